//! Error taxonomy for generation requests
//!
//! Planning-stage errors abort the whole request before any audio is
//! produced. Rendering-stage errors are chunk-scoped where possible (one
//! retry on a cheaper route) and request-fatal only after retry exhaustion.
//! Every variant carries the offending bar/marker/instrument so failures
//! are actionable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerateError {
    /// Malformed input, rejected before any planning begins.
    #[error("invalid controls: {reason}")]
    InvalidControls { reason: String },

    /// A marker cannot be placed strictly inside a section without
    /// violating the minimum section length.
    #[error("marker '{tag}' at {time_sec:.2}s cannot be placed: {detail}")]
    UnsatisfiableMarkers {
        tag: String,
        time_sec: f64,
        detail: String,
    },

    /// The harmonic anchor contains a chord that cannot be reconciled
    /// with the declared key/mode.
    #[error("anchor chord '{symbol}' at bar {bar} is unsatisfiable: {detail}")]
    UnsatisfiableAnchor {
        bar: usize,
        symbol: String,
        detail: String,
    },

    /// An instrument token maps to no synthesis route. Raised at request
    /// start, before any audio is produced.
    #[error("no synthesis route for instrument '{name}'")]
    UnsupportedInstrument { name: String },

    /// A chunk exceeded its render budget even after the fallback retry.
    #[error("render timeout on stem '{stem}', chunk {chunk}")]
    RenderTimeout { stem: String, chunk: usize },

    /// Cooperative cancellation; partial stems are still returned.
    #[error("request cancelled")]
    Cancelled,

    /// Chunks for a stem arrived out of order or with a gap.
    #[error("stem '{stem}': chunk starting at sample {got} does not follow committed position {expected}")]
    ChunkDiscontinuity {
        stem: String,
        expected: usize,
        got: usize,
    },

    #[error("export failed: {0}")]
    Export(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GenerateError>;

impl GenerateError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        GenerateError::InvalidControls {
            reason: reason.into(),
        }
    }
}
