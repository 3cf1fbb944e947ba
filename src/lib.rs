//! # Cantus - constraint-honoring music generation
//!
//! Cantus turns a small set of musical controls (key/mode/tempo, a 4-bar
//! harmonic anchor, an optional reference groove, up to 4 instruments and
//! timed structural markers) into a rendered multi-stem performance that
//! provably honors the stated constraints.
//!
//! ## Pipeline
//!
//! Data flows strictly forward; every stage reads the same immutable
//! conditioning vector and hands its output read-only to the next stage:
//!
//! ```text
//! Controls -> ConditioningEncoder -> StructurePlanner -> HarmonyPlanner
//!          -> MelodyRhythmPlanner -> GrooveImposer
//!          -> TimbreRenderer (streamed, per stem) -> StreamMixdown
//! ```
//!
//! ## Quick start
//!
//! ```rust
//! use cantus::controls::Controls;
//! use cantus::generate::{generate, GenerateOptions};
//! use cantus::render::CancellationToken;
//! use cantus::theory::{Key, Mode};
//!
//! let mut controls = Controls::new(Key::parse("C").unwrap(), Mode::Ionian, 120.0, 8.0);
//! controls.harmonic_anchor = vec!["Am".into(), "G".into(), "C".into(), "F".into()];
//!
//! let result = generate(&controls, &GenerateOptions::default(), CancellationToken::new())
//!     .expect("generation failed");
//! assert_eq!(result.chords.events[0].chord.symbol, "Am");
//! assert!(!result.master.left.is_empty());
//! ```
//!
//! Constraint guarantees: the anchor appears verbatim in the first bars
//! of the harmony; strong-beat melody tones are chord tones; groove
//! imposition never inverts note order within a voice; chunked rendering
//! carries per-stem synthesis state so timbre never resets at chunk
//! boundaries.

pub mod annotate;
pub mod conditioning;
pub mod config;
pub mod controls;
pub mod error;
pub mod export;
pub mod generate;
pub mod groove;
pub mod harmony;
pub mod melody;
pub mod mixdown;
pub mod render;
pub mod score;
pub mod structure;
pub mod synth;
pub mod theory;

pub use error::{GenerateError, Result};
pub use generate::{generate, GenerateOptions, GenerationResult, RequestStatus};
pub use render::CancellationToken;
