//! Preset files: TOML controls and JSON groove references
//!
//! A preset carries the same fields the CLI accepts; explicit CLI flags
//! take precedence over preset values. The groove reference is a JSON
//! array of beat-relative (onset, duration, velocity) triples spanning
//! one loop.

use crate::controls::GrooveNote;
use crate::error::{GenerateError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Optional-everything mirror of the CLI surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub key: Option<String>,
    pub mode: Option<String>,
    pub bpm: Option<f64>,
    /// e.g. "Am-G-C-F"
    pub anchor: Option<String>,
    /// e.g. "60s", "1m30s"
    pub length: Option<String>,
    /// comma-separated, at most 4
    pub instruments: Option<String>,
    /// "time:label" entries
    pub markers: Option<Vec<String>>,
    /// path to a groove reference JSON, resolved relative to the preset
    pub groove: Option<String>,
    /// quantization grid, e.g. "1/16"
    pub quantize: Option<String>,
    /// groove strength in [0, 1]
    pub strength: Option<f64>,
    pub seed: Option<u64>,
}

/// Load a TOML preset.
pub fn load_preset(path: &Path) -> Result<Preset> {
    let text = fs::read_to_string(path)?;
    toml::from_str(&text).map_err(|e| {
        GenerateError::invalid(format!("preset {}: {e}", path.display()))
    })
}

/// Load a symbolic groove reference from JSON.
pub fn load_groove_reference(path: &Path) -> Result<Vec<GrooveNote>> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| {
        GenerateError::invalid(format!("groove reference {}: {e}", path.display()))
    })
}
