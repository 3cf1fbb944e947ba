//! User-facing controls for a generation request
//!
//! `Controls` is the immutable input boundary: everything the caller can
//! say about the piece. String-typed fields (anchor chords) are validated
//! by the conditioning encoder so that malformed input is rejected before
//! any planning begins. The free-form parsers mirror what a CLI or config
//! front-end accepts: durations like `60`, `60s`, `1m30s`, `1:00`; markers
//! like `30:motif`; anchors like `Am-G-C-F`.

use crate::error::{GenerateError, Result};
use crate::theory::{Key, Mode};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Longest piece we will plan, in seconds.
pub const MAX_DURATION_SECS: f64 = 300.0;
/// Hard cap on anchor length, in bars.
pub const MAX_ANCHOR_BARS: usize = 4;
/// Hard cap on instrument count (one stem per instrument).
pub const MAX_INSTRUMENTS: usize = 4;

/// One note of a symbolic reference performance, beat-relative, spanning
/// one loop. Used to extract a groove template.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrooveNote {
    pub onset_beat: f64,
    pub duration_beats: f64,
    pub velocity: u8,
}

/// A timed structural marker, e.g. "introduce the motif at 30s".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub time_sec: f64,
    pub tag: String,
}

/// Synthesis route requested for an instrument. `None` in
/// `InstrumentSpec::route_hint` means "infer from the timbre tag".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteHint {
    /// Learned-generative decoder.
    Generative,
    /// Differentiable-parametric synthesis (oscillator + envelope).
    Parametric,
    /// Pre-recorded / pre-baked sample playback.
    Sample,
}

/// An instrument choice: free-form timbre tag plus an optional route hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub name: String,
    pub route_hint: Option<RouteHint>,
}

impl InstrumentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        InstrumentSpec {
            name: name.into(),
            route_hint: None,
        }
    }

    pub fn with_hint(name: impl Into<String>, hint: RouteHint) -> Self {
        InstrumentSpec {
            name: name.into(),
            route_hint: Some(hint),
        }
    }
}

/// Immutable user input for one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controls {
    pub key: Key,
    pub mode: Mode,
    pub tempo_bpm: f64,
    /// Up to 4 bars of chord symbols reproduced verbatim at the start of
    /// the generated harmony. Empty means "no anchor".
    pub harmonic_anchor: Vec<String>,
    /// Optional one-loop reference performance for groove extraction.
    pub groove_reference: Option<Vec<GrooveNote>>,
    /// Ordered set of instrument choices, one stem each.
    pub instruments: Vec<InstrumentSpec>,
    pub markers: Vec<Marker>,
    pub total_duration_secs: f64,
}

impl Controls {
    /// Minimal valid controls for the given key/mode/tempo/length.
    pub fn new(key: Key, mode: Mode, tempo_bpm: f64, total_duration_secs: f64) -> Self {
        Controls {
            key,
            mode,
            tempo_bpm,
            harmonic_anchor: Vec::new(),
            groove_reference: None,
            instruments: Vec::new(),
            markers: Vec::new(),
            total_duration_secs,
        }
    }
}

lazy_static! {
    static ref RE_MIN_SEC: Regex = Regex::new(r"^(\d+)m(?:(\d+)s)?$").unwrap();
    static ref RE_COLON: Regex = Regex::new(r"^(\d+):([0-5]\d)$").unwrap();
}

/// Parse a duration string: `60`, `60s`, `1m30s`, `1:00`, `00:45`.
pub fn parse_duration(s: &str) -> Result<f64> {
    let s = s.trim().to_lowercase();
    if let Ok(v) = s.parse::<f64>() {
        return Ok(v);
    }
    if let Some(stripped) = s.strip_suffix('s') {
        if let Ok(v) = stripped.parse::<f64>() {
            return Ok(v);
        }
    }
    if let Some(c) = RE_MIN_SEC.captures(&s) {
        let mins: f64 = c[1].parse().unwrap_or(0.0);
        let secs: f64 = c.get(2).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
        return Ok(mins * 60.0 + secs);
    }
    if let Some(c) = RE_COLON.captures(&s) {
        let mins: f64 = c[1].parse().unwrap_or(0.0);
        let secs: f64 = c[2].parse().unwrap_or(0.0);
        return Ok(mins * 60.0 + secs);
    }
    Err(GenerateError::invalid(format!(
        "duration '{}' must look like 60, 60s, 1m30s, 1:00 or 00:45",
        s
    )))
}

/// Parse a marker string `time:label`, e.g. `30:motif` or `00:45:sweep`.
/// The label may itself contain colons only in the `m:ss` time form.
pub fn parse_marker(s: &str) -> Result<Marker> {
    let s = s.trim();
    // try the two-colon form first: "mm:ss:label"
    let parts: Vec<&str> = s.splitn(3, ':').collect();
    if parts.len() == 3 && RE_COLON.is_match(&format!("{}:{}", parts[0], parts[1])) {
        let time_sec = parse_duration(&format!("{}:{}", parts[0], parts[1]))?;
        return Ok(Marker {
            time_sec,
            tag: parts[2].trim().to_string(),
        });
    }
    if parts.len() >= 2 {
        let time_sec = parse_duration(parts[0])?;
        return Ok(Marker {
            time_sec,
            tag: parts[1..].join(":").trim().to_string(),
        });
    }
    Err(GenerateError::invalid(format!(
        "marker '{}' must be 'time:label' (e.g. 30:motif or 00:45:sweep)",
        s
    )))
}

/// Parse an anchor string: `Am-G-C-F`, `Am G C F` or `Am, G, C, F`.
/// Symbols are not validated here; the conditioning encoder does that.
pub fn parse_anchor(s: &str) -> Vec<String> {
    s.split(|c: char| c == ',' || c == '-' || c.is_whitespace())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a comma-separated instrument list into specs (no hints).
pub fn parse_instruments(s: &str) -> Vec<InstrumentSpec> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(InstrumentSpec::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("60").unwrap(), 60.0);
        assert_eq!(parse_duration("60s").unwrap(), 60.0);
        assert_eq!(parse_duration("1m30s").unwrap(), 90.0);
        assert_eq!(parse_duration("1m").unwrap(), 60.0);
        assert_eq!(parse_duration("1:00").unwrap(), 60.0);
        assert_eq!(parse_duration("00:45").unwrap(), 45.0);
        assert_eq!(parse_duration("2:03").unwrap(), 123.0);
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("1:75").is_err());
    }

    #[test]
    fn markers() {
        let m = parse_marker("30:motif").unwrap();
        assert_eq!(m.time_sec, 30.0);
        assert_eq!(m.tag, "motif");

        let m = parse_marker("00:45:filter_sweep").unwrap();
        assert_eq!(m.time_sec, 45.0);
        assert_eq!(m.tag, "filter_sweep");

        let m = parse_marker("30s:drop").unwrap();
        assert_eq!(m.time_sec, 30.0);
        assert_eq!(m.tag, "drop");

        assert!(parse_marker("nocolon").is_err());
    }

    #[test]
    fn anchors() {
        assert_eq!(parse_anchor("Am-G-C-F"), vec!["Am", "G", "C", "F"]);
        assert_eq!(parse_anchor("Am, G, C, F"), vec!["Am", "G", "C", "F"]);
        assert_eq!(parse_anchor("Am G C F"), vec!["Am", "G", "C", "F"]);
        assert!(parse_anchor("").is_empty());
    }

    #[test]
    fn instruments() {
        let v = parse_instruments("analog_bass, jazz_kit");
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].name, "analog_bass");
        assert!(v[0].route_hint.is_none());
    }
}
