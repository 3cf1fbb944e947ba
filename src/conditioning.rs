//! Conditioning encoder: validated, derived view of the controls
//!
//! `encode` is the single entry point of the pipeline. It validates the
//! raw `Controls` (rejecting with `InvalidControls` before any planning
//! happens) and derives the features every downstream stage shares: the
//! bar/beat clocks, the scale, per-pitch-class key profile weights and
//! summary statistics of the reference groove. The result is immutable
//! and threaded read-only through all stages.

use crate::controls::{
    Controls, GrooveNote, InstrumentSpec, Marker, RouteHint, MAX_ANCHOR_BARS, MAX_DURATION_SECS,
    MAX_INSTRUMENTS,
};
use crate::error::{GenerateError, Result};
use crate::theory::{Chord, Key, Mode, PitchClass};
use serde::{Deserialize, Serialize};

/// Fixed meter: everything here is 4/4, as in the reference system.
pub const BEATS_PER_BAR: u32 = 4;

/// Summary statistics of the reference groove, used for annotation and
/// logging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrooveStats {
    pub note_count: usize,
    /// Mean absolute deviation from the 16th grid, in beats.
    pub mean_abs_offset_beats: f64,
    pub mean_velocity: f64,
}

/// Derived, immutable per-request conditioning shared by every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditioningVector {
    pub key: Key,
    pub mode: Mode,
    pub tempo_bpm: f64,
    pub beats_per_bar: u32,
    pub total_duration_secs: f64,
    pub total_bars: usize,
    pub seconds_per_beat: f64,
    pub seconds_per_bar: f64,
    /// Parsed anchor chords, at most one per bar for the first 4 bars.
    pub anchor: Vec<Chord>,
    /// Scale pitch classes of key/mode.
    pub scale: Vec<PitchClass>,
    /// Weight per pitch class: tonal-hierarchy profile of the key/mode.
    pub key_profile: [f32; 12],
    pub markers: Vec<Marker>,
    pub instruments: Vec<InstrumentSpec>,
    pub groove_reference: Option<Vec<GrooveNote>>,
    pub groove_stats: Option<GrooveStats>,
}

impl ConditioningVector {
    /// Bar index containing the given time offset (fractional bars are
    /// truncated).
    pub fn bar_at(&self, time_sec: f64) -> usize {
        (time_sec / self.seconds_per_bar).floor() as usize
    }
}

/// Validate controls and derive the conditioning vector. Pure and
/// deterministic: identical controls always produce an identical result.
pub fn encode(controls: &Controls) -> Result<ConditioningVector> {
    if !controls.tempo_bpm.is_finite() || controls.tempo_bpm <= 0.0 {
        return Err(GenerateError::invalid(format!(
            "tempo must be positive, got {}",
            controls.tempo_bpm
        )));
    }
    if !controls.total_duration_secs.is_finite() || controls.total_duration_secs <= 0.0 {
        return Err(GenerateError::invalid(format!(
            "total duration must be positive, got {}",
            controls.total_duration_secs
        )));
    }
    if controls.total_duration_secs > MAX_DURATION_SECS {
        return Err(GenerateError::invalid(format!(
            "total duration {:.2}s exceeds the {:.0}s cap",
            controls.total_duration_secs, MAX_DURATION_SECS
        )));
    }
    if controls.harmonic_anchor.len() > MAX_ANCHOR_BARS {
        return Err(GenerateError::invalid(format!(
            "anchor has {} bars, at most {} allowed",
            controls.harmonic_anchor.len(),
            MAX_ANCHOR_BARS
        )));
    }
    if controls.instruments.len() > MAX_INSTRUMENTS {
        return Err(GenerateError::invalid(format!(
            "{} instruments requested, at most {} allowed",
            controls.instruments.len(),
            MAX_INSTRUMENTS
        )));
    }
    for marker in &controls.markers {
        if !marker.time_sec.is_finite()
            || marker.time_sec < 0.0
            || marker.time_sec > controls.total_duration_secs
        {
            return Err(GenerateError::invalid(format!(
                "marker '{}' at {:.2}s lies outside [0, {:.2}]",
                marker.tag, marker.time_sec, controls.total_duration_secs
            )));
        }
    }

    let mut anchor = Vec::with_capacity(controls.harmonic_anchor.len());
    for (i, symbol) in controls.harmonic_anchor.iter().enumerate() {
        match Chord::parse(symbol) {
            Some(chord) => anchor.push(chord),
            None => {
                return Err(GenerateError::invalid(format!(
                    "anchor bar {}: unparseable chord symbol '{}'",
                    i, symbol
                )))
            }
        }
    }

    let seconds_per_beat = 60.0 / controls.tempo_bpm;
    let seconds_per_bar = seconds_per_beat * BEATS_PER_BAR as f64;
    // ceil so the timeline always covers the request (never under-runs)
    let total_bars = (controls.total_duration_secs / seconds_per_bar).ceil().max(1.0) as usize;

    let scale = controls.key.scale(controls.mode);
    let key_profile = key_profile(&scale, controls.key);

    let instruments = if controls.instruments.is_empty() {
        default_instruments()
    } else {
        controls.instruments.clone()
    };

    let groove_stats = controls.groove_reference.as_deref().map(groove_stats);

    Ok(ConditioningVector {
        key: controls.key,
        mode: controls.mode,
        tempo_bpm: controls.tempo_bpm,
        beats_per_bar: BEATS_PER_BAR,
        total_duration_secs: controls.total_duration_secs,
        total_bars,
        seconds_per_beat,
        seconds_per_bar,
        anchor,
        scale,
        key_profile,
        markers: controls.markers.clone(),
        instruments,
        groove_reference: controls.groove_reference.clone(),
        groove_stats,
    })
}

/// Tonal-hierarchy weights: tonic strongest, then dominant, then the
/// remaining scale degrees; non-scale classes near zero.
fn key_profile(scale: &[PitchClass], key: Key) -> [f32; 12] {
    let mut profile = [0.05f32; 12];
    for &pc in scale {
        profile[pc as usize] = 0.5;
    }
    profile[key.tonic as usize] = 1.0;
    let dominant = ((key.tonic as usize) + 7) % 12;
    if scale.contains(&(dominant as PitchClass)) {
        profile[dominant] = 0.8;
    }
    let mediant_minor = ((key.tonic as usize) + 3) % 12;
    let mediant_major = ((key.tonic as usize) + 4) % 12;
    for m in [mediant_minor, mediant_major] {
        if scale.contains(&(m as PitchClass)) {
            profile[m] = 0.65;
        }
    }
    profile
}

/// Stem set used when the caller names no instruments.
fn default_instruments() -> Vec<InstrumentSpec> {
    vec![
        InstrumentSpec::with_hint("lead_synth", RouteHint::Parametric),
        InstrumentSpec::with_hint("analog_bass", RouteHint::Parametric),
        InstrumentSpec::with_hint("warm_pad", RouteHint::Generative),
        InstrumentSpec::with_hint("kit", RouteHint::Sample),
    ]
}

fn groove_stats(notes: &[GrooveNote]) -> GrooveStats {
    if notes.is_empty() {
        return GrooveStats {
            note_count: 0,
            mean_abs_offset_beats: 0.0,
            mean_velocity: 0.0,
        };
    }
    // deviation from the 16-slot-per-beat grid the template extractor uses
    let steps = 16.0;
    let mut sum_abs = 0.0;
    let mut sum_vel = 0.0;
    for n in notes {
        let nearest = (n.onset_beat * steps).round() / steps;
        sum_abs += (n.onset_beat - nearest).abs();
        sum_vel += n.velocity as f64;
    }
    GrooveStats {
        note_count: notes.len(),
        mean_abs_offset_beats: sum_abs / notes.len() as f64,
        mean_velocity: sum_vel / notes.len() as f64,
    }
}
