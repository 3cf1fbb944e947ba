//! Groove template extraction and imposition
//!
//! A groove template is a cyclic per-grid-slot map of micro-timing and
//! velocity deviation extracted from a one-loop reference performance.
//! Imposition warps a quantized score onto that feel under an adjustable
//! strength: `strength = 0` is pure quantization, `strength = 1`
//! reproduces the reference feel as closely as the grid allows.
//!
//! Invariant: note order within a voice never inverts. When a full offset
//! would cross a neighbor, it is clipped to the midpoint between the two
//! quantized onsets; on symmetric ties the earlier note wins and the
//! later note lands on the earlier note's onset.

use crate::controls::GrooveNote;
use crate::score::{NoteEvent, Score};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Maximum displacement the template may impose, in milliseconds.
/// Anything larger stops sounding human.
pub const DEFAULT_MAX_OFFSET_MS: f64 = 12.0;

/// Quantization grid: slots per beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrooveGrid {
    Quarter,
    Eighth,
    Twelfth,
    Sixteenth,
    TwentyFourth,
    ThirtySecond,
}

impl GrooveGrid {
    pub fn steps_per_beat(self) -> usize {
        match self {
            GrooveGrid::Quarter => 4,
            GrooveGrid::Eighth => 8,
            GrooveGrid::Twelfth => 12,
            GrooveGrid::Sixteenth => 16,
            GrooveGrid::TwentyFourth => 24,
            GrooveGrid::ThirtySecond => 32,
        }
    }

    /// Parse the usual notation: "1/4", "1/8", "1/12", "1/16", "1/24",
    /// "1/32".
    pub fn parse(s: &str) -> Option<GrooveGrid> {
        match s.trim() {
            "1/4" => Some(GrooveGrid::Quarter),
            "1/8" => Some(GrooveGrid::Eighth),
            "1/12" => Some(GrooveGrid::Twelfth),
            "1/16" => Some(GrooveGrid::Sixteenth),
            "1/24" => Some(GrooveGrid::TwentyFourth),
            "1/32" => Some(GrooveGrid::ThirtySecond),
            _ => None,
        }
    }
}

impl Default for GrooveGrid {
    fn default() -> Self {
        GrooveGrid::Sixteenth
    }
}

/// Cyclic per-slot map of (timing offset in beats, velocity scale).
/// Computed once per request, applied many times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrooveTemplate {
    pub grid: GrooveGrid,
    /// Offset from the grid point, in beats, one entry per slot.
    pub offsets_beats: Vec<f64>,
    /// Multiplicative velocity deviation, one entry per slot. 1.0 = flat.
    pub velocity_scales: Vec<f64>,
}

impl GrooveTemplate {
    /// A template that imposes nothing: zero offsets, unit scales.
    pub fn flat(grid: GrooveGrid) -> GrooveTemplate {
        let steps = grid.steps_per_beat();
        GrooveTemplate {
            grid,
            offsets_beats: vec![0.0; steps],
            velocity_scales: vec![1.0; steps],
        }
    }

    /// Extract per-slot medians from a one-loop reference performance.
    /// Slots the reference never touches keep zero offset and unit scale.
    pub fn from_reference(notes: &[GrooveNote], grid: GrooveGrid) -> GrooveTemplate {
        let steps = grid.steps_per_beat();
        if notes.is_empty() {
            return GrooveTemplate::flat(grid);
        }
        let mean_velocity =
            notes.iter().map(|n| n.velocity as f64).sum::<f64>() / notes.len() as f64;

        let mut per_slot_offsets: Vec<Vec<f64>> = vec![Vec::new(); steps];
        let mut per_slot_vels: Vec<Vec<f64>> = vec![Vec::new(); steps];
        for n in notes {
            let slot_f = n.onset_beat.rem_euclid(1.0) * steps as f64;
            let slot = (slot_f.round() as usize) % steps;
            let nearest = (n.onset_beat * steps as f64).round() / steps as f64;
            per_slot_offsets[slot].push(n.onset_beat - nearest);
            per_slot_vels[slot].push(n.velocity as f64);
        }

        let offsets_beats = per_slot_offsets.iter().map(|v| median(v)).collect();
        let velocity_scales = per_slot_vels
            .iter()
            .map(|v| {
                if v.is_empty() || mean_velocity <= 0.0 {
                    1.0
                } else {
                    median(v) / mean_velocity
                }
            })
            .collect();

        debug!(steps, notes = notes.len(), "groove template extracted");
        GrooveTemplate {
            grid,
            offsets_beats,
            velocity_scales,
        }
    }

    fn slot_of(&self, onset_beat: f64) -> usize {
        let steps = self.grid.steps_per_beat();
        let slot_f = onset_beat.rem_euclid(1.0) * steps as f64;
        (slot_f.round() as usize) % steps
    }

    pub fn offset_at(&self, onset_beat: f64) -> f64 {
        self.offsets_beats[self.slot_of(onset_beat)]
    }

    pub fn velocity_scale_at(&self, onset_beat: f64) -> f64 {
        self.velocity_scales[self.slot_of(onset_beat)]
    }
}

pub struct GrooveImposer {
    /// Offsets are clamped to this displacement (in beats) before being
    /// scaled by strength.
    pub max_offset_beats: f64,
}

impl GrooveImposer {
    /// Build an imposer whose displacement cap is `max_ms` at the given
    /// tempo.
    pub fn with_max_ms(max_ms: f64, tempo_bpm: f64) -> GrooveImposer {
        let seconds_per_beat = 60.0 / tempo_bpm;
        GrooveImposer {
            max_offset_beats: (max_ms.abs() / 1000.0) / seconds_per_beat,
        }
    }

    /// Warp the score onto the template. `strength` is clamped to [0, 1].
    /// Returns a new score; the input is not mutated.
    pub fn impose(&self, score: &Score, template: &GrooveTemplate, strength: f64) -> Score {
        let strength = strength.clamp(0.0, 1.0);
        let steps = template.grid.steps_per_beat() as f64;
        let mut out = Score::new();

        for (name, events) in &score.voices {
            let mut events = events.clone();
            // imposition is defined over the quantized order
            events.sort_by(|a, b| {
                a.onset_beat
                    .partial_cmp(&b.onset_beat)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut warped: Vec<NoteEvent> = Vec::with_capacity(events.len());
            let mut quantized: Vec<f64> = Vec::with_capacity(events.len());
            for ev in &events {
                let q = (ev.onset_beat * steps).round() / steps;
                let raw = template
                    .offset_at(q)
                    .clamp(-self.max_offset_beats, self.max_offset_beats);
                // never push a note before the start of the piece
                let mut onset = (q + strength * raw).max(0.0);

                // collision policy: clip to the midpoint between the two
                // quantized onsets, favoring the earlier note
                if let (Some(prev), Some(&prev_q)) = (warped.last(), quantized.last()) {
                    if onset < prev.onset_beat {
                        let midpoint = (prev_q + q) / 2.0;
                        onset = midpoint.max(prev.onset_beat);
                    }
                }

                let scale = template.velocity_scale_at(q);
                let velocity = (ev.velocity as f64 * (1.0 + strength * (scale - 1.0)))
                    .round()
                    .clamp(1.0, 127.0) as u8;

                warped.push(NoteEvent {
                    onset_beat: onset,
                    duration_beats: ev.duration_beats,
                    pitch: ev.pitch,
                    velocity,
                });
                quantized.push(q);
            }
            out.voices.insert(name.clone(), warped);
        }
        out
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
