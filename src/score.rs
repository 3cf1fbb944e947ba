//! Symbolic score: voices of beat-relative note events
//!
//! Everything upstream of the renderer uses a beat-relative clock so that
//! groove imposition is a pure time-warp and absolute tempo only matters
//! at render time.

use crate::theory::MidiNote;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical voice names used by the planner.
pub const VOICE_MELODY: &str = "melody";
pub const VOICE_BASS: &str = "bass";
pub const VOICE_INNER: &str = "inner1";
pub const VOICE_DRUMS: &str = "drums";

/// Drum hits use a fixed class vocabulary rather than pitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrumClass {
    Kick,
    Snare,
    ClosedHat,
    OpenHat,
    Crash,
}

impl DrumClass {
    /// General MIDI percussion note for export.
    pub fn gm_note(self) -> MidiNote {
        match self {
            DrumClass::Kick => 36,
            DrumClass::Snare => 38,
            DrumClass::ClosedHat => 42,
            DrumClass::OpenHat => 46,
            DrumClass::Crash => 49,
        }
    }
}

/// A note is either pitched (MIDI number) or a drum class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PitchOrDrum {
    Pitched(MidiNote),
    Drum(DrumClass),
}

impl PitchOrDrum {
    pub fn midi(self) -> MidiNote {
        match self {
            PitchOrDrum::Pitched(n) => n,
            PitchOrDrum::Drum(d) => d.gm_note(),
        }
    }

    pub fn pitch_class(self) -> Option<u8> {
        match self {
            PitchOrDrum::Pitched(n) => Some(n % 12),
            PitchOrDrum::Drum(_) => None,
        }
    }
}

/// One note event on the beat-relative clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub onset_beat: f64,
    pub duration_beats: f64,
    pub pitch: PitchOrDrum,
    pub velocity: u8,
}

impl NoteEvent {
    pub fn pitched(note: MidiNote, onset: f64, duration: f64, velocity: u8) -> Self {
        NoteEvent {
            onset_beat: onset,
            duration_beats: duration,
            pitch: PitchOrDrum::Pitched(note),
            velocity,
        }
    }

    pub fn drum(class: DrumClass, onset: f64, duration: f64, velocity: u8) -> Self {
        NoteEvent {
            onset_beat: onset,
            duration_beats: duration,
            pitch: PitchOrDrum::Drum(class),
            velocity,
        }
    }

    pub fn end_beat(&self) -> f64 {
        self.onset_beat + self.duration_beats
    }
}

/// Mapping from voice name to its ordered note events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub voices: BTreeMap<String, Vec<NoteEvent>>,
}

impl Score {
    pub fn new() -> Self {
        Score::default()
    }

    pub fn voice(&self, name: &str) -> &[NoteEvent] {
        self.voices.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn voice_mut(&mut self, name: &str) -> &mut Vec<NoteEvent> {
        self.voices.entry(name.to_string()).or_default()
    }

    /// Last sounding beat across all voices.
    pub fn end_beat(&self) -> f64 {
        self.voices
            .values()
            .flat_map(|evs| evs.iter().map(NoteEvent::end_beat))
            .fold(0.0, f64::max)
    }

    /// Sort every voice by onset, keeping insertion order for ties.
    pub fn sort_voices(&mut self) {
        for evs in self.voices.values_mut() {
            evs.sort_by(|a, b| {
                a.onset_beat
                    .partial_cmp(&b.onset_beat)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
    }

    pub fn note_count(&self) -> usize {
        self.voices.values().map(Vec::len).sum()
    }
}
