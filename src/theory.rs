//! Tonal primitives: keys, modes, chord symbols, scales
//!
//! All pitched planning works in pitch classes (0..11) and MIDI note
//! numbers. Chord symbols are parsed best-effort in the usual pop notation
//! ("Am", "F#m7", "Bbmaj7", "G7", "Csus4").

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// MIDI note number type
pub type MidiNote = u8;

/// Pitch class 0..11, C = 0
pub type PitchClass = u8;

lazy_static! {
    static ref NOTE_TO_PC: HashMap<&'static str, PitchClass> = {
        let mut m = HashMap::new();
        m.insert("C", 0);
        m.insert("C#", 1);
        m.insert("Db", 1);
        m.insert("D", 2);
        m.insert("D#", 3);
        m.insert("Eb", 3);
        m.insert("E", 4);
        m.insert("F", 5);
        m.insert("F#", 6);
        m.insert("Gb", 6);
        m.insert("G", 7);
        m.insert("G#", 8);
        m.insert("Ab", 8);
        m.insert("A", 9);
        m.insert("A#", 10);
        m.insert("Bb", 10);
        m.insert("B", 11);
        m
    };

    /// Chord quality suffix -> semitone intervals from the root.
    /// Longest-match wins during parsing.
    static ref CHORD_INTERVALS: HashMap<&'static str, Vec<i32>> = {
        let mut m = HashMap::new();
        // Triads
        m.insert("", vec![0, 4, 7]);
        m.insert("maj", vec![0, 4, 7]);
        m.insert("M", vec![0, 4, 7]);
        m.insert("m", vec![0, 3, 7]);
        m.insert("min", vec![0, 3, 7]);
        m.insert("-", vec![0, 3, 7]);
        m.insert("dim", vec![0, 3, 6]);
        m.insert("o", vec![0, 3, 6]);
        m.insert("aug", vec![0, 4, 8]);
        m.insert("+", vec![0, 4, 8]);
        m.insert("sus2", vec![0, 2, 7]);
        m.insert("sus4", vec![0, 5, 7]);
        m.insert("5", vec![0, 7]);
        // Sevenths
        m.insert("7", vec![0, 4, 7, 10]);
        m.insert("maj7", vec![0, 4, 7, 11]);
        m.insert("M7", vec![0, 4, 7, 11]);
        m.insert("m7", vec![0, 3, 7, 10]);
        m.insert("min7", vec![0, 3, 7, 10]);
        m.insert("dim7", vec![0, 3, 6, 9]);
        m.insert("m7b5", vec![0, 3, 6, 10]);
        m.insert("6", vec![0, 4, 7, 9]);
        m.insert("m6", vec![0, 3, 7, 9]);
        m
    };
}

/// The seven diatonic modes, Ionian..Locrian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Ionian,
    Dorian,
    Phrygian,
    Lydian,
    Mixolydian,
    Aeolian,
    Locrian,
}

impl Mode {
    /// Semitone intervals from the tonic.
    pub fn intervals(self) -> &'static [i32; 7] {
        match self {
            Mode::Ionian => &[0, 2, 4, 5, 7, 9, 11],
            Mode::Dorian => &[0, 2, 3, 5, 7, 9, 10],
            Mode::Phrygian => &[0, 1, 3, 5, 7, 8, 10],
            Mode::Lydian => &[0, 2, 4, 6, 7, 9, 11],
            Mode::Mixolydian => &[0, 2, 4, 5, 7, 9, 10],
            Mode::Aeolian => &[0, 2, 3, 5, 7, 8, 10],
            Mode::Locrian => &[0, 1, 3, 5, 6, 8, 10],
        }
    }

    /// Parse a mode name. Accepts the common aliases "major" and "minor".
    pub fn parse(s: &str) -> Option<Mode> {
        match s.trim().to_lowercase().as_str() {
            "ionian" | "major" => Some(Mode::Ionian),
            "dorian" => Some(Mode::Dorian),
            "phrygian" => Some(Mode::Phrygian),
            "lydian" => Some(Mode::Lydian),
            "mixolydian" => Some(Mode::Mixolydian),
            "aeolian" | "minor" => Some(Mode::Aeolian),
            "locrian" => Some(Mode::Locrian),
            _ => None,
        }
    }

    /// The parallel mode used as the borrowing pool: major modes borrow
    /// from Aeolian, minor-flavored modes from Ionian.
    pub fn parallel(self) -> Mode {
        match self {
            Mode::Ionian | Mode::Lydian | Mode::Mixolydian => Mode::Aeolian,
            _ => Mode::Ionian,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Ionian => "ionian",
            Mode::Dorian => "dorian",
            Mode::Phrygian => "phrygian",
            Mode::Lydian => "lydian",
            Mode::Mixolydian => "mixolydian",
            Mode::Aeolian => "aeolian",
            Mode::Locrian => "locrian",
        }
    }
}

/// A tonal center, e.g. C, F#, Bb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub tonic: PitchClass,
}

impl Key {
    /// Parse a key name like "C", "F#", "bb". Unicode accidentals are
    /// normalized first.
    pub fn parse(s: &str) -> Option<Key> {
        let s = normalize_note_name(s);
        NOTE_TO_PC.get(s.as_str()).map(|&tonic| Key { tonic })
    }

    pub fn name(&self) -> &'static str {
        pc_name(self.tonic)
    }

    /// Scale pitch classes for this key in the given mode.
    pub fn scale(&self, mode: Mode) -> Vec<PitchClass> {
        mode.intervals()
            .iter()
            .map(|iv| ((self.tonic as i32 + iv) % 12) as PitchClass)
            .collect()
    }
}

/// Canonical sharp-preferring name for a pitch class.
pub fn pc_name(pc: PitchClass) -> &'static str {
    const NAMES: [&str; 12] = [
        "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
    ];
    NAMES[(pc % 12) as usize]
}

fn normalize_note_name(s: &str) -> String {
    let s = s.trim().replace('♯', "#").replace('♭', "b");
    let mut out = String::new();
    let mut chars = s.chars();
    if let Some(c) = chars.next() {
        out.push(c.to_ascii_uppercase());
    }
    for c in chars {
        // keep accidental case: 'b' stays lowercase, '#' passes through
        out.push(c);
    }
    out
}

/// A parsed chord symbol: root pitch class plus quality intervals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chord {
    pub root: PitchClass,
    pub intervals: Vec<i32>,
    /// The symbol as the user wrote it.
    pub symbol: String,
}

impl Chord {
    /// Parse a chord symbol like "Am", "F#m7", "Bbmaj7". Returns None when
    /// the root or the quality suffix is not recognized.
    pub fn parse(symbol: &str) -> Option<Chord> {
        let s = symbol.trim();
        if s.is_empty() {
            return None;
        }
        let norm = normalize_note_name(s);
        let bytes = norm.as_bytes();
        let root_len = if bytes.len() >= 2 && (bytes[1] == b'#' || bytes[1] == b'b') {
            2
        } else {
            1
        };
        let root_str = &norm[..root_len];
        let root = *NOTE_TO_PC.get(root_str)?;
        let suffix = norm[root_len..].trim();
        let intervals = CHORD_INTERVALS.get(suffix)?.clone();
        Some(Chord {
            root,
            intervals,
            symbol: s.to_string(),
        })
    }

    /// The chord's pitch classes, root first.
    pub fn pitch_classes(&self) -> Vec<PitchClass> {
        self.intervals
            .iter()
            .map(|iv| ((self.root as i32 + iv) % 12) as PitchClass)
            .collect()
    }

    pub fn contains_pc(&self, pc: PitchClass) -> bool {
        self.pitch_classes().contains(&(pc % 12))
    }

    /// True when at least one chord tone lies in the given scale.
    pub fn intersects_scale(&self, scale: &[PitchClass]) -> bool {
        self.pitch_classes().iter().any(|pc| scale.contains(pc))
    }

}

/// Pick the MIDI pitch within [lo, hi] whose pitch class is in `pc_set`,
/// nearest to `target`. Falls back to clamping when the set is empty in
/// the register.
pub fn nearest_pitch_in_pcs(target: i32, pc_set: &[PitchClass], lo: MidiNote, hi: MidiNote) -> MidiNote {
    let mut best: Option<(i32, i32)> = None; // (distance, pitch)
    for p in lo..=hi {
        if pc_set.contains(&(p % 12)) {
            let d = (p as i32 - target).abs();
            match best {
                Some((bd, _)) if bd <= d => {}
                _ => best = Some((d, p as i32)),
            }
        }
    }
    match best {
        Some((_, p)) => p as MidiNote,
        None => target.clamp(lo as i32, hi as i32) as MidiNote,
    }
}

/// Equal-tempered frequency of a MIDI note.
pub fn midi_to_freq(note: MidiNote) -> f32 {
    440.0 * 2f32.powf((note as f32 - 69.0) / 12.0)
}
