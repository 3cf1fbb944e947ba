//! Melody/rhythm planner: multi-voice symbolic score over the harmony
//!
//! Each voice is generated independently but conditioned on the same
//! chord sequence and a shared motif. Hard rules: strong-beat notes are
//! chord tones; weak-beat passing tones resolve by step to the following
//! strong-beat tone within one beat. Drums use the fixed class vocabulary
//! instead of pitch. Everything stays on the beat-relative clock.

use crate::conditioning::ConditioningVector;
use crate::error::Result;
use crate::harmony::ChordSequence;
use crate::score::{
    DrumClass, NoteEvent, Score, VOICE_BASS, VOICE_DRUMS, VOICE_INNER, VOICE_MELODY,
};
use crate::structure::{SectionLabel, SectionTimeline};
use crate::theory::{nearest_pitch_in_pcs, MidiNote, PitchClass};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

const MELODY_LO: MidiNote = 60; // C4
const MELODY_HI: MidiNote = 76; // E5
const BASS_LO: MidiNote = 40; // E2
const BASS_HI: MidiNote = 55; // G3

const VEL_STRONG: u8 = 96;
const VEL_WEAK: u8 = 84;
const VEL_BASS: u8 = 104;
const VEL_PAD: u8 = 70;

/// A recorded restatement of the motif, for the annotation sheet and the
/// structure-consistency tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotifOccurrence {
    pub start_bar: usize,
    pub source_bar: usize,
    pub transposition_semitones: i32,
}

/// Planner output: the score plus where the motif was restated.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedScore {
    pub score: Score,
    pub motifs: Vec<MotifOccurrence>,
}

pub struct MelodyRhythmPlanner {
    pub motif_bars: usize,
}

impl Default for MelodyRhythmPlanner {
    fn default() -> Self {
        MelodyRhythmPlanner { motif_bars: 2 }
    }
}

impl MelodyRhythmPlanner {
    pub fn plan(
        &self,
        cv: &ConditioningVector,
        timeline: &SectionTimeline,
        chords: &ChordSequence,
        rng: &mut StdRng,
    ) -> Result<PlannedScore> {
        let bpb = cv.beats_per_bar as f64;
        let mut score = Score::new();

        *score.voice_mut(VOICE_MELODY) = self.plan_melody(cv, chords, rng);
        *score.voice_mut(VOICE_BASS) = self.plan_bass(cv, chords);
        *score.voice_mut(VOICE_INNER) = self.plan_inner(cv, chords);
        *score.voice_mut(VOICE_DRUMS) = self.plan_drums(cv, chords.len_bars());

        let motifs = self.restate_motif(cv, timeline, chords, &mut score);

        apply_section_dynamics(timeline, bpb, &mut score);
        add_section_fills(timeline, bpb, &mut score);

        score.sort_voices();
        debug!(
            notes = score.note_count(),
            motifs = motifs.len(),
            "melody/rhythm planned"
        );
        Ok(PlannedScore { score, motifs })
    }

    /// Quarter-note melody: chord tones on beats 1 and 3 (alternating
    /// root and third/fifth targets for contour), stepwise passing tones
    /// on beats 2 and 4 that resolve into the next strong tone.
    fn plan_melody(
        &self,
        cv: &ConditioningVector,
        chords: &ChordSequence,
        rng: &mut StdRng,
    ) -> Vec<NoteEvent> {
        let bars = chords.len_bars();
        let bpb = cv.beats_per_bar as f64;
        let center = ((MELODY_LO + MELODY_HI) / 2) as i32;
        let mut events = Vec::with_capacity(bars * 4);
        let mut prev: i32 = center;

        for bar in 0..bars {
            let event = chords.chord_at_bar(bar);
            let pcs = event.chord.pitch_classes();
            let root_pc = pcs[0];
            let color_pc = if bar % 2 == 0 {
                pcs.get(1).copied().unwrap_or(root_pc)
            } else {
                pcs.get(2).copied().unwrap_or(root_pc)
            };
            // the strong tone that follows beat 4 lives in the next bar
            let next_root_pc = if bar + 1 < bars {
                chords.chord_at_bar(bar + 1).chord.pitch_classes()[0]
            } else {
                cv.key.tonic
            };

            let bar_start = bar as f64 * bpb;

            // beat 1: chord root region, voice-led from the previous note
            let n0 = nearest_pitch_in_pcs(prev, &[root_pc], MELODY_LO, MELODY_HI);
            // predicted beat-3 tone, used as the resolution target of beat 2
            let n2_target = nearest_pitch_in_pcs(n0 as i32, &[color_pc], MELODY_LO, MELODY_HI);
            let n1 = passing_tone(n2_target, &cv.scale, n0 as i32, rng);
            let n2 = nearest_pitch_in_pcs(n1 as i32, &[color_pc], MELODY_LO, MELODY_HI);
            let next_target = nearest_pitch_in_pcs(n2 as i32, &[next_root_pc], MELODY_LO, MELODY_HI);
            let n3 = passing_tone(next_target, &cv.scale, n2 as i32, rng);

            for (b, note) in [n0, n1, n2, n3].into_iter().enumerate() {
                let vel = if b % 2 == 0 { VEL_STRONG } else { VEL_WEAK };
                events.push(NoteEvent::pitched(note, bar_start + b as f64, 1.0, vel));
            }
            prev = n3 as i32;
        }
        events
    }

    /// Half-note bass: root then fifth each bar, nearest-pitch voice
    /// leading within the bass register.
    fn plan_bass(&self, cv: &ConditioningVector, chords: &ChordSequence) -> Vec<NoteEvent> {
        let bars = chords.len_bars();
        let bpb = cv.beats_per_bar as f64;
        let half = bpb / 2.0;
        let mut events = Vec::with_capacity(bars * 2);
        let mut prev: i32 = ((BASS_LO + BASS_HI) / 2) as i32;

        for bar in 0..bars {
            let event = chords.chord_at_bar(bar);
            let pcs = event.chord.pitch_classes();
            let root_pc = pcs[0];
            let fifth_pc = pcs.get(2).copied().unwrap_or(root_pc);
            let bar_start = bar as f64 * bpb;

            let root = nearest_pitch_in_pcs(prev, &[root_pc], BASS_LO, BASS_HI);
            let fifth = nearest_pitch_in_pcs(root as i32, &[fifth_pc], BASS_LO, BASS_HI);
            events.push(NoteEvent::pitched(root, bar_start, half, VEL_BASS));
            events.push(NoteEvent::pitched(fifth, bar_start + half, half, VEL_BASS));
            prev = fifth as i32;
        }
        events
    }

    /// Sustained pad from the harmony's own upper voicing, one bar per
    /// chord. Reusing the planned voicing keeps the pad register clear of
    /// the bass.
    fn plan_inner(&self, cv: &ConditioningVector, chords: &ChordSequence) -> Vec<NoteEvent> {
        let bpb = cv.beats_per_bar as f64;
        let mut events = Vec::new();
        for event in &chords.events {
            let bar_start = event.start_bar as f64 * bpb;
            for &pitch in event.voicing.iter().skip(1) {
                events.push(NoteEvent::pitched(pitch, bar_start, bpb, VEL_PAD));
            }
        }
        events
    }

    /// Backbeat kit: kick on 1 and 3, snare on 2 and 4, closed hats on
    /// 8ths, an open hat leading into the next bar, and a kick pickup
    /// every other bar.
    fn plan_drums(&self, cv: &ConditioningVector, bars: usize) -> Vec<NoteEvent> {
        let bpb = cv.beats_per_bar as f64;
        let mut events = Vec::with_capacity(bars * 14);
        for bar in 0..bars {
            let s = bar as f64 * bpb;

            events.push(NoteEvent::drum(DrumClass::Kick, s, 0.25, 118));
            events.push(NoteEvent::drum(DrumClass::Kick, s + 2.0, 0.25, 112));
            events.push(NoteEvent::drum(DrumClass::Snare, s + 1.0, 0.25, 108));
            events.push(NoteEvent::drum(DrumClass::Snare, s + 3.0, 0.25, 112));
            if bar % 2 == 1 {
                events.push(NoteEvent::drum(DrumClass::Kick, s + 1.75, 0.125, 96));
            }
            for n in 0..8 {
                let vel = if n % 2 == 0 { 94 } else { 84 };
                events.push(NoteEvent::drum(
                    DrumClass::ClosedHat,
                    s + n as f64 * 0.5,
                    0.25,
                    vel,
                ));
            }
            events.push(NoteEvent::drum(DrumClass::OpenHat, s + 3.5, 0.375, 96));
        }
        events
    }

    /// Restate the opening melody motif, transposed to the local chord
    /// root, at every chorus start and at every marker asking for it.
    fn restate_motif(
        &self,
        cv: &ConditioningVector,
        timeline: &SectionTimeline,
        chords: &ChordSequence,
        score: &mut Score,
    ) -> Vec<MotifOccurrence> {
        let bpb = cv.beats_per_bar as f64;
        let motif_len_beats = self.motif_bars as f64 * bpb;
        let melody = score.voice(VOICE_MELODY).to_vec();
        if melody.is_empty() {
            return Vec::new();
        }
        let motif: Vec<NoteEvent> = melody
            .iter()
            .copied()
            .filter(|ev| ev.onset_beat < motif_len_beats)
            .collect();
        if motif.is_empty() {
            return Vec::new();
        }

        // markers are explicit user constraints and win over the implicit
        // chorus restatement; overlapping windows are dropped
        let mut requested: Vec<usize> = cv
            .markers
            .iter()
            .filter(|m| m.tag.to_lowercase().contains("motif"))
            .map(|m| cv.bar_at(m.time_sec))
            .collect();
        requested.extend(
            timeline
                .sections
                .iter()
                .filter(|s| s.label.is_chorus())
                .map(|s| s.start_bar),
        );
        let mut target_bars: Vec<usize> = Vec::new();
        for bar in requested {
            if bar < self.motif_bars || bar + self.motif_bars > chords.len_bars() {
                continue;
            }
            let overlaps = target_bars
                .iter()
                .any(|&t| bar < t + self.motif_bars && t < bar + self.motif_bars);
            if !overlaps {
                target_bars.push(bar);
            }
        }
        target_bars.sort_unstable();

        let source_root = chords.chord_at_bar(0).chord.root as i32;
        let mut occurrences = Vec::new();
        let voice = score.voice_mut(VOICE_MELODY);
        for &bar in &target_bars {
            let delta_pc = (chords.chord_at_bar(bar).chord.root as i32 - source_root).rem_euclid(12);
            // transpose by the smaller direction
            let delta = if delta_pc > 6 { delta_pc - 12 } else { delta_pc };
            let window_start = bar as f64 * bpb;
            let window_end = window_start + motif_len_beats;
            voice.retain(|ev| ev.end_beat() <= window_start || ev.onset_beat >= window_end);

            let mut copy: Vec<NoteEvent> = motif
                .iter()
                .map(|ev| {
                    let pitch = transpose_in_register(ev.pitch.midi(), delta, MELODY_LO, MELODY_HI);
                    NoteEvent::pitched(
                        pitch,
                        ev.onset_beat + window_start,
                        ev.duration_beats,
                        ev.velocity,
                    )
                })
                .collect();

            // the transposed copy must still honor the hard rules over the
            // local harmony: snap strong beats to chord tones, then keep
            // weak beats within a step of their resolution
            let follower = voice
                .iter()
                .find(|e| (e.onset_beat - window_end).abs() < 1e-9)
                .map(|e| e.pitch.midi());
            snap_copy_to_harmony(&mut copy, cv, chords, follower);

            // the pre-existing weak note just before the window resolves
            // into the copy's first note now
            if let Some(first) = copy.first().map(|e| e.pitch.midi()) {
                if let Some(prev_ev) = voice
                    .iter_mut()
                    .find(|e| (e.onset_beat - (window_start - 1.0)).abs() < 1e-9)
                {
                    prev_ev.pitch = crate::score::PitchOrDrum::Pitched(step_neighbor(
                        first,
                        &cv.scale,
                        prev_ev.pitch.midi() as i32,
                    ));
                }
            }

            voice.extend(copy);
            occurrences.push(MotifOccurrence {
                start_bar: bar,
                source_bar: 0,
                transposition_semitones: delta,
            });
        }
        occurrences
    }
}

/// Re-project a transposed motif copy onto the local harmony: strong
/// beats snap to the nearest chord tone of the active chord, weak beats
/// to a scale tone within a step of the note they resolve into.
fn snap_copy_to_harmony(
    copy: &mut [NoteEvent],
    cv: &ConditioningVector,
    chords: &ChordSequence,
    follower: Option<MidiNote>,
) {
    let bpb = cv.beats_per_bar as f64;
    // strong beats first
    for ev in copy.iter_mut() {
        let beat_in_bar = ev.onset_beat.rem_euclid(bpb);
        if beat_in_bar.fract() == 0.0 && (beat_in_bar as u32) % 2 == 0 {
            let chord = &chords.chord_at_beat(ev.onset_beat, cv.beats_per_bar).chord;
            let snapped = nearest_pitch_in_pcs(
                ev.pitch.midi() as i32,
                &chord.pitch_classes(),
                MELODY_LO,
                MELODY_HI,
            );
            ev.pitch = crate::score::PitchOrDrum::Pitched(snapped);
        }
    }
    // then weak beats resolve into the next sounding note
    for i in 0..copy.len() {
        let beat_in_bar = copy[i].onset_beat.rem_euclid(bpb);
        if beat_in_bar.fract() == 0.0 && (beat_in_bar as u32) % 2 == 1 {
            let next = if i + 1 < copy.len() {
                Some(copy[i + 1].pitch.midi())
            } else {
                follower
            };
            if let Some(next) = next {
                let fixed = step_neighbor(next, &cv.scale, copy[i].pitch.midi() as i32);
                copy[i].pitch = crate::score::PitchOrDrum::Pitched(fixed);
            }
        }
    }
}

/// Deterministic weak-beat repair: the nearest scale tone within one or
/// two semitones of `target`, preferring the side closer to `prev`.
fn step_neighbor(target: MidiNote, scale: &[PitchClass], prev: i32) -> MidiNote {
    let mut best: Option<(i32, MidiNote)> = None;
    for d in [-2i32, -1, 1, 2] {
        let p = target as i32 + d;
        if p < MELODY_LO as i32 || p > MELODY_HI as i32 {
            continue;
        }
        if !scale.contains(&((p % 12) as PitchClass)) {
            continue;
        }
        let dist = (p - prev).abs();
        match best {
            Some((bd, bp)) if bd < dist || (bd == dist && (bp as i32) <= p) => {}
            _ => best = Some((dist, p as MidiNote)),
        }
    }
    best.map(|(_, p)| p).unwrap_or(target)
}

/// A weak-beat tone one or two scale steps away from its resolution
/// target, preferring the side nearer the previous note.
fn passing_tone(target: MidiNote, scale: &[PitchClass], prev: i32, rng: &mut StdRng) -> MidiNote {
    let mut candidates: Vec<MidiNote> = Vec::new();
    for d in [-2i32, -1, 1, 2] {
        let p = target as i32 + d;
        if p < MELODY_LO as i32 || p > MELODY_HI as i32 {
            continue;
        }
        if scale.contains(&((p % 12) as PitchClass)) {
            candidates.push(p as MidiNote);
        }
    }
    if candidates.is_empty() {
        return target;
    }
    let best_dist = candidates
        .iter()
        .map(|&c| (c as i32 - prev).abs())
        .min()
        .unwrap_or(0);
    let nearest: Vec<MidiNote> = candidates
        .into_iter()
        .filter(|&c| (c as i32 - prev).abs() == best_dist)
        .collect();
    nearest[rng.gen_range(0..nearest.len())]
}

/// Transpose, then fold back into the register by octaves.
fn transpose_in_register(pitch: MidiNote, delta: i32, lo: MidiNote, hi: MidiNote) -> MidiNote {
    let mut p = pitch as i32 + delta;
    while p < lo as i32 {
        p += 12;
    }
    while p > hi as i32 {
        p -= 12;
    }
    p.clamp(lo as i32, hi as i32) as MidiNote
}

fn section_gain(label: SectionLabel) -> f64 {
    match label {
        SectionLabel::Intro => 0.88,
        SectionLabel::Chorus | SectionLabel::ChorusOutro => 1.15,
        SectionLabel::Bridge => 0.96,
        _ => 1.0,
    }
}

/// Per-section velocity scaling; drums and pad get a lighter touch.
fn apply_section_dynamics(timeline: &SectionTimeline, bpb: f64, score: &mut Score) {
    for section in &timeline.sections {
        let start_b = section.start_bar as f64 * bpb;
        let end_b = section.end_bar() as f64 * bpb;
        let gain = section_gain(section.label);
        for (name, events) in score.voices.iter_mut() {
            let g = if name == VOICE_MELODY || name == VOICE_BASS {
                gain
            } else {
                0.5 * gain + 0.5
            };
            for ev in events.iter_mut() {
                if ev.onset_beat >= start_b && ev.onset_beat < end_b {
                    let v = (ev.velocity as f64 * g).round();
                    ev.velocity = v.clamp(1.0, 127.0) as u8;
                }
            }
        }
    }
}

/// Drum fills into each section change: snare 16ths over the last beat of
/// the preceding bar, a kick pickup on the "and" of 4, and a crash on the
/// downbeat.
fn add_section_fills(timeline: &SectionTimeline, bpb: f64, score: &mut Score) {
    if timeline.sections.len() < 2 {
        return;
    }
    let drums = score.voice_mut(VOICE_DRUMS);
    if drums.is_empty() {
        return;
    }
    for section in timeline.sections.iter().skip(1) {
        let start_b = section.start_bar as f64 * bpb;
        let prev_bar = start_b - bpb;
        if prev_bar < 0.0 {
            continue;
        }
        for ofs in [3.0, 3.25, 3.5, 3.75] {
            drums.push(NoteEvent::drum(DrumClass::Snare, prev_bar + ofs, 0.20, 110));
        }
        drums.push(NoteEvent::drum(DrumClass::Kick, prev_bar + 3.5, 0.18, 115));
        drums.push(NoteEvent::drum(DrumClass::Crash, start_b, 1.5, 118));
    }
}
