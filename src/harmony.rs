//! Harmony planner: bar-by-bar chords aligned to the section timeline
//!
//! The user's harmonic anchor is reproduced verbatim for its covered bars.
//! Every later bar is chosen from the diatonic triads of the key/mode
//! (plus a bounded modal-borrowing pool), voice-led from the previous
//! voicing. Candidates whose best voicing still produces parallel perfect
//! fifths or octaves between the two lowest voices are discarded; ties are
//! broken by cadential strength (root a fifth or step away) and then by
//! total voice movement.

use crate::conditioning::ConditioningVector;
use crate::error::{GenerateError, Result};
use crate::structure::SectionTimeline;
use crate::theory::{nearest_pitch_in_pcs, pc_name, Chord, MidiNote, PitchClass};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Bass voice register for voicings.
const BASS_LO: MidiNote = 40; // E2
const BASS_HI: MidiNote = 60; // C4
/// Upper-voice register for voicings.
const UPPER_LO: MidiNote = 52; // E3
const UPPER_HI: MidiNote = 79; // G5

/// One chord occupying one bar, with a concrete voicing (ascending MIDI
/// pitches, bass first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordEvent {
    pub start_bar: usize,
    pub chord: Chord,
    pub voicing: Vec<MidiNote>,
}

/// Ordered chords, one per bar, covering the whole timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordSequence {
    pub events: Vec<ChordEvent>,
}

impl ChordSequence {
    pub fn len_bars(&self) -> usize {
        self.events.len()
    }

    pub fn chord_at_bar(&self, bar: usize) -> &ChordEvent {
        let idx = bar.min(self.events.len().saturating_sub(1));
        &self.events[idx]
    }

    /// The chord event active at a beat-relative onset (4 beats per bar).
    pub fn chord_at_beat(&self, onset_beat: f64, beats_per_bar: u32) -> &ChordEvent {
        let bar = (onset_beat / beats_per_bar as f64).floor().max(0.0) as usize;
        self.chord_at_bar(bar)
    }
}

pub struct HarmonyPlanner {
    /// Borrowed (non-diatonic) chords allowed per 8 generated bars.
    pub borrowing_per_8_bars: usize,
}

impl Default for HarmonyPlanner {
    fn default() -> Self {
        HarmonyPlanner {
            borrowing_per_8_bars: 1,
        }
    }
}

struct Candidate {
    chord: Chord,
    borrowed: bool,
}

impl HarmonyPlanner {
    /// Plan the chord sequence. Fails with `UnsatisfiableAnchor` when an
    /// anchor chord shares no pitch class with the declared key/mode.
    pub fn plan(
        &self,
        cv: &ConditioningVector,
        timeline: &SectionTimeline,
        rng: &mut StdRng,
    ) -> Result<ChordSequence> {
        let total_bars = timeline.total_bars();

        for (bar, chord) in cv.anchor.iter().enumerate() {
            if !chord.intersects_scale(&cv.scale) {
                return Err(GenerateError::UnsatisfiableAnchor {
                    bar,
                    symbol: chord.symbol.clone(),
                    detail: format!(
                        "no pitch class of the chord lies in {} {}",
                        cv.key.name(),
                        cv.mode.name()
                    ),
                });
            }
        }

        let diatonic = diatonic_triads(cv.scale.as_slice());
        let borrowed_pool: Vec<Chord> = {
            let parallel_scale = cv.key.scale(cv.mode.parallel());
            diatonic_triads(&parallel_scale)
                .into_iter()
                .filter(|c| !diatonic.iter().any(|d| d.pitch_classes() == c.pitch_classes()))
                .collect()
        };

        let generated_bars = total_bars.saturating_sub(cv.anchor.len());
        let mut borrow_budget = (generated_bars / 8) * self.borrowing_per_8_bars;

        let mut events: Vec<ChordEvent> = Vec::with_capacity(total_bars);

        // anchor bars, verbatim
        for (bar, chord) in cv.anchor.iter().enumerate() {
            let voicing = match events.last() {
                None => initial_voicing(chord),
                Some(prev) => match best_voicing(&prev.voicing, chord) {
                    Some((v, _)) => v,
                    None => {
                        // the anchor is a hard constraint: accept the
                        // voicing with least movement even if it carries
                        // a parallel perfect interval
                        warn!(bar, symbol = %chord.symbol, "anchor voicing keeps a parallel perfect interval");
                        fallback_voicing(&prev.voicing, chord)
                    }
                },
            };
            events.push(ChordEvent {
                start_bar: bar,
                chord: chord.clone(),
                voicing,
            });
        }

        // first bar without an anchor: start from the tonic triad
        if events.is_empty() && total_bars > 0 {
            let tonic = diatonic[0].clone();
            let voicing = initial_voicing(&tonic);
            events.push(ChordEvent {
                start_bar: 0,
                chord: tonic,
                voicing,
            });
        }

        while events.len() < total_bars {
            let bar = events.len();
            let prev = events.last().expect("at least one chord planned").clone();

            let mut pool: Vec<Candidate> = diatonic
                .iter()
                .cloned()
                .map(|chord| Candidate {
                    chord,
                    borrowed: false,
                })
                .collect();
            if borrow_budget > 0 {
                pool.extend(borrowed_pool.iter().cloned().map(|chord| Candidate {
                    chord,
                    borrowed: true,
                }));
            }

            // final bar closes on the tonic when it can
            if bar + 1 == total_bars {
                let tonic = diatonic
                    .iter()
                    .find(|c| c.root == cv.key.tonic)
                    .cloned()
                    .unwrap_or_else(|| diatonic[0].clone());
                if let Some((voicing, _)) = best_voicing(&prev.voicing, &tonic) {
                    events.push(ChordEvent {
                        start_bar: bar,
                        chord: tonic,
                        voicing,
                    });
                    continue;
                }
            }

            let mut scored: Vec<(f64, i32, Vec<MidiNote>, Candidate)> = Vec::new();
            for cand in pool {
                let Some((voicing, movement)) = best_voicing(&prev.voicing, &cand.chord) else {
                    continue;
                };
                let mut cadence = cadence_score(prev.chord.root, cand.chord.root);
                if cand.borrowed {
                    cadence -= 0.25;
                }
                scored.push((cadence, movement, voicing, cand));
            }

            if scored.is_empty() {
                // should not happen with seven diatonic candidates, but
                // never leave a hole: restate the previous chord
                warn!(bar, "no voice-leadable candidate; restating previous chord");
                events.push(ChordEvent {
                    start_bar: bar,
                    ..prev
                });
                continue;
            }

            let best_cadence = scored
                .iter()
                .map(|(c, ..)| *c)
                .fold(f64::NEG_INFINITY, f64::max);
            let min_movement = scored
                .iter()
                .filter(|(c, ..)| *c == best_cadence)
                .map(|(_, m, ..)| *m)
                .min()
                .unwrap_or(0);
            let tied: Vec<usize> = scored
                .iter()
                .enumerate()
                .filter(|(_, (c, m, ..))| *c == best_cadence && *m == min_movement)
                .map(|(i, _)| i)
                .collect();
            let pick = tied[rng.gen_range(0..tied.len())];
            let (_, _, voicing, cand) = scored.swap_remove(pick);

            if cand.borrowed {
                borrow_budget -= 1;
                debug!(bar, symbol = %cand.chord.symbol, "borrowed chord used");
            }
            events.push(ChordEvent {
                start_bar: bar,
                chord: cand.chord,
                voicing,
            });
        }

        debug!(bars = events.len(), "harmony planned");
        Ok(ChordSequence { events })
    }
}

/// Stacked-third triads on every scale degree.
fn diatonic_triads(scale: &[PitchClass]) -> Vec<Chord> {
    let n = scale.len();
    (0..n)
        .map(|d| {
            let root = scale[d];
            let third = scale[(d + 2) % n];
            let fifth = scale[(d + 4) % n];
            chord_from_pcs(root, third, fifth)
        })
        .collect()
}

fn chord_from_pcs(root: PitchClass, third: PitchClass, fifth: PitchClass) -> Chord {
    let iv3 = ((third as i32 - root as i32).rem_euclid(12)) as i32;
    let iv5 = ((fifth as i32 - root as i32).rem_euclid(12)) as i32;
    let suffix = match (iv3, iv5) {
        (4, 7) => "",
        (3, 7) => "m",
        (3, 6) => "dim",
        (4, 8) => "aug",
        _ => "",
    };
    Chord {
        root,
        intervals: vec![0, iv3, iv5],
        symbol: format!("{}{}", pc_name(root), suffix),
    }
}

/// Root-position voicing near the low-middle register, used for the very
/// first chord.
fn initial_voicing(chord: &Chord) -> Vec<MidiNote> {
    let pcs = chord.pitch_classes();
    let bass = nearest_pitch_in_pcs(48, &[pcs[0]], BASS_LO, BASS_HI);
    let mut voicing = vec![bass];
    let mut above = bass;
    for &pc in pcs.iter().skip(1) {
        let mut p = above + 1;
        while p % 12 != pc {
            p += 1;
        }
        voicing.push(p);
        above = p;
    }
    voicing
}

/// Best parallel-free voicing of `chord` voice-led from `prev`, together
/// with its total movement. `None` when every assignment of the upper
/// chord tones still yields parallel perfect fifths/octaves between the
/// two lowest voices.
fn best_voicing(prev: &[MidiNote], chord: &Chord) -> Option<(Vec<MidiNote>, i32)> {
    let mut best: Option<(Vec<MidiNote>, i32)> = None;
    for voicing in voicing_options(prev, chord) {
        if has_parallel_perfect(prev, &voicing) {
            continue;
        }
        let movement = movement_cost(prev, &voicing);
        match &best {
            Some((_, m)) if *m <= movement => {}
            _ => best = Some((voicing, movement)),
        }
    }
    best
}

/// Least-movement voicing ignoring the parallel filter (anchor fallback).
fn fallback_voicing(prev: &[MidiNote], chord: &Chord) -> Vec<MidiNote> {
    voicing_options(prev, chord)
        .into_iter()
        .min_by_key(|v| movement_cost(prev, v))
        .unwrap_or_else(|| initial_voicing(chord))
}

/// Enumerate voice-led voicings: root in the bass nearest the previous
/// bass, upper chord tones assigned to the previous upper voices in every
/// permutation.
fn voicing_options(prev: &[MidiNote], chord: &Chord) -> Vec<Vec<MidiNote>> {
    let pcs = chord.pitch_classes();
    let nearest_bass = nearest_pitch_in_pcs(prev[0] as i32, &[pcs[0]], BASS_LO, BASS_HI);
    // octave alternatives let the bass approach from the other direction,
    // which breaks otherwise-unavoidable parallel motion
    let mut basses = vec![nearest_bass];
    for alt in [nearest_bass as i32 - 12, nearest_bass as i32 + 12] {
        if alt >= BASS_LO as i32 && alt <= BASS_HI as i32 {
            basses.push(alt as MidiNote);
        }
    }
    let uppers: Vec<PitchClass> = pcs.iter().skip(1).copied().collect();

    let prev_upper: Vec<MidiNote> = if prev.len() > 1 {
        prev[1..].to_vec()
    } else {
        vec![prev[0] + 12]
    };
    let anchor_for = |j: usize| -> i32 {
        let idx = j.min(prev_upper.len() - 1);
        prev_upper[idx] as i32
    };

    let mut out = Vec::new();
    for &bass in &basses {
        for perm in permutations(&uppers) {
            let mut voicing = vec![bass];
            for (j, &pc) in perm.iter().enumerate() {
                let p =
                    nearest_pitch_in_pcs(anchor_for(j), &[pc], UPPER_LO.max(bass + 1), UPPER_HI);
                voicing.push(p);
            }
            voicing.sort_unstable();
            voicing.dedup();
            if voicing.len() == pcs.len() {
                out.push(voicing);
            }
        }
    }
    if out.is_empty() {
        out.push(initial_voicing(chord));
    }
    out
}

fn permutations(items: &[PitchClass]) -> Vec<Vec<PitchClass>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head);
            out.push(tail);
        }
    }
    out
}

fn movement_cost(prev: &[MidiNote], next: &[MidiNote]) -> i32 {
    let n = prev.len().min(next.len());
    (0..n)
        .map(|i| (next[i] as i32 - prev[i] as i32).abs())
        .sum()
}

/// Parallel perfect fifth/octave between the two lowest voices: both move
/// in the same direction while the interval class stays the same perfect
/// interval.
fn has_parallel_perfect(prev: &[MidiNote], next: &[MidiNote]) -> bool {
    if prev.len() < 2 || next.len() < 2 {
        return false;
    }
    let iv_prev = (prev[1] as i32 - prev[0] as i32).rem_euclid(12);
    let iv_next = (next[1] as i32 - next[0] as i32).rem_euclid(12);
    let is_perfect = |iv: i32| iv == 0 || iv == 7;
    let d0 = next[0] as i32 - prev[0] as i32;
    let d1 = next[1] as i32 - prev[1] as i32;
    is_perfect(iv_prev) && iv_prev == iv_next && d0 != 0 && d0.signum() == d1.signum()
}

/// Cadential strength of a root motion: fifth-related is strongest, then
/// stepwise, then everything else.
fn cadence_score(prev_root: PitchClass, next_root: PitchClass) -> f64 {
    let iv = (next_root as i32 - prev_root as i32).rem_euclid(12);
    match iv {
        5 | 7 => 2.0,
        1 | 2 | 10 | 11 => 1.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioning::encode;
    use crate::controls::Controls;
    use crate::structure::StructurePlanner;
    use crate::theory::{Key, Mode};
    use rand::SeedableRng;

    fn plan_for(anchor: Vec<&str>, seed: u64) -> (ConditioningVector, ChordSequence) {
        let mut c = Controls::new(Key::parse("C").unwrap(), Mode::Ionian, 120.0, 60.0);
        c.harmonic_anchor = anchor.into_iter().map(str::to_string).collect();
        let cv = encode(&c).unwrap();
        let tl = StructurePlanner::default().plan(&cv).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let seq = HarmonyPlanner::default().plan(&cv, &tl, &mut rng).unwrap();
        (cv, seq)
    }

    #[test]
    fn anchor_is_verbatim_prefix() {
        let (_, seq) = plan_for(vec!["Am", "G", "C", "F"], 7);
        let symbols: Vec<_> = seq.events[..4].iter().map(|e| e.chord.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["Am", "G", "C", "F"]);
    }

    #[test]
    fn covers_every_bar() {
        let (cv, seq) = plan_for(vec!["Am", "G", "C", "F"], 3);
        assert_eq!(seq.len_bars(), cv.total_bars);
        for (i, e) in seq.events.iter().enumerate() {
            assert_eq!(e.start_bar, i);
        }
    }

    #[test]
    fn generated_chords_stay_in_pool() {
        let (cv, seq) = plan_for(vec![], 11);
        let diatonic = diatonic_triads(&cv.scale);
        let borrowed: Vec<Chord> = diatonic_triads(&cv.key.scale(cv.mode.parallel()));
        for e in &seq.events {
            let pcs = e.chord.pitch_classes();
            let known = diatonic.iter().chain(borrowed.iter()).any(|c| c.pitch_classes() == pcs);
            assert!(known, "chord {} outside candidate pools", e.chord.symbol);
        }
    }

    #[test]
    fn no_parallel_perfects_outside_anchor() {
        let (_, seq) = plan_for(vec![], 5);
        for w in seq.events.windows(2) {
            assert!(
                !has_parallel_perfect(&w[0].voicing, &w[1].voicing),
                "parallel perfect between bars {} and {}",
                w[0].start_bar,
                w[1].start_bar
            );
        }
    }

    #[test]
    fn unsatisfiable_anchor_reports_bar() {
        // F# major triad shares no pitch class with C ionian
        let mut c = Controls::new(Key::parse("C").unwrap(), Mode::Ionian, 120.0, 60.0);
        c.harmonic_anchor = vec!["C".into(), "F#".into()];
        let cv = encode(&c).unwrap();
        let tl = StructurePlanner::default().plan(&cv).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        match HarmonyPlanner::default().plan(&cv, &tl, &mut rng) {
            Err(GenerateError::UnsatisfiableAnchor { bar, symbol, .. }) => {
                assert_eq!(bar, 1);
                assert_eq!(symbol, "F#");
            }
            other => panic!("expected UnsatisfiableAnchor, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn voicings_are_ascending() {
        let (_, seq) = plan_for(vec!["Am", "G", "C", "F"], 1);
        for e in &seq.events {
            for w in e.voicing.windows(2) {
                assert!(w[0] < w[1], "voicing not ascending in {}", e.chord.symbol);
            }
        }
    }

    #[test]
    fn final_bar_resolves_to_tonic() {
        let (cv, seq) = plan_for(vec![], 42);
        assert_eq!(seq.events.last().unwrap().chord.root, cv.key.tonic);
    }
}
