//! Derived annotation sheet: sections, chords, motifs, groove stats
//!
//! A flat, serializable view of what was planned and how far the groove
//! pushed the performance off the grid. Export collaborators turn this
//! into CSV/JSON; the sheet itself is format-agnostic.

use crate::conditioning::ConditioningVector;
use crate::groove::GrooveGrid;
use crate::harmony::ChordSequence;
use crate::melody::MotifOccurrence;
use crate::score::Score;
use crate::structure::SectionTimeline;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRow {
    pub label: String,
    pub start_bar: usize,
    pub end_bar: usize,
    pub start_sec: f64,
    pub end_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordRow {
    pub bar: usize,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotifRow {
    pub start_bar: usize,
    pub source_bar: usize,
    pub transposition_semitones: i32,
}

/// Mean absolute deviation of a voice's onsets from the quantization
/// grid, after groove imposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrooveDeviationRow {
    pub voice: String,
    pub note_count: usize,
    pub mean_abs_deviation_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationSheet {
    pub sections: Vec<SectionRow>,
    pub chords: Vec<ChordRow>,
    pub motifs: Vec<MotifRow>,
    pub groove_deviation: Vec<GrooveDeviationRow>,
}

impl AnnotationSheet {
    pub fn build(
        cv: &ConditioningVector,
        timeline: &SectionTimeline,
        chords: &ChordSequence,
        motifs: &[MotifOccurrence],
        post_groove: &Score,
        grid: GrooveGrid,
    ) -> AnnotationSheet {
        let sections = timeline
            .sections
            .iter()
            .map(|s| SectionRow {
                label: s.label.to_string(),
                start_bar: s.start_bar,
                end_bar: s.end_bar(),
                start_sec: s.start_bar as f64 * cv.seconds_per_bar,
                end_sec: s.end_bar() as f64 * cv.seconds_per_bar,
            })
            .collect();

        let chords = chords
            .events
            .iter()
            .map(|e| ChordRow {
                bar: e.start_bar,
                symbol: e.chord.symbol.clone(),
            })
            .collect();

        let motifs = motifs
            .iter()
            .map(|m| MotifRow {
                start_bar: m.start_bar,
                source_bar: m.source_bar,
                transposition_semitones: m.transposition_semitones,
            })
            .collect();

        let steps = grid.steps_per_beat() as f64;
        let ms_per_beat = cv.seconds_per_beat * 1000.0;
        let groove_deviation = post_groove
            .voices
            .iter()
            .map(|(voice, events)| {
                let mut sum = 0.0;
                for ev in events {
                    let nearest = (ev.onset_beat * steps).round() / steps;
                    sum += (ev.onset_beat - nearest).abs() * ms_per_beat;
                }
                let n = events.len();
                GrooveDeviationRow {
                    voice: voice.clone(),
                    note_count: n,
                    mean_abs_deviation_ms: if n == 0 { 0.0 } else { sum / n as f64 },
                }
            })
            .collect();

        AnnotationSheet {
            sections,
            chords,
            motifs,
            groove_deviation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioning::encode;
    use crate::controls::Controls;
    use crate::harmony::HarmonyPlanner;
    use crate::melody::MelodyRhythmPlanner;
    use crate::structure::StructurePlanner;
    use crate::theory::{Key, Mode};
    use rand::prelude::*;

    #[test]
    fn sheet_mirrors_planning_artifacts() {
        let mut c = Controls::new(Key::parse("C").unwrap(), Mode::Ionian, 120.0, 60.0);
        c.harmonic_anchor = vec!["Am".into(), "G".into(), "C".into(), "F".into()];
        let cv = encode(&c).unwrap();
        let tl = StructurePlanner::default().plan(&cv).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let chords = HarmonyPlanner::default().plan(&cv, &tl, &mut rng).unwrap();
        let planned = MelodyRhythmPlanner::default()
            .plan(&cv, &tl, &chords, &mut rng)
            .unwrap();

        let sheet = AnnotationSheet::build(
            &cv,
            &tl,
            &chords,
            &planned.motifs,
            &planned.score,
            GrooveGrid::default(),
        );
        assert_eq!(sheet.sections.len(), tl.sections.len());
        assert_eq!(sheet.chords.len(), cv.total_bars);
        assert_eq!(sheet.chords[0].symbol, "Am");
        // the planner emits on-grid onsets, so deviation is zero
        for row in &sheet.groove_deviation {
            assert!(row.mean_abs_deviation_ms < 1e-6);
        }
    }
}
