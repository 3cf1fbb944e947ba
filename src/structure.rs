//! Structure planner: section timeline from the conditioning vector
//!
//! Chooses a proportional section template sized to the requested length,
//! then nudges section boundaries so that every marker falls strictly
//! inside a section. A marker that cannot be placed without shrinking a
//! section below the configured floor fails the request with
//! `UnsatisfiableMarkers` instead of being dropped.

use crate::conditioning::ConditioningVector;
use crate::error::{GenerateError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Default minimum section length in bars.
pub const DEFAULT_MIN_SECTION_BARS: usize = 4;

/// Tolerance for "marker exactly on a boundary", in seconds.
const BOUNDARY_EPS_SECS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionLabel {
    Intro,
    Verse,
    Chorus,
    Bridge,
    ChorusOutro,
    /// Whole-piece section used for very short requests.
    Single,
}

impl SectionLabel {
    /// True for sections where the motif is restated.
    pub fn is_chorus(self) -> bool {
        matches!(self, SectionLabel::Chorus | SectionLabel::ChorusOutro)
    }
}

impl fmt::Display for SectionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SectionLabel::Intro => "Intro",
            SectionLabel::Verse => "Verse",
            SectionLabel::Chorus => "Chorus",
            SectionLabel::Bridge => "Bridge",
            SectionLabel::ChorusOutro => "Chorus/Outro",
            SectionLabel::Single => "A",
        };
        f.write_str(s)
    }
}

/// One contiguous span of bars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub label: SectionLabel,
    pub start_bar: usize,
    pub length_bars: usize,
}

impl Section {
    pub fn end_bar(&self) -> usize {
        self.start_bar + self.length_bars
    }
}

/// Contiguous, non-overlapping sections covering the whole request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionTimeline {
    pub sections: Vec<Section>,
}

impl SectionTimeline {
    pub fn total_bars(&self) -> usize {
        self.sections.last().map(Section::end_bar).unwrap_or(0)
    }

    /// The section containing the given bar.
    pub fn section_at_bar(&self, bar: usize) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| bar >= s.start_bar && bar < s.end_bar())
    }

    /// Interior boundaries, in bars (excludes 0 and the end).
    pub fn interior_boundaries(&self) -> Vec<usize> {
        self.sections
            .iter()
            .skip(1)
            .map(|s| s.start_bar)
            .collect()
    }
}

/// Template proportions: Intro 10%, Verse 35%, Chorus 25%, Bridge 15%,
/// Chorus/Outro 15%.
const TEMPLATE: [(SectionLabel, f64); 5] = [
    (SectionLabel::Intro, 0.10),
    (SectionLabel::Verse, 0.35),
    (SectionLabel::Chorus, 0.25),
    (SectionLabel::Bridge, 0.15),
    (SectionLabel::ChorusOutro, 0.15),
];

pub struct StructurePlanner {
    pub min_section_bars: usize,
}

impl Default for StructurePlanner {
    fn default() -> Self {
        StructurePlanner {
            min_section_bars: DEFAULT_MIN_SECTION_BARS,
        }
    }
}

impl StructurePlanner {
    pub fn new(min_section_bars: usize) -> Self {
        StructurePlanner {
            min_section_bars: min_section_bars.max(1),
        }
    }

    /// Produce the section timeline. Sections are stable-ordered by start
    /// bar; every marker lies strictly inside a section.
    pub fn plan(&self, cv: &ConditioningVector) -> Result<SectionTimeline> {
        let total = cv.total_bars;
        let floor = self.min_section_bars;

        let mut boundaries: Vec<usize> = if total < 2 * floor || cv.total_duration_secs < 20.0 {
            vec![0, total]
        } else {
            let mut cum = 0.0;
            let mut b = vec![0usize];
            for (_, frac) in TEMPLATE.iter().take(TEMPLATE.len() - 1) {
                cum += frac;
                b.push(((total as f64) * cum).round() as usize);
            }
            b.push(total);
            // push boundaries right until every section reaches the floor,
            // dropping trailing boundaries that no longer fit
            let mut fixed = vec![0usize];
            for &raw in b.iter().skip(1).take(b.len() - 2) {
                let lo = fixed.last().copied().unwrap_or(0) + floor;
                let bar = raw.max(lo);
                if bar + floor <= total {
                    fixed.push(bar);
                }
            }
            fixed.push(total);
            fixed
        };
        boundaries.dedup();

        self.place_markers(cv, &mut boundaries)?;

        let labels = self.labels_for(boundaries.len() - 1);
        let sections = boundaries
            .windows(2)
            .zip(labels)
            .map(|(w, label)| Section {
                label,
                start_bar: w[0],
                length_bars: w[1] - w[0],
            })
            .collect();

        let timeline = SectionTimeline { sections };
        debug!(
            sections = timeline.sections.len(),
            total_bars = timeline.total_bars(),
            "structure planned"
        );
        Ok(timeline)
    }

    fn labels_for(&self, count: usize) -> Vec<SectionLabel> {
        if count <= 1 {
            return vec![SectionLabel::Single];
        }
        TEMPLATE
            .iter()
            .map(|(label, _)| *label)
            .take(count)
            .collect()
    }

    /// Nudge interior boundaries so no marker sits exactly on one.
    fn place_markers(&self, cv: &ConditioningVector, boundaries: &mut [usize]) -> Result<()> {
        let floor = self.min_section_bars;
        let last = boundaries.len() - 1;
        for marker in &cv.markers {
            let t = marker.time_sec;
            // outer boundaries cannot move
            for &outer in [boundaries[0], boundaries[last]].iter() {
                let bt = outer as f64 * cv.seconds_per_bar;
                if (t - bt).abs() < BOUNDARY_EPS_SECS {
                    return Err(GenerateError::UnsatisfiableMarkers {
                        tag: marker.tag.clone(),
                        time_sec: t,
                        detail: "marker coincides with the start or end of the piece".into(),
                    });
                }
            }
            for i in 1..last {
                let bt = boundaries[i] as f64 * cv.seconds_per_bar;
                if (t - bt).abs() >= BOUNDARY_EPS_SECS {
                    continue;
                }
                // try moving the boundary one bar earlier, then later
                let earlier_ok = boundaries[i] - boundaries[i - 1] > floor;
                let later_ok = boundaries[i + 1] - boundaries[i] > floor;
                if earlier_ok {
                    boundaries[i] -= 1;
                } else if later_ok {
                    boundaries[i] += 1;
                } else {
                    return Err(GenerateError::UnsatisfiableMarkers {
                        tag: marker.tag.clone(),
                        time_sec: t,
                        detail: format!(
                            "boundary at bar {} cannot move without a section dropping below {} bars",
                            boundaries[i], floor
                        ),
                    });
                }
            }
        }
        // a moved boundary must not have landed on another marker
        for marker in &cv.markers {
            for &b in boundaries.iter() {
                let bt = b as f64 * cv.seconds_per_bar;
                if (marker.time_sec - bt).abs() < BOUNDARY_EPS_SECS {
                    return Err(GenerateError::UnsatisfiableMarkers {
                        tag: marker.tag.clone(),
                        time_sec: marker.time_sec,
                        detail: "boundary adjustment collided with another marker".into(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioning::encode;
    use crate::controls::{Controls, Marker};
    use crate::theory::{Key, Mode};

    fn cv_for(duration: f64, markers: Vec<Marker>) -> ConditioningVector {
        let mut c = Controls::new(Key::parse("C").unwrap(), Mode::Ionian, 120.0, duration);
        c.markers = markers;
        encode(&c).unwrap()
    }

    #[test]
    fn covers_whole_request() {
        let cv = cv_for(60.0, vec![]);
        let tl = StructurePlanner::default().plan(&cv).unwrap();
        assert_eq!(tl.total_bars(), cv.total_bars);
        // contiguity
        for w in tl.sections.windows(2) {
            assert_eq!(w[0].end_bar(), w[1].start_bar);
        }
    }

    #[test]
    fn short_request_is_single_section() {
        let cv = cv_for(12.0, vec![]);
        let tl = StructurePlanner::default().plan(&cv).unwrap();
        assert_eq!(tl.sections.len(), 1);
        assert_eq!(tl.sections[0].label, SectionLabel::Single);
    }

    #[test]
    fn marker_on_boundary_moves_it() {
        // 60s at 120bpm: 30 bars, 2s per bar. Verse/Chorus boundary lands
        // at bar round(30*0.45)=14 -> t=28s. Put a marker exactly there.
        let cv = cv_for(
            60.0,
            vec![Marker {
                time_sec: 28.0,
                tag: "motif".into(),
            }],
        );
        let tl = StructurePlanner::default().plan(&cv).unwrap();
        for &b in &tl.interior_boundaries() {
            let bt = b as f64 * cv.seconds_per_bar;
            assert!((bt - 28.0).abs() > 0.5, "boundary still at marker time");
        }
        // marker is inside exactly one section
        let bar = cv.bar_at(28.0);
        assert!(tl.section_at_bar(bar).is_some());
    }

    #[test]
    fn marker_at_time_zero_is_unsatisfiable() {
        let cv = cv_for(
            60.0,
            vec![Marker {
                time_sec: 0.0,
                tag: "start".into(),
            }],
        );
        assert!(matches!(
            StructurePlanner::default().plan(&cv),
            Err(GenerateError::UnsatisfiableMarkers { .. })
        ));
    }

    #[test]
    fn sections_respect_floor() {
        let cv = cv_for(60.0, vec![]);
        let tl = StructurePlanner::new(4).plan(&cv).unwrap();
        for s in &tl.sections {
            assert!(s.length_bars >= 4, "section {} too short", s.label);
        }
    }
}
