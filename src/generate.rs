//! Request orchestration: the staged pipeline from controls to result
//!
//! Strictly forward flow: encode -> structure -> harmony -> melody/rhythm
//! -> groove -> streamed render -> mixdown. Each stage hands its output
//! to the next read-only; constraint conflicts fail loudly instead of
//! mutating upstream artifacts. Planning errors abort before any audio;
//! render errors are chunk-scoped with one fallback retry; cancellation
//! returns a partial result with `Cancelled` stems.

use crate::annotate::AnnotationSheet;
use crate::conditioning::{encode, ConditioningVector};
use crate::controls::Controls;
use crate::error::{GenerateError, Result};
use crate::groove::{GrooveGrid, GrooveImposer, GrooveTemplate, DEFAULT_MAX_OFFSET_MS};
use crate::harmony::{ChordSequence, HarmonyPlanner};
use crate::melody::MelodyRhythmPlanner;
use crate::mixdown::{mix_master, Mixdown, Stem, StemStatus, StreamMixdown};
use crate::render::{
    CancellationToken, ChunkMessage, ChunkStream, RenderOptions, TimbreRenderer,
};
use crate::score::Score;
use crate::structure::{SectionTimeline, StructurePlanner, DEFAULT_MIN_SECTION_BARS};
use crossbeam::channel::Select;
use rand::prelude::*;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Seed for the stochastic planning choices. Constraint satisfaction
    /// holds for every seed; the seed only varies the free choices.
    pub seed: u64,
    /// Groove imposition strength in [0, 1]. 0 quantizes, 1 reproduces
    /// the reference feel.
    pub groove_strength: f64,
    pub groove_grid: GrooveGrid,
    /// Cap on imposed micro-timing, in milliseconds.
    pub max_groove_offset_ms: f64,
    pub min_section_bars: usize,
    pub render: RenderOptions,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        GenerateOptions {
            seed: 0,
            groove_strength: 1.0,
            groove_grid: GrooveGrid::default(),
            max_groove_offset_ms: DEFAULT_MAX_OFFSET_MS,
            min_section_bars: DEFAULT_MIN_SECTION_BARS,
            render: RenderOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Completed,
    Cancelled,
}

/// Everything a generation request produces, handed to export
/// collaborators.
pub struct GenerationResult {
    pub conditioning: ConditioningVector,
    pub timeline: SectionTimeline,
    pub chords: ChordSequence,
    /// The score after groove imposition.
    pub score: Score,
    pub stems: BTreeMap<String, Stem>,
    pub master: Mixdown,
    pub annotations: AnnotationSheet,
    pub status: RequestStatus,
}

/// Run the whole pipeline for one request.
pub fn generate(
    controls: &Controls,
    options: &GenerateOptions,
    cancel: CancellationToken,
) -> Result<GenerationResult> {
    let cv = encode(controls)?;
    info!(
        key = cv.key.name(),
        mode = cv.mode.name(),
        bpm = cv.tempo_bpm,
        bars = cv.total_bars,
        "request encoded"
    );

    let timeline = StructurePlanner::new(options.min_section_bars).plan(&cv)?;
    let mut rng = StdRng::seed_from_u64(options.seed);
    let chords = HarmonyPlanner::default().plan(&cv, &timeline, &mut rng)?;
    let planned = MelodyRhythmPlanner::default().plan(&cv, &timeline, &chords, &mut rng)?;

    let score = match cv.groove_reference.as_deref() {
        Some(reference) if !reference.is_empty() => {
            let template = GrooveTemplate::from_reference(reference, options.groove_grid);
            let imposer = GrooveImposer::with_max_ms(options.max_groove_offset_ms, cv.tempo_bpm);
            imposer.impose(&planned.score, &template, options.groove_strength)
        }
        _ => planned.score.clone(),
    };

    // planning is complete; stream the audio
    let renderer = TimbreRenderer::new(options.render.clone());
    let stream = renderer.render_stream(&score, &cv, &cv.instruments, cancel.clone())?;
    let (stems, status) = collect_stems(stream, &cancel)?;

    let master = mix_master(&stems.0, &stems.1);
    let annotations = AnnotationSheet::build(
        &cv,
        &timeline,
        &chords,
        &planned.motifs,
        &score,
        options.groove_grid,
    );

    info!(?status, stems = stems.0.len(), "request finished");
    Ok(GenerationResult {
        conditioning: cv,
        timeline,
        chords,
        score,
        stems: stems.0,
        master,
        annotations,
        status,
    })
}

type StemsAndPans = (BTreeMap<String, Stem>, Vec<(String, f32)>);

/// Drain the chunk stream into the mixdown, serializing writes per stem
/// while stems progress concurrently. Render failures cancel the rest of
/// the request and propagate.
fn collect_stems(
    stream: ChunkStream,
    cancel: &CancellationToken,
) -> Result<(StemsAndPans, RequestStatus)> {
    let mut mixdown = StreamMixdown::new();
    let mut completed: BTreeMap<String, bool> = BTreeMap::new();
    let mut failure: Option<GenerateError> = None;

    {
        let receivers = &stream.receivers;
        let mut open: Vec<bool> = vec![true; receivers.len()];
        let mut sel = Select::new();
        for (_, rx) in receivers {
            sel.recv(rx);
        }
        while open.iter().any(|&o| o) {
            let oper = sel.select();
            let idx = oper.index();
            match oper.recv(&receivers[idx].1) {
                Ok(ChunkMessage::Chunk(chunk)) => {
                    // chunks dispatched before cancellation may finish
                    // rendering, but nothing commits after the cut
                    if cancel.is_cancelled() {
                        continue;
                    }
                    if let Err(e) = mixdown.accumulate(chunk) {
                        warn!(error = %e, "mixdown rejected a chunk; cancelling request");
                        cancel.cancel();
                        failure.get_or_insert(e);
                    }
                }
                Ok(ChunkMessage::Done { stem_id, completed: done }) => {
                    completed.insert(stem_id, done);
                }
                Ok(ChunkMessage::Failed(e)) => {
                    warn!(error = %e, "stem failed; cancelling request");
                    cancel.cancel();
                    failure.get_or_insert(e);
                }
                Err(_) => {
                    open[idx] = false;
                    sel.remove(idx);
                }
            }
        }
    }

    let pans = stream.pans.clone();
    let sample_rate = stream.sample_rate;
    let stem_ids: Vec<String> = pans.iter().map(|(id, _)| id.clone()).collect();
    stream.join();

    if let Some(e) = failure {
        return Err(e);
    }

    let mut stems = BTreeMap::new();
    let mut any_cancelled = false;
    for stem_id in stem_ids {
        let done = completed.get(&stem_id).copied().unwrap_or(false);
        let status = if done {
            StemStatus::Finalized
        } else {
            any_cancelled = true;
            StemStatus::Cancelled
        };
        let stem = if mixdown.has_stem(&stem_id) {
            mixdown.finalize(&stem_id, status)?
        } else {
            // cancelled before the first chunk committed
            Stem {
                stem_id: stem_id.clone(),
                sample_rate,
                samples: Vec::new(),
                status,
                committed_chunks: 0,
            }
        };
        stems.insert(stem_id, stem);
    }

    let status = if any_cancelled {
        RequestStatus::Cancelled
    } else {
        RequestStatus::Completed
    };
    Ok(((stems, pans), status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theory::{Key, Mode};

    fn quick_options() -> GenerateOptions {
        GenerateOptions::default()
    }

    #[test]
    fn short_request_completes_end_to_end() {
        let controls = Controls::new(Key::parse("C").unwrap(), Mode::Ionian, 120.0, 8.0);
        let result = generate(&controls, &quick_options(), CancellationToken::new()).unwrap();
        assert_eq!(result.status, RequestStatus::Completed);
        assert_eq!(result.stems.len(), 4);
        for stem in result.stems.values() {
            assert_eq!(stem.status, StemStatus::Finalized);
            assert_eq!(stem.samples.len(), (8.0 * 44100.0) as usize);
        }
        assert_eq!(result.master.left.len(), (8.0 * 44100.0) as usize);
    }

    #[test]
    fn planning_failure_produces_no_audio() {
        let mut controls = Controls::new(Key::parse("C").unwrap(), Mode::Ionian, 120.0, 8.0);
        controls.harmonic_anchor = vec!["F#".into()];
        let err = generate(&controls, &quick_options(), CancellationToken::new());
        assert!(matches!(
            err,
            Err(GenerateError::UnsatisfiableAnchor { .. })
        ));
    }
}
