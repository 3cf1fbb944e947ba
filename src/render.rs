//! Streamed timbre renderer: score to per-stem audio chunks
//!
//! The musical timeline is partitioned into fixed windows with a fixed
//! overlap. Each stem renders on its own worker thread, chunk by chunk in
//! strict onset order, threading its carried synthesis state from one
//! chunk to the next. Different stems are independent and render in
//! parallel. The produced stream is finite and non-restartable: consume
//! it once, re-rendering needs a fresh call.
//!
//! Per-chunk budget: a chunk that exceeds its render budget is retried
//! once on the sample-layer fallback route; exceeding it again fails the
//! stem with `RenderTimeout`. Cancellation lets in-flight chunks finish
//! but dispatches nothing further.

use crate::conditioning::ConditioningVector;
use crate::controls::InstrumentSpec;
use crate::error::{GenerateError, Result};
use crate::score::{PitchOrDrum, Score, VOICE_BASS, VOICE_DRUMS, VOICE_INNER, VOICE_MELODY};
use crate::synth::{
    route_for_instrument, ActiveNote, ChunkContext, RouteState, SampleLayer, SynthRoute,
};
use crate::theory::midi_to_freq;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_SAMPLE_RATE: u32 = 44100;
/// Window length in seconds (2-4s keeps the first-chunk latency bounded).
pub const DEFAULT_WINDOW_SECS: f64 = 3.0;
/// Overlap as a fraction of the window length.
pub const DEFAULT_OVERLAP_FRACTION: f64 = 0.15;
/// Context gathered before a window start for legato continuity.
pub const DEFAULT_LOOKBEHIND_SECS: f64 = 1.0;

/// One chunk of rendered PCM for one stem. Owned by the mixdown once
/// emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedChunk {
    pub stem_id: String,
    pub chunk_index: usize,
    pub sample_rate: u32,
    /// Absolute position of the first sample in the stem.
    pub start_sample: usize,
    /// Body plus overlap tail.
    pub pcm: Vec<f32>,
    /// Length of the overlap tail at the end of `pcm` (0 on the last
    /// chunk).
    pub overlap_tail_samples: usize,
}

impl RenderedChunk {
    pub fn body_samples(&self) -> usize {
        self.pcm.len() - self.overlap_tail_samples
    }
}

/// Message on a stem's chunk channel.
#[derive(Debug)]
pub enum ChunkMessage {
    Chunk(RenderedChunk),
    /// The stem finished. `completed` is false when cancellation stopped
    /// dispatch early.
    Done { stem_id: String, completed: bool },
    Failed(GenerateError),
}

/// Cooperative cancellation token shared between the caller and the
/// render workers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub sample_rate: u32,
    pub window_secs: f64,
    pub overlap_fraction: f64,
    pub lookbehind_secs: f64,
    /// Per-chunk render budget.
    pub chunk_timeout: Duration,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            sample_rate: DEFAULT_SAMPLE_RATE,
            window_secs: DEFAULT_WINDOW_SECS,
            overlap_fraction: DEFAULT_OVERLAP_FRACTION,
            lookbehind_secs: DEFAULT_LOOKBEHIND_SECS,
            chunk_timeout: Duration::from_secs(2),
        }
    }
}

/// Everything one stem worker needs: its notes, its routes and its pan.
/// The route objects are shared read-only; the carried state is created
/// inside the worker and never leaves it.
pub struct StemSpec {
    pub stem_id: String,
    pub notes: Vec<ActiveNote>,
    pub route: Arc<dyn SynthRoute>,
    pub fallback: Arc<dyn SynthRoute>,
    pub pan: f32,
}

/// A finite, non-restartable stream of chunks, one channel per stem.
pub struct ChunkStream {
    pub receivers: Vec<(String, Receiver<ChunkMessage>)>,
    pub pans: Vec<(String, f32)>,
    handles: Vec<JoinHandle<()>>,
    pub total_samples: usize,
    pub sample_rate: u32,
}

impl ChunkStream {
    /// Wait for every worker to finish. Receivers must have been drained
    /// first.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

pub struct TimbreRenderer {
    pub options: RenderOptions,
}

impl Default for TimbreRenderer {
    fn default() -> Self {
        TimbreRenderer {
            options: RenderOptions::default(),
        }
    }
}

impl TimbreRenderer {
    pub fn new(options: RenderOptions) -> Self {
        TimbreRenderer { options }
    }

    /// Resolve routes for every instrument, project the score onto the
    /// absolute clock and start one worker per stem. Route resolution
    /// failures surface here, before any audio is produced.
    pub fn render_stream(
        &self,
        score: &Score,
        cv: &ConditioningVector,
        instruments: &[InstrumentSpec],
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        let sr = self.options.sample_rate;
        let fallback: Arc<dyn SynthRoute> = Arc::new(SampleLayer::new(sr));

        let mut stems = Vec::with_capacity(instruments.len());
        let mut assigned: Vec<&'static str> = Vec::new();
        for spec in instruments {
            let route: Arc<dyn SynthRoute> = route_for_instrument(spec, sr)?.into();
            let voice = voice_for_instrument(spec, &assigned);
            assigned.push(voice);
            let notes = project_voice(score.voice(voice), cv);
            stems.push(StemSpec {
                stem_id: spec.name.clone(),
                notes,
                route,
                fallback: fallback.clone(),
                pan: pan_for_voice(voice),
            });
        }
        info!(stems = stems.len(), "render stream starting");
        Ok(self.render_stream_with(stems, cv, cancel))
    }

    /// Start workers over explicit stem specs. Public so callers (and
    /// tests) can inject their own capability objects.
    pub fn render_stream_with(
        &self,
        stems: Vec<StemSpec>,
        cv: &ConditioningVector,
        cancel: CancellationToken,
    ) -> ChunkStream {
        let opts = self.options.clone();
        let cv = Arc::new(cv.clone());
        let total_samples = (cv.total_duration_secs * opts.sample_rate as f64).ceil() as usize;

        let mut receivers = Vec::with_capacity(stems.len());
        let mut pans = Vec::with_capacity(stems.len());
        let mut handles = Vec::with_capacity(stems.len());

        for stem in stems {
            let (tx, rx) = unbounded::<ChunkMessage>();
            receivers.push((stem.stem_id.clone(), rx));
            pans.push((stem.stem_id.clone(), stem.pan));
            let cv = cv.clone();
            let opts = opts.clone();
            let cancel = cancel.clone();
            let name = format!("stem-{}", stem.stem_id);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || run_stem_worker(stem, cv, opts, cancel, tx))
                .expect("failed to spawn stem worker");
            handles.push(handle);
        }

        ChunkStream {
            receivers,
            pans,
            handles,
            total_samples,
            sample_rate: opts.sample_rate,
        }
    }
}

/// Worker loop: strict chunk order, carried state, timeout with one
/// fallback retry, cooperative cancellation between dispatches.
fn run_stem_worker(
    stem: StemSpec,
    cv: Arc<ConditioningVector>,
    opts: RenderOptions,
    cancel: CancellationToken,
    tx: Sender<ChunkMessage>,
) {
    let sr = opts.sample_rate;
    let total_samples = (cv.total_duration_secs * sr as f64).ceil() as usize;
    let window_samples = ((opts.window_secs * sr as f64) as usize).max(1);
    let overlap_samples = ((opts.window_secs * opts.overlap_fraction) * sr as f64) as usize;
    let chunk_count = total_samples.div_ceil(window_samples);

    let mut state = RouteState::default();
    let mut fallback_state = RouteState::default();

    for chunk_index in 0..chunk_count {
        if cancel.is_cancelled() {
            debug!(stem = %stem.stem_id, chunk_index, "cancelled before dispatch");
            let _ = tx.send(ChunkMessage::Done {
                stem_id: stem.stem_id.clone(),
                completed: false,
            });
            return;
        }

        let start_sample = chunk_index * window_samples;
        let body_samples = window_samples.min(total_samples - start_sample);
        let is_last = chunk_index + 1 == chunk_count;
        let tail_samples = if is_last { 0 } else { overlap_samples };
        let samples = body_samples + tail_samples;
        let start_sec = start_sample as f64 / sr as f64;
        let end_sec = (start_sample + samples) as f64 / sr as f64;

        // local context: notes sounding in the window plus lookbehind,
        // with slack for release tails
        let notes: Vec<ActiveNote> = stem
            .notes
            .iter()
            .filter(|n| {
                n.onset_sec < end_sec
                    && n.onset_sec + n.duration_sec + 1.0 > start_sec - opts.lookbehind_secs
            })
            .copied()
            .collect();

        let ctx = ChunkContext {
            stem: &stem.stem_id,
            chunk_index,
            start_sec,
            samples,
            body_samples,
            sample_rate: sr,
            notes: &notes,
            conditioning: &cv,
        };

        let t0 = Instant::now();
        let mut pcm = stem.route.render_chunk(&ctx, &mut state);
        if t0.elapsed() > opts.chunk_timeout {
            warn!(
                stem = %stem.stem_id,
                chunk_index,
                elapsed_ms = t0.elapsed().as_millis() as u64,
                "chunk over budget, retrying on fallback route"
            );
            let t1 = Instant::now();
            pcm = stem.fallback.render_chunk(&ctx, &mut fallback_state);
            if t1.elapsed() > opts.chunk_timeout {
                let _ = tx.send(ChunkMessage::Failed(GenerateError::RenderTimeout {
                    stem: stem.stem_id.clone(),
                    chunk: chunk_index,
                }));
                return;
            }
        }

        let chunk = RenderedChunk {
            stem_id: stem.stem_id.clone(),
            chunk_index,
            sample_rate: sr,
            start_sample,
            pcm,
            overlap_tail_samples: tail_samples,
        };
        if tx.send(ChunkMessage::Chunk(chunk)).is_err() {
            // consumer hung up; treat as cancellation
            return;
        }
    }

    let _ = tx.send(ChunkMessage::Done {
        stem_id: stem.stem_id.clone(),
        completed: true,
    });
}

/// Project a voice's beat-relative events onto the absolute clock.
pub fn project_voice(events: &[crate::score::NoteEvent], cv: &ConditioningVector) -> Vec<ActiveNote> {
    let spb = cv.seconds_per_beat;
    events
        .iter()
        .enumerate()
        .map(|(i, ev)| {
            let (frequency, drum) = match ev.pitch {
                PitchOrDrum::Pitched(n) => (midi_to_freq(n), None),
                PitchOrDrum::Drum(d) => (0.0, Some(d)),
            };
            ActiveNote {
                id: i as u64,
                onset_sec: ev.onset_beat * spb,
                duration_sec: ev.duration_beats * spb,
                frequency,
                drum,
                velocity: ev.velocity,
            }
        })
        .collect()
}

/// Map an instrument to the voice it plays. Keyword-matched; a second
/// lead-ish tag takes the inner voice instead of doubling the melody.
pub fn voice_for_instrument(spec: &InstrumentSpec, taken: &[&'static str]) -> &'static str {
    let tag = spec.name.to_lowercase();
    let candidate = if ["kit", "drum", "perc"].iter().any(|k| tag.contains(k)) {
        VOICE_DRUMS
    } else if tag.contains("bass") {
        VOICE_BASS
    } else if ["pad", "string", "choir", "warm", "cin"]
        .iter()
        .any(|k| tag.contains(k))
    {
        VOICE_INNER
    } else {
        VOICE_MELODY
    };
    if candidate == VOICE_MELODY
        && taken.contains(&VOICE_MELODY)
        && !taken.contains(&VOICE_INNER)
    {
        return VOICE_INNER;
    }
    candidate
}

/// Stereo placement per voice (melody right of center, bass left, the
/// rest centered).
pub fn pan_for_voice(voice: &str) -> f32 {
    match voice {
        VOICE_MELODY => 0.65,
        VOICE_BASS => 0.35,
        _ => 0.5,
    }
}
