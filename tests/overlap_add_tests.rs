//! Overlap-add and cancellation properties of the streamed renderer and
//! the mixdown, driven end to end with injected test routes.

use cantus::conditioning::{encode, ConditioningVector};
use cantus::controls::Controls;
use cantus::mixdown::{StemStatus, StreamMixdown};
use cantus::render::{
    CancellationToken, ChunkMessage, RenderOptions, RenderedChunk, StemSpec, TimbreRenderer,
};
use cantus::synth::{ChunkContext, RouteState, SynthRoute};
use cantus::theory::{Key, Mode};
use std::sync::Arc;

/// Emits a constant value derived from the chunk index, so tests can tell
/// exactly which chunk's samples ended up where.
struct IndexedRoute;

impl SynthRoute for IndexedRoute {
    fn name(&self) -> &'static str {
        "indexed"
    }

    fn render_chunk(&self, ctx: &ChunkContext<'_>, _state: &mut RouteState) -> Vec<f32> {
        vec![(ctx.chunk_index + 1) as f32 * 0.1; ctx.samples]
    }
}

fn cv_secs(secs: f64) -> ConditioningVector {
    encode(&Controls::new(
        Key::parse("C").unwrap(),
        Mode::Ionian,
        120.0,
        secs,
    ))
    .unwrap()
}

fn indexed_stem(name: &str) -> StemSpec {
    StemSpec {
        stem_id: name.to_string(),
        notes: Vec::new(),
        route: Arc::new(IndexedRoute),
        fallback: Arc::new(IndexedRoute),
        pan: 0.5,
    }
}

#[test]
fn two_chunk_overlap_add_roundtrip() {
    // synthetic stem with known content: chunk1 body 8 + tail 4, chunk2
    // body 6, committed length must be len1 + len2 - overlap
    let mut mixdown = StreamMixdown::new();
    let chunk1 = RenderedChunk {
        stem_id: "synth".into(),
        chunk_index: 0,
        sample_rate: 44100,
        start_sample: 0,
        pcm: vec![0.8; 12],
        overlap_tail_samples: 4,
    };
    let chunk2 = RenderedChunk {
        stem_id: "synth".into(),
        chunk_index: 1,
        sample_rate: 44100,
        start_sample: 8,
        pcm: vec![0.0; 6],
        overlap_tail_samples: 0,
    };
    mixdown.accumulate(chunk1).unwrap();
    mixdown.accumulate(chunk2).unwrap();
    let stem = mixdown.finalize("synth", StemStatus::Finalized).unwrap();

    assert_eq!(stem.samples.len(), 12 + 6 - 4);
    // before the seam: pure chunk 1
    for &s in &stem.samples[..8] {
        assert_eq!(s, 0.8);
    }
    // cross-fade region: strictly convex blend of 0.8 and 0.0
    for &s in &stem.samples[8..12] {
        assert!(s > 0.0 && s < 0.8, "sample {s} outside the convex blend");
    }
    // after the overlap: pure chunk 2
    for &s in &stem.samples[12..] {
        assert_eq!(s, 0.0);
    }
}

#[test]
fn streamed_chunks_commit_contiguously() {
    let cv = cv_secs(7.0);
    let renderer = TimbreRenderer::new(RenderOptions::default());
    let stream =
        renderer.render_stream_with(vec![indexed_stem("a")], &cv, CancellationToken::new());
    let total = stream.total_samples;

    let mut mixdown = StreamMixdown::new();
    let (_, rx) = &stream.receivers[0];
    let mut completed = false;
    for msg in rx.iter() {
        match msg {
            ChunkMessage::Chunk(c) => mixdown.accumulate(c).unwrap(),
            ChunkMessage::Done { completed: done, .. } => {
                completed = done;
                break;
            }
            ChunkMessage::Failed(e) => panic!("failure: {e}"),
        }
    }
    assert!(completed);
    let stem = mixdown.finalize("a", StemStatus::Finalized).unwrap();
    assert_eq!(stem.samples.len(), total);
    stream.join();
}

#[test]
fn cancellation_truncates_at_last_committed_chunk() {
    let cv = cv_secs(12.0); // 4 chunks of 3s
    let renderer = TimbreRenderer::new(RenderOptions::default());
    let cancel = CancellationToken::new();
    let stream = renderer.render_stream_with(vec![indexed_stem("a")], &cv, cancel.clone());
    let window_samples = (3.0 * 44100.0) as usize;

    let mut mixdown = StreamMixdown::new();
    let (_, rx) = &stream.receivers[0];
    let mut committed = 0usize;
    for msg in rx.iter() {
        match msg {
            ChunkMessage::Chunk(c) => {
                if committed == 0 {
                    // commit exactly one chunk, then cancel
                    mixdown.accumulate(c).unwrap();
                    committed = 1;
                    cancel.cancel();
                }
                // post-cancel chunks are dropped, not committed
            }
            ChunkMessage::Done { .. } => break,
            ChunkMessage::Failed(e) => panic!("failure: {e}"),
        }
    }
    stream.join();

    let stem = mixdown.finalize("a", StemStatus::Cancelled).unwrap();
    assert_eq!(stem.status, StemStatus::Cancelled);
    assert_eq!(stem.committed_chunks, 1);
    // exactly one chunk body, the held tail dropped
    assert_eq!(stem.samples.len(), window_samples);
    // no chunk-2 content (value 0.2) appears anywhere
    for &s in &stem.samples {
        assert!((s - 0.1).abs() < 1e-6, "foreign chunk content: {s}");
    }
}

#[test]
fn independent_stems_finalize_concurrently_rendered_streams() {
    let cv = cv_secs(5.0);
    let renderer = TimbreRenderer::new(RenderOptions::default());
    let stream = renderer.render_stream_with(
        vec![indexed_stem("a"), indexed_stem("b"), indexed_stem("c")],
        &cv,
        CancellationToken::new(),
    );
    let total = stream.total_samples;

    let mut mixdown = StreamMixdown::new();
    for (name, rx) in &stream.receivers {
        for msg in rx.iter() {
            match msg {
                ChunkMessage::Chunk(c) => mixdown.accumulate(c).unwrap(),
                ChunkMessage::Done { completed, .. } => {
                    assert!(completed, "stem {name} did not complete");
                    break;
                }
                ChunkMessage::Failed(e) => panic!("failure: {e}"),
            }
        }
    }
    for name in ["a", "b", "c"] {
        let stem = mixdown.finalize(name, StemStatus::Finalized).unwrap();
        assert_eq!(stem.samples.len(), total);
    }
    stream.join();
}
