//! Renderer behavior: timeout fallback, fail-fast route resolution and
//! cross-chunk continuity of the carried synthesis state.

use cantus::conditioning::{encode, ConditioningVector};
use cantus::controls::{Controls, InstrumentSpec};
use cantus::error::GenerateError;
use cantus::mixdown::{StemStatus, StreamMixdown};
use cantus::render::{
    CancellationToken, ChunkMessage, RenderOptions, StemSpec, TimbreRenderer,
};
use cantus::score::{NoteEvent, Score, VOICE_MELODY};
use cantus::synth::{
    ActiveNote, ChunkContext, ParametricSynth, RouteState, SampleLayer, SynthRoute, Waveform,
};
use cantus::theory::{Key, Mode};
use std::sync::Arc;
use std::time::Duration;

/// A route that blows the chunk budget every time.
struct SlowRoute {
    delay: Duration,
}

impl SynthRoute for SlowRoute {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn render_chunk(&self, ctx: &ChunkContext<'_>, _state: &mut RouteState) -> Vec<f32> {
        std::thread::sleep(self.delay);
        vec![0.5; ctx.samples]
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

fn tight_budget_options() -> RenderOptions {
    RenderOptions {
        chunk_timeout: Duration::from_millis(20),
        ..RenderOptions::default()
    }
}

fn drain(stream: cantus::render::ChunkStream) -> (Vec<ChunkMessage>, usize) {
    let (_, rx) = &stream.receivers[0];
    let mut messages = Vec::new();
    let mut chunks = 0usize;
    for msg in rx.iter() {
        let done = matches!(
            msg,
            ChunkMessage::Done { .. } | ChunkMessage::Failed(_)
        );
        if matches!(msg, ChunkMessage::Chunk(_)) {
            chunks += 1;
        }
        messages.push(msg);
        if done {
            break;
        }
    }
    stream.join();
    (messages, chunks)
}

#[test]
fn over_budget_chunk_falls_back_to_the_sample_route() {
    let cv = cv_secs(3.0);
    let renderer = TimbreRenderer::new(tight_budget_options());
    let stems = vec![StemSpec {
        stem_id: "slow".into(),
        notes: Vec::new(),
        route: Arc::new(SlowRoute {
            delay: Duration::from_millis(60),
        }),
        fallback: Arc::new(SampleLayer::new(44100)),
        pan: 0.5,
    }];
    let stream = renderer.render_stream_with(stems, &cv, CancellationToken::new());
    let (messages, chunks) = drain(stream);

    assert_eq!(chunks, 1, "3s request is a single chunk");
    assert!(
        matches!(messages.last(), Some(ChunkMessage::Done { completed: true, .. })),
        "fallback retry should have completed the stem"
    );
}

#[test]
fn timeout_after_fallback_retry_fails_the_stem() {
    let cv = cv_secs(3.0);
    let renderer = TimbreRenderer::new(tight_budget_options());
    let slow: Arc<dyn SynthRoute> = Arc::new(SlowRoute {
        delay: Duration::from_millis(60),
    });
    let stems = vec![StemSpec {
        stem_id: "slow".into(),
        notes: Vec::new(),
        route: slow.clone(),
        fallback: slow,
        pan: 0.5,
    }];
    let stream = renderer.render_stream_with(stems, &cv, CancellationToken::new());
    let (messages, _) = drain(stream);

    match messages.last() {
        Some(ChunkMessage::Failed(GenerateError::RenderTimeout { stem, chunk })) => {
            assert_eq!(stem, "slow");
            assert_eq!(*chunk, 0);
        }
        other => panic!("expected RenderTimeout, got {other:?}"),
    }
}

#[test]
fn unknown_instrument_fails_before_any_chunk() {
    let cv = cv_secs(3.0);
    let renderer = TimbreRenderer::default();
    let err = renderer.render_stream(
        &Score::new(),
        &cv,
        &[
            InstrumentSpec::new("analog_bass"),
            InstrumentSpec::new("zzz_unknown"),
        ],
        CancellationToken::new(),
    );
    match err {
        Err(GenerateError::UnsupportedInstrument { name }) => assert_eq!(name, "zzz_unknown"),
        other => panic!("expected UnsupportedInstrument, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn sustained_note_is_continuous_across_the_chunk_seam() {
    // one long sine spanning several chunks; after overlap-add the seam
    // must not contain a jump larger than the natural per-sample slope
    let cv = cv_secs(7.0);
    let mut score = Score::new();
    // 7s at 120bpm = 14 beats
    score
        .voice_mut(VOICE_MELODY)
        .push(NoteEvent::pitched(57, 0.0, 14.0, 100));
    let notes: Vec<ActiveNote> = cantus::render::project_voice(score.voice(VOICE_MELODY), &cv);

    let renderer = TimbreRenderer::new(RenderOptions::default());
    let stems = vec![StemSpec {
        stem_id: "lead".into(),
        notes,
        route: Arc::new(ParametricSynth::new(Waveform::Sine)),
        fallback: Arc::new(SampleLayer::new(44100)),
        pan: 0.5,
    }];
    let stream = renderer.render_stream_with(stems, &cv, CancellationToken::new());

    let mut mixdown = StreamMixdown::new();
    let (_, rx) = &stream.receivers[0];
    for msg in rx.iter() {
        match msg {
            ChunkMessage::Chunk(c) => mixdown.accumulate(c).unwrap(),
            ChunkMessage::Done { .. } => break,
            ChunkMessage::Failed(e) => panic!("failure: {e}"),
        }
    }
    stream.join();
    let stem = mixdown.finalize("lead", StemStatus::Finalized).unwrap();

    // 220 Hz sine at 44.1 kHz moves at most ~2*pi*f/sr of full scale per
    // sample; anything well above that at a seam is a discontinuity
    let max_natural_step = 2.0 * std::f32::consts::PI * 220.0 / 44100.0 * 0.25;
    let window = (3.0 * 44100.0) as usize;
    for seam in [window, 2 * window] {
        for i in seam.saturating_sub(2)..(seam + 2).min(stem.samples.len() - 1) {
            let step = (stem.samples[i + 1] - stem.samples[i]).abs();
            assert!(
                step < max_natural_step * 3.0,
                "discontinuity {} at sample {} (seam {})",
                step,
                i,
                seam
            );
        }
    }
}
