//! Synthesis routes: the polymorphic rendering capability
//!
//! The renderer never talks to a concrete synthesizer; it talks to
//! `SynthRoute`: "given local symbolic context, conditioning and the
//! state carried from the previous chunk, produce the next chunk of
//! samples". Three variants exist: a generative additive decoder, a
//! parametric oscillator+envelope synth and a pre-baked sample layer.
//! Route objects are read-only and safely shared; the carried
//! `RouteState` is exclusive to one stem of one request.

use crate::conditioning::ConditioningVector;
use crate::controls::{InstrumentSpec, RouteHint};
use crate::error::{GenerateError, Result};
use crate::score::DrumClass;
use rand::prelude::*;
use std::collections::HashMap;
use std::f32::consts::PI;

/// One note projected onto the absolute-time clock for rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveNote {
    /// Stable id across chunks (index within the stem's note list).
    pub id: u64,
    pub onset_sec: f64,
    pub duration_sec: f64,
    /// Fundamental frequency; unused for drums.
    pub frequency: f32,
    pub drum: Option<DrumClass>,
    pub velocity: u8,
}

impl ActiveNote {
    pub fn amplitude(&self) -> f32 {
        self.velocity.clamp(1, 127) as f32 / 127.0
    }
}

/// Local context for one chunk: the notes sounding in the window plus
/// the clock and conditioning.
pub struct ChunkContext<'a> {
    pub stem: &'a str,
    pub chunk_index: usize,
    pub start_sec: f64,
    /// Samples to produce: window body plus overlap tail.
    pub samples: usize,
    /// Samples belonging to the body; the remainder is the tail that the
    /// next chunk re-renders and the mixdown cross-fades.
    pub body_samples: usize,
    pub sample_rate: u32,
    pub notes: &'a [ActiveNote],
    pub conditioning: &'a ConditioningVector,
}

/// Carried synthesis state, owned by the renderer and threaded
/// chunk-to-chunk per stem. Phase continuity across chunk boundaries
/// lives here; without it, vibrato and detune would audibly reset.
#[derive(Debug, Clone, Default)]
pub struct RouteState {
    /// Oscillator phase per note id, snapshotted at the chunk body end.
    pub phases: HashMap<u64, f32>,
    /// Per-note partial phases for the additive decoder.
    pub partial_phases: HashMap<u64, Vec<f32>>,
    /// Free-running vibrato LFO phase.
    pub lfo_phase: f32,
    /// Absolute time the state is valid for (end of last body).
    pub rendered_until_sec: f64,
}

pub trait SynthRoute: Send + Sync {
    fn name(&self) -> &'static str;

    /// Render `ctx.samples` mono samples starting at `ctx.start_sec`.
    /// Must update `state` to be valid at the end of the chunk body.
    fn render_chunk(&self, ctx: &ChunkContext<'_>, state: &mut RouteState) -> Vec<f32>;
}

/// Analytic ADSR: evaluated by note-relative time, so it is continuous
/// across chunk boundaries by construction.
#[derive(Debug, Clone, Copy)]
pub struct Adsr {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for Adsr {
    fn default() -> Self {
        Adsr {
            attack: 0.005,
            decay: 0.05,
            sustain: 0.85,
            release: 0.05,
        }
    }
}

impl Adsr {
    /// Envelope level at `t` seconds after note-on, for a note held
    /// `hold` seconds. Zero once the release has finished.
    pub fn level(&self, t: f32, hold: f32) -> f32 {
        if t < 0.0 {
            return 0.0;
        }
        if t >= hold {
            let rel = t - hold;
            if rel >= self.release {
                return 0.0;
            }
            return self.level_held(hold) * (1.0 - rel / self.release.max(1e-6));
        }
        self.level_held(t)
    }

    fn level_held(&self, t: f32) -> f32 {
        if t < self.attack {
            t / self.attack.max(1e-6)
        } else if t < self.attack + self.decay {
            let d = (t - self.attack) / self.decay.max(1e-6);
            1.0 + (self.sustain - 1.0) * d
        } else {
            self.sustain
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Saw,
    Square,
    Triangle,
}

impl Waveform {
    fn sample(self, phase: f32) -> f32 {
        let frac = phase - phase.floor();
        match self {
            Waveform::Sine => (2.0 * PI * frac).sin(),
            Waveform::Saw => 2.0 * frac - 1.0,
            Waveform::Square => {
                if frac < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Triangle => 2.0 * (2.0 * frac - 1.0).abs() - 1.0,
        }
    }
}

/// Differentiable-parametric route: one oscillator with a light vibrato
/// and an ADSR per note. The vibrato makes the carried phase matter: a
/// reset at a chunk boundary would be audible as a click or detune jump.
pub struct ParametricSynth {
    pub waveform: Waveform,
    pub adsr: Adsr,
    pub gain: f32,
    pub vibrato_hz: f32,
    pub vibrato_depth: f32,
}

impl ParametricSynth {
    pub fn new(waveform: Waveform) -> Self {
        ParametricSynth {
            waveform,
            adsr: Adsr::default(),
            gain: 0.22,
            vibrato_hz: 5.0,
            vibrato_depth: 0.002,
        }
    }
}

impl SynthRoute for ParametricSynth {
    fn name(&self) -> &'static str {
        "parametric"
    }

    fn render_chunk(&self, ctx: &ChunkContext<'_>, state: &mut RouteState) -> Vec<f32> {
        let sr = ctx.sample_rate as f32;
        let dt = 1.0 / sr;
        let mut out = vec![0.0f32; ctx.samples];
        let lfo_start = state.lfo_phase;

        for note in ctx.notes {
            let start_phase = *state.phases.get(&note.id).unwrap_or(&0.0);
            let mut phase = start_phase;
            let mut body_phase = start_phase;
            let amp = self.gain * note.amplitude();
            for (i, sample) in out.iter_mut().enumerate() {
                let t_abs = ctx.start_sec + i as f64 * dt as f64;
                let t_rel = (t_abs - note.onset_sec) as f32;
                if t_rel >= 0.0 {
                    let env = self.adsr.level(t_rel, note.duration_sec as f32);
                    if env > 0.0 {
                        let lfo = lfo_start + (i as f32 * dt) * self.vibrato_hz;
                        let f = note.frequency
                            * (1.0 + self.vibrato_depth * (2.0 * PI * lfo).sin());
                        phase += f * dt;
                        *sample += amp * env * self.waveform.sample(phase);
                    }
                }
                if i + 1 == ctx.body_samples {
                    body_phase = phase;
                }
            }
            if ctx.body_samples >= out.len() {
                body_phase = phase;
            }
            state.phases.insert(note.id, body_phase);
        }

        state.lfo_phase = lfo_start + (ctx.body_samples as f32 * dt) * self.vibrato_hz;
        state.rendered_until_sec = ctx.start_sec + ctx.body_samples as f64 * dt as f64;
        out
    }
}

/// Learned-generative stand-in: an additive decoder whose spectral
/// rolloff is shaped by the conditioning key profile, with a slow
/// per-partial detune drift carried in the state.
pub struct GenerativeDecoder {
    pub partials: usize,
    pub adsr: Adsr,
    pub gain: f32,
    pub drift_hz: f32,
}

impl GenerativeDecoder {
    pub fn new() -> Self {
        GenerativeDecoder {
            partials: 6,
            adsr: Adsr {
                attack: 0.05,
                decay: 0.2,
                sustain: 0.7,
                release: 0.25,
            },
            gain: 0.16,
            drift_hz: 0.3,
        }
    }
}

impl Default for GenerativeDecoder {
    fn default() -> Self {
        GenerativeDecoder::new()
    }
}

impl SynthRoute for GenerativeDecoder {
    fn name(&self) -> &'static str {
        "generative"
    }

    fn render_chunk(&self, ctx: &ChunkContext<'_>, state: &mut RouteState) -> Vec<f32> {
        let sr = ctx.sample_rate as f32;
        let dt = 1.0 / sr;
        let mut out = vec![0.0f32; ctx.samples];
        let lfo_start = state.lfo_phase;

        // brighter spectrum in strongly tonal keys; deterministic per
        // request via the conditioning profile
        let profile_energy: f32 = ctx.conditioning.key_profile.iter().sum::<f32>() / 12.0;
        let rolloff = 1.2 + profile_energy;

        for note in ctx.notes {
            let amp = self.gain * note.amplitude();
            let start_phases = state
                .partial_phases
                .get(&note.id)
                .cloned()
                .unwrap_or_else(|| vec![0.0; self.partials]);
            let mut work = start_phases.clone();
            let mut body_snapshot = start_phases;

            for (i, sample) in out.iter_mut().enumerate() {
                let t_abs = ctx.start_sec + i as f64 * dt as f64;
                let t_rel = (t_abs - note.onset_sec) as f32;
                if t_rel >= 0.0 {
                    let env = self.adsr.level(t_rel, note.duration_sec as f32);
                    if env > 0.0 {
                        let drift = lfo_start + (i as f32 * dt) * self.drift_hz;
                        let mut acc = 0.0f32;
                        for (k, phase) in work.iter_mut().enumerate() {
                            let n = (k + 1) as f32;
                            let detune = 1.0 + 0.001 * n * (2.0 * PI * drift).sin();
                            *phase += note.frequency * n * detune * dt;
                            acc += (2.0 * PI * *phase).sin() / n.powf(rolloff);
                        }
                        *sample += amp * env * acc;
                    }
                }
                if i + 1 == ctx.body_samples {
                    body_snapshot = work.clone();
                }
            }
            if ctx.body_samples >= out.len() {
                body_snapshot = work;
            }
            state.partial_phases.insert(note.id, body_snapshot);
        }

        state.lfo_phase = lfo_start + (ctx.body_samples as f32 * dt) * self.drift_hz;
        state.rendered_until_sec = ctx.start_sec + ctx.body_samples as f64 * dt as f64;
        out
    }
}

/// Sample-playback route: percussive one-shots baked once at
/// construction, plus a pitched pluck for the timeout fallback path.
/// Playback is aligned by note-relative time, so it carries no phase.
pub struct SampleLayer {
    sample_rate: u32,
    gain: f32,
    drums: HashMap<DrumClass, Vec<f32>>,
    pluck: Vec<f32>,
    pluck_base_hz: f32,
}

impl SampleLayer {
    pub fn new(sample_rate: u32) -> Self {
        let mut drums = HashMap::new();
        drums.insert(DrumClass::Kick, bake_kick(sample_rate));
        drums.insert(DrumClass::Snare, bake_snare(sample_rate));
        drums.insert(DrumClass::ClosedHat, bake_hat(sample_rate, 0.06));
        drums.insert(DrumClass::OpenHat, bake_hat(sample_rate, 0.30));
        drums.insert(DrumClass::Crash, bake_crash(sample_rate));
        SampleLayer {
            sample_rate,
            gain: 0.5,
            drums,
            pluck: bake_pluck(sample_rate, 220.0),
            pluck_base_hz: 220.0,
        }
    }

    fn one_shot(&self, note: &ActiveNote) -> (&[f32], f32) {
        match note.drum {
            Some(class) => (
                self.drums.get(&class).map(Vec::as_slice).unwrap_or(&[]),
                1.0,
            ),
            None => (&self.pluck, note.frequency / self.pluck_base_hz),
        }
    }
}

impl SynthRoute for SampleLayer {
    fn name(&self) -> &'static str {
        "sample"
    }

    fn render_chunk(&self, ctx: &ChunkContext<'_>, state: &mut RouteState) -> Vec<f32> {
        let sr = self.sample_rate as f64;
        let mut out = vec![0.0f32; ctx.samples];

        for note in ctx.notes {
            let (shot, rate) = self.one_shot(note);
            if shot.is_empty() {
                continue;
            }
            let amp = self.gain * note.amplitude();
            for (i, sample) in out.iter_mut().enumerate() {
                let t_rel = ctx.start_sec + i as f64 / sr - note.onset_sec;
                if t_rel < 0.0 {
                    continue;
                }
                // resample by playback rate, linear interpolation
                let pos = t_rel * sr * rate as f64;
                let idx = pos.floor() as usize;
                if idx + 1 >= shot.len() {
                    break;
                }
                let frac = (pos - idx as f64) as f32;
                let v = shot[idx] * (1.0 - frac) + shot[idx + 1] * frac;
                *sample += amp * v;
            }
        }

        state.rendered_until_sec =
            ctx.start_sec + ctx.body_samples as f64 / self.sample_rate as f64;
        out
    }
}

fn bake_kick(sr: u32) -> Vec<f32> {
    let len = (0.30 * sr as f32) as usize;
    let dt = 1.0 / sr as f32;
    let mut rng = StdRng::seed_from_u64(12345);
    let mut phase = 0.0f32;
    (0..len)
        .map(|i| {
            let t = i as f32 * dt;
            // pitch sweep 120 -> 45 Hz
            let f = 45.0 + 75.0 * (-t / 0.05).exp();
            phase += f * dt;
            let body = (2.0 * PI * phase).sin() * (-t / 0.12).exp();
            let click = if t < 0.005 {
                rng.gen_range(-1.0f32..1.0) * 0.4 * (1.0 - t / 0.005)
            } else {
                0.0
            };
            body + click
        })
        .collect()
}

fn bake_snare(sr: u32) -> Vec<f32> {
    let len = (0.22 * sr as f32) as usize;
    let dt = 1.0 / sr as f32;
    let mut rng = StdRng::seed_from_u64(23456);
    (0..len)
        .map(|i| {
            let t = i as f32 * dt;
            let tone = (2.0 * PI * 190.0 * t).sin() * (-t / 0.06).exp() * 0.5;
            let noise = rng.gen_range(-1.0f32..1.0) * (-t / 0.09).exp() * 0.7;
            tone + noise
        })
        .collect()
}

fn bake_hat(sr: u32, decay: f32) -> Vec<f32> {
    let len = ((decay * 4.0) * sr as f32) as usize;
    let dt = 1.0 / sr as f32;
    let mut rng = StdRng::seed_from_u64(34567);
    let mut lp = 0.0f32;
    (0..len)
        .map(|i| {
            let t = i as f32 * dt;
            let white = rng.gen_range(-1.0f32..1.0);
            // crude high-pass: white minus a one-pole lowpass
            lp += 0.15 * (white - lp);
            (white - lp) * (-t / decay).exp() * 0.6
        })
        .collect()
}

fn bake_crash(sr: u32) -> Vec<f32> {
    let len = (1.4 * sr as f32) as usize;
    let dt = 1.0 / sr as f32;
    let mut rng = StdRng::seed_from_u64(45678);
    let mut lp = 0.0f32;
    (0..len)
        .map(|i| {
            let t = i as f32 * dt;
            let white = rng.gen_range(-1.0f32..1.0);
            lp += 0.25 * (white - lp);
            let shimmer = 1.0 + 0.3 * (2.0 * PI * 7.0 * t).sin();
            (white - lp) * (-t / 0.5).exp() * 0.5 * shimmer
        })
        .collect()
}

fn bake_pluck(sr: u32, freq: f32) -> Vec<f32> {
    let len = (0.8 * sr as f32) as usize;
    let dt = 1.0 / sr as f32;
    let mut phase = 0.0f32;
    (0..len)
        .map(|i| {
            let t = i as f32 * dt;
            phase += freq * dt;
            let frac = phase - phase.floor();
            (2.0 * frac - 1.0) * (-t / 0.25).exp()
        })
        .collect()
}

/// Resolve the synthesis route for an instrument. The hint wins; without
/// one the timbre tag is matched by keyword. Unknown tags fail fast with
/// `UnsupportedInstrument` before any audio is produced.
pub fn route_for_instrument(
    spec: &InstrumentSpec,
    sample_rate: u32,
) -> Result<Box<dyn SynthRoute>> {
    if let Some(hint) = spec.route_hint {
        return Ok(match hint {
            RouteHint::Sample => Box::new(SampleLayer::new(sample_rate)),
            RouteHint::Parametric => Box::new(ParametricSynth::new(waveform_for_tag(&spec.name))),
            RouteHint::Generative => Box::new(GenerativeDecoder::new()),
        });
    }
    let tag = spec.name.to_lowercase();
    if ["kit", "drum", "perc"].iter().any(|k| tag.contains(k)) {
        return Ok(Box::new(SampleLayer::new(sample_rate)));
    }
    if ["pad", "string", "choir", "cin", "warm"]
        .iter()
        .any(|k| tag.contains(k))
    {
        return Ok(Box::new(GenerativeDecoder::new()));
    }
    if [
        "bass", "lead", "gtr", "guitar", "key", "piano", "synth", "analog", "pluck", "organ",
    ]
    .iter()
    .any(|k| tag.contains(k))
    {
        return Ok(Box::new(ParametricSynth::new(waveform_for_tag(&tag))));
    }
    Err(GenerateError::UnsupportedInstrument {
        name: spec.name.clone(),
    })
}

fn waveform_for_tag(tag: &str) -> Waveform {
    let tag = tag.to_lowercase();
    if tag.contains("bass") {
        Waveform::Saw
    } else if tag.contains("organ") || tag.contains("flute") {
        Waveform::Sine
    } else if tag.contains("square") || tag.contains("chip") {
        Waveform::Square
    } else {
        Waveform::Triangle
    }
}
