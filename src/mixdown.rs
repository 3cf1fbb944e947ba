//! Stream mixdown: overlap-add accumulation and the stereo master
//!
//! Chunks arrive per stem in strict order. Each chunk's body is committed
//! immediately, with its first samples cross-faded against the previous
//! chunk's held overlap tail, so the stem buffer never contains
//! duplicated or discontinuous samples. The master is produced only after
//! all stems are finalized: constant-power panning, sample-aligned
//! summation and peak-safe gain staging.

use crate::error::{GenerateError, Result};
use crate::render::RenderedChunk;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Peak ceiling for stems and master.
const PEAK_TARGET: f32 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StemStatus {
    Finalized,
    /// The stem was truncated at the last fully committed chunk.
    Cancelled,
}

/// A finalized, immutable mono stem.
#[derive(Debug, Clone, PartialEq)]
pub struct Stem {
    pub stem_id: String,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
    pub status: StemStatus,
    pub committed_chunks: usize,
}

/// The stereo master.
#[derive(Debug, Clone, PartialEq)]
pub struct Mixdown {
    pub sample_rate: u32,
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

struct StemAccumulator {
    buffer: Vec<f32>,
    /// Overlap tail held back until the next chunk arrives.
    pending_tail: Vec<f32>,
    committed_chunks: usize,
    sample_rate: u32,
}

/// Accumulates chunks per stem (single-writer per stem) and finalizes
/// each stem exactly once.
#[derive(Default)]
pub struct StreamMixdown {
    accumulators: BTreeMap<String, StemAccumulator>,
}

impl StreamMixdown {
    pub fn new() -> Self {
        StreamMixdown::default()
    }

    /// Commit one chunk. Chunks of a stem must arrive in order and
    /// contiguous modulo the declared overlap.
    pub fn accumulate(&mut self, chunk: RenderedChunk) -> Result<()> {
        let acc = self
            .accumulators
            .entry(chunk.stem_id.clone())
            .or_insert_with(|| StemAccumulator {
                buffer: Vec::new(),
                pending_tail: Vec::new(),
                committed_chunks: 0,
                sample_rate: chunk.sample_rate,
            });

        if chunk.start_sample != acc.buffer.len() {
            return Err(GenerateError::ChunkDiscontinuity {
                stem: chunk.stem_id.clone(),
                expected: acc.buffer.len(),
                got: chunk.start_sample,
            });
        }

        let body = chunk.body_samples();
        let overlap = acc.pending_tail.len().min(body);

        // cross-fade the held tail against the new chunk's head; the
        // committed sample is a convex combination of both contributions
        for i in 0..overlap {
            let t = (i + 1) as f32 / (overlap + 1) as f32;
            let blended = acc.pending_tail[i] * (1.0 - t) + chunk.pcm[i] * t;
            acc.buffer.push(blended);
        }
        acc.buffer.extend_from_slice(&chunk.pcm[overlap..body]);

        acc.pending_tail = chunk.pcm[body..].to_vec();
        acc.committed_chunks += 1;
        debug!(
            stem = %chunk.stem_id,
            chunk = chunk.chunk_index,
            committed = acc.buffer.len(),
            "chunk committed"
        );
        Ok(())
    }

    /// Finalize a stem. On a cancelled stream the held overlap tail is
    /// dropped: the stem ends at the last fully committed chunk instead
    /// of fabricating silence.
    pub fn finalize(&mut self, stem_id: &str, status: StemStatus) -> Result<Stem> {
        let acc = self.accumulators.remove(stem_id).ok_or_else(|| {
            GenerateError::Export(format!("finalize on unknown stem '{stem_id}'"))
        })?;
        let mut samples = acc.buffer;
        if status == StemStatus::Finalized && !acc.pending_tail.is_empty() {
            // a completed stream should have ended with a tail-less
            // chunk; keep whatever remains rather than dropping audio
            samples.extend_from_slice(&acc.pending_tail);
        }
        peak_normalize(&mut samples);
        Ok(Stem {
            stem_id: stem_id.to_string(),
            sample_rate: acc.sample_rate,
            samples,
            status,
            committed_chunks: acc.committed_chunks,
        })
    }

    /// True when `accumulate` has seen this stem.
    pub fn has_stem(&self, stem_id: &str) -> bool {
        self.accumulators.contains_key(stem_id)
    }
}

/// Sum finalized stems into a stereo master with constant-power panning
/// and peak-safe gain staging.
pub fn mix_master(stems: &BTreeMap<String, Stem>, pans: &[(String, f32)]) -> Mixdown {
    let sample_rate = stems
        .values()
        .next()
        .map(|s| s.sample_rate)
        .unwrap_or(44100);
    let len = stems.values().map(|s| s.samples.len()).max().unwrap_or(0);
    let mut left = vec![0.0f32; len];
    let mut right = vec![0.0f32; len];

    for (stem_id, stem) in stems {
        let pan = pans
            .iter()
            .find(|(id, _)| id == stem_id)
            .map(|(_, p)| *p)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let theta = pan * std::f32::consts::FRAC_PI_2;
        let (gl, gr) = (theta.cos(), theta.sin());
        for (i, &s) in stem.samples.iter().enumerate() {
            left[i] += s * gl;
            right[i] += s * gr;
        }
    }

    // soft gain staging: scale down when the sum exceeds full scale
    let peak = left
        .iter()
        .chain(right.iter())
        .fold(0.0f32, |m, &s| m.max(s.abs()));
    if peak > PEAK_TARGET {
        let g = PEAK_TARGET / peak;
        for s in left.iter_mut().chain(right.iter_mut()) {
            *s *= g;
        }
    }

    Mixdown {
        sample_rate,
        left,
        right,
    }
}

fn peak_normalize(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
    if peak > PEAK_TARGET {
        let g = PEAK_TARGET / peak;
        for s in samples.iter_mut() {
            *s *= g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(stem: &str, index: usize, start: usize, pcm: Vec<f32>, tail: usize) -> RenderedChunk {
        RenderedChunk {
            stem_id: stem.to_string(),
            chunk_index: index,
            sample_rate: 44100,
            start_sample: start,
            pcm,
            overlap_tail_samples: tail,
        }
    }

    #[test]
    fn overlap_add_length_arithmetic() {
        let mut mix = StreamMixdown::new();
        // chunk 1: 8 body + 4 tail, chunk 2: 6 body, no tail
        mix.accumulate(chunk("a", 0, 0, vec![0.1; 12], 4)).unwrap();
        mix.accumulate(chunk("a", 1, 8, vec![0.3; 6], 0)).unwrap();
        let stem = mix.finalize("a", StemStatus::Finalized).unwrap();
        // len(chunk1) + len(chunk2) - overlap
        assert_eq!(stem.samples.len(), 12 + 6 - 4);
    }

    #[test]
    fn crossfade_region_is_convex() {
        let mut mix = StreamMixdown::new();
        // constant 1.0 tail against constant 0.0 head: every cross-faded
        // sample must lie strictly between the two contributions
        let mut pcm1 = vec![1.0f32; 12];
        for s in pcm1.iter_mut().take(8) {
            *s = 0.5;
        }
        mix.accumulate(chunk("a", 0, 0, pcm1, 4)).unwrap();
        mix.accumulate(chunk("a", 1, 8, vec![0.0; 8], 0)).unwrap();
        let stem = mix.finalize("a", StemStatus::Finalized).unwrap();
        for i in 8..12 {
            assert!(
                stem.samples[i] > 0.0 && stem.samples[i] < 1.0,
                "sample {} = {} not a convex blend",
                i,
                stem.samples[i]
            );
        }
        // blend weights decrease monotonically toward the new chunk
        for i in 8..11 {
            assert!(stem.samples[i] > stem.samples[i + 1]);
        }
    }

    #[test]
    fn out_of_order_chunk_is_rejected() {
        let mut mix = StreamMixdown::new();
        mix.accumulate(chunk("a", 0, 0, vec![0.0; 12], 4)).unwrap();
        let err = mix.accumulate(chunk("a", 2, 16, vec![0.0; 12], 4));
        assert!(matches!(
            err,
            Err(GenerateError::ChunkDiscontinuity { expected: 8, got: 16, .. })
        ));
    }

    #[test]
    fn cancelled_stem_drops_pending_tail() {
        let mut mix = StreamMixdown::new();
        mix.accumulate(chunk("a", 0, 0, vec![0.2; 12], 4)).unwrap();
        let stem = mix.finalize("a", StemStatus::Cancelled).unwrap();
        assert_eq!(stem.samples.len(), 8);
        assert_eq!(stem.status, StemStatus::Cancelled);
        assert_eq!(stem.committed_chunks, 1);
    }

    #[test]
    fn master_is_peak_safe() {
        let mut stems = BTreeMap::new();
        stems.insert(
            "a".to_string(),
            Stem {
                stem_id: "a".into(),
                sample_rate: 44100,
                samples: vec![0.9; 16],
                status: StemStatus::Finalized,
                committed_chunks: 1,
            },
        );
        stems.insert(
            "b".to_string(),
            Stem {
                stem_id: "b".into(),
                sample_rate: 44100,
                samples: vec![0.9; 16],
                status: StemStatus::Finalized,
                committed_chunks: 1,
            },
        );
        let pans = vec![("a".to_string(), 0.5), ("b".to_string(), 0.5)];
        let master = mix_master(&stems, &pans);
        let peak = master
            .left
            .iter()
            .chain(master.right.iter())
            .fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(peak <= PEAK_TARGET + 1e-6);
        assert_eq!(master.left.len(), 16);
    }

    #[test]
    fn pan_splits_energy() {
        let mut stems = BTreeMap::new();
        stems.insert(
            "a".to_string(),
            Stem {
                stem_id: "a".into(),
                sample_rate: 44100,
                samples: vec![0.5; 4],
                status: StemStatus::Finalized,
                committed_chunks: 1,
            },
        );
        // hard left
        let master = mix_master(&stems, &[("a".to_string(), 0.0)]);
        assert!(master.left[0] > 0.4);
        assert!(master.right[0].abs() < 1e-6);
    }
}
