//! Export collaborators: WAV stems and master, multitrack MIDI,
//! annotation CSV/JSON
//!
//! These sit outside the orchestration core proper: they consume the
//! finished `GenerationResult` artifacts and marshal them to disk.

use crate::annotate::AnnotationSheet;
use crate::error::{GenerateError, Result};
use crate::mixdown::{Mixdown, Stem};
use crate::score::{PitchOrDrum, Score, VOICE_BASS, VOICE_INNER, VOICE_MELODY};
use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::fs;
use std::io::Write as _;
use std::path::Path;
use tracing::info;

/// MIDI ticks per quarter note.
const TICKS_PER_BEAT: u16 = 480;
/// General MIDI percussion channel (zero-based).
const DRUM_CHANNEL: u8 = 9;

/// Write a mono stem as 16-bit PCM WAV.
pub fn write_stem_wav(path: &Path, stem: &Stem) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: stem.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| GenerateError::Export(format!("create {}: {e}", path.display())))?;
    for &sample in &stem.samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer
            .write_sample((clamped * 32767.0) as i16)
            .map_err(|e| GenerateError::Export(format!("write sample: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| GenerateError::Export(format!("finalize WAV: {e}")))?;
    info!(path = %path.display(), samples = stem.samples.len(), "stem written");
    Ok(())
}

/// Write the stereo master as interleaved 16-bit PCM WAV.
pub fn write_master_wav(path: &Path, master: &Mixdown) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: master.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| GenerateError::Export(format!("create {}: {e}", path.display())))?;
    for (l, r) in master.left.iter().zip(master.right.iter()) {
        for &s in [l, r].iter() {
            writer
                .write_sample((s.clamp(-1.0, 1.0) * 32767.0) as i16)
                .map_err(|e| GenerateError::Export(format!("write sample: {e}")))?;
        }
    }
    writer
        .finalize()
        .map_err(|e| GenerateError::Export(format!("finalize WAV: {e}")))?;
    info!(path = %path.display(), "master written");
    Ok(())
}

fn program_for_voice(voice: &str) -> u8 {
    match voice {
        VOICE_MELODY => 73, // flute-ish lead
        VOICE_BASS => 34,   // picked bass
        VOICE_INNER => 48,  // strings
        _ => 0,
    }
}

/// Write the post-groove score as a multitrack (format 1) MIDI file,
/// one track per voice, drums on channel 10.
pub fn write_midi(path: &Path, score: &Score, tempo_bpm: f64) -> Result<()> {
    let mut smf = Smf::new(Header::new(
        Format::Parallel,
        Timing::Metrical(u15::new(TICKS_PER_BEAT)),
    ));

    // tempo track
    let micros_per_beat = (60_000_000.0 / tempo_bpm).round() as u32;
    smf.tracks.push(vec![
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(micros_per_beat))),
        },
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        },
    ]);

    for (voice_idx, (voice, events)) in score.voices.iter().enumerate() {
        let is_drums = events
            .iter()
            .any(|e| matches!(e.pitch, PitchOrDrum::Drum(_)));
        let channel = if is_drums {
            DRUM_CHANNEL
        } else {
            (voice_idx as u8) % 16
        };

        // (tick, on?, key, vel) sorted by tick, offs before ons at a tick
        let mut moments: Vec<(u32, bool, u8, u8)> = Vec::with_capacity(events.len() * 2);
        for ev in events {
            let on = (ev.onset_beat.max(0.0) * TICKS_PER_BEAT as f64).round() as u32;
            let off_beat = ev.end_beat().max(ev.onset_beat + 1e-3);
            let off = (off_beat * TICKS_PER_BEAT as f64).round() as u32;
            let key = ev.pitch.midi().min(127);
            let vel = ev.velocity.clamp(1, 127);
            moments.push((on, true, key, vel));
            moments.push((off.max(on + 1), false, key, 0));
        }
        moments.sort_by_key(|&(tick, on, key, _)| (tick, on, key));

        let mut track: Vec<TrackEvent> = Vec::with_capacity(moments.len() + 2);
        if !is_drums {
            track.push(TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel: u4::new(channel),
                    message: MidiMessage::ProgramChange {
                        program: u7::new(program_for_voice(voice)),
                    },
                },
            });
        }
        let mut last_tick = 0u32;
        for (tick, on, key, vel) in moments {
            let delta = tick - last_tick;
            last_tick = tick;
            let message = if on {
                MidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(vel),
                }
            } else {
                MidiMessage::NoteOff {
                    key: u7::new(key),
                    vel: u7::new(0),
                }
            };
            track.push(TrackEvent {
                delta: u28::new(delta),
                kind: TrackEventKind::Midi {
                    channel: u4::new(channel),
                    message,
                },
            });
        }
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        smf.tracks.push(track);
    }

    smf.save(path)
        .map_err(|e| GenerateError::Export(format!("save MIDI {}: {e}", path.display())))?;
    info!(path = %path.display(), tracks = smf.tracks.len(), "MIDI written");
    Ok(())
}

/// Write the annotation sheet as JSON.
pub fn write_annotation_json(path: &Path, sheet: &AnnotationSheet) -> Result<()> {
    let json = serde_json::to_string_pretty(sheet)
        .map_err(|e| GenerateError::Export(format!("serialize annotations: {e}")))?;
    fs::write(path, json)?;
    Ok(())
}

/// Write the annotation sheet as CSV, one block per table.
pub fn write_annotation_csv(path: &Path, sheet: &AnnotationSheet) -> Result<()> {
    let mut f = fs::File::create(path)?;
    writeln!(f, "section,start_bar,end_bar,start_sec,end_sec")?;
    for s in &sheet.sections {
        writeln!(
            f,
            "{},{},{},{:.3},{:.3}",
            s.label, s.start_bar, s.end_bar, s.start_sec, s.end_sec
        )?;
    }
    writeln!(f)?;
    writeln!(f, "bar,chord")?;
    for c in &sheet.chords {
        writeln!(f, "{},{}", c.bar, c.symbol)?;
    }
    writeln!(f)?;
    writeln!(f, "motif_start_bar,source_bar,transposition")?;
    for m in &sheet.motifs {
        writeln!(
            f,
            "{},{},{}",
            m.start_bar, m.source_bar, m.transposition_semitones
        )?;
    }
    writeln!(f)?;
    writeln!(f, "voice,notes,mean_abs_deviation_ms")?;
    for g in &sheet.groove_deviation {
        writeln!(
            f,
            "{},{},{:.3}",
            g.voice, g.note_count, g.mean_abs_deviation_ms
        )?;
    }
    Ok(())
}
