//! Export round-trips: WAV, MIDI and annotation files on disk.

use cantus::controls::Controls;
use cantus::export::{
    write_annotation_csv, write_annotation_json, write_master_wav, write_midi, write_stem_wav,
};
use cantus::generate::{generate, GenerateOptions};
use cantus::render::CancellationToken;
use cantus::theory::{Key, Mode};

fn small_result() -> cantus::generate::GenerationResult {
    let mut controls = Controls::new(Key::parse("D").unwrap(), Mode::Dorian, 112.0, 8.0);
    controls.harmonic_anchor = vec!["Dm".into(), "G".into()];
    generate(&controls, &GenerateOptions::default(), CancellationToken::new()).unwrap()
}

#[test]
fn wav_files_have_expected_shape() {
    let result = small_result();
    let dir = tempfile::tempdir().unwrap();

    let mix_path = dir.path().join("take.mix.wav");
    write_master_wav(&mix_path, &result.master).unwrap();
    let reader = hound::WavReader::open(&mix_path).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.sample_rate, 44100);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(
        reader.len() as usize,
        result.master.left.len() * 2,
        "interleaved sample count"
    );

    let (stem_id, stem) = result.stems.iter().next().unwrap();
    let stem_path = dir.path().join(format!("take.{stem_id}.wav"));
    write_stem_wav(&stem_path, stem).unwrap();
    let reader = hound::WavReader::open(&stem_path).unwrap();
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.len() as usize, stem.samples.len());
}

#[test]
fn midi_roundtrip_preserves_tracks_and_tempo() {
    let result = small_result();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("take.mid");
    write_midi(&path, &result.score, result.conditioning.tempo_bpm).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let smf = midly::Smf::parse(&bytes).unwrap();
    // tempo track plus one track per voice
    assert_eq!(smf.tracks.len(), 1 + result.score.voices.len());

    let tempo = smf.tracks[0].iter().find_map(|ev| match ev.kind {
        midly::TrackEventKind::Meta(midly::MetaMessage::Tempo(t)) => Some(t.as_int()),
        _ => None,
    });
    // 112 bpm ~= 535714 microseconds per beat
    assert_eq!(tempo, Some(535714));

    // every voice track carries note events
    for track in &smf.tracks[1..] {
        let notes = track
            .iter()
            .filter(|ev| {
                matches!(
                    ev.kind,
                    midly::TrackEventKind::Midi {
                        message: midly::MidiMessage::NoteOn { .. },
                        ..
                    }
                )
            })
            .count();
        assert!(notes > 0, "voice track without notes");
    }
}

#[test]
fn annotation_files_carry_the_plan() {
    let result = small_result();
    let dir = tempfile::tempdir().unwrap();

    let json_path = dir.path().join("a.json");
    write_annotation_json(&json_path, &result.annotations).unwrap();
    let text = std::fs::read_to_string(&json_path).unwrap();
    let back: cantus::annotate::AnnotationSheet = serde_json::from_str(&text).unwrap();
    assert_eq!(back, result.annotations);

    let csv_path = dir.path().join("a.csv");
    write_annotation_csv(&csv_path, &result.annotations).unwrap();
    let text = std::fs::read_to_string(&csv_path).unwrap();
    assert!(text.starts_with("section,start_bar,end_bar,start_sec,end_sec"));
    assert!(text.contains("bar,chord"));
    assert!(text.contains("Dm"), "anchor chord missing from CSV");
}
