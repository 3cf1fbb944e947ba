//! Cantus CLI - plan and render a generation request from the command line

use cantus::config::{load_groove_reference, load_preset, Preset};
use cantus::controls::{
    parse_anchor, parse_duration, parse_instruments, parse_marker, Controls, Marker,
};
use cantus::error::GenerateError;
use cantus::export::{
    write_annotation_csv, write_annotation_json, write_master_wav, write_midi, write_stem_wav,
};
use cantus::generate::{generate, GenerateOptions, RequestStatus};
use cantus::groove::GrooveGrid;
use cantus::render::CancellationToken;
use cantus::theory::{Key, Mode};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "cantus")]
#[command(about = "Constraint-honoring music generation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a piece and export the requested artifacts
    Generate {
        /// Musical key (e.g. C, D#, Bb)
        #[arg(long)]
        key: Option<String>,

        /// Mode (major/minor or modal: dorian, lydian, ...)
        #[arg(long)]
        mode: Option<String>,

        /// Tempo in beats per minute
        #[arg(long)]
        bpm: Option<f64>,

        /// 4-bar chord anchor, e.g. "Am-G-C-F"
        #[arg(long, default_value = "")]
        anchor: String,

        /// Total length (e.g. 60, 60s, 1m30s, 1:00)
        #[arg(long)]
        length: Option<String>,

        /// Repeatable marker "time:label", e.g. 30:motif
        #[arg(long)]
        marker: Vec<String>,

        /// Comma-separated instruments (at most 4)
        #[arg(long, default_value = "")]
        instruments: String,

        /// Path to a symbolic groove reference (JSON)
        #[arg(long)]
        groove: Option<PathBuf>,

        /// Quantization grid (1/4 .. 1/32)
        #[arg(long)]
        quantize: Option<String>,

        /// Groove strength 0.0-1.0
        #[arg(long)]
        strength: Option<f64>,

        /// Seed for the stochastic planning choices
        #[arg(long)]
        seed: Option<u64>,

        /// TOML preset; explicit flags override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output directory
        #[arg(long, default_value = "out")]
        outdir: PathBuf,

        /// Base name for output files
        #[arg(long, default_value = "take")]
        name: String,

        /// Export per-instrument stems
        #[arg(long)]
        stems: bool,

        /// Export multitrack MIDI
        #[arg(long)]
        midi: bool,

        /// Export the stereo master WAV (on by default when no other
        /// export is requested)
        #[arg(long)]
        wav: bool,

        /// Export the annotation sheet as CSV
        #[arg(long)]
        csv: bool,

        /// Export the annotation sheet as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> cantus::Result<()> {
    match cli.command {
        Commands::Generate {
            key,
            mode,
            bpm,
            anchor,
            length,
            marker,
            instruments,
            groove,
            quantize,
            strength,
            seed,
            config,
            outdir,
            name,
            stems,
            midi,
            wav,
            csv,
            json,
        } => {
            let preset = match config {
                Some(path) => load_preset(&path)?,
                None => Preset::default(),
            };

            let key_str = key
                .or(preset.key)
                .ok_or_else(|| GenerateError::invalid("--key is required"))?;
            let mode_str = mode
                .or(preset.mode)
                .ok_or_else(|| GenerateError::invalid("--mode is required"))?;
            let bpm = bpm
                .or(preset.bpm)
                .ok_or_else(|| GenerateError::invalid("--bpm is required"))?;
            let length_str = length
                .or(preset.length)
                .ok_or_else(|| GenerateError::invalid("--length is required"))?;

            let key = Key::parse(&key_str).ok_or_else(|| {
                GenerateError::invalid(format!("unsupported key '{key_str}'"))
            })?;
            let mode = Mode::parse(&mode_str).ok_or_else(|| {
                GenerateError::invalid(format!(
                    "unsupported mode '{mode_str}' (try major, minor, dorian, ...)"
                ))
            })?;
            let total = parse_duration(&length_str)?;

            let mut controls = Controls::new(key, mode, bpm, total);

            let anchor_str = if anchor.is_empty() {
                preset.anchor.unwrap_or_default()
            } else {
                anchor
            };
            controls.harmonic_anchor = parse_anchor(&anchor_str);

            let instruments_str = if instruments.is_empty() {
                preset.instruments.unwrap_or_default()
            } else {
                instruments
            };
            controls.instruments = parse_instruments(&instruments_str);

            let marker_strs = if marker.is_empty() {
                preset.markers.unwrap_or_default()
            } else {
                marker
            };
            let mut markers: Vec<Marker> = Vec::with_capacity(marker_strs.len());
            for m in &marker_strs {
                markers.push(parse_marker(m)?);
            }
            markers.sort_by(|a, b| a.time_sec.total_cmp(&b.time_sec));
            controls.markers = markers;

            let groove_path = groove.or(preset.groove.map(PathBuf::from));
            if let Some(path) = groove_path {
                controls.groove_reference = Some(load_groove_reference(&path)?);
            }

            let grid_str = quantize.or(preset.quantize).unwrap_or_else(|| "1/16".into());
            let groove_grid = GrooveGrid::parse(&grid_str).ok_or_else(|| {
                GenerateError::invalid(format!("unsupported quantize grid '{grid_str}'"))
            })?;

            let options = GenerateOptions {
                seed: seed.or(preset.seed).unwrap_or(0),
                groove_strength: strength.or(preset.strength).unwrap_or(1.0),
                groove_grid,
                ..GenerateOptions::default()
            };

            let result = generate(&controls, &options, CancellationToken::new())?;

            println!("Planned sections:");
            println!("  {:<14} {:>6} {:>6} {:>9} {:>9}", "section", "bar", "bars", "start", "end");
            for s in &result.annotations.sections {
                println!(
                    "  {:<14} {:>6} {:>6} {:>8.1}s {:>8.1}s",
                    s.label,
                    s.start_bar,
                    s.end_bar - s.start_bar,
                    s.start_sec,
                    s.end_sec
                );
            }
            if !result.annotations.motifs.is_empty() {
                println!("Motif restatements:");
                for m in &result.annotations.motifs {
                    println!(
                        "  bar {:>3}  (from bar {}, {:+} semitones)",
                        m.start_bar, m.source_bar, m.transposition_semitones
                    );
                }
            }
            if result.status == RequestStatus::Cancelled {
                println!("note: request was cancelled; stems are partial");
            }

            std::fs::create_dir_all(&outdir)?;
            let wav = wav || !(stems || midi || csv || json);
            if wav {
                let path = outdir.join(format!("{name}.mix.wav"));
                write_master_wav(&path, &result.master)?;
                println!("wrote {}", path.display());
            }
            if stems {
                for (stem_id, stem) in &result.stems {
                    let path = outdir.join(format!("{name}.{stem_id}.wav"));
                    write_stem_wav(&path, stem)?;
                    println!("wrote {}", path.display());
                }
            }
            if midi {
                let path = outdir.join(format!("{name}.mid"));
                write_midi(&path, &result.score, result.conditioning.tempo_bpm)?;
                println!("wrote {}", path.display());
            }
            if csv {
                let path = outdir.join(format!("{name}.annotations.csv"));
                write_annotation_csv(&path, &result.annotations)?;
                println!("wrote {}", path.display());
            }
            if json {
                let path = outdir.join(format!("{name}.annotations.json"));
                write_annotation_json(&path, &result.annotations)?;
                println!("wrote {}", path.display());
            }
            Ok(())
        }
    }
}
