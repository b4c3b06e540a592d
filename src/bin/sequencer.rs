use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use song_sequencer::corpus::{load_corpus, training_data};
use song_sequencer::pipeline::stages;
use song_sequencer::{LabeledSequence, SequencerBuilder, SequencerConfig, SequencerError};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sequencer")]
#[command(about = "Train a note classifier and label recordings with segmented HMM decoding")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train the network and estimate decoding statistics from an annotated corpus.
    Train {
        /// Configuration JSON; defaults are used when omitted.
        #[arg(long, env = "SEQUENCER_CONFIG")]
        config: Option<PathBuf>,
        #[arg(long, env = "SEQUENCER_TRAIN_CORPUS")]
        corpus: PathBuf,
        /// Model directory to write.
        #[arg(long, env = "SEQUENCER_MODEL_DIR")]
        out: PathBuf,
    },
    /// Label every recording of a corpus with a trained model.
    Decode {
        #[arg(long, env = "SEQUENCER_MODEL_DIR")]
        model: PathBuf,
        #[arg(long, env = "SEQUENCER_DECODE_CORPUS")]
        corpus: PathBuf,
        #[arg(long, env = "SEQUENCER_OUT")]
        out: PathBuf,
        /// Worker threads, 0 for one per core.
        #[arg(long, env = "SEQUENCER_THREADS")]
        threads: Option<usize>,
    },
}

#[derive(Debug, Serialize)]
struct DecodeReport {
    generated_at: String,
    model_dir: String,
    cancelled: bool,
    sequences: Vec<LabeledSequence>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("song_sequencer=info")),
        )
        .init();

    if let Err(err) = run(Args::parse()) {
        tracing::error!(error = %err, "sequencer failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), SequencerError> {
    let cancel = AtomicBool::new(false);
    match args.command {
        Command::Train { config, corpus, out } => {
            let config = match config {
                Some(path) => SequencerConfig::load(&path)?,
                None => SequencerConfig::default(),
            };
            let entries = load_corpus(&corpus)?;
            let (sequences, spectrograms) = training_data(&entries)?;
            let (model, report) = stages::fit(&sequences, &spectrograms, &config, &cancel)?;
            model.save(&out)?;
            tracing::info!(
                out = %out.display(),
                labels = model.bundle.labels.len(),
                iterations = report.completed_iterations,
                final_loss = report.final_loss,
                "model written"
            );
        }
        Command::Decode {
            model,
            corpus,
            out,
            threads,
        } => {
            let mut builder = SequencerBuilder::from_model_dir(&model)?;
            if let Some(threads) = threads {
                builder = builder.with_threads(threads);
            }
            let sequencer = builder.build()?;
            let inputs = load_corpus(&corpus)?
                .iter()
                .map(|entry| entry.input())
                .collect::<Result<Vec<_>, _>>()?;

            let progress = ProgressBar::new(inputs.len() as u64);
            progress.set_style(
                ProgressStyle::with_template(
                    "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
            );
            let labeled = sequencer.label_all(&inputs, &cancel, |sequence| {
                progress.set_message(sequence.id.clone());
                progress.inc(1);
            })?;
            progress.finish_with_message("done");

            let report = DecodeReport {
                generated_at: Utc::now().to_rfc3339(),
                model_dir: model.display().to_string(),
                cancelled: labeled.cancelled,
                sequences: labeled.sequences,
            };
            write_report(&out, &report)?;
            tracing::info!(out = %out.display(), sequences = report.sequences.len(), "labels written");
        }
    }
    Ok(())
}

fn write_report(path: &Path, report: &DecodeReport) -> Result<(), SequencerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SequencerError::io("create output directory", e))?;
    }
    let mut file = File::create(path).map_err(|e| SequencerError::io("create output file", e))?;
    serde_json::to_writer_pretty(&mut file, report)
        .map_err(|e| SequencerError::json("serialize labels", e))?;
    file.write_all(b"\n")
        .map_err(|e| SequencerError::io("finalize output file", e))?;
    Ok(())
}
