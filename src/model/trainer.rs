use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SequencerError};
use crate::features::{push_window, window_positions, MeanSd};
use crate::labels::{LabelList, SilentLabelPolicy, Target};
use crate::model::layers::{BatchLoss, Shape};
use crate::model::network::Network;
use crate::model::optimizer::MomentumSgd;
use crate::types::{Sequence, SoundInterval, StftParam};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub iterations: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    /// Learning-rate multiplier applied every `lr_decay_every` iterations.
    pub lr_decay: f32,
    /// 0 disables the schedule.
    pub lr_decay_every: usize,
    /// 0 disables loss reporting.
    pub report_every: usize,
    pub seed: u64,
    /// Frames between consecutive training windows.
    pub window_stride: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            iterations: 200,
            batch_size: 2,
            learning_rate: 0.01,
            momentum: 0.9,
            weight_decay: 0.0,
            lr_decay: 1.0,
            lr_decay_every: 0,
            report_every: 10,
            seed: 0,
            window_stride: 1,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(SequencerError::configuration("training", message));
        if self.batch_size == 0 {
            return fail("batch_size must be positive".into());
        }
        if self.window_stride == 0 {
            return fail("window_stride must be positive".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return fail(format!("momentum must lie in [0, 1), got {}", self.momentum));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return fail(format!("weight_decay must be non-negative, got {}", self.weight_decay));
        }
        if !(self.lr_decay > 0.0 && self.lr_decay <= 1.0) {
            return fail(format!("lr_decay must lie in (0, 1], got {}", self.lr_decay));
        }
        Ok(())
    }
}

/// One training window, identified by its source spectrogram and centre frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSample {
    pub sequence: usize,
    pub position: usize,
    pub target: Target,
}

/// Normalized spectrograms plus every training window cut from them.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    spectrograms: Vec<Array2<f32>>,
    samples: Vec<WindowSample>,
    window_height: usize,
    bins: usize,
}

/// Geometry shared by training-window extraction.
#[derive(Debug, Clone, Copy)]
pub struct WindowOptions {
    pub stft: StftParam,
    pub window_height: usize,
    pub stride: usize,
    pub silent: SilentLabelPolicy,
}

impl TrainingSet {
    /// Cuts windows from every sequence; the target is the note covering the window centre.
    pub fn build(
        sequences: &[Sequence],
        spectrograms: &[Array2<f32>],
        labels: &LabelList,
        mean_sd: &MeanSd,
        options: WindowOptions,
    ) -> Result<Self> {
        if sequences.len() != spectrograms.len() {
            return Err(SequencerError::configuration(
                "training set",
                format!(
                    "{} sequences but {} spectrograms",
                    sequences.len(),
                    spectrograms.len()
                ),
            ));
        }
        if options.window_height == 0 {
            return Err(SequencerError::configuration(
                "training set",
                "window height must be positive",
            ));
        }

        let silent = labels.silent_target(options.silent);
        let mut normalized = Vec::with_capacity(spectrograms.len());
        let mut samples = Vec::new();
        for (seq_idx, (sequence, spectrogram)) in sequences.iter().zip(spectrograms).enumerate() {
            let expected_frames = options.stft.spectrogram_length(sequence.num_samples);
            if expected_frames != spectrogram.nrows() {
                tracing::warn!(
                    sequence = %sequence.id,
                    frames = spectrogram.nrows(),
                    expected_frames,
                    "spectrogram length disagrees with the sample count, note frames may be misaligned"
                );
            }
            let notes = sequence
                .notes
                .iter()
                .map(|note| {
                    let index = labels.index_of(&note.label).ok_or_else(|| {
                        SequencerError::configuration(
                            "training set",
                            format!(
                                "label ({}, {}) is missing from the label list",
                                note.label.upper, note.label.lower
                            ),
                        )
                        .in_sequence(&sequence.id)
                    })?;
                    Ok((options.stft.note_frames(note), index))
                })
                .collect::<Result<Vec<(SoundInterval, usize)>>>()?;

            let whole = SoundInterval::new(0, spectrogram.nrows());
            for position in window_positions(whole, options.window_height, options.stride) {
                let target = notes
                    .iter()
                    .find(|(frames, _)| frames.contains(position))
                    .map(|&(_, index)| Target::Class(index))
                    .unwrap_or(silent);
                samples.push(WindowSample {
                    sequence: seq_idx,
                    position,
                    target,
                });
            }
            normalized.push(
                mean_sd
                    .normalize(spectrogram)
                    .map_err(|e| e.in_sequence(&sequence.id))?,
            );
        }

        let labelled = samples
            .iter()
            .filter(|s| s.target != Target::NoLoss)
            .count();
        tracing::info!(
            sequences = sequences.len(),
            windows = samples.len(),
            labelled,
            window_height = options.window_height,
            "training set built"
        );

        Ok(Self {
            spectrograms: normalized,
            samples,
            window_height: options.window_height,
            bins: mean_sd.width(),
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[WindowSample] {
        &self.samples
    }

    /// Network input shape of one window.
    pub fn input_shape(&self) -> Shape {
        Shape::new(1, self.window_height, self.bins)
    }

    fn fill_batch(&self, indices: &[usize], input: &mut Vec<f32>, targets: &mut Vec<Target>) {
        input.clear();
        targets.clear();
        for &i in indices {
            let sample = self.samples[i];
            push_window(
                self.spectrograms[sample.sequence].view(),
                sample.position,
                self.window_height,
                input,
            );
            targets.push(sample.target);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub completed_iterations: usize,
    pub cancelled: bool,
    /// Mean loss of the last completed iteration; `None` if it saw no labelled window.
    pub final_loss: Option<f64>,
}

pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Runs the configured number of iterations over `set`.
    ///
    /// On error the network holds the parameters of the last completed iteration.
    pub fn train(
        &self,
        network: &mut Network,
        set: &TrainingSet,
        cancel: &AtomicBool,
    ) -> Result<TrainingReport> {
        if set.is_empty() {
            return Err(SequencerError::configuration(
                "training",
                "training set contains no windows",
            ));
        }
        if network.input_shape() != set.input_shape() {
            return Err(SequencerError::configuration(
                "training",
                format!(
                    "network expects input {:?}, training windows are {:?}",
                    network.input_shape(),
                    set.input_shape()
                ),
            ));
        }

        let cfg = &self.config;
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut optimizer = MomentumSgd::new(cfg.momentum, cfg.weight_decay, network.parameters().len());
        let mut order: Vec<usize> = (0..set.len()).collect();
        let mut learning_rate = cfg.learning_rate;
        let mut input = Vec::new();
        let mut targets = Vec::with_capacity(cfg.batch_size);
        let mut report = TrainingReport {
            completed_iterations: 0,
            cancelled: false,
            final_loss: None,
        };

        for iteration in 0..cfg.iterations {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!(iteration, "training cancelled");
                report.cancelled = true;
                break;
            }

            let snapshot = network.snapshot();
            order.shuffle(&mut rng);
            let mut loss = BatchLoss {
                total: 0.0,
                labelled: 0,
            };
            for batch in order.chunks(cfg.batch_size) {
                set.fill_batch(batch, &mut input, &mut targets);
                let step = network
                    .forward(&input, batch.len())
                    .and_then(|_| network.backward(&targets))
                    .and_then(|batch_loss| {
                        network.step(&mut optimizer, learning_rate)?;
                        Ok(batch_loss)
                    });
                match step {
                    Ok(batch_loss) => {
                        loss.total += batch_loss.total;
                        loss.labelled += batch_loss.labelled;
                    }
                    Err(err) => {
                        network.restore(&snapshot);
                        return Err(err.in_iteration(iteration));
                    }
                }
            }

            report.completed_iterations = iteration + 1;
            report.final_loss = loss.mean();

            if cfg.report_every > 0 && report.completed_iterations % cfg.report_every == 0 {
                tracing::info!(
                    iteration = report.completed_iterations,
                    loss = report.final_loss,
                    learning_rate,
                    "training progress"
                );
            }
            if cfg.lr_decay_every > 0 && report.completed_iterations % cfg.lr_decay_every == 0 {
                learning_rate *= cfg.lr_decay;
            }
        }

        Ok(report)
    }
}
