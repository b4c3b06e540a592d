use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SequencerError};
use crate::features::{push_window, window_positions, MeanSd};
use crate::model::network::Network;
use crate::types::{validate_intervals, PosteriorMap, SoundInterval};

/// Which positions the classifier evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifyScope {
    /// Every position whose window fits inside the spectrogram.
    #[default]
    AllPositions,
    /// Only positions whose window fits entirely inside one sound interval. Intervals
    /// shorter than the window get no classified position.
    InsideIntervals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Window height in spectrogram frames.
    pub window_height: usize,
    /// Windows per forward batch.
    pub batch_size: usize,
    pub scope: ClassifyScope,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            window_height: 96,
            batch_size: 64,
            scope: ClassifyScope::default(),
        }
    }
}

/// Sliding-window inference over one spectrogram at a time.
///
/// Owns its network; clone the classifier to run several spectrograms concurrently.
#[derive(Debug, Clone)]
pub struct Classifier {
    network: Network,
    mean_sd: MeanSd,
    num_labels: usize,
    silent_index: Option<usize>,
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(
        network: Network,
        mean_sd: MeanSd,
        num_labels: usize,
        silent_index: Option<usize>,
        config: ClassifierConfig,
    ) -> Result<Self> {
        let input = network.input_shape();
        if input.width != mean_sd.width() {
            return Err(SequencerError::shape(
                0,
                "classifier frequency bins",
                input.width,
                mean_sd.width(),
            ));
        }
        if input.channels != 1 || input.height != config.window_height {
            return Err(SequencerError::configuration(
                "classifier",
                format!(
                    "network input {input:?} does not take single-channel windows of height {}",
                    config.window_height
                ),
            ));
        }
        if config.batch_size == 0 {
            return Err(SequencerError::configuration(
                "classifier",
                "batch_size must be positive",
            ));
        }
        let width = num_labels + usize::from(silent_index.is_some());
        if network.output_size() != width {
            return Err(SequencerError::configuration(
                "classifier",
                format!(
                    "network has {} outputs, label space needs {width}",
                    network.output_size()
                ),
            ));
        }
        Ok(Self {
            network,
            mean_sd,
            num_labels,
            silent_index,
            config,
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Posterior distribution for every position in scope, `None` elsewhere.
    pub fn classify(
        &mut self,
        spectrogram: &Array2<f32>,
        intervals: &[SoundInterval],
    ) -> Result<PosteriorMap> {
        let bins = self.network.input_shape().width;
        if spectrogram.ncols() != bins {
            return Err(SequencerError::shape(
                0,
                "spectrogram frequency bins",
                bins,
                spectrogram.ncols(),
            ));
        }
        let frames = spectrogram.nrows();
        let height = self.config.window_height;

        let ranges = match self.config.scope {
            ClassifyScope::AllPositions => vec![SoundInterval::new(0, frames)],
            ClassifyScope::InsideIntervals => {
                validate_intervals(intervals)?;
                if let Some(last) = intervals.last() {
                    if last.end > frames {
                        return Err(SequencerError::configuration(
                            "classifier",
                            format!("interval ends at frame {}, spectrogram has {frames}", last.end),
                        ));
                    }
                }
                intervals.to_vec()
            }
        };
        let positions: Vec<usize> = ranges
            .iter()
            .flat_map(|&range| window_positions(range, height, 1))
            .collect();

        let normalized = self.mean_sd.normalize(spectrogram)?;
        let mut map = PosteriorMap::new(self.num_labels, self.silent_index, frames);
        let width = map.width();
        let mut input = Vec::with_capacity(self.config.batch_size * height * bins);
        for batch in positions.chunks(self.config.batch_size) {
            input.clear();
            for &position in batch {
                push_window(normalized.view(), position, height, &mut input);
            }
            let probs = self.network.forward(&input, batch.len())?;
            for (&position, row) in batch.iter().zip(probs.chunks_exact(width)) {
                map.set(position, row.to_vec())?;
            }
        }

        tracing::debug!(
            frames,
            classified = map.classified(),
            scope = ?self.config.scope,
            "spectrogram classified"
        );
        Ok(map)
    }
}
