use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::decoding::boundaries::EnvelopeBoundaryDetector;
use crate::decoding::observation::{BayesNormalization, ObservationMode, ObservationOptions};
use crate::error::{Result, SequencerError};
use crate::labels::{OutputSizePolicy, SilentLabelPolicy};
use crate::model::layers::LayerSpec;
use crate::model::trainer::TrainingConfig;
use crate::pipeline::classifier::ClassifierConfig;
use crate::types::StftParam;

/// Everything needed to train a model and decode with it, loadable from one JSON file.
/// Missing sections and fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub stft: StftParam,
    pub network: NetworkConfig,
    pub training: TrainingConfig,
    pub classifier: ClassifierConfig,
    pub hmm: HmmConfig,
    pub labels: LabelConfig,
    pub boundary: EnvelopeBoundaryDetector,
    /// Decoding worker threads; 0 lets rayon decide.
    pub threads: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub conv_channels: usize,
    pub kernel_size: usize,
    pub pool_size: usize,
    pub full_connection_size: usize,
    /// Explicit topology; replaces the default stack built from the fields above.
    pub layers: Option<Vec<LayerSpec>>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            conv_channels: 16,
            kernel_size: 5,
            pool_size: 2,
            full_connection_size: 240,
            layers: None,
        }
    }
}

impl NetworkConfig {
    /// Layer stack ending in a softmax over `outputs` classes.
    pub fn layer_specs(&self, outputs: usize) -> Vec<LayerSpec> {
        if let Some(layers) = &self.layers {
            return layers.clone();
        }
        let conv = LayerSpec::Conv {
            channels: self.conv_channels,
            kernel_height: self.kernel_size,
            kernel_width: self.kernel_size,
            pad_height: self.kernel_size / 2,
            pad_width: self.kernel_size / 2,
        };
        vec![
            conv.clone(),
            LayerSpec::Relu,
            LayerSpec::MaxPool {
                size: self.pool_size,
            },
            conv,
            LayerSpec::Relu,
            LayerSpec::MaxPool {
                size: self.pool_size,
            },
            LayerSpec::Dense {
                units: self.full_connection_size,
            },
            LayerSpec::LayerNorm { eps: 1e-5 },
            LayerSpec::Relu,
            LayerSpec::Dense { units: outputs },
            LayerSpec::SoftmaxLoss,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HmmConfig {
    pub smoothing_constant: f64,
    /// Spectrogram frames per decoding unit.
    pub unit_frames: usize,
    pub observation_mode: ObservationMode,
    pub bayes_normalization: BayesNormalization,
    /// Treat a non-finite best path score as an error instead of an empty interval.
    pub strict_numerics: bool,
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            smoothing_constant: 1e-4,
            unit_frames: 1,
            observation_mode: ObservationMode::Posterior,
            bayes_normalization: BayesNormalization::PerUnit,
            strict_numerics: false,
        }
    }
}

impl HmmConfig {
    pub fn observation_options(&self) -> ObservationOptions {
        ObservationOptions {
            unit_frames: self.unit_frames,
            mode: self.observation_mode,
            normalization: self.bayes_normalization,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    pub output_size: OutputSizePolicy,
    pub silent_label: SilentLabelPolicy,
}

impl SequencerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| SequencerError::io("read sequencer config", e))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| SequencerError::json("parse sequencer config", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |context: &'static str, message: &str| {
            Err(SequencerError::configuration(context, message.to_string()))
        };
        if self.stft.fft_length == 0 || self.stft.shift_length == 0 {
            return fail("stft", "fft_length and shift_length must be positive");
        }
        if self.network.layers.is_none()
            && [
                self.network.conv_channels,
                self.network.kernel_size,
                self.network.pool_size,
                self.network.full_connection_size,
            ]
            .contains(&0)
        {
            return fail("network", "layer sizes must be positive");
        }
        self.training.validate()?;
        if self.classifier.window_height == 0 || self.classifier.batch_size == 0 {
            return fail("classifier", "window_height and batch_size must be positive");
        }
        if !(self.hmm.smoothing_constant.is_finite() && self.hmm.smoothing_constant > 0.0) {
            return fail("hmm", "smoothing_constant must be positive");
        }
        if self.hmm.unit_frames == 0 {
            return fail("hmm", "unit_frames must be positive");
        }
        if self.boundary.baseline_frames == 0 {
            return fail("boundary", "baseline_frames must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_reference_setup() {
        let config = SequencerConfig::default();
        assert_eq!(config.stft.fft_length, 512);
        assert_eq!(config.stft.shift_length, 32);
        assert_eq!(config.network.conv_channels, 16);
        assert_eq!(config.network.full_connection_size, 240);
        assert_eq!(config.training.iterations, 200);
        assert_eq!(config.training.batch_size, 2);
        assert_eq!(config.training.seed, 0);
        assert_eq!(config.classifier.window_height, 96);
        assert_eq!(config.hmm.smoothing_constant, 1e-4);
        assert_eq!(config.hmm.observation_mode, ObservationMode::Posterior);
        assert_eq!(config.labels.silent_label, SilentLabelPolicy::NoLoss);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{
            "training": { "iterations": 3, "learning_rate": 0.1 },
            "hmm": { "observation_mode": "bayes_prior", "bayes_normalization": "per_interval" },
            "labels": { "silent_label": "dedicated_class" }
        }"#;
        let config: SequencerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.training.iterations, 3);
        assert_eq!(config.training.batch_size, 2);
        assert_eq!(config.hmm.observation_mode, ObservationMode::BayesPrior);
        assert_eq!(config.hmm.bayes_normalization, BayesNormalization::PerInterval);
        assert_eq!(config.labels.silent_label, SilentLabelPolicy::DedicatedClass);
        assert_eq!(config.hmm.unit_frames, 1);
    }

    #[test]
    fn default_stack_ends_in_softmax_over_outputs() {
        let specs = NetworkConfig::default().layer_specs(7);
        assert_eq!(specs.last(), Some(&LayerSpec::SoftmaxLoss));
        assert_eq!(specs[specs.len() - 2], LayerSpec::Dense { units: 7 });
    }

    #[test]
    fn load_rejects_invalid_values() {
        let path = std::env::temp_dir().join("song_sequencer_config_invalid.json");
        std::fs::write(&path, r#"{ "hmm": { "smoothing_constant": 0.0 } }"#).expect("write config");
        let err = SequencerConfig::load(&path).unwrap_err();
        assert!(matches!(err, SequencerError::Configuration { context: "hmm", .. }));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_reports_missing_file_as_io() {
        let err = SequencerConfig::load(Path::new("/nonexistent/sequencer.json")).unwrap_err();
        assert!(matches!(err, SequencerError::Io { .. }));
    }
}
