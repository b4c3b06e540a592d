use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::SequencerConfig;
use crate::decoding::observation::LabelPrior;
use crate::decoding::transitions::TransitionTable;
use crate::error::{Result, SequencerError};
use crate::features::MeanSd;
use crate::labels::LabelList;
use crate::model::layers::{LayerSpec, Shape};
use crate::model::network::Network;
use crate::model::persistence::{load_parameters, save_parameters};

pub const BUNDLE_FILE: &str = "model.json";
pub const PARAMETERS_FILE: &str = "parameters.safetensors";

/// Everything besides the parameters that decoding needs from training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub config: SequencerConfig,
    pub input_shape: Shape,
    pub layers: Vec<LayerSpec>,
    pub labels: LabelList,
    pub mean_sd: MeanSd,
    pub transitions: TransitionTable,
    pub prior: LabelPrior,
    pub trained_at: String,
}

impl ModelBundle {
    pub fn silent_index(&self) -> Option<usize> {
        self.labels.silent_index(self.config.labels.silent_label)
    }
}

/// A bundle together with the network holding its trained parameters.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub bundle: ModelBundle,
    pub network: Network,
}

impl TrainedModel {
    /// Writes `model.json` and `parameters.safetensors` into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(|e| SequencerError::io("create model directory", e))?;
        let json = serde_json::to_string_pretty(&self.bundle)
            .map_err(|e| SequencerError::json("serialize model bundle", e))?;
        std::fs::write(dir.join(BUNDLE_FILE), json)
            .map_err(|e| SequencerError::io("write model bundle", e))?;
        save_parameters(self.network.parameters(), &dir.join(PARAMETERS_FILE))
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(dir.join(BUNDLE_FILE))
            .map_err(|e| SequencerError::io("read model bundle", e))?;
        let mut bundle: ModelBundle = serde_json::from_str(&data)
            .map_err(|e| SequencerError::json("parse model bundle", e))?;
        bundle.config.validate()?;
        bundle.labels = bundle.labels.reindexed();

        let mut network = Network::new(bundle.input_shape, &bundle.layers, bundle.config.training.seed)?;
        let params = load_parameters(&dir.join(PARAMETERS_FILE), network.parameters())?;
        network.load_parameters(params)?;
        tracing::info!(
            dir = %dir.display(),
            labels = bundle.labels.len(),
            trained_at = %bundle.trained_at,
            "model loaded"
        );
        Ok(Self { bundle, network })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::OutputSizePolicy;
    use crate::types::{LabelPair, Note, Sequence};

    fn model() -> TrainedModel {
        let note = |upper: &str| Note {
            start: 0,
            end: 1,
            label: LabelPair::new(upper, "x"),
        };
        let sequences = vec![Sequence {
            id: "m".into(),
            sampling_rate_hz: 32_000,
            num_samples: 10,
            notes: vec![note("A"), note("B")],
        }];
        let mut config = SequencerConfig::default();
        config.classifier.window_height = 3;
        let layers = vec![LayerSpec::Dense { units: 2 }, LayerSpec::SoftmaxLoss];
        let input_shape = Shape::new(1, 3, 2);
        let network = Network::new(input_shape, &layers, 0).unwrap();
        let bundle = ModelBundle {
            config,
            input_shape,
            layers,
            labels: LabelList::create(&sequences, OutputSizePolicy::ObservedPairs).unwrap(),
            mean_sd: MeanSd {
                mean: vec![0.0; 2],
                sd: vec![1.0; 2],
            },
            transitions: TransitionTable::from_rows(vec![
                vec![0.45, 0.45, 0.1],
                vec![0.45, 0.45, 0.1],
                vec![0.5, 0.5, 0.0],
            ])
            .unwrap(),
            prior: LabelPrior::from_probs(vec![0.5, 0.5]).unwrap(),
            trained_at: "2026-01-01T00:00:00+00:00".into(),
        };
        TrainedModel { bundle, network }
    }

    #[test]
    fn save_then_load_restores_bundle_and_parameters() {
        let dir = std::env::temp_dir().join("song_sequencer_bundle_round_trip");
        let original = model();
        original.save(&dir).unwrap();
        let loaded = TrainedModel::load(&dir).unwrap();
        let _ = std::fs::remove_dir_all(&dir);

        assert_eq!(loaded.bundle, original.bundle);
        assert_eq!(loaded.network.parameters().params(), original.network.parameters().params());
    }

    #[test]
    fn hand_edited_invalid_config_is_rejected_on_load() {
        let dir = std::env::temp_dir().join("song_sequencer_bundle_invalid_config");
        model().save(&dir).unwrap();
        let path = dir.join(BUNDLE_FILE);
        let mut json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        json["config"]["hmm"]["unit_frames"] = serde_json::json!(0);
        std::fs::write(&path, json.to_string()).unwrap();

        let result = TrainedModel::load(&dir);
        let _ = std::fs::remove_dir_all(&dir);
        assert!(matches!(result, Err(SequencerError::Configuration { context: "hmm", .. })));
    }
}
