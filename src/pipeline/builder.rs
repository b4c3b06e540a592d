use std::path::Path;

use crate::config::HmmConfig;
use crate::error::Result;
use crate::pipeline::bundle::TrainedModel;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::defaults::ViterbiSegmentDecoder;
use crate::pipeline::runtime::{Sequencer, SequencerParts};
use crate::pipeline::traits::{BoundaryDetector, SegmentDecoder};

pub struct SequencerBuilder {
    model: TrainedModel,
    hmm: Option<HmmConfig>,
    threads: Option<usize>,
    boundary_detector: Option<Box<dyn BoundaryDetector>>,
    segment_decoder: Option<Box<dyn SegmentDecoder>>,
}

impl SequencerBuilder {
    pub fn new(model: TrainedModel) -> Self {
        Self {
            model,
            hmm: None,
            threads: None,
            boundary_detector: None,
            segment_decoder: None,
        }
    }

    /// Loads the model bundle written by [`TrainedModel::save`].
    pub fn from_model_dir(dir: &Path) -> Result<Self> {
        Ok(Self::new(TrainedModel::load(dir)?))
    }

    /// Overrides the decoding settings stored with the model.
    pub fn with_hmm(mut self, hmm: HmmConfig) -> Self {
        self.hmm = Some(hmm);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_boundary_detector(mut self, boundary_detector: Box<dyn BoundaryDetector>) -> Self {
        self.boundary_detector = Some(boundary_detector);
        self
    }

    pub fn with_segment_decoder(mut self, segment_decoder: Box<dyn SegmentDecoder>) -> Self {
        self.segment_decoder = Some(segment_decoder);
        self
    }

    pub fn build(self) -> Result<Sequencer> {
        let TrainedModel { bundle, network } = self.model;
        let config = bundle.config.clone();
        let hmm = self.hmm.unwrap_or(config.hmm);
        let silent_index = bundle.silent_index();

        let classifier = Classifier::new(
            network,
            bundle.mean_sd,
            bundle.labels.len(),
            silent_index,
            config.classifier,
        )?;

        Ok(Sequencer::from_parts(SequencerParts {
            classifier,
            labels: bundle.labels,
            transitions: bundle.transitions,
            prior: bundle.prior,
            stft: config.stft,
            observation: hmm.observation_options(),
            threads: self.threads.unwrap_or(config.threads),
            boundary_detector: self
                .boundary_detector
                .unwrap_or_else(|| Box::new(config.boundary)),
            segment_decoder: self.segment_decoder.unwrap_or_else(|| {
                Box::new(ViterbiSegmentDecoder {
                    strict_numerics: hmm.strict_numerics,
                })
            }),
        }))
    }
}
