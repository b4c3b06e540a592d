use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::Array2;
use rayon::prelude::*;

use crate::decoding::observation::{LabelPrior, ObservationOptions};
use crate::decoding::transitions::TransitionTable;
use crate::error::{Result, SequencerError};
use crate::labels::LabelList;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::stages::{self, DecodeContext};
use crate::pipeline::traits::{BoundaryDetector, SegmentDecoder};
use crate::types::{LabeledSequence, Note, SoundInterval, StftParam};

/// One recording to label.
#[derive(Debug, Clone)]
pub struct SequenceInput {
    pub id: String,
    /// Frames x frequency bins.
    pub spectrogram: Array2<f32>,
    /// Precomputed sound intervals; the boundary detector runs when absent.
    pub intervals: Option<Vec<SoundInterval>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelingReport {
    /// Completed sequences in input order.
    pub sequences: Vec<LabeledSequence>,
    pub cancelled: bool,
}

/// Classify, observe and decode pipeline for whole recordings.
pub struct Sequencer {
    classifier: Classifier,
    labels: LabelList,
    transitions: TransitionTable,
    prior: LabelPrior,
    stft: StftParam,
    observation: ObservationOptions,
    threads: usize,
    boundary_detector: Box<dyn BoundaryDetector>,
    segment_decoder: Box<dyn SegmentDecoder>,
}

pub(crate) struct SequencerParts {
    pub classifier: Classifier,
    pub labels: LabelList,
    pub transitions: TransitionTable,
    pub prior: LabelPrior,
    pub stft: StftParam,
    pub observation: ObservationOptions,
    pub threads: usize,
    pub boundary_detector: Box<dyn BoundaryDetector>,
    pub segment_decoder: Box<dyn SegmentDecoder>,
}

impl Sequencer {
    pub(crate) fn from_parts(parts: SequencerParts) -> Self {
        Self {
            classifier: parts.classifier,
            labels: parts.labels,
            transitions: parts.transitions,
            prior: parts.prior,
            stft: parts.stft,
            observation: parts.observation,
            threads: parts.threads,
            boundary_detector: parts.boundary_detector,
            segment_decoder: parts.segment_decoder,
        }
    }

    pub fn labels(&self) -> &LabelList {
        &self.labels
    }

    pub fn label(&self, input: &SequenceInput) -> Result<LabeledSequence> {
        let mut classifier = self.classifier.clone();
        self.label_with(&mut classifier, input)
    }

    /// Labels every input on the worker pool, one network clone per worker.
    ///
    /// `cancel` is checked before each sequence; sequences finished before it was set are
    /// still returned. The first failing sequence aborts the run with its id attached.
    pub fn label_all<F>(
        &self,
        inputs: &[SequenceInput],
        cancel: &AtomicBool,
        on_done: F,
    ) -> Result<LabelingReport>
    where
        F: Fn(&LabeledSequence) + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| SequencerError::configuration("thread pool", e.to_string()))?;

        let outcomes: Vec<Option<Result<LabeledSequence>>> = pool.install(|| {
            inputs
                .par_iter()
                .map_with(self.classifier.clone(), |classifier, input| {
                    if cancel.load(Ordering::Relaxed) {
                        return None;
                    }
                    let outcome = self.label_with(classifier, input);
                    if let Ok(labeled) = &outcome {
                        on_done(labeled);
                    }
                    Some(outcome)
                })
                .collect()
        });

        let mut sequences = Vec::with_capacity(inputs.len());
        let mut cancelled = false;
        for outcome in outcomes {
            match outcome {
                Some(result) => sequences.push(result?),
                None => cancelled = true,
            }
        }
        tracing::info!(
            requested = inputs.len(),
            labeled = sequences.len(),
            notes = sequences.iter().map(|s| s.notes.len()).sum::<usize>(),
            cancelled,
            "labeling finished"
        );
        Ok(LabelingReport {
            sequences,
            cancelled,
        })
    }

    fn label_with(&self, classifier: &mut Classifier, input: &SequenceInput) -> Result<LabeledSequence> {
        self.run(classifier, input)
            .map(|notes| LabeledSequence {
                id: input.id.clone(),
                notes,
            })
            .map_err(|e| e.in_sequence(&input.id))
    }

    fn run(&self, classifier: &mut Classifier, input: &SequenceInput) -> Result<Vec<Note>> {
        let detected;
        let intervals = match &input.intervals {
            Some(intervals) => intervals.as_slice(),
            None => {
                detected = self.boundary_detector.detect_intervals(&input.spectrogram);
                detected.as_slice()
            }
        };
        let posteriors = stages::classify(classifier, &input.spectrogram, intervals)?;
        let context = DecodeContext {
            labels: &self.labels,
            transitions: &self.transitions,
            prior: Some(&self.prior),
            stft: self.stft,
            options: self.observation,
        };
        stages::decode(&posteriors, intervals, &context, self.segment_decoder.as_ref())
    }
}
