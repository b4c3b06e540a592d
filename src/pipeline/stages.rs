//! Entry points: train a network, classify a spectrogram, estimate transitions and decode.

use std::sync::atomic::AtomicBool;

use ndarray::Array2;

use crate::config::SequencerConfig;
use crate::decoding::grouping::group_into_notes;
use crate::decoding::observation::{build_observations, LabelPrior, ObservationOptions};
use crate::decoding::transitions::TransitionTable;
use crate::error::{Result, SequencerError};
use crate::features::MeanSd;
use crate::labels::LabelList;
use crate::model::network::Network;
use crate::model::trainer::{Trainer, TrainingReport, TrainingSet, WindowOptions};
use crate::pipeline::bundle::{ModelBundle, TrainedModel};
use crate::pipeline::classifier::Classifier;
use crate::pipeline::traits::SegmentDecoder;
use crate::types::{Note, PosteriorMap, Sequence, SoundInterval, StftParam};

/// A freshly trained network with the label space and normalization it was trained on.
#[derive(Debug, Clone)]
pub struct TrainedNetwork {
    pub network: Network,
    pub labels: LabelList,
    pub mean_sd: MeanSd,
    pub report: TrainingReport,
}

/// Builds the label list, normalization and training windows, then trains a new network.
pub fn train(
    sequences: &[Sequence],
    spectrograms: &[Array2<f32>],
    config: &SequencerConfig,
    cancel: &AtomicBool,
) -> Result<TrainedNetwork> {
    config.validate()?;
    let labels = LabelList::create(sequences, config.labels.output_size)?;
    let mean_sd = MeanSd::estimate(spectrograms)?;
    let options = WindowOptions {
        stft: config.stft,
        window_height: config.classifier.window_height,
        stride: config.training.window_stride,
        silent: config.labels.silent_label,
    };
    let set = TrainingSet::build(sequences, spectrograms, &labels, &mean_sd, options)?;

    let outputs = labels.output_size(config.labels.silent_label);
    let specs = config.network.layer_specs(outputs);
    let mut network = Network::new(set.input_shape(), &specs, config.training.seed)?;
    if network.output_size() != outputs {
        return Err(SequencerError::configuration(
            "network",
            format!(
                "network has {} outputs, label space needs {outputs}",
                network.output_size()
            ),
        ));
    }

    let report = Trainer::new(config.training.clone())?.train(&mut network, &set, cancel)?;
    tracing::info!(
        iterations = report.completed_iterations,
        cancelled = report.cancelled,
        final_loss = report.final_loss,
        "training finished"
    );
    Ok(TrainedNetwork {
        network,
        labels,
        mean_sd,
        report,
    })
}

pub fn classify(
    classifier: &mut Classifier,
    spectrogram: &Array2<f32>,
    intervals: &[SoundInterval],
) -> Result<PosteriorMap> {
    classifier.classify(spectrogram, intervals)
}

pub fn estimate_transitions(
    sequences: &[Sequence],
    labels: &LabelList,
    config: &SequencerConfig,
) -> Result<TransitionTable> {
    TransitionTable::estimate(
        sequences,
        labels,
        config.stft,
        config.hmm.unit_frames,
        config.hmm.smoothing_constant,
    )
}

/// Trains the network and estimates every decoding statistic in one pass.
pub fn fit(
    sequences: &[Sequence],
    spectrograms: &[Array2<f32>],
    config: &SequencerConfig,
    cancel: &AtomicBool,
) -> Result<(TrainedModel, TrainingReport)> {
    let trained = train(sequences, spectrograms, config, cancel)?;
    let transitions = estimate_transitions(sequences, &trained.labels, config)?;
    let prior = LabelPrior::estimate(
        sequences,
        &trained.labels,
        config.stft,
        config.hmm.smoothing_constant,
    )?;
    let bundle = ModelBundle {
        config: config.clone(),
        input_shape: trained.network.input_shape(),
        layers: trained.network.specs().to_vec(),
        labels: trained.labels,
        mean_sd: trained.mean_sd,
        transitions,
        prior,
        trained_at: chrono::Utc::now().to_rfc3339(),
    };
    Ok((
        TrainedModel {
            bundle,
            network: trained.network,
        },
        trained.report,
    ))
}

/// Read-only inputs shared by every decoded sequence.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    pub labels: &'a LabelList,
    pub transitions: &'a TransitionTable,
    pub prior: Option<&'a LabelPrior>,
    pub stft: StftParam,
    pub options: ObservationOptions,
}

/// Decodes every interval independently and returns the notes in time order.
pub fn decode(
    posteriors: &PosteriorMap,
    intervals: &[SoundInterval],
    context: &DecodeContext<'_>,
    decoder: &dyn SegmentDecoder,
) -> Result<Vec<Note>> {
    let n = context.transitions.num_labels();
    if posteriors.num_labels() != n || context.labels.len() != n {
        return Err(SequencerError::configuration(
            "decode",
            format!(
                "posteriors cover {} labels, label list {}, transition table {n}",
                posteriors.num_labels(),
                context.labels.len()
            ),
        ));
    }

    let observations = build_observations(posteriors, intervals, context.options, context.prior)?;
    let mut notes = Vec::new();
    for (interval, unit_frames, units) in observations.sound_segments() {
        let path = decoder.decode_units(units, context.transitions)?;
        if !path.is_empty() && path.len() != units.len() {
            return Err(SequencerError::configuration(
                "decode",
                format!("decoder returned {} labels for {} units", path.len(), units.len()),
            ));
        }
        let interval_notes = group_into_notes(&path, interval, unit_frames, context.labels, context.stft)?;
        tracing::debug!(
            start = interval.start,
            end = interval.end,
            units = units.len(),
            notes = interval_notes.len(),
            "interval decoded"
        );
        notes.extend(interval_notes);
    }
    Ok(notes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoding::observation::{BayesNormalization, ObservationMode};
    use crate::labels::OutputSizePolicy;
    use crate::pipeline::defaults::ViterbiSegmentDecoder;
    use crate::types::LabelPair;

    fn two_labels() -> LabelList {
        let note = |upper: &str| Note {
            start: 0,
            end: 1,
            label: LabelPair::new(upper, "x"),
        };
        let seqs = vec![Sequence {
            id: "l".into(),
            sampling_rate_hz: 32_000,
            num_samples: 10,
            notes: vec![note("A"), note("B")],
        }];
        LabelList::create(&seqs, OutputSizePolicy::ObservedPairs).unwrap()
    }

    fn flat_table() -> TransitionTable {
        TransitionTable::from_rows(vec![
            vec![0.45, 0.45, 0.1],
            vec![0.45, 0.45, 0.1],
            vec![0.5, 0.5, 0.0],
        ])
        .unwrap()
    }

    fn stft() -> StftParam {
        StftParam {
            fft_length: 2,
            shift_length: 1,
        }
    }

    fn posteriors(rows: &[[f32; 2]]) -> PosteriorMap {
        let mut map = PosteriorMap::new(2, None, rows.len());
        for (i, row) in rows.iter().enumerate() {
            map.set(i, row.to_vec()).unwrap();
        }
        map
    }

    fn labels_of(notes: &[Note]) -> Vec<&str> {
        notes.iter().map(|n| n.label.upper.as_str()).collect()
    }

    #[test]
    fn bayes_correction_changes_the_decoded_labels() {
        let labels = two_labels();
        let table = flat_table();
        // classifier leans to A everywhere, but A also dominated training
        let map = posteriors(&[[0.6, 0.4]; 4]);
        let prior = LabelPrior::from_probs(vec![0.9, 0.1]).unwrap();
        let intervals = [SoundInterval::new(0, 4)];
        let decoder = ViterbiSegmentDecoder::default();

        let mut context = DecodeContext {
            labels: &labels,
            transitions: &table,
            prior: Some(&prior),
            stft: stft(),
            options: ObservationOptions::default(),
        };
        let plain = decode(&map, &intervals, &context, &decoder).unwrap();
        assert_eq!(labels_of(&plain), vec!["A"]);

        for normalization in [BayesNormalization::PerUnit, BayesNormalization::PerInterval] {
            context.options = ObservationOptions {
                mode: ObservationMode::BayesPrior,
                normalization,
                ..ObservationOptions::default()
            };
            let corrected = decode(&map, &intervals, &context, &decoder).unwrap();
            assert_eq!(labels_of(&corrected), vec!["B"], "{normalization:?}");
        }
    }

    #[test]
    fn bayes_normalizations_decode_to_the_same_notes() {
        let labels = two_labels();
        let table = flat_table();
        let map = posteriors(&[[0.7, 0.3], [0.55, 0.45], [0.4, 0.6], [0.35, 0.65], [0.5, 0.5], [0.8, 0.2]]);
        let prior = LabelPrior::from_probs(vec![0.7, 0.3]).unwrap();
        let intervals = [SoundInterval::new(0, 6)];
        let decode_with = |normalization| {
            let context = DecodeContext {
                labels: &labels,
                transitions: &table,
                prior: Some(&prior),
                stft: stft(),
                options: ObservationOptions {
                    mode: ObservationMode::BayesPrior,
                    normalization,
                    ..ObservationOptions::default()
                },
            };
            decode(&map, &intervals, &context, &ViterbiSegmentDecoder::default()).unwrap()
        };
        assert_eq!(
            decode_with(BayesNormalization::PerUnit),
            decode_with(BayesNormalization::PerInterval)
        );
    }

    #[test]
    fn intervals_decode_independently_and_notes_carry_sample_bounds() {
        let labels = two_labels();
        let table = flat_table();
        let map = posteriors(&[[0.9, 0.1], [0.9, 0.1], [0.5, 0.5], [0.1, 0.9], [0.1, 0.9], [0.1, 0.9]]);
        let context = DecodeContext {
            labels: &labels,
            transitions: &table,
            prior: None,
            stft: stft(),
            options: ObservationOptions::default(),
        };
        let intervals = [SoundInterval::new(0, 2), SoundInterval::new(3, 6)];
        let notes = decode(&map, &intervals, &context, &ViterbiSegmentDecoder::default()).unwrap();
        assert_eq!(labels_of(&notes), vec!["A", "B"]);
        assert_eq!((notes[0].start, notes[0].end), (1, 3));
        assert_eq!((notes[1].start, notes[1].end), (4, 7));
    }

    #[test]
    fn short_interval_yields_no_notes() {
        let labels = two_labels();
        let table = flat_table();
        let map = posteriors(&[[0.9, 0.1]; 4]);
        let context = DecodeContext {
            labels: &labels,
            transitions: &table,
            prior: None,
            stft: stft(),
            options: ObservationOptions {
                unit_frames: 3,
                ..ObservationOptions::default()
            },
        };
        let notes = decode(&map, &[SoundInterval::new(0, 2)], &context, &ViterbiSegmentDecoder::default()).unwrap();
        assert!(notes.is_empty());
    }

    #[test]
    fn label_count_mismatch_is_a_configuration_error() {
        let labels = two_labels();
        let table = TransitionTable::from_rows(vec![vec![0.5, 0.5], vec![1.0, 0.0]]).unwrap();
        let map = posteriors(&[[0.5, 0.5]]);
        let context = DecodeContext {
            labels: &labels,
            transitions: &table,
            prior: None,
            stft: stft(),
            options: ObservationOptions::default(),
        };
        let err = decode(&map, &[SoundInterval::new(0, 1)], &context, &ViterbiSegmentDecoder::default()).unwrap_err();
        assert!(matches!(err, SequencerError::Configuration { .. }));
    }
}
