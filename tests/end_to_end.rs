use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use ndarray::Array2;
use song_sequencer::model::layers::LayerSpec;
use song_sequencer::pipeline::stages;
use song_sequencer::{
    LabelPair, Note, Sequence, SequenceInput, SequencerBuilder, SequencerConfig, SequencerError,
    SoundInterval, StftParam, TrainedModel,
};

const FRAMES: usize = 40;
const BINS: usize = 4;
const FIRST: (usize, usize) = (5, 15);
const SECOND: (usize, usize) = (20, 30);

fn stft() -> StftParam {
    StftParam {
        fft_length: 2,
        shift_length: 1,
    }
}

/// Two notes: `first` excites bins 0-1, `second` bins 2-3, silence elsewhere.
fn recording(id: &str, first: &str, second: &str) -> (Sequence, Array2<f32>) {
    let mut spec = Array2::<f32>::zeros((FRAMES, BINS));
    let mut notes = Vec::new();
    for (upper, (start, end)) in [(first, FIRST), (second, SECOND)] {
        let band = if upper == "a" { 0..2 } else { 2..4 };
        for f in start..end {
            for b in band.clone() {
                spec[[f, b]] = 1.0 + 0.1 * ((f * 7 + b * 3) % 5) as f32;
            }
        }
        notes.push(Note {
            start: stft().frame_to_sample(start),
            end: stft().frame_to_sample(end),
            label: LabelPair::new(upper, "x"),
        });
    }
    let sequence = Sequence {
        id: id.to_string(),
        sampling_rate_hz: 32_000,
        num_samples: stft().frame_to_sample(FRAMES),
        notes,
    };
    (sequence, spec)
}

fn config() -> SequencerConfig {
    let mut config = SequencerConfig {
        stft: stft(),
        threads: 2,
        ..SequencerConfig::default()
    };
    config.network.layers = Some(vec![
        LayerSpec::Dense { units: 8 },
        LayerSpec::Relu,
        LayerSpec::Dense { units: 2 },
        LayerSpec::SoftmaxLoss,
    ]);
    config.classifier.window_height = 3;
    config.classifier.batch_size = 8;
    config.training.iterations = 40;
    config.training.batch_size = 4;
    config.training.learning_rate = 0.05;
    config
}

fn corpus() -> (Vec<Sequence>, Vec<Array2<f32>>) {
    let (s1, x1) = recording("ab", "a", "b");
    let (s2, x2) = recording("ba", "b", "a");
    (vec![s1, s2], vec![x1, x2])
}

fn labels_of(notes: &[Note]) -> Vec<&str> {
    notes.iter().map(|n| n.label.upper.as_str()).collect()
}

#[test]
fn trained_model_survives_a_save_and_labels_recordings() {
    let (sequences, spectrograms) = corpus();
    let cancel = AtomicBool::new(false);
    let (model, report) = stages::fit(&sequences, &spectrograms, &config(), &cancel).unwrap();
    assert_eq!(report.completed_iterations, 40);
    assert!(!report.cancelled);
    assert_eq!(model.bundle.labels.len(), 2);

    let dir = std::env::temp_dir().join("song_sequencer_end_to_end");
    model.save(&dir).unwrap();
    let reloaded = TrainedModel::load(&dir).unwrap();
    assert_eq!(reloaded.bundle, model.bundle);
    assert_eq!(reloaded.network.parameters().params(), model.network.parameters().params());
    let sequencer = SequencerBuilder::new(reloaded).build().unwrap();
    let _ = std::fs::remove_dir_all(&dir);

    let inputs = vec![
        SequenceInput {
            id: "given".into(),
            spectrogram: spectrograms[0].clone(),
            intervals: Some(vec![
                SoundInterval::new(FIRST.0, FIRST.1),
                SoundInterval::new(SECOND.0, SECOND.1),
            ]),
        },
        SequenceInput {
            id: "detected".into(),
            spectrogram: spectrograms[1].clone(),
            intervals: None,
        },
    ];
    let done = AtomicUsize::new(0);
    let labeled = sequencer
        .label_all(&inputs, &cancel, |_| {
            done.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    assert!(!labeled.cancelled);
    assert_eq!(done.load(Ordering::Relaxed), 2);
    assert_eq!(labeled.sequences[0].id, "given");
    assert_eq!(labeled.sequences[1].id, "detected");
    assert_eq!(labels_of(&labeled.sequences[0].notes), vec!["a", "b"]);
    assert_eq!(labels_of(&labeled.sequences[1].notes), vec!["b", "a"]);
    for (labeled, truth) in labeled.sequences.iter().zip(&sequences) {
        assert_eq!(labeled.notes, truth.notes);
    }
}

#[test]
fn cancelled_labeling_returns_no_sequences() {
    let (sequences, spectrograms) = corpus();
    let running = AtomicBool::new(false);
    let (model, _) = stages::fit(&sequences, &spectrograms, &config(), &running).unwrap();
    let sequencer = SequencerBuilder::new(model).build().unwrap();

    let inputs: Vec<SequenceInput> = spectrograms
        .into_iter()
        .enumerate()
        .map(|(i, spectrogram)| SequenceInput {
            id: format!("r{i}"),
            spectrogram,
            intervals: None,
        })
        .collect();
    let cancelled = AtomicBool::new(true);
    let report = sequencer.label_all(&inputs, &cancelled, |_| {}).unwrap();
    assert!(report.cancelled);
    assert!(report.sequences.is_empty());
}

#[test]
fn unreadable_model_dir_is_an_error() {
    assert!(SequencerBuilder::from_model_dir(std::path::Path::new("/nonexistent/model")).is_err());
}

#[test]
fn callers_can_report_io_and_json_failures_as_sequencer_errors() {
    let io = SequencerError::io(
        "write labels",
        std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
    );
    assert!(io.to_string().contains("write labels"));

    let parse = serde_json::from_str::<Vec<u32>>("[1,").unwrap_err();
    let json = SequencerError::json("serialize labels", parse);
    assert!(matches!(json, SequencerError::Json { context: "serialize labels", .. }));
}
