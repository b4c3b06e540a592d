//! Conversion of per-position classifier posteriors into per-unit observation
//! probabilities over the detected sound intervals.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SequencerError};
use crate::labels::LabelList;
use crate::types::{validate_intervals, PosteriorMap, Sequence, SoundInterval, StftParam};

/// Smoothed empirical prior of label pairs, counted in spectrogram frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelPrior {
    probs: Vec<f64>,
}

impl LabelPrior {
    pub fn estimate(
        sequences: &[Sequence],
        labels: &LabelList,
        stft: StftParam,
        smoothing: f64,
    ) -> Result<Self> {
        if !(smoothing.is_finite() && smoothing > 0.0) {
            return Err(SequencerError::configuration(
                "label prior",
                format!("smoothing constant must be positive, got {smoothing}"),
            ));
        }
        let mut counts = vec![0.0f64; labels.len()];
        for sequence in sequences {
            for note in &sequence.notes {
                let index = labels.index_of(&note.label).ok_or_else(|| {
                    SequencerError::configuration(
                        "label prior",
                        format!(
                            "label ({}, {}) is missing from the label list",
                            note.label.upper, note.label.lower
                        ),
                    )
                    .in_sequence(&sequence.id)
                })?;
                counts[index] += stft.note_frames(note).len() as f64;
            }
        }
        let total = counts.iter().sum::<f64>() + smoothing * counts.len() as f64;
        Self::from_probs(counts.iter().map(|c| (c + smoothing) / total).collect())
    }

    /// Every entry must be positive and finite; the vector is renormalized to sum to 1.
    pub fn from_probs(probs: Vec<f64>) -> Result<Self> {
        if probs.is_empty() || probs.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(SequencerError::configuration(
                "label prior",
                "prior must be a non-empty vector of positive probabilities",
            ));
        }
        let sum: f64 = probs.iter().sum();
        Ok(Self {
            probs: probs.into_iter().map(|p| p / sum).collect(),
        })
    }

    pub fn probs(&self) -> &[f64] {
        &self.probs
    }
}

/// How averaged posteriors become observation likelihoods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationMode {
    /// The averaged posterior is the observation probability.
    #[default]
    Posterior,
    /// The posterior is divided by the training label prior (Bayes' rule), then renormalized.
    BayesPrior,
}

/// Renormalization applied after the Bayes division.
///
/// Both variants rescale whole units, and every path through an interval visits each
/// unit exactly once, so they always decode to the same labels. They differ only in
/// the observation values handed to a custom [`SegmentDecoder`].
///
/// [`SegmentDecoder`]: crate::pipeline::traits::SegmentDecoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BayesNormalization {
    /// Each unit sums to 1.
    #[default]
    PerUnit,
    /// All units of one interval together sum to the interval's unit count.
    PerInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationOptions {
    pub unit_frames: usize,
    pub mode: ObservationMode,
    pub normalization: BayesNormalization,
}

impl Default for ObservationOptions {
    fn default() -> Self {
        Self {
            unit_frames: 1,
            mode: ObservationMode::default(),
            normalization: BayesNormalization::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Frames outside every interval: the boundary state with probability 1.
    Silence { start: usize, end: usize },
    /// One probability row per decoding unit; unit `k` covers
    /// `[start + k * unit_frames, start + (k + 1) * unit_frames)`.
    Sound {
        interval: SoundInterval,
        unit_frames: usize,
        probs: Vec<Vec<f64>>,
    },
}

/// Time-ordered silence and sound segments covering a whole recording.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentedObservations {
    pub num_labels: usize,
    pub segments: Vec<Segment>,
    /// Units without any classified position; they carry the uniform distribution.
    pub unclassified_units: usize,
}

impl SegmentedObservations {
    pub fn sound_segments(&self) -> impl Iterator<Item = (SoundInterval, usize, &[Vec<f64>])> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Sound {
                interval,
                unit_frames,
                probs,
            } => Some((*interval, *unit_frames, probs.as_slice())),
            Segment::Silence { .. } => None,
        })
    }
}

pub fn build_observations(
    posteriors: &PosteriorMap,
    intervals: &[SoundInterval],
    options: ObservationOptions,
    prior: Option<&LabelPrior>,
) -> Result<SegmentedObservations> {
    if options.unit_frames == 0 {
        return Err(SequencerError::configuration(
            "observations",
            "unit_frames must be positive",
        ));
    }
    validate_intervals(intervals)?;
    let total = posteriors.len();
    if let Some(last) = intervals.last() {
        if last.end > total {
            return Err(SequencerError::configuration(
                "observations",
                format!("interval ends at frame {}, recording has {total}", last.end),
            ));
        }
    }

    let num_labels = posteriors.num_labels();
    let prior = match options.mode {
        ObservationMode::Posterior => None,
        ObservationMode::BayesPrior => {
            let prior = prior.ok_or_else(|| {
                SequencerError::configuration(
                    "observations",
                    "bayes_prior observation mode needs a label prior",
                )
            })?;
            if prior.probs().len() != num_labels {
                return Err(SequencerError::configuration(
                    "observations",
                    format!(
                        "label prior covers {} labels, posteriors cover {num_labels}",
                        prior.probs().len()
                    ),
                ));
            }
            Some(prior)
        }
    };

    let mut segments = Vec::with_capacity(intervals.len() * 2 + 1);
    let mut unclassified_units = 0usize;
    let mut cursor = 0usize;
    for interval in intervals {
        if interval.start > cursor {
            segments.push(Segment::Silence {
                start: cursor,
                end: interval.start,
            });
        }
        let u = options.unit_frames;
        let units = interval.len() / u;
        let mut probs: Vec<Vec<f64>> = (0..units)
            .map(|k| {
                let start = interval.start + k * u;
                unit_observation(posteriors, start..start + u).unwrap_or_else(|| {
                    unclassified_units += 1;
                    vec![1.0 / num_labels as f64; num_labels]
                })
            })
            .collect();
        if let Some(prior) = prior {
            apply_prior(&mut probs, prior.probs(), options.normalization);
        }
        segments.push(Segment::Sound {
            interval: *interval,
            unit_frames: u,
            probs,
        });
        cursor = interval.end;
    }
    if cursor < total {
        segments.push(Segment::Silence {
            start: cursor,
            end: total,
        });
    }

    if unclassified_units > 0 {
        tracing::warn!(
            unclassified_units,
            intervals = intervals.len(),
            "decoding units without classifier output fall back to a uniform observation"
        );
    }

    Ok(SegmentedObservations {
        num_labels,
        segments,
        unclassified_units,
    })
}

/// Averages the classified rows inside `frames` over the label columns; `None` when no
/// position inside `frames` was classified.
fn unit_observation(posteriors: &PosteriorMap, frames: std::ops::Range<usize>) -> Option<Vec<f64>> {
    let n = posteriors.num_labels();
    let silent = posteriors.silent_index();
    let mut acc = vec![0.0f64; n];
    let mut seen = 0usize;
    for position in frames {
        let Some(row) = posteriors.get(position) else {
            continue;
        };
        let labels = row
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != silent)
            .map(|(_, &v)| v as f64);
        for (a, v) in acc.iter_mut().zip(labels) {
            *a += v;
        }
        seen += 1;
    }
    if seen == 0 {
        return None;
    }
    let sum: f64 = acc.iter().sum();
    if sum == 0.0 {
        return Some(vec![1.0 / n as f64; n]);
    }
    acc.iter_mut().for_each(|a| *a /= sum);
    Some(acc)
}

fn apply_prior(units: &mut [Vec<f64>], prior: &[f64], normalization: BayesNormalization) {
    for unit in units.iter_mut() {
        for (p, q) in unit.iter_mut().zip(prior) {
            *p /= q;
        }
    }
    match normalization {
        BayesNormalization::PerUnit => {
            for unit in units.iter_mut() {
                let sum: f64 = unit.iter().sum();
                if sum > 0.0 {
                    unit.iter_mut().for_each(|p| *p /= sum);
                }
            }
        }
        BayesNormalization::PerInterval => {
            let sum: f64 = units.iter().flatten().sum();
            if sum > 0.0 {
                let scale = units.len() as f64 / sum;
                units.iter_mut().flatten().for_each(|p| *p *= scale);
            }
        }
    }
}
