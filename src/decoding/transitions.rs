use serde::{Deserialize, Serialize};

use crate::error::{Result, SequencerError};
use crate::labels::LabelList;
use crate::types::{Sequence, StftParam};

const ROW_SUM_TOLERANCE: f64 = 1e-9;

/// Smoothed label transition probabilities with a boundary state.
///
/// States `0..N` are label pairs, state `N` is the boundary/silence state. Row is the
/// previous state, column the next one. Boundary to boundary is never a valid successor.
///
/// Rows condition on the whole previous pair, upper and lower label. A table conditioned
/// on the previous upper label alone is the special case where every pair sharing an
/// upper label has the same row; this table does not tie those rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TableRows", into = "TableRows")]
pub struct TransitionTable {
    num_labels: usize,
    probs: Vec<f64>,
    log_probs: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct TableRows {
    rows: Vec<Vec<f64>>,
}

impl TryFrom<TableRows> for TransitionTable {
    type Error = SequencerError;

    fn try_from(raw: TableRows) -> Result<Self> {
        Self::from_rows(raw.rows)
    }
}

impl From<TransitionTable> for TableRows {
    fn from(table: TransitionTable) -> Self {
        Self { rows: table.rows() }
    }
}

impl TransitionTable {
    /// Counts transitions at decoding-unit granularity and normalizes them with additive
    /// smoothing `smoothing`.
    pub fn estimate(
        sequences: &[Sequence],
        labels: &LabelList,
        stft: StftParam,
        unit_frames: usize,
        smoothing: f64,
    ) -> Result<Self> {
        if !(smoothing.is_finite() && smoothing > 0.0) {
            return Err(SequencerError::configuration(
                "transition estimation",
                format!("smoothing constant must be positive, got {smoothing}"),
            ));
        }
        if unit_frames == 0 {
            return Err(SequencerError::configuration(
                "transition estimation",
                "unit_frames must be positive",
            ));
        }
        if labels.is_empty() {
            return Err(SequencerError::configuration(
                "transition estimation",
                "label list is empty",
            ));
        }

        let n = labels.len();
        let states = n + 1;
        let boundary = n;
        let mut counts = vec![0.0f64; states * states];
        let mut count = |from: usize, to: usize, times: f64| counts[from * states + to] += times;

        for sequence in sequences {
            let mut notes: Vec<_> = sequence.notes.iter().collect();
            notes.sort_by_key(|note| (note.start, note.end));

            let mut prev: Option<(usize, usize)> = None;
            for note in notes {
                let label = labels.index_of(&note.label).ok_or_else(|| {
                    SequencerError::configuration(
                        "transition estimation",
                        format!(
                            "label ({}, {}) has no transition state",
                            note.label.upper, note.label.lower
                        ),
                    )
                    .in_sequence(&sequence.id)
                })?;
                let frames = stft.note_frames(note);
                let units = (frames.len() / unit_frames).max(1);

                match prev {
                    None => count(boundary, label, 1.0),
                    Some((prev_label, prev_end)) if frames.start <= prev_end => {
                        count(prev_label, label, 1.0)
                    }
                    Some((prev_label, _)) => {
                        count(prev_label, boundary, 1.0);
                        count(boundary, label, 1.0);
                    }
                }
                count(label, label, (units - 1) as f64);
                prev = Some((label, frames.end));
            }
            if let Some((last, _)) = prev {
                count(last, boundary, 1.0);
            }
        }

        let mut rows = Vec::with_capacity(states);
        for from in 0..states {
            let row = &counts[from * states..(from + 1) * states];
            let successors = if from == boundary { n } else { states };
            let total: f64 = row.iter().sum::<f64>() + smoothing * successors as f64;
            rows.push(
                row.iter()
                    .enumerate()
                    .map(|(to, &c)| {
                        if from == boundary && to == boundary {
                            0.0
                        } else {
                            (c + smoothing) / total
                        }
                    })
                    .collect(),
            );
        }

        let table = Self::from_rows(rows)?;
        tracing::info!(
            labels = n,
            sequences = sequences.len(),
            smoothing,
            unit_frames,
            "transition table estimated"
        );
        Ok(table)
    }

    /// Builds a table from explicit probability rows, one per previous state.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let states = rows.len();
        if states < 2 {
            return Err(SequencerError::configuration(
                "transition table",
                "table needs at least one label state and the boundary state",
            ));
        }
        let mut probs = Vec::with_capacity(states * states);
        for (from, row) in rows.iter().enumerate() {
            if row.len() != states {
                return Err(SequencerError::configuration(
                    "transition table",
                    format!("row {from} has {} entries, expected {states}", row.len()),
                ));
            }
            if row.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(SequencerError::configuration(
                    "transition table",
                    format!("row {from} holds a negative or non-finite probability"),
                ));
            }
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                return Err(SequencerError::configuration(
                    "transition table",
                    format!("row {from} sums to {sum}, expected 1"),
                ));
            }
            probs.extend_from_slice(row);
        }
        let log_probs = probs.iter().map(|p| p.ln()).collect();
        Ok(Self {
            num_labels: states - 1,
            probs,
            log_probs,
        })
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn boundary(&self) -> usize {
        self.num_labels
    }

    fn states(&self) -> usize {
        self.num_labels + 1
    }

    pub fn prob(&self, from: usize, to: usize) -> f64 {
        self.probs[from * self.states() + to]
    }

    /// Natural log of [`Self::prob`]; `-inf` for impossible transitions.
    pub fn log_prob(&self, from: usize, to: usize) -> f64 {
        self.log_probs[from * self.states() + to]
    }

    pub fn rows(&self) -> Vec<Vec<f64>> {
        self.probs
            .chunks_exact(self.states())
            .map(|row| row.to_vec())
            .collect()
    }
}
