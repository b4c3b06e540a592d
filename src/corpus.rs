//! JSON corpus of recordings with precomputed spectrograms.

use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SequencerError};
use crate::pipeline::runtime::SequenceInput;
use crate::types::{Note, Sequence, SoundInterval};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub id: String,
    pub sampling_rate_hz: u32,
    pub num_samples: usize,
    /// Frames x frequency bins.
    pub spectrogram: Vec<Vec<f32>>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub intervals: Option<Vec<SoundInterval>>,
}

impl CorpusEntry {
    pub fn sequence(&self) -> Sequence {
        Sequence {
            id: self.id.clone(),
            sampling_rate_hz: self.sampling_rate_hz,
            num_samples: self.num_samples,
            notes: self.notes.clone(),
        }
    }

    pub fn spectrogram_array(&self) -> Result<Array2<f32>> {
        let frames = self.spectrogram.len();
        let bins = self.spectrogram.first().map_or(0, Vec::len);
        if let Some(row) = self.spectrogram.iter().position(|r| r.len() != bins) {
            return Err(SequencerError::configuration(
                "corpus",
                format!(
                    "`{}` frame {row} has {} bins, frame 0 has {bins}",
                    self.id,
                    self.spectrogram[row].len()
                ),
            ));
        }
        let flat: Vec<f32> = self.spectrogram.iter().flatten().copied().collect();
        Array2::from_shape_vec((frames, bins), flat)
            .map_err(|e| SequencerError::configuration("corpus", e.to_string()))
    }

    pub fn input(&self) -> Result<SequenceInput> {
        Ok(SequenceInput {
            id: self.id.clone(),
            spectrogram: self.spectrogram_array()?,
            intervals: self.intervals.clone(),
        })
    }
}

pub fn load_corpus(path: &Path) -> Result<Vec<CorpusEntry>> {
    let data = std::fs::read_to_string(path).map_err(|e| SequencerError::io("read corpus", e))?;
    let entries: Vec<CorpusEntry> =
        serde_json::from_str(&data).map_err(|e| SequencerError::json("parse corpus", e))?;
    tracing::info!(path = %path.display(), recordings = entries.len(), "corpus loaded");
    Ok(entries)
}

/// Splits training entries into the sequences and spectrograms the trainer consumes.
pub fn training_data(entries: &[CorpusEntry]) -> Result<(Vec<Sequence>, Vec<Array2<f32>>)> {
    let sequences = entries.iter().map(CorpusEntry::sequence).collect();
    let spectrograms = entries
        .iter()
        .map(CorpusEntry::spectrogram_array)
        .collect::<Result<Vec<_>>>()?;
    Ok((sequences, spectrograms))
}
