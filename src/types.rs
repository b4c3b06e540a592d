use serde::{Deserialize, Serialize};

use crate::error::{Result, SequencerError};

/// One classifier class: the label space is factored into an upper and a lower symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelPair {
    pub upper: String,
    pub lower: String,
}

impl LabelPair {
    pub fn new(upper: impl Into<String>, lower: impl Into<String>) -> Self {
        Self {
            upper: upper.into(),
            lower: lower.into(),
        }
    }
}

/// A labelled event. Sample interval is [start, end), start inclusive/end exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub start: usize,
    pub end: usize,
    pub label: LabelPair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: String,
    pub sampling_rate_hz: u32,
    pub num_samples: usize,
    /// Ground truth, only present for training recordings.
    #[serde(default)]
    pub notes: Vec<Note>,
}

/// Half-open range [start, end) of spectrogram frames produced by a boundary detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundInterval {
    pub start: usize,
    pub end: usize,
}

impl SoundInterval {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, frame: usize) -> bool {
        frame >= self.start && frame < self.end
    }
}

/// Intervals must be well formed, disjoint and time ordered.
pub fn validate_intervals(intervals: &[SoundInterval]) -> Result<()> {
    let mut prev_end = 0usize;
    for (idx, interval) in intervals.iter().enumerate() {
        if interval.end < interval.start {
            return Err(SequencerError::configuration(
                "sound intervals",
                format!(
                    "interval {idx} ends before it starts ({}..{})",
                    interval.start, interval.end
                ),
            ));
        }
        if idx > 0 && interval.start < prev_end {
            return Err(SequencerError::configuration(
                "sound intervals",
                format!("interval {idx} overlaps or precedes its predecessor"),
            ));
        }
        prev_end = interval.end;
    }
    Ok(())
}

/// Decoder output for one recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledSequence {
    pub id: String,
    pub notes: Vec<Note>,
}

/// Classifier output for one recording: per spectrogram position either a distribution
/// over network outputs or nothing when the position was not classified.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorMap {
    num_labels: usize,
    silent_index: Option<usize>,
    rows: Vec<Option<Vec<f32>>>,
}

impl PosteriorMap {
    pub fn new(num_labels: usize, silent_index: Option<usize>, positions: usize) -> Self {
        Self {
            num_labels,
            silent_index,
            rows: vec![None; positions],
        }
    }

    /// Label pairs covered, excluding any silent column.
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn silent_index(&self) -> Option<usize> {
        self.silent_index
    }

    /// Entries per classified row.
    pub fn width(&self) -> usize {
        self.num_labels + usize::from(self.silent_index.is_some())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&[f32]> {
        self.rows.get(position).and_then(|row| row.as_deref())
    }

    pub fn set(&mut self, position: usize, distribution: Vec<f32>) -> Result<()> {
        if distribution.len() != self.width() {
            return Err(SequencerError::configuration(
                "posterior map",
                format!(
                    "distribution has {} entries, expected {}",
                    distribution.len(),
                    self.width()
                ),
            ));
        }
        let len = self.rows.len();
        let row = self.rows.get_mut(position).ok_or_else(|| {
            SequencerError::configuration(
                "posterior map",
                format!("position {position} outside map of {len} positions"),
            )
        })?;
        *row = Some(distribution);
        Ok(())
    }

    pub fn classified(&self) -> usize {
        self.rows.iter().filter(|row| row.is_some()).count()
    }
}

/// Short-time Fourier geometry linking sample positions to spectrogram frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StftParam {
    pub fft_length: usize,
    pub shift_length: usize,
}

impl Default for StftParam {
    fn default() -> Self {
        Self {
            fft_length: 512,
            shift_length: 32,
        }
    }
}

impl StftParam {
    /// Number of whole frames a recording of `num_samples` samples yields.
    pub fn spectrogram_length(&self, num_samples: usize) -> usize {
        if num_samples < self.fft_length || self.shift_length == 0 {
            return 0;
        }
        (num_samples - self.fft_length) / self.shift_length + 1
    }

    /// First frame whose centre lies at or after `sample`.
    pub fn sample_to_frame(&self, sample: usize) -> usize {
        let half = self.fft_length / 2;
        if sample <= half {
            return 0;
        }
        (sample - half).div_ceil(self.shift_length)
    }

    /// Centre sample of `frame`.
    pub fn frame_to_sample(&self, frame: usize) -> usize {
        frame * self.shift_length + self.fft_length / 2
    }

    /// Frame range covered by a note.
    pub fn note_frames(&self, note: &Note) -> SoundInterval {
        SoundInterval::new(
            self.sample_to_frame(note.start),
            self.sample_to_frame(note.end),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stft_frame_sample_round_trip() {
        let stft = StftParam::default();
        for frame in [0usize, 1, 7, 1000] {
            assert_eq!(stft.sample_to_frame(stft.frame_to_sample(frame)), frame);
        }
    }

    #[test]
    fn spectrogram_length_matches_frame_count() {
        let stft = StftParam {
            fft_length: 512,
            shift_length: 32,
        };
        assert_eq!(stft.spectrogram_length(100), 0);
        assert_eq!(stft.spectrogram_length(512), 1);
        assert_eq!(stft.spectrogram_length(512 + 32 * 9), 10);
    }

    #[test]
    fn note_frames_cover_centred_frames() {
        let stft = StftParam {
            fft_length: 4,
            shift_length: 2,
        };
        // frame centres: 2, 4, 6, 8, ...
        let note = Note {
            start: 3,
            end: 8,
            label: LabelPair::new("a", "x"),
        };
        assert_eq!(stft.note_frames(&note), SoundInterval::new(1, 3));
    }

    #[test]
    fn overlapping_intervals_are_rejected() {
        let ok = [SoundInterval::new(0, 4), SoundInterval::new(4, 9)];
        assert!(validate_intervals(&ok).is_ok());
        let bad = [SoundInterval::new(0, 5), SoundInterval::new(4, 9)];
        assert!(validate_intervals(&bad).is_err());
        let inverted = [SoundInterval::new(6, 2)];
        assert!(validate_intervals(&inverted).is_err());
    }

    #[test]
    fn posterior_map_tracks_classified_positions() {
        let mut map = PosteriorMap::new(2, Some(2), 4);
        assert_eq!(map.width(), 3);
        map.set(1, vec![0.2, 0.3, 0.5]).unwrap();
        assert_eq!(map.get(1), Some(&[0.2f32, 0.3, 0.5][..]));
        assert!(map.get(0).is_none());
        assert!(map.set(2, vec![1.0, 0.0]).is_err());
        assert!(map.set(9, vec![1.0, 0.0, 0.0]).is_err());
        assert_eq!(map.classified(), 1);
    }
}
