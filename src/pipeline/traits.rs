use ndarray::Array2;

use crate::decoding::transitions::TransitionTable;
use crate::error::Result;
use crate::types::SoundInterval;

/// Splits a recording into candidate sound intervals.
pub trait BoundaryDetector: Send + Sync {
    /// Disjoint, time-ordered frame intervals of `spectrogram` (frames x bins).
    fn detect_intervals(&self, spectrogram: &Array2<f32>) -> Vec<SoundInterval>;
}

/// Chooses one label per decoding unit of a single sound interval.
pub trait SegmentDecoder: Send + Sync {
    fn decode_units(
        &self,
        observations: &[Vec<f64>],
        transitions: &TransitionTable,
    ) -> Result<Vec<usize>>;
}
