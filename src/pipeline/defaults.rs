use ndarray::Array2;

use crate::decoding::boundaries::EnvelopeBoundaryDetector;
use crate::decoding::transitions::TransitionTable;
use crate::decoding::viterbi::viterbi_decode;
use crate::error::Result;
use crate::pipeline::traits::{BoundaryDetector, SegmentDecoder};
use crate::types::SoundInterval;

impl BoundaryDetector for EnvelopeBoundaryDetector {
    fn detect_intervals(&self, spectrogram: &Array2<f32>) -> Vec<SoundInterval> {
        self.detect(spectrogram)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ViterbiSegmentDecoder {
    pub strict_numerics: bool,
}

impl SegmentDecoder for ViterbiSegmentDecoder {
    fn decode_units(
        &self,
        observations: &[Vec<f64>],
        transitions: &TransitionTable,
    ) -> Result<Vec<usize>> {
        viterbi_decode(observations, transitions, self.strict_numerics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_detector_behind_trait_matches_direct_call() {
        let mut spec = Array2::<f32>::zeros((30, 2));
        spec.slice_mut(ndarray::s![10..20, ..]).fill(1.0);
        let detector = EnvelopeBoundaryDetector::default();
        let boxed: Box<dyn BoundaryDetector> = Box::new(detector.clone());
        assert_eq!(boxed.detect_intervals(&spec), detector.detect(&spec));
        assert_eq!(boxed.detect_intervals(&spec), vec![SoundInterval::new(10, 20)]);
    }

    #[test]
    fn viterbi_decoder_behind_trait_matches_direct_call() {
        let table = TransitionTable::from_rows(vec![
            vec![0.8, 0.1, 0.1],
            vec![0.1, 0.8, 0.1],
            vec![0.5, 0.5, 0.0],
        ])
        .unwrap();
        let obs = vec![vec![0.3, 0.7], vec![0.6, 0.4]];
        let decoder: Box<dyn SegmentDecoder> = Box::new(ViterbiSegmentDecoder::default());
        assert_eq!(
            decoder.decode_units(&obs, &table).unwrap(),
            viterbi_decode(&obs, &table, false).unwrap()
        );
    }
}
