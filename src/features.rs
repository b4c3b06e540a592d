//! Spectrogram normalization and local window extraction.
//!
//! Spectrograms are `frames x frequency bins`. A window of height `h` for position `p`
//! covers frames `[p - h/2, p - h/2 + h)` and is flattened time-major into one network
//! input sample of shape `(1, h, bins)`.

use ndarray::{s, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SequencerError};
use crate::types::SoundInterval;

const MIN_SD: f32 = 1e-6;

/// Per-frequency-bin mean and standard deviation estimated over training spectrograms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanSd {
    pub mean: Vec<f32>,
    pub sd: Vec<f32>,
}

impl MeanSd {
    pub fn estimate<'a, I>(spectrograms: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Array2<f32>>,
    {
        let mut width: Option<usize> = None;
        let mut sum = Vec::new();
        let mut sum_sq = Vec::new();
        let mut frames = 0usize;

        for spectrogram in spectrograms {
            let bins = spectrogram.ncols();
            match width {
                None => {
                    width = Some(bins);
                    sum = vec![0.0f64; bins];
                    sum_sq = vec![0.0f64; bins];
                }
                Some(w) if w != bins => {
                    return Err(SequencerError::configuration(
                        "mean/sd estimation",
                        format!("spectrogram has {bins} frequency bins, expected {w}"),
                    ));
                }
                Some(_) => {}
            }
            for row in spectrogram.axis_iter(Axis(0)) {
                for (bin, &v) in row.iter().enumerate() {
                    let v = v as f64;
                    sum[bin] += v;
                    sum_sq[bin] += v * v;
                }
            }
            frames += spectrogram.nrows();
        }

        if frames == 0 {
            return Err(SequencerError::configuration(
                "mean/sd estimation",
                "no spectrogram frames to estimate from",
            ));
        }

        let n = frames as f64;
        let mean: Vec<f32> = sum.iter().map(|s| (s / n) as f32).collect();
        let sd = sum
            .iter()
            .zip(&sum_sq)
            .map(|(s, sq)| {
                let m = s / n;
                ((sq / n - m * m).max(0.0).sqrt() as f32).max(MIN_SD)
            })
            .collect();
        Ok(Self { mean, sd })
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    pub fn normalize(&self, spectrogram: &Array2<f32>) -> Result<Array2<f32>> {
        if spectrogram.ncols() != self.width() {
            return Err(SequencerError::configuration(
                "normalize spectrogram",
                format!(
                    "spectrogram has {} frequency bins, normalization expects {}",
                    spectrogram.ncols(),
                    self.width()
                ),
            ));
        }
        let mut out = spectrogram.clone();
        for mut row in out.axis_iter_mut(Axis(0)) {
            for ((v, m), sd) in row.iter_mut().zip(&self.mean).zip(&self.sd) {
                *v = (*v - m) / sd;
            }
        }
        Ok(out)
    }
}

/// First frame of the window centred on `position`, if it does not start before frame 0.
pub(crate) fn window_start(position: usize, height: usize) -> Option<usize> {
    position.checked_sub(height / 2)
}

/// Positions whose window fits inside `range`, every `stride` frames.
pub(crate) fn window_positions(
    range: SoundInterval,
    height: usize,
    stride: usize,
) -> impl Iterator<Item = usize> {
    let first_start = range.start;
    let last_start = range.end.checked_sub(height);
    let positions = match last_start {
        Some(last) if last >= first_start && height > 0 => first_start..last + 1,
        _ => 0..0,
    };
    positions.step_by(stride.max(1)).map(move |start| start + height / 2)
}

/// Appends the flattened window centred on `position` to `out`.
pub(crate) fn push_window(
    spectrogram: ArrayView2<'_, f32>,
    position: usize,
    height: usize,
    out: &mut Vec<f32>,
) {
    if let Some(start) = window_start(position, height) {
        let window = spectrogram.slice(s![start..start + height, ..]);
        out.extend(window.iter().copied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn window_fits(position: usize, height: usize, range: SoundInterval) -> bool {
        match window_start(position, height) {
            Some(start) => start >= range.start && start + height <= range.end,
            None => false,
        }
    }

    #[test]
    fn normalized_training_data_has_zero_mean_unit_sd() {
        let a = array![[1.0f32, 10.0], [3.0, 10.0]];
        let b = array![[5.0f32, 10.0], [7.0, 10.0]];
        let stats = MeanSd::estimate([&a, &b]).unwrap();
        assert!((stats.mean[0] - 4.0).abs() < 1e-6);
        assert!((stats.sd[0] - 5.0f32.sqrt()).abs() < 1e-5);
        // constant bin keeps a floor sd instead of dividing by zero
        assert_eq!(stats.sd[1], MIN_SD);

        let n = stats.normalize(&a).unwrap();
        assert!((n[[0, 0]] + 3.0 / 5.0f32.sqrt()).abs() < 1e-5);
        assert_eq!(n[[1, 1]], 0.0);
    }

    #[test]
    fn mismatched_widths_are_rejected() {
        let a = Array2::<f32>::zeros((2, 3));
        let b = Array2::<f32>::zeros((2, 4));
        assert!(MeanSd::estimate([&a, &b]).is_err());
        let stats = MeanSd::estimate([&a]).unwrap();
        assert!(stats.normalize(&b).is_err());
    }

    #[test]
    fn window_positions_stay_inside_range() {
        let range = SoundInterval::new(10, 20);
        let positions: Vec<usize> = window_positions(range, 4, 1).collect();
        assert_eq!(positions.first(), Some(&12));
        assert_eq!(positions.last(), Some(&18));
        assert!(positions.iter().all(|&p| window_fits(p, 4, range)));
        assert!(!window_fits(19, 4, range));
        assert_eq!(window_positions(SoundInterval::new(0, 3), 4, 1).count(), 0);
        assert_eq!(window_positions(range, 4, 3).count(), 3);
    }

    #[test]
    fn push_window_flattens_time_major() {
        let spec = array![[0.0f32, 1.0], [2.0, 3.0], [4.0, 5.0], [6.0, 7.0]];
        let mut out = Vec::new();
        push_window(spec.view(), 2, 2, &mut out);
        assert_eq!(out, vec![2.0, 3.0, 4.0, 5.0]);
    }
}
