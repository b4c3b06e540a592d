use ndarray::{s, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::types::SoundInterval;

/// Energy-envelope onset/offset detector over a frequency band of the spectrogram.
///
/// Per-frame band energy is compared with a threshold derived from the noise floor (the
/// mean energy of the quietest `baseline_frames` frames). Short dips are bridged and short
/// bursts are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeBoundaryDetector {
    pub frequency_offset: usize,
    /// `None` runs the band to the last frequency bin.
    pub frequency_length: Option<usize>,
    pub threshold_multiplier: f32,
    pub min_threshold: f32,
    pub baseline_frames: usize,
    /// Quiet runs shorter than this are merged into the surrounding sound.
    pub min_gap_frames: usize,
    pub min_note_frames: usize,
}

impl Default for EnvelopeBoundaryDetector {
    fn default() -> Self {
        Self {
            frequency_offset: 0,
            frequency_length: None,
            threshold_multiplier: 4.0,
            min_threshold: 0.01,
            baseline_frames: 10,
            min_gap_frames: 2,
            min_note_frames: 3,
        }
    }
}

impl EnvelopeBoundaryDetector {
    pub fn detect(&self, spectrogram: &Array2<f32>) -> Vec<SoundInterval> {
        let Some(energy) = self.band_energy(spectrogram) else {
            return Vec::new();
        };
        let threshold = (self.noise_floor(&energy) * self.threshold_multiplier).max(self.min_threshold);
        let runs = runs_above_threshold(&energy, threshold);
        let merged = bridge_gaps(runs, self.min_gap_frames);
        let intervals: Vec<SoundInterval> = merged
            .into_iter()
            .filter(|interval| interval.len() >= self.min_note_frames.max(1))
            .collect();
        tracing::debug!(
            frames = energy.len(),
            threshold,
            intervals = intervals.len(),
            "sound intervals detected"
        );
        intervals
    }

    fn band_energy(&self, spectrogram: &Array2<f32>) -> Option<Vec<f32>> {
        let bins = spectrogram.ncols();
        if spectrogram.nrows() == 0 || self.frequency_offset >= bins {
            return None;
        }
        let end = match self.frequency_length {
            Some(len) => (self.frequency_offset + len).min(bins),
            None => bins,
        };
        if end <= self.frequency_offset {
            return None;
        }
        let band = spectrogram.slice(s![.., self.frequency_offset..end]);
        band.mean_axis(Axis(1)).map(|energy| energy.to_vec())
    }

    fn noise_floor(&self, energy: &[f32]) -> f32 {
        let baseline_frames = energy.len().min(self.baseline_frames.max(1));
        let mut sorted = energy.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted.iter().take(baseline_frames).copied().sum::<f32>() / baseline_frames as f32
    }
}

fn runs_above_threshold(energy: &[f32], threshold: f32) -> Vec<SoundInterval> {
    let mut runs = Vec::new();
    let mut run_start = 0usize;
    let mut run_len = 0usize;
    for (frame_idx, e) in energy.iter().copied().enumerate() {
        if e >= threshold {
            if run_len == 0 {
                run_start = frame_idx;
            }
            run_len += 1;
            continue;
        }
        if run_len > 0 {
            runs.push(SoundInterval::new(run_start, run_start + run_len));
        }
        run_len = 0;
    }
    if run_len > 0 {
        runs.push(SoundInterval::new(run_start, run_start + run_len));
    }
    runs
}

fn bridge_gaps(runs: Vec<SoundInterval>, min_gap_frames: usize) -> Vec<SoundInterval> {
    let mut merged: Vec<SoundInterval> = Vec::with_capacity(runs.len());
    for run in runs {
        match merged.last_mut() {
            Some(last) if run.start - last.end < min_gap_frames => last.end = run.end,
            _ => merged.push(run),
        }
    }
    merged
}
