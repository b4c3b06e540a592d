use crate::error::{Result, SequencerError};
use crate::labels::LabelList;
use crate::types::{Note, SoundInterval, StftParam};

/// Merges a per-unit label path into notes, one per run of equal labels.
///
/// Run boundaries are stamped at frame centres: a run over units `[a, b]` spans samples
/// `[frame_to_sample(start of a), frame_to_sample(end of b))`.
pub fn group_into_notes(
    path: &[usize],
    interval: SoundInterval,
    unit_frames: usize,
    labels: &LabelList,
    stft: StftParam,
) -> Result<Vec<Note>> {
    let mut notes = Vec::new();
    let mut run_start = 0usize;

    let flush = |label: usize, first: usize, end_unit: usize, out: &mut Vec<Note>| -> Result<()> {
        let pair = labels.pair(label).ok_or_else(|| {
            SequencerError::configuration(
                "note grouping",
                format!("decoded label {label} is outside the label list of {}", labels.len()),
            )
        })?;
        out.push(Note {
            start: stft.frame_to_sample(interval.start + first * unit_frames),
            end: stft.frame_to_sample(interval.start + end_unit * unit_frames),
            label: pair.clone(),
        });
        Ok(())
    };

    for unit in 1..=path.len() {
        if unit == path.len() || path[unit] != path[run_start] {
            flush(path[run_start], run_start, unit, &mut notes)?;
            run_start = unit;
        }
    }
    Ok(notes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::OutputSizePolicy;
    use crate::types::{LabelPair, Sequence};

    fn labels() -> LabelList {
        let note = |upper: &str| Note {
            start: 0,
            end: 1,
            label: LabelPair::new(upper, "x"),
        };
        let seqs = vec![Sequence {
            id: "l".into(),
            sampling_rate_hz: 32_000,
            num_samples: 10,
            notes: vec![note("a"), note("b")],
        }];
        LabelList::create(&seqs, OutputSizePolicy::ObservedPairs).unwrap()
    }

    #[test]
    fn runs_become_contiguous_notes() {
        let stft = StftParam {
            fft_length: 4,
            shift_length: 2,
        };
        let notes = group_into_notes(&[0, 0, 1, 1, 1, 0], SoundInterval::new(10, 22), 2, &labels(), stft).unwrap();
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].label, LabelPair::new("a", "x"));
        // frames 10..14, 14..20, 20..22
        assert_eq!((notes[0].start, notes[0].end), (22, 30));
        assert_eq!((notes[1].start, notes[1].end), (30, 42));
        assert_eq!((notes[2].start, notes[2].end), (42, 46));
        assert_eq!(notes[1].label, LabelPair::new("b", "x"));
    }

    #[test]
    fn empty_path_has_no_notes() {
        let notes = group_into_notes(&[], SoundInterval::new(0, 0), 1, &labels(), StftParam::default()).unwrap();
        assert!(notes.is_empty());
    }

    #[test]
    fn unknown_label_is_rejected() {
        let err = group_into_notes(&[5], SoundInterval::new(0, 1), 1, &labels(), StftParam::default()).unwrap_err();
        assert!(matches!(err, SequencerError::Configuration { .. }));
    }
}
