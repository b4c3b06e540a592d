use crate::decoding::transitions::TransitionTable;
use crate::error::{Result, SequencerError};

/// Most likely label path through one sound interval.
///
/// The path starts from and ends in the boundary state. Scores are natural-log f64.
/// Comparisons are strict `>` in label order, so among equal-scoring predecessors the
/// lowest label index wins. An interval with no units yields an empty path.
///
/// A best score that is not finite is a `NumericInstability` error when `strict` is
/// set; otherwise it is logged and the interval decodes to nothing.
pub fn viterbi_decode(
    observations: &[Vec<f64>],
    table: &TransitionTable,
    strict: bool,
) -> Result<Vec<usize>> {
    let t_len = observations.len();
    let n = table.num_labels();
    if t_len == 0 {
        return Ok(Vec::new());
    }
    if let Some((t, row)) = observations.iter().enumerate().find(|(_, row)| row.len() != n) {
        return Err(SequencerError::configuration(
            "viterbi",
            format!(
                "unit {t} has {} observation entries, transition table has {n} labels",
                row.len()
            ),
        ));
    }

    let boundary = table.boundary();
    let mut prev: Vec<f64> = (0..n)
        .map(|s| table.log_prob(boundary, s) + observations[0][s].ln())
        .collect();
    let mut curr = vec![f64::NEG_INFINITY; n];
    let mut bp = vec![0usize; t_len * n];

    for t in 1..t_len {
        let row = &observations[t];
        let bp_offset = t * n;
        for s in 0..n {
            let (best, from) = best_predecessor(&prev, s, table);
            curr[s] = best + row[s].ln();
            bp[bp_offset + s] = from;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let mut best = f64::NEG_INFINITY;
    let mut s = 0usize;
    for (state, score) in prev.iter().enumerate() {
        let cand = score + table.log_prob(state, boundary);
        if cand > best {
            best = cand;
            s = state;
        }
    }

    if !best.is_finite() {
        if strict {
            return Err(SequencerError::numeric(
                "viterbi",
                format!("best path score over {t_len} units is {best}"),
            ));
        }
        tracing::warn!(units = t_len, score = best, "no finite path through interval");
        return Ok(Vec::new());
    }

    let mut path = Vec::with_capacity(t_len);
    path.push(s);
    for t in (1..t_len).rev() {
        s = bp[t * n + s];
        path.push(s);
    }
    path.reverse();
    Ok(path)
}

#[inline(always)]
fn best_predecessor(prev: &[f64], s: usize, table: &TransitionTable) -> (f64, usize) {
    let mut best = f64::NEG_INFINITY;
    let mut from = 0usize;
    for (p, score) in prev.iter().enumerate() {
        let cand = score + table.log_prob(p, s);
        if cand > best {
            best = cand;
            from = p;
        }
    }
    (best, from)
}
