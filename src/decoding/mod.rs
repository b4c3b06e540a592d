pub mod boundaries;
pub mod grouping;
pub mod observation;
pub mod transitions;
pub mod viterbi;
