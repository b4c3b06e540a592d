use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SequencerError};
use crate::types::{LabelPair, Sequence};

/// How many classes the label space enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSizePolicy {
    /// Only pairs observed in training get an index.
    #[default]
    ObservedPairs,
    /// Every upper x lower combination gets an index: `upper * num_lower + lower`.
    CartesianProduct,
}

/// Which target a window outside every note carries during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SilentLabelPolicy {
    /// Silent windows contribute no loss.
    #[default]
    NoLoss,
    /// Silence is trained as an extra class with index `len()`.
    DedicatedClass,
}

/// Training target of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Class(usize),
    NoLoss,
}

/// Bijection between label pairs and dense indices `0..len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelList {
    upper: Vec<String>,
    lower: Vec<String>,
    pairs: Vec<LabelPair>,
    #[serde(skip)]
    index: HashMap<LabelPair, usize>,
}

impl LabelList {
    pub fn create(sequences: &[Sequence], policy: OutputSizePolicy) -> Result<Self> {
        let observed: BTreeSet<LabelPair> = sequences
            .iter()
            .flat_map(|s| s.notes.iter().map(|n| n.label.clone()))
            .collect();
        if observed.is_empty() {
            return Err(SequencerError::configuration(
                "label list",
                "training sequences contain no notes",
            ));
        }
        let upper: Vec<String> = observed
            .iter()
            .map(|p| p.upper.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let lower: Vec<String> = observed
            .iter()
            .map(|p| p.lower.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let pairs = match policy {
            OutputSizePolicy::ObservedPairs => observed.into_iter().collect(),
            OutputSizePolicy::CartesianProduct => upper
                .iter()
                .flat_map(|u| lower.iter().map(move |l| LabelPair::new(u.clone(), l.clone())))
                .collect(),
        };
        Ok(Self::from_parts(upper, lower, pairs))
    }

    fn from_parts(upper: Vec<String>, lower: Vec<String>, pairs: Vec<LabelPair>) -> Self {
        let index = pairs
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i))
            .collect();
        Self {
            upper,
            lower,
            pairs,
            index,
        }
    }

    /// Rebuilds the lookup table after deserialization.
    pub fn reindexed(self) -> Self {
        Self::from_parts(self.upper, self.lower, self.pairs)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn num_upper(&self) -> usize {
        self.upper.len()
    }

    pub fn num_lower(&self) -> usize {
        self.lower.len()
    }

    pub fn index_of(&self, pair: &LabelPair) -> Option<usize> {
        self.index.get(pair).copied()
    }

    pub fn pair(&self, index: usize) -> Option<&LabelPair> {
        self.pairs.get(index)
    }

    pub fn pairs(&self) -> &[LabelPair] {
        &self.pairs
    }

    /// Network output width, including the silent class when it is trained.
    pub fn output_size(&self, silent: SilentLabelPolicy) -> usize {
        match silent {
            SilentLabelPolicy::NoLoss => self.len(),
            SilentLabelPolicy::DedicatedClass => self.len() + 1,
        }
    }

    pub fn silent_target(&self, silent: SilentLabelPolicy) -> Target {
        match silent {
            SilentLabelPolicy::NoLoss => Target::NoLoss,
            SilentLabelPolicy::DedicatedClass => Target::Class(self.len()),
        }
    }

    pub fn silent_index(&self, silent: SilentLabelPolicy) -> Option<usize> {
        match silent {
            SilentLabelPolicy::NoLoss => None,
            SilentLabelPolicy::DedicatedClass => Some(self.len()),
        }
    }
}
