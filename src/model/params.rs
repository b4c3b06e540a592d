//! Flat parameter and gradient arena shared by every trainable layer.
//!
//! Each trainable layer owns one disjoint slot of the arena. Optimizers and the
//! persistence layer iterate the slots uniformly without knowing layer types.

/// One trainable layer's region of the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSlot {
    pub layer: usize,
    pub name: &'static str,
    pub offset: usize,
    pub len: usize,
}

impl ParamSlot {
    /// Stable tensor name used when the arena is persisted.
    pub fn key(&self) -> String {
        format!("{:02}.{}", self.layer, self.name)
    }

    fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Borrowed view of one layer's parameters and gradients.
pub struct ParameterStore<'a> {
    pub params: &'a [f32],
    pub grads: &'a mut [f32],
}

#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    params: Vec<f32>,
    grads: Vec<f32>,
    slots: Vec<ParamSlot>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a zeroed slot and returns its index.
    pub(crate) fn allocate(&mut self, layer: usize, name: &'static str, len: usize) -> usize {
        let offset = self.params.len();
        self.params.resize(offset + len, 0.0);
        self.grads.resize(offset + len, 0.0);
        self.slots.push(ParamSlot {
            layer,
            name,
            offset,
            len,
        });
        self.slots.len() - 1
    }

    pub fn slots(&self) -> &[ParamSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn grads(&self) -> &[f32] {
        &self.grads
    }

    pub fn slot_params(&self, slot: usize) -> &[f32] {
        &self.params[self.slots[slot].range()]
    }

    pub fn slot_params_mut(&mut self, slot: usize) -> &mut [f32] {
        let range = self.slots[slot].range();
        &mut self.params[range]
    }

    pub fn store(&mut self, slot: usize) -> ParameterStore<'_> {
        let range = self.slots[slot].range();
        ParameterStore {
            params: &self.params[range.clone()],
            grads: &mut self.grads[range],
        }
    }

    pub(crate) fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    pub(crate) fn params_and_grads_mut(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.params, &self.grads)
    }

    pub fn zero_grads(&mut self) {
        self.grads.iter_mut().for_each(|g| *g = 0.0);
    }

    /// Slot whose gradient holds a NaN or infinity, if any.
    pub fn first_non_finite_grad(&self) -> Option<&ParamSlot> {
        self.slots
            .iter()
            .find(|slot| self.grads[slot.range()].iter().any(|g| !g.is_finite()))
    }

    /// Same topology: identical slot keys and lengths in the same order.
    pub fn same_topology(&self, other: &ParameterSet) -> bool {
        self.slots.len() == other.slots.len()
            && self
                .slots
                .iter()
                .zip(&other.slots)
                .all(|(a, b)| a.layer == b.layer && a.name == b.name && a.len == b.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_disjoint_and_ordered() {
        let mut set = ParameterSet::new();
        let a = set.allocate(0, "weight", 6);
        let b = set.allocate(0, "bias", 2);
        let c = set.allocate(3, "weight", 4);
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(set.len(), 12);
        assert_eq!(set.grads().len(), set.params().len());
        assert_eq!(set.slots()[1].offset, 6);
        assert_eq!(set.slots()[2].offset, 8);
        assert_eq!(set.slots()[2].key(), "03.weight");
    }

    #[test]
    fn store_exposes_matching_lengths() {
        let mut set = ParameterSet::new();
        set.allocate(1, "gamma", 5);
        set.slot_params_mut(0).copy_from_slice(&[1.0; 5]);
        let ParameterStore { params, grads } = set.store(0);
        assert_eq!(params.len(), grads.len());
        grads[2] = f32::NAN;
        assert_eq!(set.first_non_finite_grad().map(|s| s.layer), Some(1));
        set.zero_grads();
        assert!(set.first_non_finite_grad().is_none());
    }
}
