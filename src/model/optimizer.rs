use crate::model::params::ParameterSet;

/// Stochastic gradient descent with classical momentum and L2 weight decay.
///
/// Velocity buffers mirror the flat parameter arena, so one pass updates every
/// trainable layer regardless of its type.
#[derive(Debug, Clone)]
pub struct MomentumSgd {
    momentum: f32,
    weight_decay: f32,
    velocity: Vec<f32>,
}

impl MomentumSgd {
    pub fn new(momentum: f32, weight_decay: f32, parameter_count: usize) -> Self {
        Self {
            momentum,
            weight_decay,
            velocity: vec![0.0; parameter_count],
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.velocity.len()
    }

    pub(crate) fn step(&mut self, params: &mut ParameterSet, learning_rate: f32) {
        let (weights, grads) = params.params_and_grads_mut();
        debug_assert_eq!(weights.len(), self.velocity.len());
        for ((w, &g), v) in weights.iter_mut().zip(grads).zip(self.velocity.iter_mut()) {
            *v = self.momentum * *v - learning_rate * (g + self.weight_decay * *w);
            *w += *v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::params::ParameterStore;

    #[test]
    fn momentum_accumulates_velocity() {
        let mut set = ParameterSet::new();
        set.allocate(0, "dense", 1);
        let ParameterStore { grads, .. } = set.store(0);
        grads[0] = 1.0;
        let mut sgd = MomentumSgd::new(0.5, 0.0, 1);
        sgd.step(&mut set, 0.1);
        assert!((set.params()[0] + 0.1).abs() < 1e-7);
        sgd.step(&mut set, 0.1);
        // v = 0.5 * -0.1 - 0.1 = -0.15
        assert!((set.params()[0] + 0.25).abs() < 1e-7);
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let mut set = ParameterSet::new();
        set.allocate(0, "dense", 1);
        set.slot_params_mut(0)[0] = 2.0;
        let mut sgd = MomentumSgd::new(0.0, 0.5, 1);
        sgd.step(&mut set, 0.1);
        assert!((set.params()[0] - 1.9).abs() < 1e-6);
    }
}
