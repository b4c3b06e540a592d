use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Result, SequencerError};
use crate::labels::Target;
use crate::model::layers::{BatchLoss, Layer, LayerSpec, Shape};
use crate::model::optimizer::MomentumSgd;
use crate::model::params::ParameterSet;

/// Ordered layer pipeline owning the complete parameter arena.
///
/// Forward/backward calls mutate per-layer activation caches, so a `Network` must not
/// be shared between concurrent callers; clone it per worker instead.
#[derive(Debug, Clone)]
pub struct Network {
    input: Shape,
    specs: Vec<LayerSpec>,
    layers: Vec<Layer>,
    params: ParameterSet,
}

impl Network {
    pub fn new(input: Shape, specs: &[LayerSpec], seed: u64) -> Result<Self> {
        match specs.iter().position(|s| *s == LayerSpec::SoftmaxLoss) {
            Some(pos) if pos + 1 == specs.len() => {}
            _ => {
                return Err(SequencerError::configuration(
                    "network topology",
                    "the last layer, and only the last layer, must be softmax_loss",
                ))
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = ParameterSet::new();
        let mut layers = Vec::with_capacity(specs.len());
        let mut shape = input;
        for (index, spec) in specs.iter().enumerate() {
            let layer = Layer::build(index, spec, shape, &mut params, &mut rng)?;
            shape = layer.output_shape();
            layers.push(layer);
        }

        tracing::info!(
            layers = layers.len(),
            parameters = params.len(),
            input = ?input,
            outputs = shape.size(),
            "network constructed"
        );

        Ok(Self {
            input,
            specs: specs.to_vec(),
            layers,
            params,
        })
    }

    pub fn input_shape(&self) -> Shape {
        self.input
    }

    pub fn output_size(&self) -> usize {
        self.layers
            .last()
            .map(|l| l.output_shape().size())
            .unwrap_or(0)
    }

    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    /// Replaces every parameter; the incoming set must have this network's topology.
    pub fn load_parameters(&mut self, params: ParameterSet) -> Result<()> {
        if !self.params.same_topology(&params) {
            return Err(SequencerError::configuration(
                "load parameters",
                format!(
                    "parameter topology mismatch: network has {} slots / {} values, got {} slots / {} values",
                    self.params.slots().len(),
                    self.params.len(),
                    params.slots().len(),
                    params.len()
                ),
            ));
        }
        self.params = params;
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Vec<f32> {
        self.params.params().to_vec()
    }

    pub(crate) fn restore(&mut self, snapshot: &[f32]) {
        self.params.params_mut().copy_from_slice(snapshot);
    }

    /// Evaluates `batch` samples and returns the softmax outputs, sample-major.
    pub fn forward(&mut self, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        if batch == 0 {
            return Ok(Vec::new());
        }
        let mut activation = input.to_vec();
        for layer in &mut self.layers {
            activation = layer.forward(&self.params, &activation, batch)?;
        }
        Ok(activation)
    }

    /// Backpropagates the loss of the last forward batch, overwriting all gradients.
    pub fn backward(&mut self, targets: &[Target]) -> Result<BatchLoss> {
        self.params.zero_grads();
        let Some((Layer::SoftmaxLoss(loss_layer), hidden)) = self.layers.split_last_mut() else {
            return Err(SequencerError::configuration(
                "network backward",
                "network has no loss layer",
            ));
        };
        let (loss, mut grad) = loss_layer.loss_gradient(targets)?;
        for layer in hidden.iter_mut().rev() {
            grad = layer.backward(&mut self.params, &grad);
        }
        Ok(loss)
    }

    /// Applies one optimizer step, or nothing at all if any gradient is not finite.
    pub fn step(&mut self, optimizer: &mut MomentumSgd, learning_rate: f32) -> Result<()> {
        if optimizer.parameter_count() != self.params.len() {
            return Err(SequencerError::configuration(
                "optimizer",
                format!(
                    "optimizer tracks {} parameters, network has {}",
                    optimizer.parameter_count(),
                    self.params.len()
                ),
            ));
        }
        if let Some(slot) = self.params.first_non_finite_grad() {
            let kind = self.layers[slot.layer].kind();
            return Err(SequencerError::numeric(
                "parameter update",
                format!("non-finite gradient in layer {} ({kind})", slot.layer),
            ));
        }
        optimizer.step(&mut self.params, learning_rate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_specs(classes: usize) -> Vec<LayerSpec> {
        vec![
            LayerSpec::Conv {
                channels: 2,
                kernel_height: 3,
                kernel_width: 3,
                pad_height: 1,
                pad_width: 1,
            },
            LayerSpec::Relu,
            LayerSpec::MaxPool { size: 2 },
            LayerSpec::Dense { units: 6 },
            LayerSpec::LayerNorm { eps: 1e-5 },
            LayerSpec::Relu,
            LayerSpec::Dense { units: classes },
            LayerSpec::SoftmaxLoss,
        ]
    }

    #[test]
    fn construction_infers_shapes_and_parameter_slots() {
        let net = Network::new(Shape::new(1, 4, 6), &tiny_specs(3), 0).unwrap();
        assert_eq!(net.output_size(), 3);
        let slots = net.parameters().slots();
        let layers: Vec<usize> = slots.iter().map(|s| s.layer).collect();
        assert_eq!(layers, vec![0, 3, 4, 6]);
        // conv: 2*1*3*3 + 2; dense: 6 * (2*2*3) + 6; norm: 2*6; dense: 3*6 + 3
        let lens: Vec<usize> = slots.iter().map(|s| s.len).collect();
        assert_eq!(lens, vec![20, 78, 12, 21]);
    }

    #[test]
    fn loss_layer_must_terminate_the_network() {
        let specs = vec![LayerSpec::SoftmaxLoss, LayerSpec::Dense { units: 2 }];
        assert!(Network::new(Shape::flat(4), &specs, 0).is_err());
        let specs = vec![LayerSpec::Dense { units: 2 }];
        assert!(Network::new(Shape::flat(4), &specs, 0).is_err());
    }

    #[test]
    fn first_forward_rejects_wrong_input_length() {
        let mut net = Network::new(Shape::new(1, 4, 6), &tiny_specs(3), 0).unwrap();
        let err = net.forward(&[0.0; 23], 1).unwrap_err();
        assert!(matches!(err, SequencerError::ShapeMismatch { layer: 0, .. }));
    }

    #[test]
    fn training_steps_reduce_loss_on_a_separable_batch() {
        let mut net = Network::new(Shape::flat(4), &[LayerSpec::Dense { units: 2 }, LayerSpec::SoftmaxLoss], 1).unwrap();
        let input = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let targets = [Target::Class(0), Target::Class(1)];
        let mut sgd = MomentumSgd::new(0.9, 0.0, net.parameters().len());

        net.forward(&input, 2).unwrap();
        let first = net.backward(&targets).unwrap().mean().unwrap();
        let mut last = first;
        for _ in 0..50 {
            net.step(&mut sgd, 0.1).unwrap();
            net.forward(&input, 2).unwrap();
            last = net.backward(&targets).unwrap().mean().unwrap();
        }
        assert!(last < first * 0.5, "loss did not decrease: {first} -> {last}");
    }

    #[test]
    fn non_finite_gradient_leaves_parameters_untouched() {
        let mut net = Network::new(Shape::flat(2), &[LayerSpec::Dense { units: 2 }, LayerSpec::SoftmaxLoss], 4).unwrap();
        net.forward(&[f32::NAN, 1.0], 1).unwrap();
        net.backward(&[Target::Class(0)]).unwrap();
        let before = net.snapshot();
        let mut sgd = MomentumSgd::new(0.0, 0.0, net.parameters().len());
        let err = net.step(&mut sgd, 0.1).unwrap_err();
        assert!(matches!(err, SequencerError::NumericInstability { .. }));
        assert_eq!(net.snapshot(), before);
    }

    #[test]
    fn load_parameters_rejects_other_topology() {
        let mut a = Network::new(Shape::flat(4), &[LayerSpec::Dense { units: 2 }, LayerSpec::SoftmaxLoss], 0).unwrap();
        let b = Network::new(Shape::flat(4), &[LayerSpec::Dense { units: 3 }, LayerSpec::SoftmaxLoss], 0).unwrap();
        let err = a.load_parameters(b.parameters().clone()).unwrap_err();
        assert!(matches!(err, SequencerError::Configuration { .. }));
    }
}
