use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SequencerError};
use crate::labels::Target;
use crate::model::params::{ParameterSet, ParameterStore};

/// Per-sample tensor shape, stored channel-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    pub fn flat(size: usize) -> Self {
        Self::new(size, 1, 1)
    }

    pub fn size(&self) -> usize {
        self.channels * self.height * self.width
    }
}

fn default_norm_eps() -> f32 {
    1e-5
}

/// Declarative layer description; shapes are inferred when the network is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv {
        channels: usize,
        kernel_height: usize,
        kernel_width: usize,
        #[serde(default)]
        pad_height: usize,
        #[serde(default)]
        pad_width: usize,
    },
    MaxPool {
        size: usize,
    },
    Dense {
        units: usize,
    },
    LayerNorm {
        #[serde(default = "default_norm_eps")]
        eps: f32,
    },
    Relu,
    SoftmaxLoss,
}

#[derive(Debug, Clone)]
pub(crate) enum Layer {
    Conv(Conv2d),
    MaxPool(MaxPool2d),
    Dense(Dense),
    LayerNorm(LayerNorm),
    Relu(Relu),
    SoftmaxLoss(SoftmaxLoss),
}

impl Layer {
    pub(crate) fn build(
        index: usize,
        spec: &LayerSpec,
        input: Shape,
        params: &mut ParameterSet,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if input.size() == 0 {
            return Err(SequencerError::shape(index, "layer input", 1, 0));
        }
        let layer = match *spec {
            LayerSpec::Conv {
                channels,
                kernel_height,
                kernel_width,
                pad_height,
                pad_width,
            } => Layer::Conv(Conv2d::build(
                index,
                input,
                channels,
                (kernel_height, kernel_width),
                (pad_height, pad_width),
                params,
                rng,
            )?),
            LayerSpec::MaxPool { size } => Layer::MaxPool(MaxPool2d::build(index, input, size)?),
            LayerSpec::Dense { units } => Layer::Dense(Dense::build(index, input, units, params, rng)?),
            LayerSpec::LayerNorm { eps } => Layer::LayerNorm(LayerNorm::build(index, input, eps, params)),
            LayerSpec::Relu => Layer::Relu(Relu {
                index,
                shape: input,
                mask: Vec::new(),
            }),
            LayerSpec::SoftmaxLoss => Layer::SoftmaxLoss(SoftmaxLoss {
                index,
                classes: input.size(),
                probs: Vec::new(),
                batch: 0,
            }),
        };
        Ok(layer)
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Layer::Conv(_) => "conv",
            Layer::MaxPool(_) => "max_pool",
            Layer::Dense(_) => "dense",
            Layer::LayerNorm(_) => "layer_norm",
            Layer::Relu(_) => "relu",
            Layer::SoftmaxLoss(_) => "softmax_loss",
        }
    }

    pub(crate) fn output_shape(&self) -> Shape {
        match self {
            Layer::Conv(l) => l.output,
            Layer::MaxPool(l) => l.output,
            Layer::Dense(l) => Shape::flat(l.units),
            Layer::LayerNorm(l) => l.shape,
            Layer::Relu(l) => l.shape,
            Layer::SoftmaxLoss(l) => Shape::flat(l.classes),
        }
    }

    /// Runs the layer on `batch` samples and caches what `backward` needs.
    pub(crate) fn forward(
        &mut self,
        params: &ParameterSet,
        input: &[f32],
        batch: usize,
    ) -> Result<Vec<f32>> {
        match self {
            Layer::Conv(l) => l.forward(params, input, batch),
            Layer::MaxPool(l) => l.forward(input, batch),
            Layer::Dense(l) => l.forward(params, input, batch),
            Layer::LayerNorm(l) => l.forward(params, input, batch),
            Layer::Relu(l) => l.forward(input, batch),
            Layer::SoftmaxLoss(l) => l.forward(input, batch),
        }
    }

    /// Returns the input gradient and overwrites this layer's parameter gradient.
    pub(crate) fn backward(&mut self, params: &mut ParameterSet, grad_out: &[f32]) -> Vec<f32> {
        match self {
            Layer::Conv(l) => l.backward(params, grad_out),
            Layer::MaxPool(l) => l.backward(grad_out),
            Layer::Dense(l) => l.backward(params, grad_out),
            Layer::LayerNorm(l) => l.backward(params, grad_out),
            Layer::Relu(l) => l.backward(grad_out),
            // The loss gradient is already taken with respect to the logits.
            Layer::SoftmaxLoss(_) => grad_out.to_vec(),
        }
    }
}

fn check_input(index: usize, kind: &'static str, input: &[f32], batch: usize, size: usize) -> Result<()> {
    let expected = batch * size;
    if input.len() != expected {
        return Err(SequencerError::shape(index, kind, expected, input.len()));
    }
    Ok(())
}

fn glorot_fill(buf: &mut [f32], fan_in: usize, fan_out: usize, rng: &mut impl Rng) {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    for w in buf.iter_mut() {
        *w = rng.gen_range(-limit..limit);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Conv2d {
    index: usize,
    input: Shape,
    output: Shape,
    kernel: (usize, usize),
    pad: (usize, usize),
    slot: usize,
    cached_input: Vec<f32>,
    batch: usize,
}

impl Conv2d {
    fn build(
        index: usize,
        input: Shape,
        channels: usize,
        kernel: (usize, usize),
        pad: (usize, usize),
        params: &mut ParameterSet,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let (kh, kw) = kernel;
        if channels == 0 || kh == 0 || kw == 0 {
            return Err(SequencerError::configuration(
                "conv layer",
                format!("layer {index}: channels and kernel sizes must be positive"),
            ));
        }
        let padded_h = input.height + 2 * pad.0;
        let padded_w = input.width + 2 * pad.1;
        if kh > padded_h {
            return Err(SequencerError::shape(index, "conv kernel height", padded_h, kh));
        }
        if kw > padded_w {
            return Err(SequencerError::shape(index, "conv kernel width", padded_w, kw));
        }
        let output = Shape::new(channels, padded_h - kh + 1, padded_w - kw + 1);
        let weight_len = channels * input.channels * kh * kw;
        let slot = params.allocate(index, "conv", weight_len + channels);
        glorot_fill(
            &mut params.slot_params_mut(slot)[..weight_len],
            input.channels * kh * kw,
            channels * kh * kw,
            rng,
        );
        Ok(Self {
            index,
            input,
            output,
            kernel,
            pad,
            slot,
            cached_input: Vec::new(),
            batch: 0,
        })
    }

    fn weight_len(&self) -> usize {
        self.output.channels * self.input.channels * self.kernel.0 * self.kernel.1
    }

    /// Input coordinate for output row `o` and kernel row `k`, or None inside padding.
    fn source(o: usize, k: usize, pad: usize, extent: usize) -> Option<usize> {
        let padded = o + k;
        if padded < pad || padded - pad >= extent {
            None
        } else {
            Some(padded - pad)
        }
    }

    fn forward(&mut self, params: &ParameterSet, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        check_input(self.index, "conv input", input, batch, self.input.size())?;
        let (w, b) = params.slot_params(self.slot).split_at(self.weight_len());
        let (ic_n, ih, iw) = (self.input.channels, self.input.height, self.input.width);
        let (oc_n, oh, ow) = (self.output.channels, self.output.height, self.output.width);
        let (kh, kw) = self.kernel;
        let in_size = self.input.size();
        let out_size = self.output.size();

        let mut out = vec![0.0f32; batch * out_size];
        for n in 0..batch {
            let x = &input[n * in_size..(n + 1) * in_size];
            let y = &mut out[n * out_size..(n + 1) * out_size];
            for oc in 0..oc_n {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = b[oc];
                        for ic in 0..ic_n {
                            for ky in 0..kh {
                                let Some(iy) = Self::source(oy, ky, self.pad.0, ih) else {
                                    continue;
                                };
                                for kx in 0..kw {
                                    let Some(ix) = Self::source(ox, kx, self.pad.1, iw) else {
                                        continue;
                                    };
                                    acc += w[((oc * ic_n + ic) * kh + ky) * kw + kx]
                                        * x[(ic * ih + iy) * iw + ix];
                                }
                            }
                        }
                        y[(oc * oh + oy) * ow + ox] = acc;
                    }
                }
            }
        }
        self.cached_input = input.to_vec();
        self.batch = batch;
        Ok(out)
    }

    fn backward(&mut self, params: &mut ParameterSet, grad_out: &[f32]) -> Vec<f32> {
        let weight_len = self.weight_len();
        let ParameterStore { params: stored, grads } = params.store(self.slot);
        let w = &stored[..weight_len];
        let (gw, gb) = grads.split_at_mut(weight_len);
        gw.fill(0.0);
        gb.fill(0.0);

        let (ic_n, ih, iw) = (self.input.channels, self.input.height, self.input.width);
        let (oc_n, oh, ow) = (self.output.channels, self.output.height, self.output.width);
        let (kh, kw) = self.kernel;
        let in_size = self.input.size();
        let out_size = self.output.size();

        let mut grad_in = vec![0.0f32; self.batch * in_size];
        for n in 0..self.batch {
            let x = &self.cached_input[n * in_size..(n + 1) * in_size];
            let gx = &mut grad_in[n * in_size..(n + 1) * in_size];
            let gy = &grad_out[n * out_size..(n + 1) * out_size];
            for oc in 0..oc_n {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let g = gy[(oc * oh + oy) * ow + ox];
                        gb[oc] += g;
                        for ic in 0..ic_n {
                            for ky in 0..kh {
                                let Some(iy) = Self::source(oy, ky, self.pad.0, ih) else {
                                    continue;
                                };
                                for kx in 0..kw {
                                    let Some(ix) = Self::source(ox, kx, self.pad.1, iw) else {
                                        continue;
                                    };
                                    let wi = ((oc * ic_n + ic) * kh + ky) * kw + kx;
                                    let xi = (ic * ih + iy) * iw + ix;
                                    gw[wi] += g * x[xi];
                                    gx[xi] += g * w[wi];
                                }
                            }
                        }
                    }
                }
            }
        }
        grad_in
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MaxPool2d {
    index: usize,
    input: Shape,
    output: Shape,
    size: usize,
    argmax: Vec<usize>,
    batch: usize,
}

impl MaxPool2d {
    fn build(index: usize, input: Shape, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SequencerError::configuration(
                "max pool layer",
                format!("layer {index}: pool size must be positive"),
            ));
        }
        if size > input.height || size > input.width {
            return Err(SequencerError::shape(
                index,
                "max pool window",
                input.height.min(input.width),
                size,
            ));
        }
        Ok(Self {
            index,
            input,
            output: Shape::new(input.channels, input.height / size, input.width / size),
            size,
            argmax: Vec::new(),
            batch: 0,
        })
    }

    fn forward(&mut self, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        check_input(self.index, "max pool input", input, batch, self.input.size())?;
        let (c_n, ih, iw) = (self.input.channels, self.input.height, self.input.width);
        let (oh, ow) = (self.output.height, self.output.width);
        let in_size = self.input.size();
        let out_size = self.output.size();

        let mut out = vec![0.0f32; batch * out_size];
        let mut argmax = vec![0usize; batch * out_size];
        for n in 0..batch {
            for c in 0..c_n {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = n * in_size + (c * ih + oy * self.size) * iw + ox * self.size;
                        for dy in 0..self.size {
                            for dx in 0..self.size {
                                let idx = n * in_size
                                    + (c * ih + oy * self.size + dy) * iw
                                    + ox * self.size
                                    + dx;
                                if input[idx] > best {
                                    best = input[idx];
                                    best_idx = idx;
                                }
                            }
                        }
                        let o = n * out_size + (c * oh + oy) * ow + ox;
                        out[o] = best;
                        argmax[o] = best_idx;
                    }
                }
            }
        }
        self.argmax = argmax;
        self.batch = batch;
        Ok(out)
    }

    fn backward(&mut self, grad_out: &[f32]) -> Vec<f32> {
        let mut grad_in = vec![0.0f32; self.batch * self.input.size()];
        for (o, &src) in self.argmax.iter().enumerate() {
            grad_in[src] += grad_out[o];
        }
        grad_in
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Dense {
    index: usize,
    inputs: usize,
    units: usize,
    slot: usize,
    cached_input: Vec<f32>,
    batch: usize,
}

impl Dense {
    fn build(
        index: usize,
        input: Shape,
        units: usize,
        params: &mut ParameterSet,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if units == 0 {
            return Err(SequencerError::configuration(
                "dense layer",
                format!("layer {index}: unit count must be positive"),
            ));
        }
        let inputs = input.size();
        let slot = params.allocate(index, "dense", units * inputs + units);
        glorot_fill(
            &mut params.slot_params_mut(slot)[..units * inputs],
            inputs,
            units,
            rng,
        );
        Ok(Self {
            index,
            inputs,
            units,
            slot,
            cached_input: Vec::new(),
            batch: 0,
        })
    }

    fn forward(&mut self, params: &ParameterSet, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        check_input(self.index, "dense input", input, batch, self.inputs)?;
        let (w, b) = params.slot_params(self.slot).split_at(self.units * self.inputs);
        let mut out = vec![0.0f32; batch * self.units];
        for n in 0..batch {
            let x = &input[n * self.inputs..(n + 1) * self.inputs];
            for o in 0..self.units {
                let row = &w[o * self.inputs..(o + 1) * self.inputs];
                let dot: f32 = row.iter().zip(x).map(|(wi, xi)| wi * xi).sum();
                out[n * self.units + o] = dot + b[o];
            }
        }
        self.cached_input = input.to_vec();
        self.batch = batch;
        Ok(out)
    }

    fn backward(&mut self, params: &mut ParameterSet, grad_out: &[f32]) -> Vec<f32> {
        let weight_len = self.units * self.inputs;
        let ParameterStore { params: stored, grads } = params.store(self.slot);
        let w = &stored[..weight_len];
        let (gw, gb) = grads.split_at_mut(weight_len);
        gw.fill(0.0);
        gb.fill(0.0);

        let mut grad_in = vec![0.0f32; self.batch * self.inputs];
        for n in 0..self.batch {
            let x = &self.cached_input[n * self.inputs..(n + 1) * self.inputs];
            let gx = &mut grad_in[n * self.inputs..(n + 1) * self.inputs];
            for o in 0..self.units {
                let g = grad_out[n * self.units + o];
                gb[o] += g;
                let row = o * self.inputs;
                for i in 0..self.inputs {
                    gw[row + i] += g * x[i];
                    gx[i] += g * w[row + i];
                }
            }
        }
        grad_in
    }
}

/// Per-sample normalization over all features with a learned affine transform.
#[derive(Debug, Clone)]
pub(crate) struct LayerNorm {
    index: usize,
    shape: Shape,
    eps: f32,
    slot: usize,
    normalized: Vec<f32>,
    inv_std: Vec<f32>,
    batch: usize,
}

impl LayerNorm {
    fn build(index: usize, shape: Shape, eps: f32, params: &mut ParameterSet) -> Self {
        let features = shape.size();
        let slot = params.allocate(index, "layer_norm", 2 * features);
        params.slot_params_mut(slot)[..features].fill(1.0);
        Self {
            index,
            shape,
            eps,
            slot,
            normalized: Vec::new(),
            inv_std: Vec::new(),
            batch: 0,
        }
    }

    fn forward(&mut self, params: &ParameterSet, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        let f = self.shape.size();
        check_input(self.index, "layer norm input", input, batch, f)?;
        let (gamma, beta) = params.slot_params(self.slot).split_at(f);
        let mut out = vec![0.0f32; batch * f];
        let mut normalized = vec![0.0f32; batch * f];
        let mut inv_std = vec![0.0f32; batch];
        for n in 0..batch {
            let x = &input[n * f..(n + 1) * f];
            let mean = x.iter().map(|&v| v as f64).sum::<f64>() / f as f64;
            let var = x
                .iter()
                .map(|&v| {
                    let d = v as f64 - mean;
                    d * d
                })
                .sum::<f64>()
                / f as f64;
            let s = 1.0 / (var + self.eps as f64).sqrt();
            inv_std[n] = s as f32;
            for i in 0..f {
                let xh = ((x[i] as f64 - mean) * s) as f32;
                normalized[n * f + i] = xh;
                out[n * f + i] = gamma[i] * xh + beta[i];
            }
        }
        self.normalized = normalized;
        self.inv_std = inv_std;
        self.batch = batch;
        Ok(out)
    }

    fn backward(&mut self, params: &mut ParameterSet, grad_out: &[f32]) -> Vec<f32> {
        let f = self.shape.size();
        let ParameterStore { params: stored, grads } = params.store(self.slot);
        let gamma = &stored[..f];
        let (g_gamma, g_beta) = grads.split_at_mut(f);
        g_gamma.fill(0.0);
        g_beta.fill(0.0);

        let mut grad_in = vec![0.0f32; self.batch * f];
        let mut dxhat = vec![0.0f64; f];
        for n in 0..self.batch {
            let xh = &self.normalized[n * f..(n + 1) * f];
            let gy = &grad_out[n * f..(n + 1) * f];
            let mut sum_d = 0.0f64;
            let mut sum_dx = 0.0f64;
            for i in 0..f {
                g_gamma[i] += gy[i] * xh[i];
                g_beta[i] += gy[i];
                dxhat[i] = (gy[i] * gamma[i]) as f64;
                sum_d += dxhat[i];
                sum_dx += dxhat[i] * xh[i] as f64;
            }
            let s = self.inv_std[n] as f64;
            for i in 0..f {
                let g = s * (dxhat[i] - sum_d / f as f64 - xh[i] as f64 * sum_dx / f as f64);
                grad_in[n * f + i] = g as f32;
            }
        }
        grad_in
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Relu {
    index: usize,
    shape: Shape,
    mask: Vec<bool>,
}

impl Relu {
    fn forward(&mut self, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        check_input(self.index, "relu input", input, batch, self.shape.size())?;
        self.mask = input.iter().map(|&v| v > 0.0).collect();
        Ok(input.iter().map(|&v| v.max(0.0)).collect())
    }

    fn backward(&mut self, grad_out: &[f32]) -> Vec<f32> {
        grad_out
            .iter()
            .zip(&self.mask)
            .map(|(&g, &on)| if on { g } else { 0.0 })
            .collect()
    }
}

/// Softmax output with cross-entropy loss against label-pair targets.
#[derive(Debug, Clone)]
pub(crate) struct SoftmaxLoss {
    index: usize,
    classes: usize,
    probs: Vec<f32>,
    batch: usize,
}

/// Loss of one minibatch, averaged over samples that carry a class target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchLoss {
    pub total: f64,
    pub labelled: usize,
}

impl BatchLoss {
    pub fn mean(&self) -> Option<f64> {
        (self.labelled > 0).then(|| self.total / self.labelled as f64)
    }
}

impl SoftmaxLoss {
    fn forward(&mut self, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        check_input(self.index, "softmax input", input, batch, self.classes)?;
        let mut probs = vec![0.0f32; input.len()];
        for (logits, p) in input
            .chunks_exact(self.classes)
            .zip(probs.chunks_exact_mut(self.classes))
        {
            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f64;
            for (o, &l) in p.iter_mut().zip(logits) {
                let e = ((l - max) as f64).exp();
                *o = e as f32;
                sum += e;
            }
            for o in p.iter_mut() {
                *o = (*o as f64 / sum) as f32;
            }
        }
        self.probs = probs.clone();
        self.batch = batch;
        Ok(probs)
    }

    /// Gradient of the mean cross-entropy with respect to the logits.
    pub(crate) fn loss_gradient(&self, targets: &[Target]) -> Result<(BatchLoss, Vec<f32>)> {
        if targets.len() != self.batch {
            return Err(SequencerError::shape(self.index, "loss targets", self.batch, targets.len()));
        }
        let labelled = targets.iter().filter(|t| matches!(t, Target::Class(_))).count();
        let mut grad = vec![0.0f32; self.probs.len()];
        let mut total = 0.0f64;
        if labelled == 0 {
            return Ok((BatchLoss { total, labelled }, grad));
        }
        let scale = 1.0 / labelled as f32;
        for (n, target) in targets.iter().enumerate() {
            let Target::Class(class) = *target else {
                continue;
            };
            if class >= self.classes {
                return Err(SequencerError::shape(self.index, "loss target class", self.classes, class));
            }
            let p = &self.probs[n * self.classes..(n + 1) * self.classes];
            let g = &mut grad[n * self.classes..(n + 1) * self.classes];
            for (k, (&pk, gk)) in p.iter().zip(g.iter_mut()).enumerate() {
                let onehot = if k == class { 1.0 } else { 0.0 };
                *gk = (pk - onehot) * scale;
            }
            total -= (p[class] as f64).max(1e-12).ln();
        }
        Ok((BatchLoss { total, labelled }, grad))
    }
}
