use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, SequencerError};
use crate::model::params::ParameterSet;

/// Writes every slot of `params` as one flat f32 tensor named after the slot key.
pub fn save_parameters(params: &ParameterSet, path: &Path) -> Result<()> {
    let mut tensors = HashMap::with_capacity(params.slots().len());
    for (idx, slot) in params.slots().iter().enumerate() {
        let values = params.slot_params(idx);
        let tensor = Tensor::from_slice(values, values.len(), &Device::Cpu)
            .map_err(|e| SequencerError::tensor("build parameter tensor", e))?;
        tensors.insert(slot.key(), tensor);
    }
    candle_core::safetensors::save(&tensors, path)
        .map_err(|e| SequencerError::tensor("write safetensors", e))?;
    tracing::info!(
        path = %path.display(),
        slots = params.slots().len(),
        parameters = params.len(),
        "parameters saved"
    );
    Ok(())
}

/// Reads a parameter dump into a copy of `topology`.
///
/// The file must contain exactly the slot keys of `topology`, each with the slot's length.
pub fn load_parameters(path: &Path, topology: &ParameterSet) -> Result<ParameterSet> {
    let data = std::fs::read(path).map_err(|e| SequencerError::io("read safetensors", e))?;
    let tensors = candle_core::safetensors::load_buffer(&data, &Device::Cpu)
        .map_err(|e| SequencerError::tensor("parse safetensors", e))?;

    if tensors.len() != topology.slots().len() {
        return Err(SequencerError::configuration(
            "load parameters",
            format!(
                "file holds {} tensors, network has {} trainable layers",
                tensors.len(),
                topology.slots().len()
            ),
        ));
    }

    let mut loaded = topology.clone();
    for idx in 0..topology.slots().len() {
        let slot = &topology.slots()[idx];
        let key = slot.key();
        let tensor = tensors.get(&key).ok_or_else(|| {
            SequencerError::configuration(
                "load parameters",
                format!("tensor `{key}` missing from parameter file"),
            )
        })?;
        let values = tensor
            .flatten_all()
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| SequencerError::tensor("read parameter tensor", e))?;
        if values.len() != slot.len {
            return Err(SequencerError::configuration(
                "load parameters",
                format!(
                    "tensor `{key}` has {} values, layer expects {}",
                    values.len(),
                    slot.len
                ),
            ));
        }
        loaded.slot_params_mut(idx).copy_from_slice(&values);
    }
    loaded.zero_grads();
    Ok(loaded)
}
