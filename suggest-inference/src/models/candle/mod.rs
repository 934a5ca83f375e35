use std::{collections::HashSet, path::PathBuf, str::FromStr};

use candle::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device,
};
use tracing::info;

use crate::bail;

use super::ModelError;

pub mod llama;

pub fn device(device_id: usize) -> Result<Device, candle::Error> {
    if cuda_is_available() {
        info!("Using CUDA");
        Device::new_cuda(device_id)
    } else if metal_is_available() {
        info!("Using Metal");
        Device::new_metal(device_id)
    } else {
        info!("Using Cpu");
        Ok(Device::Cpu)
    }
}

/// Parses a dtype description (`f32`, `bf16`, ...). Half precision
/// types fall back to `f32` on cpu, where they are not supported.
pub fn dtype(dtype: &str, device: &Device) -> Result<DType, ModelError> {
    let dtype = DType::from_str(dtype)
        .map_err(|e| ModelError::InvalidConfig(format!("invalid dtype `{dtype}`: {e}")))?;
    if device.is_cpu() && matches!(dtype, DType::BF16 | DType::F16) {
        info!("Half precision is not supported on cpu, falling back to f32");
        return Ok(DType::F32);
    }
    Ok(dtype)
}

pub fn hub_load_safetensors(
    repo: &hf_hub::api::sync::ApiRepo,
    json_file: &str,
) -> Result<Vec<PathBuf>, ModelError> {
    let json_file = repo.get(json_file)?;
    let json_file = std::fs::File::open(json_file)?;
    let json: serde_json::Value = serde_json::from_reader(&json_file)?;
    let weight_map = match json.get("weight_map") {
        None => bail!("no weight map in {json_file:?}"),
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => bail!("weight map in {json_file:?} is not a map"),
    };
    let safetensors_files = weight_map
        .values()
        .filter_map(|value| value.as_str())
        .collect::<HashSet<_>>();
    let safetensors_files = safetensors_files
        .into_iter()
        .map(|file| repo.get(file))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(safetensors_files)
}
