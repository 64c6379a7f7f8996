//! `compressed-tensors` "pack-quantized" layout.
//!
//! A quantised `<prefix>.weight` of shape `[M, K]` is replaced by:
//!
//! | Tensor | dtype | shape |
//! |--------|-------|-------|
//! | `<prefix>.weight_packed` | I32 | `[M, ceil(K / pack_factor)]` |
//! | `<prefix>.weight_scale` | model float dtype | `[M, ceil(K / group_size)]` |
//! | `<prefix>.weight_shape` | I64 | `[2]` = `[M, K]` |
//!
//! and `config.json` gains a `quantization_config` block describing the
//! scheme so loaders can rebuild the modules.

use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::DType;
use half::{bf16, f16};
use safetensors::Dtype;
use serde_json::{json, Value};

use squeeze_common::QuantRecipe;
use squeeze_core::{QuantArgs, QuantizedLinear};

use crate::checkpoint::CONFIG_FILE;
use crate::writer::OutputTensor;

pub const QUANT_METHOD: &str = "compressed-tensors";
pub const FORMAT: &str = "pack-quantized";

/// `<prefix>.weight` → `<prefix>`; `None` for names that are not weights.
pub fn module_name(weight_name: &str) -> Option<&str> {
    weight_name.strip_suffix(".weight")
}

pub fn packed_name(module: &str) -> String {
    format!("{module}.weight_packed")
}

pub fn scale_name(module: &str) -> String {
    format!("{module}.weight_scale")
}

pub fn shape_name(module: &str) -> String {
    format!("{module}.weight_shape")
}

/// Storage dtype of group scales: the model's half-precision dtype.
pub fn scale_dtype(model_dtype: DType) -> Dtype {
    match model_dtype {
        DType::BF16 => Dtype::BF16,
        DType::F32 => Dtype::F32,
        _ => Dtype::F16,
    }
}

fn encode_scales(scales: &[f32], dtype: Dtype) -> Result<Vec<u8>> {
    let bytes = match dtype {
        Dtype::F16 => scales
            .iter()
            .flat_map(|&s| f16::from_f32(s).to_le_bytes())
            .collect(),
        Dtype::BF16 => scales
            .iter()
            .flat_map(|&s| bf16::from_f32(s).to_le_bytes())
            .collect(),
        Dtype::F32 => scales.iter().flat_map(|s| s.to_le_bytes()).collect(),
        other => bail!("unsupported scale dtype {other:?}"),
    };
    Ok(bytes)
}

/// The three tensors replacing `<module>.weight`.
pub fn encode_linear(
    module: &str,
    linear: &QuantizedLinear,
    scale_dtype: Dtype,
) -> Result<[OutputTensor<'static>; 3]> {
    let packed = linear
        .packed()
        .with_context(|| format!("pack {module}"))?;
    let packed_bytes: Vec<u8> = packed.iter().flat_map(|w| w.to_le_bytes()).collect();
    let shape_bytes: Vec<u8> = [linear.rows as i64, linear.cols as i64]
        .iter()
        .flat_map(|d| d.to_le_bytes())
        .collect();

    Ok([
        OutputTensor::owned(
            packed_name(module),
            Dtype::I32,
            vec![linear.rows, linear.packed_cols()],
            packed_bytes,
        ),
        OutputTensor::owned(
            scale_name(module),
            scale_dtype,
            vec![linear.rows, linear.num_groups()],
            encode_scales(&linear.scales, scale_dtype)?,
        ),
        OutputTensor::owned(shape_name(module), Dtype::I64, vec![2], shape_bytes),
    ])
}

/// The `quantization_config` block for a weight-only group scheme.
pub fn quantization_config(args: &QuantArgs, recipe: &QuantRecipe, compression_ratio: f64) -> Value {
    json!({
        "quant_method": QUANT_METHOD,
        "format": FORMAT,
        "quantization_status": "compressed",
        "global_compression_ratio": compression_ratio,
        "config_groups": {
            "group_0": {
                "targets": recipe.targets,
                "weights": {
                    "num_bits": args.num_bits,
                    "type": "int",
                    "symmetric": args.symmetric,
                    "strategy": "group",
                    "group_size": args.group_size,
                    "block_structure": null,
                    "dynamic": false,
                    "actorder": null,
                    "observer": "minmax",
                    "observer_kwargs": {},
                },
                "input_activations": null,
                "output_activations": null,
            }
        },
        "ignore": recipe.ignore,
        "kv_cache_scheme": null,
        "sparsity_config": {},
    })
}

/// Copy `config.json` from `src_dir` to `dst_dir` with `quantization_config`
/// set. Every other key is kept as is.
pub fn write_config(src_dir: &Path, dst_dir: &Path, quantization: Value) -> Result<()> {
    let src = src_dir.join(CONFIG_FILE);
    let raw = std::fs::read_to_string(&src).with_context(|| format!("read {}", src.display()))?;
    let mut config: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", src.display()))?;
    let Some(obj) = config.as_object_mut() else {
        bail!("{} is not a JSON object", src.display());
    };
    obj.insert("quantization_config".to_string(), quantization);

    let dst = dst_dir.join(CONFIG_FILE);
    std::fs::write(&dst, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("write {}", dst.display()))?;
    Ok(())
}
