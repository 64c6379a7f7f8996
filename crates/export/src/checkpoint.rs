//! Read-only view of a Hugging Face safetensors checkpoint directory.
//!
//! Either a sharded checkpoint described by `model.safetensors.index.json`
//! or a single `model.safetensors`. Shards are memory-mapped; tensors are
//! materialised only when a layer asks for them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use serde::Deserialize;

use squeeze_common::DecoderConfig;

pub const SINGLE_FILE: &str = "model.safetensors";
pub const INDEX_FILE: &str = "model.safetensors.index.json";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: BTreeMap<String, String>,
}

pub struct Checkpoint {
    dir: PathBuf,
    tensors: MmapedSafetensors,
    index: Option<serde_json::Value>,
}

impl Checkpoint {
    pub fn open(dir: &Path) -> Result<Self> {
        let index_path = dir.join(INDEX_FILE);
        let (shards, index) = if index_path.is_file() {
            let raw = std::fs::read_to_string(&index_path)
                .with_context(|| format!("read {}", index_path.display()))?;
            let parsed: ShardIndex = serde_json::from_str(&raw)
                .with_context(|| format!("parse {}", index_path.display()))?;
            let files: BTreeSet<&String> = parsed.weight_map.values().collect();
            let shards: Vec<PathBuf> = files.into_iter().map(|f| dir.join(f)).collect();
            (shards, Some(serde_json::from_str(&raw)?))
        } else if dir.join(SINGLE_FILE).is_file() {
            (vec![dir.join(SINGLE_FILE)], None)
        } else {
            bail!(
                "{} has neither {INDEX_FILE} nor {SINGLE_FILE}",
                dir.display()
            );
        };
        for shard in &shards {
            if !shard.is_file() {
                bail!("missing checkpoint shard {}", shard.display());
            }
        }

        // SAFETY: shards are opened read-only and not modified while mapped.
        let tensors = unsafe { MmapedSafetensors::multi(&shards) }
            .with_context(|| format!("map safetensors in {}", dir.display()))?;
        tracing::info!(dir = %dir.display(), shards = shards.len(), "Opened checkpoint");

        Ok(Self {
            dir: dir.to_path_buf(),
            tensors,
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parsed shard index, when the checkpoint is sharded.
    pub fn index_json(&self) -> Option<&serde_json::Value> {
        self.index.as_ref()
    }

    pub fn config(&self) -> Result<DecoderConfig> {
        DecoderConfig::load(&self.dir.join(CONFIG_FILE))
    }

    /// All tensor names, sorted.
    pub fn tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tensors
            .tensors()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    /// Stored dtype, shape and bytes of `name`, untouched.
    pub fn raw(&self, name: &str) -> Result<TensorView<'_>> {
        self.tensors
            .get(name)
            .with_context(|| format!("tensor {name} not in checkpoint"))
    }

    pub fn load(&self, name: &str, device: &Device, dtype: DType) -> Result<Tensor> {
        let tensor = self
            .tensors
            .load(name, device)
            .with_context(|| format!("load tensor {name}"))?;
        Ok(tensor.to_dtype(dtype)?)
    }

    /// Every tensor whose name starts with `prefix.`, keyed by full name.
    pub fn load_prefix(
        &self,
        prefix: &str,
        device: &Device,
        dtype: DType,
    ) -> Result<HashMap<String, Tensor>> {
        let dotted = format!("{prefix}.");
        self.tensor_names()
            .into_iter()
            .filter(|n| n.starts_with(&dotted))
            .map(|n| {
                let t = self.load(&n, device, dtype)?;
                Ok((n, t))
            })
            .collect()
    }

    /// Stored bytes of every tensor under `prefix.`.
    pub fn prefix_bytes(&self, prefix: &str) -> u64 {
        let dotted = format!("{prefix}.");
        self.tensors
            .tensors()
            .iter()
            .filter(|(n, _)| n.starts_with(&dotted))
            .map(|(_, v)| v.data().len() as u64)
            .sum()
    }

    /// Stored bytes of every tensor.
    pub fn total_bytes(&self) -> u64 {
        self.tensors
            .tensors()
            .iter()
            .map(|(_, v)| v.data().len() as u64)
            .sum()
    }

    /// Compute dtype of the checkpoint: `torch_dtype` from the config, or
    /// the dtype of the first floating-point tensor.
    pub fn model_dtype(&self, config: &DecoderConfig) -> DType {
        if let Some(dtype) = config.torch_dtype.as_deref().and_then(parse_torch_dtype) {
            return dtype;
        }
        self.tensor_names()
            .iter()
            .filter_map(|n| self.tensors.get(n).ok())
            .find_map(|v| match v.dtype() {
                safetensors::Dtype::BF16 => Some(DType::BF16),
                safetensors::Dtype::F16 => Some(DType::F16),
                safetensors::Dtype::F32 => Some(DType::F32),
                _ => None,
            })
            .unwrap_or(DType::F32)
    }
}

/// `"bfloat16"` / `"float16"` / `"float32"` (with or without `torch.`).
pub fn parse_torch_dtype(s: &str) -> Option<DType> {
    match s.trim_start_matches("torch.") {
        "bfloat16" => Some(DType::BF16),
        "float16" | "half" => Some(DType::F16),
        "float32" | "float" => Some(DType::F32),
        _ => None,
    }
}
