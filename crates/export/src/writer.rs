//! Sharded safetensors writer.
//!
//! One shard is written as `model.safetensors` with no index; several are
//! written as `model-00001-of-0000N.safetensors` plus
//! `model.safetensors.index.json`:
//!
//! ```json
//! { "metadata": { "total_size": 123 }, "weight_map": { "name": "model-00001-of-00002.safetensors" } }
//! ```

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use safetensors::tensor::TensorView;
use safetensors::Dtype;

use crate::checkpoint::{INDEX_FILE, SINGLE_FILE};

/// One tensor to write, either borrowed from a mapped input shard or owned.
#[derive(Debug, Clone)]
pub struct OutputTensor<'a> {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Cow<'a, [u8]>,
}

impl<'a> OutputTensor<'a> {
    pub fn owned(name: impl Into<String>, dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            data: Cow::Owned(data),
        }
    }

    /// Copy-free passthrough of a tensor as stored in the input checkpoint.
    pub fn borrowed(name: impl Into<String>, view: &TensorView<'a>) -> Self {
        Self {
            name: name.into(),
            dtype: view.dtype(),
            shape: view.shape().to_vec(),
            data: Cow::Borrowed(view.data()),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Greedy in-order shard bins over tensor sizes. A new shard starts when the
/// next tensor would push a non-empty shard past `max_bytes`; a tensor larger
/// than the limit gets a shard of its own.
pub fn plan_shards(sizes: &[u64], max_bytes: u64) -> Vec<Vec<usize>> {
    let mut shards: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_size = 0u64;
    for (i, &size) in sizes.iter().enumerate() {
        if !current.is_empty() && current_size + size > max_bytes {
            shards.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(i);
        current_size += size;
    }
    if !current.is_empty() {
        shards.push(current);
    }
    shards
}

pub fn shard_file_name(index: usize, count: usize) -> String {
    format!("model-{:05}-of-{:05}.safetensors", index + 1, count)
}

/// What [`write_sharded`] put on disk.
#[derive(Debug, Clone)]
pub struct WrittenShards {
    pub files: Vec<PathBuf>,
    pub total_size: u64,
}

/// Write `tensors` into `dir`, at most `max_shard_bytes` of tensor data per file.
pub fn write_sharded(
    dir: &Path,
    tensors: &[OutputTensor<'_>],
    max_shard_bytes: u64,
) -> Result<WrittenShards> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let sizes: Vec<u64> = tensors.iter().map(OutputTensor::size).collect();
    let total_size: u64 = sizes.iter().sum();
    let plan = plan_shards(&sizes, max_shard_bytes);
    let metadata: Option<HashMap<String, String>> =
        Some(HashMap::from([("format".to_string(), "pt".to_string())]));

    let mut files = Vec::with_capacity(plan.len());
    let mut weight_map = BTreeMap::new();
    for (shard_idx, members) in plan.iter().enumerate() {
        let file_name = if plan.len() == 1 {
            SINGLE_FILE.to_string()
        } else {
            shard_file_name(shard_idx, plan.len())
        };
        let path = dir.join(&file_name);

        let views = members
            .iter()
            .map(|&i| {
                let t = &tensors[i];
                let view = TensorView::new(t.dtype, t.shape.clone(), &t.data)
                    .with_context(|| format!("tensor {} has inconsistent shape", t.name))?;
                weight_map.insert(t.name.clone(), file_name.clone());
                Ok((t.name.clone(), view))
            })
            .collect::<Result<Vec<_>>>()?;
        safetensors::serialize_to_file(views, &metadata, &path)
            .with_context(|| format!("write {}", path.display()))?;

        tracing::info!(
            file = %file_name,
            tensors = members.len(),
            bytes = members.iter().map(|&i| sizes[i]).sum::<u64>(),
            "Wrote shard"
        );
        files.push(path);
    }

    if plan.len() > 1 {
        let index = serde_json::json!({
            "metadata": { "total_size": total_size },
            "weight_map": weight_map,
        });
        let path = dir.join(INDEX_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&index)?)
            .with_context(|| format!("write {}", path.display()))?;
    }

    Ok(WrittenShards { files, total_size })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(name: &str, len: usize) -> OutputTensor<'static> {
        OutputTensor::owned(name, Dtype::U8, vec![len], vec![7u8; len])
    }

    #[test]
    fn plan_respects_limit_and_order() {
        assert_eq!(plan_shards(&[4, 4, 4], 8), vec![vec![0, 1], vec![2]]);
        assert_eq!(plan_shards(&[3, 10, 3], 8), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(plan_shards(&[1, 1, 1], 100), vec![vec![0, 1, 2]]);
        assert!(plan_shards(&[], 8).is_empty());
    }

    #[test]
    fn single_shard_has_no_index() {
        let dir = tempfile::tempdir().unwrap();
        let out = write_sharded(dir.path(), &[tensor("a", 3), tensor("b", 5)], 1000).unwrap();
        assert_eq!(out.files, vec![dir.path().join(SINGLE_FILE)]);
        assert_eq!(out.total_size, 8);
        assert!(!dir.path().join(INDEX_FILE).exists());

        let bytes = std::fs::read(&out.files[0]).unwrap();
        let st = safetensors::SafeTensors::deserialize(&bytes).unwrap();
        assert_eq!(st.tensor("b").unwrap().data(), &[7u8; 5]);
        let (_, meta) = safetensors::SafeTensors::read_metadata(&bytes).unwrap();
        let meta = meta.metadata().as_ref().unwrap();
        assert_eq!(meta.get("format").map(String::as_str), Some("pt"));
    }

    #[test]
    fn several_shards_get_index() {
        let dir = tempfile::tempdir().unwrap();
        let tensors = vec![tensor("z", 6), tensor("a", 6), tensor("m", 6)];
        let out = write_sharded(dir.path(), &tensors, 10).unwrap();
        assert_eq!(out.files.len(), 3);
        assert_eq!(out.files[1], dir.path().join("model-00002-of-00003.safetensors"));

        let index: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap())
                .unwrap();
        assert_eq!(index["metadata"]["total_size"], 18);
        assert_eq!(index["weight_map"]["a"], "model-00002-of-00003.safetensors");
        let keys: Vec<&String> = index["weight_map"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["a", "m", "z"]);
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bad = OutputTensor::owned("bad", Dtype::F32, vec![3], vec![0u8; 4]);
        assert!(write_sharded(dir.path(), &[bad], 100).is_err());
    }
}
