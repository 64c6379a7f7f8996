//! Run configuration for a one-shot compression.
//!
//! Serialised as JSON. Every field has a default so a minimal `{}` file
//! reproduces the stock run: `model/` under `/workspace/shared-workspace`,
//! 16 calibration samples per device, 64 tokens each, GPTQ W4A16 with group
//! size 16 and `lm_head` left in full precision.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Journal file written next to the model directories during a swap.
pub const SWAP_JOURNAL_NAME: &str = ".squeeze-swap.json";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub devices: DeviceConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub recipe: QuantRecipe,
    #[serde(default)]
    pub save: SaveConfig,
}

// ── Paths ───────────────────────────────────────────────────────────────────

/// The directory triple: active model, scratch output, backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    #[serde(default = "default_compressed_dir")]
    pub compressed_dir: String,
    #[serde(default = "default_original_dir")]
    pub original_dir: String,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/workspace/shared-workspace")
}
fn default_model_dir() -> String {
    "model".into()
}
fn default_compressed_dir() -> String {
    "compressed_model".into()
}
fn default_original_dir() -> String {
    "model_original".into()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            model_dir: default_model_dir(),
            compressed_dir: default_compressed_dir(),
            original_dir: default_original_dir(),
        }
    }
}

impl PathsConfig {
    /// Paths rooted at `base_dir` with the default directory names.
    pub fn with_base(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.base_dir.join(&self.model_dir)
    }

    pub fn compressed_path(&self) -> PathBuf {
        self.base_dir.join(&self.compressed_dir)
    }

    pub fn original_path(&self) -> PathBuf {
        self.base_dir.join(&self.original_dir)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.base_dir.join(SWAP_JOURNAL_NAME)
    }
}

// ── Devices ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Memory ceiling per accelerator for placed decoder layers, in GiB.
    #[serde(default = "default_memory_per_device_gib")]
    pub memory_per_device_gib: u64,
    /// Ignore accelerators and run everything on the host.
    #[serde(default)]
    pub cpu_only: bool,
}

fn default_memory_per_device_gib() -> u64 {
    16
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_per_device_gib: default_memory_per_device_gib(),
            cpu_only: false,
        }
    }
}

impl DeviceConfig {
    pub fn memory_ceiling_bytes(&self) -> u64 {
        self.memory_per_device_gib * 1024 * 1024 * 1024
    }
}

// ── Calibration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_dataset_id")]
    pub dataset_id: String,
    #[serde(default = "default_split")]
    pub split: String,
    /// Samples per available device (one device minimum).
    #[serde(default = "default_samples_per_device")]
    pub samples_per_device: usize,
    /// Token budget per sample; longer samples are truncated.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Local JSONL file used instead of the Hub dataset.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

fn default_dataset_id() -> String {
    "HuggingFaceH4/ultrachat_200k".into()
}
fn default_split() -> String {
    "train_sft".into()
}
fn default_samples_per_device() -> usize {
    16
}
fn default_max_seq_len() -> usize {
    64
}
fn default_seed() -> u64 {
    42
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            dataset_id: default_dataset_id(),
            split: default_split(),
            samples_per_device: default_samples_per_device(),
            max_seq_len: default_max_seq_len(),
            seed: default_seed(),
            local_path: None,
        }
    }
}

impl CalibrationConfig {
    /// Number of calibration samples for `num_devices` accelerators.
    pub fn num_samples(&self, num_devices: usize) -> usize {
        self.samples_per_device * num_devices.max(1)
    }
}

// ── Recipe ──────────────────────────────────────────────────────────────────

/// GPTQ recipe: which layers, which scheme, which granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantRecipe {
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
    #[serde(default = "default_group_size")]
    pub group_size: usize,
    #[serde(default)]
    pub act_order: bool,
    /// Fraction of the mean Hessian diagonal added for numerical stability.
    #[serde(default = "default_dampening_frac")]
    pub dampening_frac: f64,
    /// Columns per lazy-batch update block.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

fn default_targets() -> Vec<String> {
    vec!["Linear".into()]
}
fn default_scheme() -> String {
    "W4A16".into()
}
fn default_ignore() -> Vec<String> {
    vec!["lm_head".into()]
}
fn default_group_size() -> usize {
    16
}
fn default_dampening_frac() -> f64 {
    0.01
}
fn default_block_size() -> usize {
    128
}

impl Default for QuantRecipe {
    fn default() -> Self {
        Self {
            targets: default_targets(),
            scheme: default_scheme(),
            ignore: default_ignore(),
            group_size: default_group_size(),
            act_order: false,
            dampening_frac: default_dampening_frac(),
            block_size: default_block_size(),
        }
    }
}

impl QuantRecipe {
    pub fn quant_scheme(&self) -> anyhow::Result<QuantScheme> {
        QuantScheme::parse(&self.scheme)
    }
}

/// Weight-only integer scheme parsed from names like `W4A16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantScheme {
    pub weight_bits: u32,
    pub activation_bits: u32,
}

impl QuantScheme {
    pub fn parse(name: &str) -> anyhow::Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let Some(rest) = upper.strip_prefix('W') else {
            bail!("unknown quantization scheme {name:?}");
        };
        let Some((w, a)) = rest.split_once('A') else {
            bail!("unknown quantization scheme {name:?}");
        };
        let weight_bits: u32 = w
            .parse()
            .with_context(|| format!("weight bits in scheme {name:?}"))?;
        let activation_bits: u32 = a
            .parse()
            .with_context(|| format!("activation bits in scheme {name:?}"))?;
        if activation_bits != 16 {
            bail!("scheme {name:?}: only 16-bit activations are supported");
        }
        // Codes are packed into int32 words.
        if !matches!(weight_bits, 2 | 4 | 8) {
            bail!("scheme {name:?}: weight bits must be 2, 4 or 8");
        }
        Ok(Self {
            weight_bits,
            activation_bits,
        })
    }
}

// ── Save ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfig {
    #[serde(default = "default_max_shard_size")]
    pub max_shard_size: String,
}

fn default_max_shard_size() -> String {
    "2GB".into()
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            max_shard_size: default_max_shard_size(),
        }
    }
}

impl SaveConfig {
    pub fn max_shard_bytes(&self) -> anyhow::Result<u64> {
        parse_byte_size(&self.max_shard_size)
    }
}

/// Parse sizes like `2GB`, `500MB`, `1GiB`, `4096`.
///
/// `KB`/`MB`/`GB`/`TB` are decimal; `KiB`/`MiB`/`GiB`/`TiB` are binary.
pub fn parse_byte_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num
        .parse()
        .with_context(|| format!("invalid size {s:?}"))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        "KIB" => 1 << 10,
        "MIB" => 1 << 20,
        "GIB" => 1 << 30,
        "TIB" => 1 << 40,
        other => bail!("unknown size unit {other:?} in {s:?}"),
    };
    Ok((value * multiplier as f64) as u64)
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl CompressConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Reject recipes and settings the pipeline cannot run.
    pub fn validate(&self) -> anyhow::Result<()> {
        let r = &self.recipe;
        r.quant_scheme()?;
        if r.group_size == 0 {
            bail!("group_size must be positive");
        }
        if r.block_size == 0 || r.block_size % r.group_size != 0 {
            bail!(
                "block_size ({}) must be a positive multiple of group_size ({})",
                r.block_size,
                r.group_size
            );
        }
        if !(r.dampening_frac > 0.0 && r.dampening_frac < 1.0) {
            bail!("dampening_frac must be in (0, 1), got {}", r.dampening_frac);
        }
        if r.act_order {
            bail!("act_order is not supported");
        }
        if !r.targets.iter().any(|t| t == "Linear") {
            bail!("only `Linear` targets are supported, got {:?}", r.targets);
        }
        if self.calibration.max_seq_len == 0 {
            bail!("max_seq_len must be positive");
        }
        if self.calibration.samples_per_device == 0 {
            bail!("samples_per_device must be positive");
        }
        self.save.max_shard_bytes()?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_stock_run() {
        let config: CompressConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.paths.model_dir, "model");
        assert_eq!(config.paths.compressed_dir, "compressed_model");
        assert_eq!(config.paths.original_dir, "model_original");
        assert_eq!(config.devices.memory_per_device_gib, 16);
        assert_eq!(config.calibration.max_seq_len, 64);
        assert_eq!(config.calibration.seed, 42);
        assert_eq!(config.recipe.group_size, 16);
        assert_eq!(config.recipe.ignore, vec!["lm_head".to_string()]);
        assert!(!config.recipe.act_order);
        assert_eq!(config.save.max_shard_size, "2GB");
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let json = r#"{ "recipe": { "group_size": 32 }, "paths": { "base_dir": "/tmp/x" } }"#;
        let config: CompressConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.recipe.group_size, 32);
        assert_eq!(config.recipe.scheme, "W4A16");
        assert_eq!(config.paths.model_path(), PathBuf::from("/tmp/x/model"));
        assert_eq!(
            config.paths.journal_path(),
            PathBuf::from("/tmp/x").join(SWAP_JOURNAL_NAME)
        );
    }

    #[test]
    fn samples_scale_with_devices() {
        let c = CalibrationConfig::default();
        assert_eq!(c.num_samples(0), 16);
        assert_eq!(c.num_samples(1), 16);
        assert_eq!(c.num_samples(4), 64);
    }

    #[test]
    fn scheme_parsing() {
        let s = QuantScheme::parse("W4A16").unwrap();
        assert_eq!(s.weight_bits, 4);
        assert_eq!(s.activation_bits, 16);
        assert_eq!(QuantScheme::parse("w8a16").unwrap().weight_bits, 8);
        assert!(QuantScheme::parse("W8A8").is_err());
        assert!(QuantScheme::parse("FP8").is_err());
        assert!(QuantScheme::parse("W16A16").is_err());
        assert!(QuantScheme::parse("W3A16").is_err());
        assert!(QuantScheme::parse("W6A16").is_err());
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(parse_byte_size("2GB").unwrap(), 2_000_000_000);
        assert_eq!(parse_byte_size("500MB").unwrap(), 500_000_000);
        assert_eq!(parse_byte_size("1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert_eq!(parse_byte_size(" 1.5 KB ").unwrap(), 1500);
        assert!(parse_byte_size("2XB").is_err());
        assert!(parse_byte_size("GB").is_err());
    }

    #[test]
    fn validation_rejects_bad_recipes() {
        let mut c = CompressConfig::default();
        c.recipe.group_size = 0;
        assert!(c.validate().is_err());

        let mut c = CompressConfig::default();
        c.recipe.block_size = 100;
        assert!(c.validate().is_err());

        let mut c = CompressConfig::default();
        c.recipe.act_order = true;
        assert!(c.validate().is_err());

        let mut c = CompressConfig::default();
        c.recipe.dampening_frac = 0.0;
        assert!(c.validate().is_err());

        let mut c = CompressConfig::default();
        c.recipe.scheme = "W3A16".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("squeeze.json");
        let mut config = CompressConfig::default();
        config.calibration.max_seq_len = 128;
        config.save(&path).unwrap();
        let loaded = CompressConfig::load(&path).unwrap();
        assert_eq!(loaded.calibration.max_seq_len, 128);
        assert_eq!(loaded.recipe.scheme, "W4A16");
    }
}
