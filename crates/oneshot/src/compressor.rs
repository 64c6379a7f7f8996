//! Sequential one-shot GPTQ over a decoder checkpoint.
//!
//! ```text
//! embed samples
//! for each decoder layer:
//!     load layer on its placed device
//!     forward every sample, accumulating one Hessian per input group
//!     GPTQ every targeted linear, swap in its dequantised weights
//!     forward again through the quantised layer → next layer's inputs
//!     drop the layer
//! ```
//!
//! Only the embedding table and one decoder layer are resident at a time;
//! the checkpoint stays memory-mapped. Saving streams untouched tensors
//! straight from the mapped shards.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use indicatif::{ProgressBar, ProgressStyle};

use squeeze_common::{CalibrationSet, CompressConfig, DecoderConfig};
use squeeze_core::{
    embed_tokens, layer_prefix, load_embedding, DecoderLayer, DeviceMap, GptqQuantizer,
    HessianAccumulator, IgnoreList, InputGroup, InputObserver, LinearTarget, Placement,
    QuantizedLinear, RotaryTables,
};
use squeeze_export::compressed::module_name;
use squeeze_export::{
    copy_tokenizer_files, encode_linear, quantization_config, scale_dtype, write_config,
    write_sharded, Checkpoint, OutputTensor, WrittenShards,
};

// ── Hessian capture ─────────────────────────────────────────────────────────

/// One Hessian per input group that feeds at least one targeted linear.
struct HessianSet {
    groups: HashMap<InputGroup, HessianAccumulator>,
}

impl HessianSet {
    fn new(config: &DecoderConfig, groups: &[InputGroup], device: &Device) -> Result<Self> {
        let groups = groups
            .iter()
            .map(|&g| Ok((g, HessianAccumulator::new(g.width(config), device)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { groups })
    }

    fn get(&self, group: InputGroup) -> Option<&HessianAccumulator> {
        self.groups.get(&group)
    }
}

impl InputObserver for HessianSet {
    fn observe(&mut self, group: InputGroup, input: &Tensor) -> Result<()> {
        if let Some(h) = self.groups.get_mut(&group) {
            h.add_batch(input)?;
        }
        Ok(())
    }
}

// ── Outcome ─────────────────────────────────────────────────────────────────

/// Quantised linears keyed by module name (`model.layers.3.mlp.up_proj`).
#[derive(Debug, Default)]
pub struct CompressionOutcome {
    pub quantized: BTreeMap<String, QuantizedLinear>,
    pub ignored: Vec<String>,
    pub num_samples: usize,
    pub num_tokens: usize,
}

impl CompressionOutcome {
    pub fn total_loss(&self) -> f64 {
        self.quantized.values().map(|q| q.loss).sum()
    }
}

/// What [`Compressor::save`] wrote.
#[derive(Debug, Clone)]
pub struct SavedModel {
    pub shards: WrittenShards,
    /// Dtype of pass-through tensors and group scales, taken from the
    /// checkpoint rather than forced to f16.
    pub model_dtype: DType,
    pub compression_ratio: f64,
    pub tokenizer_files: Vec<&'static str>,
}

impl SavedModel {
    /// Output dtype, flagged when it is not the f16 a `torch_dtype=float16`
    /// load would have produced.
    pub fn dtype_note(&self) -> String {
        if self.model_dtype == DType::F16 {
            format!("{:?}", self.model_dtype)
        } else {
            format!(
                "{:?} (kept from the checkpoint, not converted to F16)",
                self.model_dtype
            )
        }
    }
}

// ── Compressor ──────────────────────────────────────────────────────────────

pub struct Compressor<'a> {
    config: &'a CompressConfig,
    checkpoint: &'a Checkpoint,
    model_config: DecoderConfig,
    device_map: DeviceMap,
    quantizer: GptqQuantizer,
    ignore: IgnoreList,
    model_dtype: DType,
}

impl<'a> Compressor<'a> {
    pub fn new(
        config: &'a CompressConfig,
        checkpoint: &'a Checkpoint,
        device_map: DeviceMap,
    ) -> Result<Self> {
        let model_config = checkpoint.config()?;
        if device_map.num_layers() != model_config.num_hidden_layers {
            bail!(
                "device map covers {} layers, model has {}",
                device_map.num_layers(),
                model_config.num_hidden_layers
            );
        }
        let model_dtype = checkpoint.model_dtype(&model_config);
        Ok(Self {
            quantizer: GptqQuantizer::from_recipe(&config.recipe)?,
            ignore: IgnoreList::new(&config.recipe.ignore)?,
            config,
            checkpoint,
            model_config,
            device_map,
            model_dtype,
        })
    }

    /// Compute dtype for a placement: the checkpoint dtype on accelerators,
    /// f32 on the CPU.
    fn compute_dtype(&self, placement: Placement) -> DType {
        match placement {
            Placement::Cpu => DType::F32,
            Placement::Cuda(_) => self.model_dtype,
        }
    }

    fn targets_of(&self, prefix: &str) -> (Vec<(LinearTarget, String)>, Vec<String>) {
        let mut targets = Vec::new();
        let mut ignored = Vec::new();
        for target in LinearTarget::ALL {
            let name = format!("{prefix}.{}", target.name());
            if self.ignore.is_ignored(&name) {
                ignored.push(name);
            } else {
                targets.push((target, name));
            }
        }
        (targets, ignored)
    }

    /// Calibrate and quantise every decoder layer in order.
    pub fn run(&self, calibration: &CalibrationSet) -> Result<CompressionOutcome> {
        let cfg = &self.model_config;
        let num_layers = cfg.num_hidden_layers;
        let max_len = calibration.samples().iter().map(Vec::len).max().unwrap_or(1).max(1);
        if calibration.is_empty() {
            tracing::warn!("No calibration samples; falling back to round-to-nearest");
        }

        let first = self.device_map.placement(0);
        let (device, dtype) = (first.device()?, self.compute_dtype(first));
        let embedding = {
            let name = "model.embed_tokens.weight".to_string();
            let table = self.checkpoint.load(&name, &device, dtype)?;
            let vb = VarBuilder::from_tensors(HashMap::from([(name, table)]), dtype, &device);
            load_embedding(cfg, vb)?
        };
        let mut hidden = calibration
            .samples()
            .iter()
            .map(|ids| embed_tokens(&embedding, ids))
            .collect::<candle_core::Result<Vec<Tensor>>>()?;
        drop(embedding);

        let mut outcome = CompressionOutcome {
            num_samples: calibration.num_samples(),
            num_tokens: calibration.num_tokens(),
            ..Default::default()
        };

        let pb = ProgressBar::new(num_layers as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} layers {msg}")
                .context("progress template")?
                .progress_chars("=>-"),
        );

        for index in 0..num_layers {
            let prefix = layer_prefix(index);
            let placement = self.device_map.placement(index);
            let device = placement.device()?;
            let dtype = self.compute_dtype(placement);
            pb.set_message(format!("{prefix} on {placement}"));

            let tensors = self.checkpoint.load_prefix(&prefix, &device, dtype)?;
            let vb = VarBuilder::from_tensors(tensors, dtype, &device);
            let mut layer = DecoderLayer::new(cfg, vb.pp(&prefix))
                .with_context(|| format!("build {prefix}"))?;
            let rope = RotaryTables::new(cfg, max_len, &device, dtype)?;

            hidden = hidden
                .into_iter()
                .map(|h| h.to_device(&device)?.to_dtype(dtype))
                .collect::<candle_core::Result<Vec<_>>>()?;

            let (targets, ignored) = self.targets_of(&prefix);
            outcome.ignored.extend(ignored);
            let mut groups: Vec<InputGroup> = targets.iter().map(|(t, _)| t.group()).collect();
            groups.dedup();

            let mut hessians = HessianSet::new(cfg, &groups, &device)?;
            for h in &hidden {
                layer.forward_observed(h, &rope, &mut hessians)?;
            }

            for (target, name) in targets {
                let weight = layer.linear_weight(target);
                let (rows, cols) = weight.dims2()?;
                let values: Vec<f32> = weight
                    .to_dtype(DType::F32)?
                    .to_device(&Device::Cpu)?
                    .flatten_all()?
                    .to_vec1()?;
                let quantized = self
                    .quantizer
                    .quantize(&values, rows, cols, hessians.get(target.group()))
                    .with_context(|| format!("quantize {name}"))?;
                tracing::info!(
                    module = %name,
                    rows,
                    cols,
                    loss = format!("{:.4}", quantized.loss),
                    "GPTQ"
                );
                layer.set_linear_weight(target, quantized.dequantized_tensor(&device, dtype)?)?;
                outcome.quantized.insert(name, quantized);
            }
            drop(hessians);

            hidden = hidden
                .iter()
                .map(|h| layer.forward(h, &rope))
                .collect::<Result<Vec<_>>>()?;
            pb.inc(1);
        }
        pb.finish_with_message("done");

        tracing::info!(
            quantized = outcome.quantized.len(),
            ignored = outcome.ignored.len(),
            total_loss = format!("{:.4}", outcome.total_loss()),
            "Calibration complete"
        );
        Ok(outcome)
    }

    /// Write the compressed checkpoint, its config and the tokenizer files.
    pub fn save(&self, outcome: &CompressionOutcome, output_dir: &Path) -> Result<SavedModel> {
        let scale_dtype = scale_dtype(self.model_dtype);
        if self.model_dtype != DType::F16 {
            tracing::info!(
                dtype = ?self.model_dtype,
                "Keeping checkpoint dtype for pass-through tensors and scales (not converting to f16)"
            );
        }
        let mut tensors: Vec<OutputTensor<'_>> = Vec::new();
        let mut replaced_bytes = 0u64;
        let mut written_quantized = 0u64;

        for name in self.checkpoint.tensor_names() {
            let quantized =
                module_name(&name).and_then(|m| outcome.quantized.get(m).map(|q| (m, q)));
            match quantized {
                Some((module, q)) => {
                    replaced_bytes += self.checkpoint.raw(&name)?.data().len() as u64;
                    let triple = encode_linear(module, q, scale_dtype)?;
                    written_quantized += triple.iter().map(OutputTensor::size).sum::<u64>();
                    tensors.extend(triple);
                }
                None => {
                    let view = self.checkpoint.raw(&name)?;
                    tensors.push(OutputTensor::borrowed(name.clone(), &view));
                }
            }
        }

        let total_before = self.checkpoint.total_bytes();
        let total_after = total_before - replaced_bytes + written_quantized;
        let compression_ratio = total_before as f64 / total_after.max(1) as f64;

        let shards = write_sharded(output_dir, &tensors, self.config.save.max_shard_bytes()?)?;
        let args = *self.quantizer.args();
        write_config(
            self.checkpoint.dir(),
            output_dir,
            quantization_config(&args, &self.config.recipe, compression_ratio),
        )?;
        let tokenizer_files = copy_tokenizer_files(self.checkpoint.dir(), output_dir)?;

        tracing::info!(
            dir = %output_dir.display(),
            shards = shards.files.len(),
            tensors = tensors.len(),
            ratio = format!("{compression_ratio:.2}x"),
            "Saved compressed model"
        );
        Ok(SavedModel {
            shards,
            model_dtype: self.model_dtype,
            compression_ratio,
            tokenizer_files,
        })
    }
}
