//! Llama-family decoder layers, loaded one at a time for calibration.
//!
//! Nothing here generates text: the forward pass exists to produce the
//! inputs of every linear module so GPTQ can build its Hessians, and to
//! propagate hidden states from one decoder layer to the next.
//!
//! Checkpoint layout (Llama, Mistral, Qwen2):
//!
//! ```text
//! model.embed_tokens.weight
//! model.layers.{i}.input_layernorm.weight
//! model.layers.{i}.self_attn.{q,k,v,o}_proj.{weight,bias}
//! model.layers.{i}.post_attention_layernorm.weight
//! model.layers.{i}.mlp.{gate,up,down}_proj.weight
//! model.norm.weight
//! lm_head.weight
//! ```

use anyhow::{bail, Context};
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{embedding, rms_norm, Embedding, Linear, Module, RmsNorm, VarBuilder};
use regex::Regex;

use squeeze_common::DecoderConfig;

use crate::attention::{rope_cos_sin, rope_inv_freq, Attention};
use crate::mlp::Mlp;

// ── Input capture ───────────────────────────────────────────────────────────

/// Linear modules that read the same input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputGroup {
    /// Normalised hidden state feeding q/k/v.
    Attention,
    /// Concatenated head outputs feeding `o_proj`.
    AttnOutput,
    /// Normalised hidden state feeding gate/up.
    Mlp,
    /// Gated activations feeding `down_proj`.
    MlpDown,
}

impl InputGroup {
    pub const ALL: [InputGroup; 4] = [
        InputGroup::Attention,
        InputGroup::AttnOutput,
        InputGroup::Mlp,
        InputGroup::MlpDown,
    ];

    /// Input width of the group's linears.
    pub fn width(&self, config: &DecoderConfig) -> usize {
        match self {
            Self::Attention | Self::Mlp => config.hidden_size,
            Self::AttnOutput => config.num_attention_heads * config.head_dim(),
            Self::MlpDown => config.intermediate_size,
        }
    }
}

/// Receives the input of every linear group during a forward pass.
pub trait InputObserver {
    fn observe(&mut self, group: InputGroup, input: &Tensor) -> anyhow::Result<()>;
}

/// Observer that drops everything; used for plain propagation.
pub struct NoObserver;

impl InputObserver for NoObserver {
    fn observe(&mut self, _group: InputGroup, _input: &Tensor) -> anyhow::Result<()> {
        Ok(())
    }
}

// ── Linear targets ──────────────────────────────────────────────────────────

/// The seven linear modules of a decoder layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinearTarget {
    QProj,
    KProj,
    VProj,
    OProj,
    GateProj,
    UpProj,
    DownProj,
}

impl LinearTarget {
    pub const ALL: [LinearTarget; 7] = [
        LinearTarget::QProj,
        LinearTarget::KProj,
        LinearTarget::VProj,
        LinearTarget::OProj,
        LinearTarget::GateProj,
        LinearTarget::UpProj,
        LinearTarget::DownProj,
    ];

    /// Module path relative to the layer, e.g. `self_attn.q_proj`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::QProj => "self_attn.q_proj",
            Self::KProj => "self_attn.k_proj",
            Self::VProj => "self_attn.v_proj",
            Self::OProj => "self_attn.o_proj",
            Self::GateProj => "mlp.gate_proj",
            Self::UpProj => "mlp.up_proj",
            Self::DownProj => "mlp.down_proj",
        }
    }

    pub fn group(&self) -> InputGroup {
        match self {
            Self::QProj | Self::KProj | Self::VProj => InputGroup::Attention,
            Self::OProj => InputGroup::AttnOutput,
            Self::GateProj | Self::UpProj => InputGroup::Mlp,
            Self::DownProj => InputGroup::MlpDown,
        }
    }
}

/// Checkpoint prefix of decoder layer `index`.
pub fn layer_prefix(index: usize) -> String {
    format!("model.layers.{index}")
}

/// Module names excluded from quantisation.
///
/// A pattern matches a module name exactly or as its trailing path
/// components (`lm_head`, `mlp.down_proj`); patterns starting with `re:`
/// are regular expressions matched anywhere in the name.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    names: Vec<String>,
    patterns: Vec<Regex>,
}

impl IgnoreList {
    pub fn new(ignore: &[String]) -> anyhow::Result<Self> {
        let mut list = Self::default();
        for entry in ignore {
            match entry.strip_prefix("re:") {
                Some(pattern) => list.patterns.push(
                    Regex::new(pattern).with_context(|| format!("ignore pattern {entry:?}"))?,
                ),
                None => list.names.push(entry.clone()),
            }
        }
        Ok(list)
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.names
            .iter()
            .any(|n| name == n || name.ends_with(&format!(".{n}")))
            || self.patterns.iter().any(|p| p.is_match(name))
    }
}

// ── Embeddings and RoPE tables ──────────────────────────────────────────────

/// `model.embed_tokens`; `vb` is the checkpoint root.
pub fn load_embedding(config: &DecoderConfig, vb: VarBuilder) -> Result<Embedding> {
    embedding(config.vocab_size, config.hidden_size, vb.pp("model.embed_tokens"))
}

/// Embed one unpadded sample: `(1, len, hidden)`.
pub fn embed_tokens(embedding: &Embedding, ids: &[u32]) -> Result<Tensor> {
    let device = embedding.embeddings().device();
    let ids = Tensor::new(ids, device)?.unsqueeze(0)?;
    embedding.forward(&ids)
}

/// RoPE cos/sin tables for one device and dtype.
pub struct RotaryTables {
    pub cos: Tensor,
    pub sin: Tensor,
}

impl RotaryTables {
    pub fn new(
        config: &DecoderConfig,
        max_len: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let (cos, sin) = rope_cos_sin(&rope_inv_freq(config), max_len, device, dtype)?;
        Ok(Self { cos, sin })
    }

    pub fn max_len(&self) -> usize {
        self.cos.dims()[0]
    }
}

// ── Decoder layer ───────────────────────────────────────────────────────────

/// Pre-norm block: `x + attn(norm(x))`, then `x + mlp(norm(x))`.
pub struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    /// `vb` is scoped to the layer prefix (see [`layer_prefix`]).
    pub fn new(config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let eps = config.rms_norm_eps;
        Ok(Self {
            input_layernorm: rms_norm(config.hidden_size, eps, vb.pp("input_layernorm"))?,
            self_attn: Attention::new(config, vb.pp("self_attn"))?,
            post_attention_layernorm: rms_norm(
                config.hidden_size,
                eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, rope: &RotaryTables) -> anyhow::Result<Tensor> {
        self.forward_observed(x, rope, &mut NoObserver)
    }

    /// Forward pass reporting every linear input to `observer`.
    pub fn forward_observed(
        &self,
        x: &Tensor,
        rope: &RotaryTables,
        observer: &mut dyn InputObserver,
    ) -> anyhow::Result<Tensor> {
        let t = x.dim(1)?;
        if t > rope.max_len() {
            bail!("sequence of {t} tokens exceeds RoPE table of {}", rope.max_len());
        }
        let residual = x;
        let normed = self.input_layernorm.forward(x)?;
        let attn = self.self_attn.forward(&normed, &rope.cos, &rope.sin, observer)?;
        let x = (residual + attn)?;

        let residual = &x;
        let normed = self.post_attention_layernorm.forward(&x)?;
        let ff = self.mlp.forward(&normed, observer)?;
        Ok((residual + ff)?)
    }

    fn linear(&self, target: LinearTarget) -> &Linear {
        match self.self_attn.linear(target) {
            Some(l) => l,
            None => self
                .mlp
                .linear(target)
                .unwrap_or_else(|| unreachable!("{target:?} is an attention or mlp linear")),
        }
    }

    /// Current weight of `target`, `(out, in)`.
    pub fn linear_weight(&self, target: LinearTarget) -> &Tensor {
        self.linear(target).weight()
    }

    /// Replace the weight of `target` (keeping its bias), e.g. with its
    /// fake-quantised version.
    pub fn set_linear_weight(&mut self, target: LinearTarget, weight: Tensor) -> anyhow::Result<()> {
        let current = self.linear(target);
        if weight.dims() != current.weight().dims() {
            bail!(
                "{}: replacement weight {:?} does not match {:?}",
                target.name(),
                weight.dims(),
                current.weight().dims()
            );
        }
        let weight = weight
            .to_device(current.weight().device())?
            .to_dtype(current.weight().dtype())?;
        let bias = current.bias().cloned();
        let slot = match self.self_attn.linear_mut(target) {
            Some(l) => l,
            None => self
                .mlp
                .linear_mut(target)
                .unwrap_or_else(|| unreachable!("{target:?} is an attention or mlp linear")),
        };
        *slot = Linear::new(weight, bias);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const H: usize = 16;
    const I: usize = 24;

    fn tiny_config() -> DecoderConfig {
        DecoderConfig::from_json(
            r#"{"model_type": "llama", "vocab_size": 32, "hidden_size": 16,
                "intermediate_size": 24, "num_hidden_layers": 1,
                "num_attention_heads": 4, "num_key_value_heads": 2}"#,
        )
        .unwrap()
    }

    fn tiny_layer(config: &DecoderConfig) -> DecoderLayer {
        let dev = Device::Cpu;
        let kv = config.num_kv_heads() * config.head_dim();
        let shapes: Vec<(&str, Vec<usize>)> = vec![
            ("input_layernorm.weight", vec![H]),
            ("post_attention_layernorm.weight", vec![H]),
            ("self_attn.q_proj.weight", vec![H, H]),
            ("self_attn.k_proj.weight", vec![kv, H]),
            ("self_attn.v_proj.weight", vec![kv, H]),
            ("self_attn.o_proj.weight", vec![H, H]),
            ("mlp.gate_proj.weight", vec![I, H]),
            ("mlp.up_proj.weight", vec![I, H]),
            ("mlp.down_proj.weight", vec![H, I]),
        ];
        let mut tensors = HashMap::new();
        for (name, shape) in shapes {
            let t = if name.ends_with("layernorm.weight") {
                Tensor::ones(shape, DType::F32, &dev).unwrap()
            } else {
                Tensor::randn(0f32, 0.2, shape, &dev).unwrap()
            };
            tensors.insert(format!("model.layers.0.{name}"), t);
        }
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &dev);
        DecoderLayer::new(config, vb.pp(layer_prefix(0))).unwrap()
    }

    #[derive(Default)]
    struct Recorder(Vec<(InputGroup, Vec<usize>)>);

    impl InputObserver for Recorder {
        fn observe(&mut self, group: InputGroup, input: &Tensor) -> anyhow::Result<()> {
            self.0.push((group, input.dims().to_vec()));
            Ok(())
        }
    }

    #[test]
    fn observer_sees_every_group_in_order() {
        let c = tiny_config();
        let layer = tiny_layer(&c);
        let rope = RotaryTables::new(&c, 8, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 5, H), &Device::Cpu).unwrap();

        let mut rec = Recorder::default();
        let y = layer.forward_observed(&x, &rope, &mut rec).unwrap();
        assert_eq!(y.dims(), &[1, 5, H]);

        let groups: Vec<InputGroup> = rec.0.iter().map(|(g, _)| *g).collect();
        assert_eq!(groups, InputGroup::ALL.to_vec());
        for (group, dims) in &rec.0 {
            assert_eq!(dims, &vec![1, 5, group.width(&c)]);
        }
    }

    #[test]
    fn attention_is_causal() {
        let c = tiny_config();
        let layer = tiny_layer(&c);
        let rope = RotaryTables::new(&c, 8, &Device::Cpu, DType::F32).unwrap();
        let dev = Device::Cpu;
        let prefix = Tensor::randn(0f32, 1.0, (1, 3, H), &dev).unwrap();
        let a = Tensor::cat(&[&prefix, &Tensor::randn(0f32, 1.0, (1, 1, H), &dev).unwrap()], 1)
            .unwrap();
        let b = Tensor::cat(&[&prefix, &Tensor::randn(0f32, 1.0, (1, 1, H), &dev).unwrap()], 1)
            .unwrap();

        let ya = layer.forward(&a, &rope).unwrap().narrow(1, 0, 3).unwrap();
        let yb = layer.forward(&b, &rope).unwrap().narrow(1, 0, 3).unwrap();
        let diff: f32 = (ya - yb).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-5, "earlier positions changed by {diff}");
    }

    #[test]
    fn sequence_longer_than_rope_table_is_rejected() {
        let c = tiny_config();
        let layer = tiny_layer(&c);
        let rope = RotaryTables::new(&c, 2, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::zeros((1, 3, H), DType::F32, &Device::Cpu).unwrap();
        assert!(layer.forward(&x, &rope).is_err());
    }

    #[test]
    fn set_linear_weight_changes_output() {
        let c = tiny_config();
        let mut layer = tiny_layer(&c);
        let rope = RotaryTables::new(&c, 8, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, H), &Device::Cpu).unwrap();
        let before = layer.forward(&x, &rope).unwrap();

        let zeros = Tensor::zeros((H, I), DType::F32, &Device::Cpu).unwrap();
        layer.set_linear_weight(LinearTarget::DownProj, zeros).unwrap();
        assert_eq!(
            layer
                .linear_weight(LinearTarget::DownProj)
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap(),
            0.0
        );
        let after = layer.forward(&x, &rope).unwrap();
        let diff: f32 = (before - after).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff > 0.0);

        let wrong = Tensor::zeros((I, H), DType::F32, &Device::Cpu).unwrap();
        assert!(layer.set_linear_weight(LinearTarget::DownProj, wrong).is_err());
    }

    #[test]
    fn embedding_lookup() {
        let c = tiny_config();
        let dev = Device::Cpu;
        let table = Tensor::arange(0f32, (32 * H) as f32, &dev)
            .unwrap()
            .reshape((32, H))
            .unwrap();
        let mut tensors = HashMap::new();
        tensors.insert("model.embed_tokens.weight".to_string(), table);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &dev);
        let emb = load_embedding(&c, vb).unwrap();
        let x = embed_tokens(&emb, &[2, 0]).unwrap();
        assert_eq!(x.dims(), &[1, 2, H]);
        let row: Vec<f32> = x.squeeze(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        assert_eq!(row[0], (2 * H) as f32);
    }

    #[test]
    fn target_names_and_groups() {
        assert_eq!(LinearTarget::QProj.name(), "self_attn.q_proj");
        assert_eq!(LinearTarget::DownProj.group(), InputGroup::MlpDown);
        assert_eq!(LinearTarget::OProj.group(), InputGroup::AttnOutput);
        assert_eq!(layer_prefix(3), "model.layers.3");
    }

    #[test]
    fn ignore_list_matching() {
        let list = IgnoreList::new(&[
            "lm_head".to_string(),
            "mlp.down_proj".to_string(),
            r"re:layers\.0\..*q_proj".to_string(),
        ])
        .unwrap();
        assert!(list.is_ignored("lm_head"));
        assert!(list.is_ignored("model.layers.5.mlp.down_proj"));
        assert!(list.is_ignored("model.layers.0.self_attn.q_proj"));
        assert!(!list.is_ignored("model.layers.1.self_attn.q_proj"));
        assert!(!list.is_ignored("model.layers.1.mlp.up_proj"));
        assert!(!list.is_ignored("not_lm_head"));
        assert!(IgnoreList::new(&["re:(".to_string()]).is_err());
    }
}
