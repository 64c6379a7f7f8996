//! Causal grouped-query self-attention for Llama-family decoders.
//!
//! * **RoPE** — half-rotation rotary embeddings with configurable base and
//!   optional Llama 3 frequency rescaling.
//! * **GQA** — key/value heads are repeated to match the query heads.
//! * Scores and softmax are computed in f32 regardless of the weight dtype.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{linear_b, Linear, Module, VarBuilder};

use squeeze_common::DecoderConfig;

use crate::model::{InputGroup, InputObserver, LinearTarget};

/// Inverse RoPE frequencies, `θ_i = base^{-2i/d}`, rescaled for Llama 3
/// checkpoints.
pub(crate) fn rope_inv_freq(config: &DecoderConfig) -> Vec<f32> {
    let head_dim = config.head_dim();
    let base = config.rope_theta;
    let inv_freq = (0..head_dim / 2).map(|i| 1.0 / base.powf(2.0 * i as f64 / head_dim as f64));

    let Some(scaling) = config.llama3_rope_scaling() else {
        return inv_freq.map(|f| f as f32).collect();
    };
    let low_wavelen = scaling.original_max_position_embeddings as f64 / scaling.low_freq_factor;
    let high_wavelen = scaling.original_max_position_embeddings as f64 / scaling.high_freq_factor;
    inv_freq
        .map(|freq| {
            let wavelen = 2.0 * std::f64::consts::PI / freq;
            if wavelen < high_wavelen {
                freq
            } else if wavelen > low_wavelen {
                freq / scaling.factor
            } else {
                let smooth = (scaling.original_max_position_embeddings as f64 / wavelen
                    - scaling.low_freq_factor)
                    / (scaling.high_freq_factor - scaling.low_freq_factor);
                (1.0 - smooth) * freq / scaling.factor + smooth * freq
            }
        })
        .map(|f| f as f32)
        .collect()
}

/// RoPE cos/sin tables for positions `[0, length)`: shape `(length, head_dim / 2)`.
pub(crate) fn rope_cos_sin(
    inv_freq: &[f32],
    length: usize,
    device: &Device,
    dtype: DType,
) -> Result<(Tensor, Tensor)> {
    let d2 = inv_freq.len();
    let inv_freq = Tensor::from_slice(inv_freq, (1, d2), device)?;
    let positions = Tensor::arange(0u32, length as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((length, 1))?;
    let freqs = positions.broadcast_mul(&inv_freq)?;
    Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
}

/// Additive causal mask: 0 on and below the diagonal, a large negative value above.
fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let mask = Tensor::tril2(t, DType::F32, device)?.reshape((1, 1, t, t))?;
    let ones = Tensor::ones((1, 1, t, t), DType::F32, device)?;
    (-1e9f64 * (&ones - &mask)?)
}

/// `(b, n_kv, t, d)` → `(b, n_kv · n_rep, t, d)`, each kv head repeated in place.
fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, n_kv, t, d) = x.dims4()?;
    Tensor::cat(&vec![&x; n_rep], 2)?.reshape((b, n_kv * n_rep, t, d))
}

pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    /// `vb` is scoped to `self_attn`.
    pub fn new(config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();
        let bias = config.attention_bias;

        Ok(Self {
            q_proj: linear_b(hidden, num_heads * head_dim, bias, vb.pp("q_proj"))?,
            k_proj: linear_b(hidden, num_kv_heads * head_dim, bias, vb.pp("k_proj"))?,
            v_proj: linear_b(hidden, num_kv_heads * head_dim, bias, vb.pp("v_proj"))?,
            o_proj: linear_b(
                num_heads * head_dim,
                hidden,
                config.o_proj_bias(),
                vb.pp("o_proj"),
            )?,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    pub(crate) fn linear(&self, target: LinearTarget) -> Option<&Linear> {
        match target {
            LinearTarget::QProj => Some(&self.q_proj),
            LinearTarget::KProj => Some(&self.k_proj),
            LinearTarget::VProj => Some(&self.v_proj),
            LinearTarget::OProj => Some(&self.o_proj),
            _ => None,
        }
    }

    pub(crate) fn linear_mut(&mut self, target: LinearTarget) -> Option<&mut Linear> {
        match target {
            LinearTarget::QProj => Some(&mut self.q_proj),
            LinearTarget::KProj => Some(&mut self.k_proj),
            LinearTarget::VProj => Some(&mut self.v_proj),
            LinearTarget::OProj => Some(&mut self.o_proj),
            _ => None,
        }
    }

    /// `x`: `(b, t, hidden)`, already normalised. `cos`/`sin` cover at least
    /// `t` positions.
    pub fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        observer: &mut dyn InputObserver,
    ) -> anyhow::Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        observer.observe(InputGroup::Attention, x)?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let cos = cos.narrow(0, 0, t)?;
        let sin = sin.narrow(0, 0, t)?;
        let q = candle_nn::rotary_emb::rope(&q, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k, &cos, &sin)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v.contiguous()?, n_rep)?.contiguous()?;

        let dtype = q.dtype();
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let scores = scores.broadcast_add(&causal_mask(t, x.device())?)?;
        let att = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(dtype)?;

        let y = att.matmul(&v)?;
        let y = y.transpose(1, 2)?.reshape((b, t, self.num_heads * self.head_dim))?;
        observer.observe(InputGroup::AttnOutput, &y)?;
        Ok(self.o_proj.forward(&y)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::NoObserver;

    fn config(json: &str) -> DecoderConfig {
        DecoderConfig::from_json(json).unwrap()
    }

    #[test]
    fn inv_freq_uses_rope_theta() {
        let c = config(
            r#"{"vocab_size": 8, "hidden_size": 8, "intermediate_size": 16,
                "num_hidden_layers": 1, "num_attention_heads": 2, "rope_theta": 100.0}"#,
        );
        let f = rope_inv_freq(&c);
        assert_eq!(f.len(), 2);
        assert!((f[0] - 1.0).abs() < 1e-6);
        assert!((f[1] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn llama3_scaling_divides_low_frequencies() {
        let base = r#""vocab_size": 8, "hidden_size": 256, "intermediate_size": 16,
                "num_hidden_layers": 1, "num_attention_heads": 2, "rope_theta": 500000.0"#;
        let plain = rope_inv_freq(&config(&format!("{{{base}}}")));
        let scaled = rope_inv_freq(&config(&format!(
            r#"{{{base}, "rope_scaling": {{"rope_type": "llama3", "factor": 8.0}}}}"#
        )));
        // Highest frequency untouched, lowest divided by the factor.
        assert_eq!(plain[0], scaled[0]);
        let last = plain.len() - 1;
        assert!((plain[last] / 8.0 - scaled[last]).abs() < 1e-12);
    }

    #[test]
    fn mask_blocks_future_positions() {
        let m = causal_mask(3, &Device::Cpu).unwrap();
        let m: Vec<Vec<f32>> = m.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(m[0][0], 0.0);
        assert_eq!(m[2][1], 0.0);
        assert!(m[0][1] < -1e8);
        assert!(m[1][2] < -1e8);
    }

    #[test]
    fn repeat_kv_interleaves_heads() {
        let x = Tensor::arange(0f32, 4.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 1, 2))
            .unwrap();
        let y = repeat_kv(x, 2).unwrap();
        assert_eq!(y.dims(), &[1, 4, 1, 2]);
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![0.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0]);
    }

    fn biased_attention(config: &DecoderConfig, o_bias: f32) -> Attention {
        let dev = Device::Cpu;
        let h = config.hidden_size;
        let kv = config.num_kv_heads() * config.head_dim();
        let mut tensors = HashMap::new();
        for (name, rows) in [("q_proj", h), ("k_proj", kv), ("v_proj", kv), ("o_proj", h)] {
            let w = Tensor::randn(0f32, 0.2, (rows, h), &dev).unwrap();
            let b = if name == "o_proj" {
                Tensor::full(o_bias, rows, &dev).unwrap()
            } else {
                Tensor::zeros(rows, DType::F32, &dev).unwrap()
            };
            tensors.insert(format!("{name}.weight"), w);
            tensors.insert(format!("{name}.bias"), b);
        }
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &dev);
        Attention::new(config, vb).unwrap()
    }

    #[test]
    fn o_proj_bias_is_applied_for_llama() {
        let c = config(
            r#"{"model_type": "llama", "vocab_size": 8, "hidden_size": 8,
                "intermediate_size": 16, "num_hidden_layers": 1,
                "num_attention_heads": 2, "attention_bias": true}"#,
        );
        let att = biased_attention(&c, 100.0);
        let (cos, sin) = rope_cos_sin(&rope_inv_freq(&c), 3, &Device::Cpu, DType::F32).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu).unwrap();
        let with_bias = att.forward(&x, &cos, &sin, &mut NoObserver).unwrap();

        let mut unbiased = att;
        let o = unbiased.o_proj.clone();
        unbiased.o_proj = Linear::new(o.weight().clone(), None);
        let without = unbiased.forward(&x, &cos, &sin, &mut NoObserver).unwrap();

        let diff: f32 = (with_bias - without)
            .unwrap()
            .mean_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((diff - 100.0).abs() < 1e-3);
    }

    #[test]
    fn qwen2_o_proj_has_no_bias() {
        let c = config(
            r#"{"model_type": "qwen2", "vocab_size": 8, "hidden_size": 8,
                "intermediate_size": 16, "num_hidden_layers": 1,
                "num_attention_heads": 2}"#,
        );
        let att = biased_attention(&c, 1.0);
        assert!(att.o_proj.bias().is_none());
        assert!(att.q_proj.bias().is_some());
    }
}
