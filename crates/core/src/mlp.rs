//! SwiGLU feed-forward block.
//!
//! ```text
//! out = down_proj( SiLU(gate_proj(x)) ⊙ up_proj(x) )
//! ```

use candle_core::{Result, Tensor};
use candle_nn::{linear_b, Linear, Module, VarBuilder};

use squeeze_common::DecoderConfig;

use crate::model::{InputGroup, InputObserver, LinearTarget};

pub struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    /// `vb` is scoped to `mlp`.
    pub fn new(config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let (h, i, bias) = (config.hidden_size, config.intermediate_size, config.mlp_bias);
        Ok(Self {
            gate_proj: linear_b(h, i, bias, vb.pp("gate_proj"))?,
            up_proj: linear_b(h, i, bias, vb.pp("up_proj"))?,
            down_proj: linear_b(i, h, bias, vb.pp("down_proj"))?,
        })
    }

    pub(crate) fn linear(&self, target: LinearTarget) -> Option<&Linear> {
        match target {
            LinearTarget::GateProj => Some(&self.gate_proj),
            LinearTarget::UpProj => Some(&self.up_proj),
            LinearTarget::DownProj => Some(&self.down_proj),
            _ => None,
        }
    }

    pub(crate) fn linear_mut(&mut self, target: LinearTarget) -> Option<&mut Linear> {
        match target {
            LinearTarget::GateProj => Some(&mut self.gate_proj),
            LinearTarget::UpProj => Some(&mut self.up_proj),
            LinearTarget::DownProj => Some(&mut self.down_proj),
            _ => None,
        }
    }

    pub fn forward(&self, x: &Tensor, observer: &mut dyn InputObserver) -> anyhow::Result<Tensor> {
        observer.observe(InputGroup::Mlp, x)?;
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let hidden = (gate * self.up_proj.forward(x)?)?;
        observer.observe(InputGroup::MlpDown, &hidden)?;
        Ok(self.down_proj.forward(&hidden)?)
    }
}
