//! # squeeze-core — The Quantisation Engine
//!
//! Everything numeric needed to compress a causal LM one decoder layer at a
//! time:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`linalg`] | Cholesky factor / inverse, GPTQ inverse-Hessian factor |
//! | [`quantize`] | `QuantArgs`, symmetric group scales, int packing |
//! | [`gptq`] | `HessianAccumulator`, `GptqQuantizer`, `QuantizedLinear` |
//! | [`attention`] | Causal GQA attention with RoPE |
//! | [`mlp`] | SwiGLU feed-forward |
//! | [`model`] | `DecoderLayer`, input capture, linear targets, ignore lists |
//! | [`devices`] | Accelerator discovery and layer placement |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Tensors go through `candle-core`/`candle-nn`;
//!    the factorisations run on the host in f64 with `rayon`.
//! 2. **One layer resident.** Only the embedding and the layer being
//!    calibrated are materialised; the rest of the checkpoint stays mapped.
//! 3. **Deterministic.** Same weights and calibration set give the same codes.

pub mod attention;
pub mod devices;
pub mod gptq;
pub mod linalg;
pub mod mlp;
pub mod model;
pub mod quantize;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use devices::{parse_nvidia_smi, probe_devices, DeviceInfo, DeviceMap, Placement};
pub use gptq::{GptqQuantizer, HessianAccumulator, QuantizedLinear};
pub use model::{
    embed_tokens, layer_prefix, load_embedding, DecoderLayer, IgnoreList, InputGroup,
    InputObserver, LinearTarget, NoObserver, RotaryTables,
};
pub use quantize::{pack_codes, unpack_codes, QuantArgs};
