//! # squeeze-export — Checkpoint I/O
//!
//! * [`checkpoint`] — memory-mapped view of the input safetensors checkpoint.
//! * [`compressed`] — `compressed-tensors` pack-quantized tensors and config.
//! * [`writer`] — sharded safetensors output with an index.
//! * [`tokenizer`] — tokenizer artefacts copied next to the weights.

pub mod checkpoint;
pub mod compressed;
pub mod tokenizer;
pub mod writer;

pub use checkpoint::{parse_torch_dtype, Checkpoint};
pub use compressed::{encode_linear, quantization_config, scale_dtype, write_config};
pub use tokenizer::copy_tokenizer_files;
pub use writer::{plan_shards, write_sharded, OutputTensor, WrittenShards};
