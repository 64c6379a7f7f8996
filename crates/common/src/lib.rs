//! # squeeze-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`CompressConfig`]** — run configuration (paths, devices, calibration,
//!   recipe, save), serialised as JSON.
//! * **[`CalibrationSource`]** / **[`CalibrationSet`]** — calibration data
//!   loading and tokenisation.
//! * **[`DecoderConfig`]** — decoder hyper-parameters from `config.json`.
//! * **[`ChatTemplate`]** — Jinja chat templates from `tokenizer_config.json`.
//! * **[`fsutil`]** — directory sizes and human-readable formatting.

pub mod config;
pub mod data;
pub mod fsutil;
pub mod model_config;
pub mod template;

pub use config::{
    parse_byte_size, CalibrationConfig, CompressConfig, DeviceConfig, PathsConfig, QuantRecipe,
    QuantScheme, SaveConfig,
};
pub use data::{
    load_tokenizer, shuffle_conversations, CalibrationSet, CalibrationSource, ChatMessage,
    Conversation,
};
pub use fsutil::{directory_size, format_size, list_dir};
pub use model_config::{DecoderConfig, RopeScaling};
pub use template::ChatTemplate;
