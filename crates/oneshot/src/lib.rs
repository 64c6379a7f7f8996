//! # squeeze-oneshot — The Compression Run
//!
//! * [`compressor`] — sequential layer-wise GPTQ calibration and save.
//! * [`report`] — before/after directory sizes and compression ratio.
//! * [`swap`] — journaled promotion of the compressed checkpoint, with crash
//!   recovery.

pub mod compressor;
pub mod report;
pub mod swap;

pub use compressor::{CompressionOutcome, Compressor, SavedModel};
pub use report::SizeReport;
pub use swap::{recover, swap_directories, Recovery, SwapPhase};
