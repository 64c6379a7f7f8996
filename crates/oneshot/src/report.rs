//! Before/after size accounting.

use std::fmt;
use std::path::Path;

use anyhow::Result;

use squeeze_common::{directory_size, format_size};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeReport {
    pub original: u64,
    pub compressed: u64,
}

impl SizeReport {
    pub fn measure(original_dir: &Path, compressed_dir: &Path) -> Result<Self> {
        Ok(Self {
            original: directory_size(original_dir)?,
            compressed: directory_size(compressed_dir)?,
        })
    }

    /// Bytes saved; 0 when the output grew.
    pub fn reduction(&self) -> u64 {
        self.original.saturating_sub(self.compressed)
    }

    /// `original / compressed`; `None` for an empty output.
    pub fn ratio(&self) -> Option<f64> {
        (self.compressed > 0).then(|| self.original as f64 / self.compressed as f64)
    }
}

impl fmt::Display for SizeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Original model size: {}", format_size(self.original))?;
        writeln!(f, "Compressed model size: {}", format_size(self.compressed))?;
        writeln!(f, "Size reduction: {}", format_size(self.reduction()))?;
        match self.ratio() {
            Some(r) => write!(f, "Compression ratio: {r:.2}x"),
            None => write!(f, "Compression ratio: n/a (compressed output is empty)"),
        }
    }
}
