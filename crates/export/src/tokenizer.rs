//! Tokenizer and generation-config files travel unchanged next to the weights.

use std::path::Path;

use anyhow::{Context, Result};

pub const TOKENIZER_FILES: &[&str] = &[
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
    "vocab.json",
    "merges.txt",
    "added_tokens.json",
    "chat_template.jinja",
    "generation_config.json",
];

/// Copy every tokenizer artefact present in `src` into `dst`. Returns the
/// names copied.
pub fn copy_tokenizer_files(src: &Path, dst: &Path) -> Result<Vec<&'static str>> {
    std::fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    let mut copied = Vec::new();
    for &name in TOKENIZER_FILES {
        let from = src.join(name);
        if !from.is_file() {
            continue;
        }
        std::fs::copy(&from, dst.join(name))
            .with_context(|| format!("copy {} to {}", from.display(), dst.display()))?;
        copied.push(name);
    }
    if !copied.contains(&"tokenizer.json") {
        tracing::warn!(src = %src.display(), "No tokenizer.json found; output may not load");
    }
    tracing::debug!(files = ?copied, "Copied tokenizer files");
    Ok(copied)
}
