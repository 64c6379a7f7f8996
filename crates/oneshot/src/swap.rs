//! Journaled promotion of the compressed checkpoint.
//!
//! End state: the original checkpoint under `model_original/`, the
//! compressed one under `model/`. Each step is recorded in a small journal
//! in the base directory so a crash between the two renames can be finished
//! by [`recover`] instead of leaving no canonical `model/`.
//!
//! | Step | Action | Journal afterwards |
//! |------|--------|--------------------|
//! | 1 | check `model/` and `compressed_model/` exist | none |
//! | 2 | write journal (temp file + rename) | `started` |
//! | 3 | remove stale `model_original/` | `started` |
//! | 4 | `model/` → `model_original/` | `original_moved` |
//! | 5 | `compressed_model/` → `model/` | removed |

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use squeeze_common::PathsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapPhase {
    Started,
    OriginalMoved,
}

#[derive(Debug, Serialize, Deserialize)]
struct Journal {
    phase: SwapPhase,
}

/// What [`recover`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No journal was present.
    Clean,
    /// The interrupted swap was finished.
    Completed,
    /// The swap had not touched `model/`; the journal was dropped.
    Abandoned,
}

/// Replace the journal atomically: write a sibling temp file, sync it, rename
/// it over the journal, then sync the directory.
fn write_journal(path: &Path, phase: SwapPhase) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file =
        File::create(&tmp).with_context(|| format!("create swap journal {}", tmp.display()))?;
    file.write_all(serde_json::to_string(&Journal { phase })?.as_bytes())?;
    file.sync_all()
        .with_context(|| format!("sync swap journal {}", tmp.display()))?;
    drop(file);
    rename(&tmp, path)?;
    sync_parent(path)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        File::open(dir)
            .and_then(|d| d.sync_all())
            .with_context(|| format!("sync directory {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}

/// `Ok(None)` when there is no journal; `Ok(Some(None))` when it exists but
/// cannot be parsed.
fn read_journal(path: &Path) -> Result<Option<Option<SwapPhase>>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read swap journal {}", path.display()))?;
    match serde_json::from_str::<Journal>(&raw) {
        Ok(journal) => Ok(Some(Some(journal.phase))),
        Err(e) => {
            tracing::warn!(journal = %path.display(), error = %e, "Unreadable swap journal");
            Ok(Some(None))
        }
    }
}

/// Phase implied by the directories alone.
fn infer_phase(model: &Path, compressed: &Path, original: &Path) -> SwapPhase {
    let second_rename_done = model.is_dir() && !compressed.exists() && original.is_dir();
    if !model.exists() || second_rename_done {
        SwapPhase::OriginalMoved
    } else {
        SwapPhase::Started
    }
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    std::fs::rename(from, to)
        .with_context(|| format!("rename {} to {}", from.display(), to.display()))
}

/// Move `model/` aside to `model_original/` and promote `compressed_model/`
/// to `model/`.
pub fn swap_directories(paths: &PathsConfig) -> Result<()> {
    let model = paths.model_path();
    let compressed = paths.compressed_path();
    let original = paths.original_path();
    let journal = paths.journal_path();

    if !model.is_dir() {
        bail!("model directory {} does not exist", model.display());
    }
    if !compressed.is_dir() {
        bail!("compressed directory {} does not exist", compressed.display());
    }
    if journal.exists() {
        bail!(
            "swap journal {} exists; run `squeeze recover` first",
            journal.display()
        );
    }

    write_journal(&journal, SwapPhase::Started)?;

    if original.exists() {
        tracing::info!(dir = %original.display(), "Removing stale backup");
        std::fs::remove_dir_all(&original)
            .with_context(|| format!("remove {}", original.display()))?;
    }

    rename(&model, &original)?;
    write_journal(&journal, SwapPhase::OriginalMoved)?;

    rename(&compressed, &model)?;
    std::fs::remove_file(&journal)
        .with_context(|| format!("remove swap journal {}", journal.display()))?;

    tracing::info!(
        model = %model.display(),
        backup = %original.display(),
        "Swapped compressed model into place"
    );
    Ok(())
}

/// Finish or abandon a swap interrupted by a crash.
pub fn recover(paths: &PathsConfig) -> Result<Recovery> {
    let journal = paths.journal_path();
    let Some(recorded) = read_journal(&journal)? else {
        return Ok(Recovery::Clean);
    };
    let model = paths.model_path();
    let compressed = paths.compressed_path();
    let original = paths.original_path();
    let phase = recorded.unwrap_or_else(|| infer_phase(&model, &compressed, &original));

    let outcome = match phase {
        SwapPhase::Started if model.is_dir() => Recovery::Abandoned,
        // Crashed after the first rename but before its journal update.
        SwapPhase::Started | SwapPhase::OriginalMoved
            if !model.exists() && original.is_dir() && compressed.is_dir() =>
        {
            rename(&compressed, &model)?;
            Recovery::Completed
        }
        // Second rename done, journal removal lost.
        SwapPhase::OriginalMoved if model.is_dir() && !compressed.exists() => Recovery::Completed,
        _ => bail!(
            "cannot recover swap in phase {phase:?}: model exists = {}, compressed exists = {}, \
             original exists = {}",
            model.exists(),
            compressed.exists(),
            original.exists()
        ),
    };

    std::fs::remove_file(&journal)
        .with_context(|| format!("remove swap journal {}", journal.display()))?;
    tracing::warn!(?phase, ?outcome, "Recovered interrupted swap");
    Ok(outcome)
}
