//! Calibration data: conversations in, token id sequences out.
//!
//! Two sources:
//!
//! * **Hub** — the parquet shards of a dataset split, fetched with `hf-hub`,
//!   read in shard order until `n` rows are collected (the equivalent of
//!   `split[:n]`). Only the `messages` column is used.
//! * **Local JSONL** — one conversation per line, either `{"messages": [...]}`,
//!   `{"text": ...}`, or `{"input": ..., "output": ...}`; plain text lines are
//!   taken as a single user turn.
//!
//! Conversations are shuffled with a fixed seed, rendered through the chat
//! template, and tokenised without special tokens, truncated, unpadded.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use arrow::array::{Array, ListArray, StringArray, StructArray};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::template::ChatTemplate;

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

pub type Conversation = Vec<ChatMessage>;

// ── Sources ─────────────────────────────────────────────────────────────────

/// Where calibration conversations come from.
#[derive(Debug, Clone)]
pub enum CalibrationSource {
    Hub { dataset_id: String, split: String },
    Jsonl(PathBuf),
}

impl CalibrationSource {
    /// Load the first `n` conversations.
    pub fn load(&self, n: usize) -> Result<Vec<Conversation>> {
        let conversations = match self {
            Self::Hub { dataset_id, split } => load_hub_split(dataset_id, split, n)?,
            Self::Jsonl(path) => load_jsonl(path, n)?,
        };
        if conversations.is_empty() {
            bail!("calibration source {self:?} produced no conversations");
        }
        if conversations.len() < n {
            tracing::warn!(
                requested = n,
                loaded = conversations.len(),
                "Calibration source has fewer rows than requested"
            );
        }
        Ok(conversations)
    }
}

/// Download parquet shards for `split` in order until `n` rows are read.
fn load_hub_split(dataset_id: &str, split: &str, n: usize) -> Result<Vec<Conversation>> {
    let api = hf_hub::api::sync::ApiBuilder::new()
        .with_token(std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty()))
        .build()
        .context("initialise Hub API")?;
    let repo = api.dataset(dataset_id.to_string());
    let info = repo
        .info()
        .with_context(|| format!("fetch dataset info for {dataset_id}"))?;
    let files: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();
    let shards = split_shards(&files, split);
    if shards.is_empty() {
        bail!("dataset {dataset_id} has no parquet shards for split {split:?}");
    }

    let mut out = Vec::with_capacity(n);
    for shard in shards {
        if out.len() >= n {
            break;
        }
        tracing::info!(shard = %shard, "Downloading calibration shard");
        let local = repo
            .get(&shard)
            .with_context(|| format!("download {dataset_id}/{shard}"))?;
        read_parquet_messages(&local, n - out.len(), &mut out)?;
    }
    Ok(out)
}

/// Parquet shards belonging to `split`, sorted by name.
///
/// Matches the hub layouts `data/{split}-00000-of-00003-*.parquet` and
/// `{split}/0000.parquet`.
pub fn split_shards(files: &[String], split: &str) -> Vec<String> {
    let flat_prefix = format!("{split}-");
    let dir_prefix = format!("{split}/");
    let mut shards: Vec<String> = files
        .iter()
        .filter(|f| f.ends_with(".parquet"))
        .filter(|f| {
            let name = f.rsplit('/').next().unwrap_or(f);
            name.starts_with(&flat_prefix) || f.contains(&dir_prefix)
        })
        .cloned()
        .collect();
    shards.sort();
    shards
}

/// Append up to `limit` conversations from the `messages` column.
fn read_parquet_messages(path: &Path, limit: usize, out: &mut Vec<Conversation>) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(256)
        .build()?;
    let mut taken = 0usize;
    for batch in reader {
        let batch = batch?;
        let column = batch
            .column_by_name("messages")
            .context("parquet shard has no `messages` column")?;
        let lists = column
            .as_any()
            .downcast_ref::<ListArray>()
            .context("`messages` is not a list column")?;
        for row in 0..lists.len() {
            if taken >= limit {
                return Ok(());
            }
            if lists.is_null(row) {
                continue;
            }
            out.push(messages_from_struct(lists.value(row).as_ref())?);
            taken += 1;
        }
    }
    Ok(())
}

fn messages_from_struct(array: &dyn Array) -> Result<Conversation> {
    let turns = array
        .as_any()
        .downcast_ref::<StructArray>()
        .context("`messages` items are not structs")?;
    let roles = string_field(turns, "role")?;
    let contents = string_field(turns, "content")?;
    Ok((0..turns.len())
        .map(|i| ChatMessage::new(roles.value(i), contents.value(i)))
        .collect())
}

fn string_field<'a>(turns: &'a StructArray, name: &str) -> Result<&'a StringArray> {
    turns
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .with_context(|| format!("`messages` items have no string `{name}` field"))
}

/// Read up to `n` conversations from a JSONL (or plain text) file.
pub fn load_jsonl(path: &Path, n: usize) -> Result<Vec<Conversation>> {
    let reader = BufReader::new(File::open(path).with_context(|| format!("open {}", path.display()))?);
    let mut out = Vec::with_capacity(n);
    for line in reader.lines() {
        if out.len() >= n {
            break;
        }
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.push(conversation_from_line(line));
    }
    Ok(out)
}

/// Interpret one line as a conversation.
fn conversation_from_line(line: &str) -> Conversation {
    if line.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(msgs) = v.get("messages") {
                if let Ok(msgs) = serde_json::from_value::<Conversation>(msgs.clone()) {
                    return msgs;
                }
            }
            if let Some(t) = v.get("text").and_then(|t| t.as_str()) {
                return vec![ChatMessage::new("user", t)];
            }
            if let (Some(inp), Some(out)) = (
                v.get("input").and_then(|x| x.as_str()),
                v.get("output").and_then(|x| x.as_str()),
            ) {
                return vec![
                    ChatMessage::new("user", inp),
                    ChatMessage::new("assistant", out),
                ];
            }
        }
    }
    vec![ChatMessage::new("user", line)]
}

/// Deterministic shuffle.
pub fn shuffle_conversations(conversations: &mut [Conversation], seed: u64) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    conversations.shuffle(&mut rng);
}

// ── CalibrationSet ──────────────────────────────────────────────────────────

/// Tokenised calibration samples, one unpadded id sequence each.
#[derive(Debug, Clone, Default)]
pub struct CalibrationSet {
    samples: Vec<Vec<u32>>,
}

impl CalibrationSet {
    pub fn from_samples(samples: Vec<Vec<u32>>) -> Self {
        Self { samples }
    }

    /// Render each conversation and tokenise it.
    ///
    /// Special tokens are not added (the template already emits them) and
    /// each sample is cut at `max_seq_len`. Padding and truncation settings
    /// shipped in `tokenizer.json` are ignored. Empty renders are dropped.
    pub fn build(
        conversations: &[Conversation],
        template: &ChatTemplate,
        tokenizer: &Tokenizer,
        max_seq_len: usize,
    ) -> Result<Self> {
        let mut tokenizer = tokenizer.clone();
        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(None)
            .map_err(|e| anyhow::anyhow!("reset tokenizer truncation: {e}"))?;

        let mut samples = Vec::with_capacity(conversations.len());
        for convo in conversations {
            let text = template.render(convo, false)?;
            let enc = tokenizer
                .encode(text.as_str(), false)
                .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
            let ids = truncate_ids(enc.get_ids(), max_seq_len);
            if !ids.is_empty() {
                samples.push(ids);
            }
        }
        Ok(Self { samples })
    }

    pub fn samples(&self) -> &[Vec<u32>] {
        &self.samples
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.samples.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn truncate_ids(ids: &[u32], max_len: usize) -> Vec<u32> {
    ids[..ids.len().min(max_len)].to_vec()
}

/// Load `tokenizer.json` from a model directory.
pub fn load_tokenizer(model_dir: &Path) -> Result<Tokenizer> {
    let path = model_dir.join("tokenizer.json");
    Tokenizer::from_file(&path).map_err(|e| anyhow::anyhow!("load tokenizer {}: {e}", path.display()))
}
