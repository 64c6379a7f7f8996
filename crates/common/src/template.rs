//! Chat template rendering.
//!
//! Templates come from `tokenizer_config.json` (`chat_template`) and are
//! rendered with Jinja semantics through `minijinja`, using the same block
//! trimming as the Python tokenizers. Python string and dict methods
//! (`.strip()`, `.startswith()`, `.items()`, ...) resolve through
//! `minijinja-contrib`'s pycompat layer. Models without a template fall back to
//! ChatML.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{context, Environment, Error, ErrorKind};
use serde_json::Value;

use crate::data::ChatMessage;

const CHATML_TEMPLATE: &str = "{% for message in messages %}\
<|im_start|>{{ message.role }}\n{{ message.content }}<|im_end|>\n\
{% endfor %}\
{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

/// A chat template plus the special tokens it may refer to.
pub struct ChatTemplate {
    env: Environment<'static>,
    source: String,
    bos_token: String,
    eos_token: String,
}

impl ChatTemplate {
    pub fn new(source: impl Into<String>, bos_token: &str, eos_token: &str) -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
        env.add_function("raise_exception", |msg: String| -> Result<String, Error> {
            Err(Error::new(ErrorKind::InvalidOperation, msg))
        });
        Self {
            env,
            source: source.into(),
            bos_token: bos_token.to_string(),
            eos_token: eos_token.to_string(),
        }
    }

    /// ChatML, used when the tokenizer ships no template.
    pub fn chatml() -> Self {
        Self::new(CHATML_TEMPLATE, "", "<|im_end|>")
    }

    /// Read `chat_template` and special tokens from `tokenizer_config.json`.
    ///
    /// A standalone `chat_template.jinja` takes precedence over the config
    /// entry.
    pub fn from_tokenizer_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join("tokenizer_config.json");
        let config: Value = if config_path.exists() {
            let text = std::fs::read_to_string(&config_path)
                .with_context(|| format!("read {}", config_path.display()))?;
            serde_json::from_str(&text).context("parse tokenizer_config.json")?
        } else {
            Value::Null
        };
        let bos = special_token(&config, "bos_token").unwrap_or_default();
        let eos = special_token(&config, "eos_token").unwrap_or_default();

        let jinja_path = dir.join("chat_template.jinja");
        let source = if jinja_path.exists() {
            Some(std::fs::read_to_string(&jinja_path)?)
        } else {
            template_source(&config)
        };
        match source {
            Some(src) => Ok(Self::new(src, &bos, &eos)),
            None => {
                tracing::warn!("No chat template in {}, using ChatML", dir.display());
                Ok(Self::chatml())
            }
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render a conversation to text.
    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        let text = self
            .env
            .render_str(
                &self.source,
                context! {
                    messages => messages,
                    bos_token => &self.bos_token,
                    eos_token => &self.eos_token,
                    add_generation_prompt => add_generation_prompt,
                },
            )
            .context("render chat template")?;
        Ok(text)
    }
}

/// `chat_template` is either a string or a list of `{name, template}`.
fn template_source(config: &Value) -> Option<String> {
    match config.get("chat_template")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let named = |name: &str| {
                items.iter().find_map(|item| {
                    (item.get("name")?.as_str()? == name)
                        .then(|| item.get("template")?.as_str().map(str::to_string))
                        .flatten()
                })
            };
            named("default").or_else(|| {
                items
                    .first()
                    .and_then(|item| item.get("template")?.as_str().map(str::to_string))
            })
        }
        _ => None,
    }
}

/// Special tokens are stored as a bare string or as `{ "content": ... }`.
fn special_token(config: &Value, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}
