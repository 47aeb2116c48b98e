//! Compiled-in collectors.
//!
//! Builtins are listed once in [`registrations`]; the application calls it
//! at start-up and merges the result with the shell collectors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;
use serde_json::{Map, Value};

use crate::collector::registry::{CollectorDescriptor, CollectorRun, Registry};
use crate::document::Document;

pub const CORE_META_JS_PATH: &str = "/var/lib/gocollect/core.meta.js";
pub const CORE_META_DIR: &str = "/etc/gocollect/core.meta";

/// Every builtin collector with its default enabled flag.
pub fn registrations() -> Registry {
    let mut builtins = Registry::new();
    builtins.register(
        "core.meta",
        CollectorDescriptor::new(Arc::new(CoreMeta::default()), "", true),
    );
    builtins
}

/// Host metadata maintained by the operator.
///
/// Sources, first match wins:
/// 1. a single JSON file (older installs),
/// 2. a directory of `*.yaml` fragments, merged into one object keyed by
///    file name without `.yaml`.
///
/// Neither present means no data.
#[derive(Debug, Clone)]
pub struct CoreMeta {
    pub js_path: PathBuf,
    pub fragment_dir: PathBuf,
}

impl Default for CoreMeta {
    fn default() -> Self {
        Self {
            js_path: PathBuf::from(CORE_META_JS_PATH),
            fragment_dir: PathBuf::from(CORE_META_DIR),
        }
    }
}

impl CoreMeta {
    async fn from_js_file(&self) -> Option<Document> {
        // absent file is the normal case, stay quiet
        let data = tokio::fs::read(&self.js_path).await.ok()?;
        match Document::new(&data) {
            Ok(document) => Some(document),
            Err(e) => {
                warn!("collector[core.meta]: {}: {e}", self.js_path.display());
                None
            }
        }
    }

    async fn from_fragments(&self) -> Option<Document> {
        let fragments = read_fragments(&self.fragment_dir).await?;

        let mut merged = Map::new();
        for (name, text) in fragments {
            match serde_yaml::from_str::<Value>(&text) {
                Ok(value) => {
                    merged.insert(name, value);
                }
                Err(e) => warn!("collector[core.meta]: yaml: {name}.yaml: {e}"),
            }
        }

        let encoded = match serde_json::to_vec(&Value::Object(merged)) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("collector[core.meta]: json: {e}");
                return None;
            }
        };
        Document::new(&encoded).ok()
    }
}

#[async_trait::async_trait]
impl CollectorRun for CoreMeta {
    async fn run(&self, _key: &str, _args: &str) -> Document {
        if let Some(document) = self.from_js_file().await {
            return document;
        }
        if let Some(document) = self.from_fragments().await {
            return document;
        }
        Document::empty()
    }
}

/// Reads `<dir>/*.yaml`, skipping hidden files, sorted by name.
/// Returns `None` when `dir` cannot be listed.
async fn read_fragments(dir: &Path) -> Option<Vec<(String, String)>> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;

    let mut fragments = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let Some(stem) = name.strip_suffix(".yaml") else {
            continue;
        };
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(true) {
            continue;
        }

        let path = entry.path();
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => fragments.push((stem.to_string(), text)),
            Err(e) => warn!("collector[core.meta]: {}: {e}", path.display()),
        }
    }

    fragments.sort_by(|a, b| a.0.cmp(&b.0));
    Some(fragments)
}
