use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use log::info;

use crate::document::Document;

/// Something that can produce a document for a collector key.
///
/// Shell scripts and compiled-in collectors both implement this; the
/// registry does not care which one it is calling.
///
/// CONTRACT:
/// - Must always return a document. Failures are reported through the
///   sentinel document (or the empty document for "no data"), never by
///   returning nothing.
#[async_trait::async_trait]
pub trait CollectorRun: Send + Sync {
    /// Runs the collector `key` with the arguments stored at registration
    /// (for shell collectors: the executable path).
    async fn run(&self, key: &str, args: &str) -> Document;
}

/// How to call one collector.
#[derive(Clone)]
pub struct CollectorDescriptor {
    pub runner: Arc<dyn CollectorRun>,
    pub args: String,
    /// `false` keeps the key known but suppressed.
    pub enabled: bool,
}

impl CollectorDescriptor {
    pub fn new(runner: Arc<dyn CollectorRun>, args: impl Into<String>, enabled: bool) -> Self {
        Self {
            runner,
            args: args.into(),
            enabled,
        }
    }
}

/// Collector key → descriptor.
///
/// Keys are case-sensitive and conventionally `category.name`.
/// Iteration order is irrelevant; see [`Registry::runnable`].
#[derive(Clone, Default)]
pub struct Registry {
    collectors: HashMap<String, CollectorDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces `key`.
    pub fn register(&mut self, key: impl Into<String>, descriptor: CollectorDescriptor) {
        self.collectors.insert(key.into(), descriptor);
    }

    /// Adds `key` only if it is not known yet. Returns whether it was added.
    pub fn register_if_absent(&mut self, key: &str, descriptor: CollectorDescriptor) -> bool {
        match self.collectors.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(descriptor);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&CollectorDescriptor> {
        self.collectors.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.collectors.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Combines two registries. `b` wins when both define a key.
    ///
    /// The argument order is the precedence policy: pass the source that
    /// should be overridable as `a`.
    pub fn merge(a: &Registry, b: &Registry) -> Registry {
        let mut merged = b.clone();
        for (key, descriptor) in &a.collectors {
            merged.register_if_absent(key, descriptor.clone());
        }
        merged
    }

    /// All enabled keys in execution order.
    ///
    /// `core.*` comes first so that `core.id` is always available before
    /// anything is pushed. See [`compare_keys`].
    pub fn runnable(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .collectors
            .iter()
            .filter(|(_, descriptor)| descriptor.enabled)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_by(|a, b| compare_keys(a, b));
        keys
    }

    /// Runs collector `key`.
    ///
    /// Unknown and disabled keys are logged and yield the empty document.
    pub async fn run(&self, key: &str) -> Document {
        match self.collectors.get(key) {
            Some(descriptor) if descriptor.enabled => {
                descriptor.runner.run(key, &descriptor.args).await
            }
            Some(_) => {
                info!("collector[{key}]: is disabled");
                Document::empty()
            }
            None => {
                info!("collector[{key}]: does not exist");
                Document::empty()
            }
        }
    }
}

/// Categories that run before all others, in this order.
const PRIORITY_CATEGORIES: [&str; 3] = ["core", "sys", "os"];

fn category_rank(category: &str) -> usize {
    match category {
        "core" => 0,
        "sys" => 1,
        "os" => 2,
        _ => PRIORITY_CATEGORIES.len(),
    }
}

/// Execution order of two collector keys.
///
/// - The category is the text before the first `.`.
/// - `core`, `sys`, `os` rank first, in that order; every other category
///   ranks after them. Equal ranks fall back to comparing the full keys.
/// - Keys without a `.` go after all keys that have one.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    match (a.split_once('.'), b.split_once('.')) {
        (Some((a_cat, _)), Some((b_cat, _))) => {
            if a_cat == b_cat {
                return a.cmp(b);
            }
            category_rank(a_cat)
                .cmp(&category_rank(b_cat))
                .then_with(|| a.cmp(b))
        }
        (None, None) => a.cmp(b),
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
    }
}
