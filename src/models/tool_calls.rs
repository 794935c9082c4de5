//! Reassembly of tool calls that providers stream in fragments.
//!
//! Providers correlate fragments differently: Anthropic and OpenAI tag them
//! with a positional index, Gemini sends whole calls that we key by their
//! position in the response. The accumulator is generic over that key so
//! every adapter shares one accumulate-then-emit-once path, and callers
//! never see partial argument JSON.

use std::collections::BTreeMap;

use tracing::warn;
use uuid::Uuid;

use crate::models::provider::ToolCall;

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug)]
pub struct ToolCallAccumulator<K: Ord> {
    pending: BTreeMap<K, PartialToolCall>,
}

impl<K: Ord> Default for ToolCallAccumulator<K> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl<K: Ord> ToolCallAccumulator<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one fragment into the call identified by `key`. Id and name are
    /// taken from the first fragment that carries them.
    pub fn push_fragment(&mut self, key: K, id: Option<&str>, name: Option<&str>, arguments: &str) {
        let partial = self.pending.entry(key).or_default();
        if partial.id.is_none() {
            partial.id = id.filter(|s| !s.is_empty()).map(str::to_string);
        }
        if partial.name.is_none() {
            partial.name = name.filter(|s| !s.is_empty()).map(str::to_string);
        }
        partial.arguments.push_str(arguments);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Removes and finalizes a single call.
    pub fn complete(&mut self, key: &K) -> Option<ToolCall> {
        self.pending.remove(key).and_then(finalize)
    }

    /// Removes and finalizes every pending call, ordered by key.
    pub fn drain(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.pending)
            .into_values()
            .filter_map(finalize)
            .collect()
    }
}

fn finalize(partial: PartialToolCall) -> Option<ToolCall> {
    let Some(name) = partial.name else {
        warn!("Dropping tool call fragments that never carried a function name");
        return None;
    };

    let arguments_json = if partial.arguments.trim().is_empty() {
        "{}".to_string()
    } else {
        partial.arguments
    };

    Some(ToolCall {
        id: partial.id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
        name,
        arguments_json,
    })
}
