//! Version tracker and streaming set.
//!
//! Both are derived views of the message store and are rebuilt wholesale after
//! every reconciliation pass, never patched in place.
use std::collections::{HashMap, HashSet};

use crate::message::ChatMessage;

/// Freshness proxy for one version of a message.
pub type Version = i64;

/// `len(text) + len(subtype)`. Cheap and only roughly ordered: a strictly
/// longer version is never older, but equal lengths say nothing.
pub fn version_of(message: &ChatMessage) -> Version {
    (message.text.len() + message.subtype.len()) as Version
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionIndex {
    versions: HashMap<i64, Version>,
    streaming: HashSet<i64>,
}

impl VersionIndex {
    pub fn from_messages(messages: &[ChatMessage]) -> Self {
        let mut index = Self::default();
        for message in messages {
            index.record(message.ts, message);
        }
        index
    }

    /// Record the accepted version of `ts` and return it.
    pub fn record(&mut self, ts: i64, message: &ChatMessage) -> Version {
        let version = version_of(message);
        self.versions.insert(ts, version);
        if message.partial {
            self.streaming.insert(ts);
        } else {
            self.streaming.remove(&ts);
        }
        version
    }

    pub fn version(&self, ts: i64) -> Option<Version> {
        self.versions.get(&ts).copied()
    }

    pub fn is_streaming(&self, ts: i64) -> bool {
        self.streaming.contains(&ts)
    }

    /// Streaming ids in ascending order.
    pub fn streaming(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.streaming.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
