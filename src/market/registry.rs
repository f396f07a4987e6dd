//! Copy-on-write registry of live markets.
//!
//! One writer (the discovery loop) replaces the whole set; readers take an
//! `Arc` snapshot and iterate it without holding the lock, so a tick never
//! observes a half-written set.

use crate::market::Market;
use alloy::primitives::B256;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Question ids that entered or left the live set on a `replace_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    pub added: Vec<B256>,
    pub removed: Vec<B256>,
}

#[derive(Clone, Default)]
pub struct MarketRegistry {
    live: Arc<RwLock<Arc<Vec<Market>>>>,
}

impl MarketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a new live set. Later duplicates of a question id are dropped.
    pub fn replace_all(&self, markets: Vec<Market>) -> RegistryDiff {
        let mut seen = HashSet::with_capacity(markets.len());
        let next: Vec<Market> = markets
            .into_iter()
            .filter(|m| {
                let fresh = seen.insert(m.question_id);
                if !fresh {
                    debug!(question_id = %m.question_id, slug = %m.slug, "duplicate question id dropped");
                }
                fresh
            })
            .collect();

        let next = Arc::new(next);
        let previous = {
            let mut guard = self.live.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, next.clone())
        };

        let before: HashSet<B256> = previous.iter().map(|m| m.question_id).collect();
        RegistryDiff {
            added: next
                .iter()
                .map(|m| m.question_id)
                .filter(|q| !before.contains(q))
                .collect(),
            removed: previous
                .iter()
                .map(|m| m.question_id)
                .filter(|q| !seen.contains(q))
                .collect(),
        }
    }

    /// Point-in-time view, in the order the feed supplied it.
    pub fn snapshot(&self) -> Arc<Vec<Market>> {
        self.live.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, question_id: &B256) -> Option<Market> {
        self.snapshot()
            .iter()
            .find(|m| &m.question_id == question_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
