//! Layered context store: the immediate, summarized and persistent tiers of
//! one session.
//!
//! Each layer keeps its token count equal to the sum of its entries' counts;
//! every mutating method recomputes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::BudgetShares;
use crate::error::WindlassError;
use crate::message::ContextMessage;
use crate::tokens::TokenEstimator;

/// The three tiers of a context window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// Raw recent turns
    Immediate,
    /// Compressed history
    Summarized,
    /// Long-lived facts and preferences; only explicit caller action changes it
    Persistent,
}

impl LayerKind {
    /// Layers in context order: persistent first, immediate last
    pub const CONTEXT_ORDER: [LayerKind; 3] = [
        LayerKind::Persistent,
        LayerKind::Summarized,
        LayerKind::Immediate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Immediate => "immediate",
            LayerKind::Summarized => "summarized",
            LayerKind::Persistent => "persistent",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerKind {
    type Err = WindlassError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "immediate" => Ok(LayerKind::Immediate),
            "summarized" => Ok(LayerKind::Summarized),
            "persistent" => Ok(LayerKind::Persistent),
            other => Err(WindlassError::Validation(format!("unknown layer: {}", other))),
        }
    }
}

/// Token budget split across layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenBudget {
    pub total: usize,
    pub immediate: usize,
    pub summarized: usize,
    pub persistent: usize,
}

impl TokenBudget {
    /// Split `total` by the configured shares (rounded down)
    pub fn from_shares(total: usize, shares: &BudgetShares) -> Self {
        let part = |share: f64| ((total as f64) * share).floor() as usize;
        Self {
            total,
            immediate: part(shares.immediate),
            summarized: part(shares.summarized),
            persistent: part(shares.persistent),
        }
    }

    /// Allowance for one layer
    pub fn for_layer(&self, kind: LayerKind) -> usize {
        match kind {
            LayerKind::Immediate => self.immediate,
            LayerKind::Summarized => self.summarized,
            LayerKind::Persistent => self.persistent,
        }
    }
}

/// One tier of the context window
#[derive(Debug, Clone)]
pub struct ContextLayer {
    kind: LayerKind,
    entries: Vec<ContextMessage>,
    token_count: usize,
    last_updated: DateTime<Utc>,
}

impl ContextLayer {
    pub fn new(kind: LayerKind, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            token_count: 0,
            last_updated: now,
        }
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Entries in chronological order
    pub fn entries(&self) -> &[ContextMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the entries' token counts
    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Append an entry, estimating its tokens if unknown
    pub fn push(&mut self, entry: ContextMessage, now: DateTime<Utc>) {
        self.entries.push(Self::sized(entry));
        self.touch(now);
    }

    /// Append several entries
    pub fn extend<I>(&mut self, entries: I, now: DateTime<Utc>)
    where
        I: IntoIterator<Item = ContextMessage>,
    {
        self.entries.extend(entries.into_iter().map(Self::sized));
        self.touch(now);
    }

    /// Remove the entry at `index`
    pub fn remove(&mut self, index: usize, now: DateTime<Utc>) -> Option<ContextMessage> {
        if index >= self.entries.len() {
            return None;
        }
        let removed = self.entries.remove(index);
        self.touch(now);
        Some(removed)
    }

    /// Remove the entry with the given id
    pub fn remove_by_id(&mut self, id: &str, now: DateTime<Utc>) -> Option<ContextMessage> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        self.remove(index, now)
    }

    /// Replace every entry
    pub fn replace(&mut self, entries: Vec<ContextMessage>, now: DateTime<Utc>) {
        self.entries = entries.into_iter().map(Self::sized).collect();
        self.touch(now);
    }

    /// Remove and return every entry
    pub fn take(&mut self, now: DateTime<Utc>) -> Vec<ContextMessage> {
        let taken = std::mem::take(&mut self.entries);
        self.touch(now);
        taken
    }

    pub fn clear(&mut self, now: DateTime<Utc>) {
        self.entries.clear();
        self.touch(now);
    }

    fn sized(mut entry: ContextMessage) -> ContextMessage {
        if entry.token_count == 0 {
            entry.token_count = TokenEstimator::new().estimate(&entry.content);
        }
        entry
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.token_count = self.entries.iter().map(|e| e.token_count).sum();
        self.last_updated = now;
    }
}

/// Usage of one layer against its budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerUsage {
    pub layer: LayerKind,
    pub entries: usize,
    pub tokens: usize,
    pub budget: usize,
    /// tokens / budget, as a percentage
    pub utilization: f64,
}

/// The three layers of one session
#[derive(Debug, Clone)]
pub struct LayeredContext {
    immediate: ContextLayer,
    summarized: ContextLayer,
    persistent: ContextLayer,
}

impl LayeredContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            immediate: ContextLayer::new(LayerKind::Immediate, now),
            summarized: ContextLayer::new(LayerKind::Summarized, now),
            persistent: ContextLayer::new(LayerKind::Persistent, now),
        }
    }

    /// Rebuild from tagged entries, keeping their relative order per layer
    pub fn from_entries<I>(entries: I, now: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = (LayerKind, ContextMessage)>,
    {
        let mut context = Self::new(now);
        let (mut immediate, mut summarized, mut persistent) = (Vec::new(), Vec::new(), Vec::new());
        for (kind, entry) in entries {
            match kind {
                LayerKind::Immediate => immediate.push(entry),
                LayerKind::Summarized => summarized.push(entry),
                LayerKind::Persistent => persistent.push(entry),
            }
        }
        context.immediate.replace(immediate, now);
        context.summarized.replace(summarized, now);
        context.persistent.replace(persistent, now);
        context
    }

    pub fn layer(&self, kind: LayerKind) -> &ContextLayer {
        match kind {
            LayerKind::Immediate => &self.immediate,
            LayerKind::Summarized => &self.summarized,
            LayerKind::Persistent => &self.persistent,
        }
    }

    pub fn layer_mut(&mut self, kind: LayerKind) -> &mut ContextLayer {
        match kind {
            LayerKind::Immediate => &mut self.immediate,
            LayerKind::Summarized => &mut self.summarized,
            LayerKind::Persistent => &mut self.persistent,
        }
    }

    pub fn immediate(&self) -> &ContextLayer {
        &self.immediate
    }

    pub fn summarized(&self) -> &ContextLayer {
        &self.summarized
    }

    pub fn persistent(&self) -> &ContextLayer {
        &self.persistent
    }

    pub fn immediate_mut(&mut self) -> &mut ContextLayer {
        &mut self.immediate
    }

    pub fn summarized_mut(&mut self) -> &mut ContextLayer {
        &mut self.summarized
    }

    /// Tokens across all layers
    pub fn total_tokens(&self) -> usize {
        self.immediate.token_count() + self.summarized.token_count() + self.persistent.token_count()
    }

    /// Entries across all layers
    pub fn message_count(&self) -> usize {
        self.immediate.len() + self.summarized.len() + self.persistent.len()
    }

    /// Every entry tagged with its layer, in context order
    pub fn tagged_entries(&self) -> impl Iterator<Item = (LayerKind, &ContextMessage)> {
        LayerKind::CONTEXT_ORDER
            .into_iter()
            .flat_map(move |kind| self.layer(kind).entries().iter().map(move |e| (kind, e)))
    }

    /// Every entry in context order: persistent, summarized, immediate
    pub fn messages(&self) -> Vec<ContextMessage> {
        self.tagged_entries().map(|(_, e)| e.clone()).collect()
    }

    /// Per-layer usage against `budget`
    pub fn usage(&self, budget: &TokenBudget) -> Vec<LayerUsage> {
        LayerKind::CONTEXT_ORDER
            .into_iter()
            .map(|kind| {
                let layer = self.layer(kind);
                let allowance = budget.for_layer(kind);
                LayerUsage {
                    layer: kind,
                    entries: layer.len(),
                    tokens: layer.token_count(),
                    budget: allowance,
                    utilization: if allowance == 0 {
                        0.0
                    } else {
                        layer.token_count() as f64 / allowance as f64 * 100.0
                    },
                }
            })
            .collect()
    }

    pub fn clear(&mut self, now: DateTime<Utc>) {
        self.immediate.clear(now);
        self.summarized.clear(now);
        self.persistent.clear(now);
    }
}
