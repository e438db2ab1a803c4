//! Subscription configurations and the per-item value cache.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::stream::delta::{decode_field, FieldValue, RawUpdate};
use crate::stream::proto::SubscriptionMode;
use crate::stream::StreamError;

/// Locally assigned table id. Ids start at 1 and follow registration order.
pub type SubscriptionId = u32;

/// Decoded field values for one item, keyed by field name in schema order.
pub type ItemValues = IndexMap<String, FieldValue>;

/// What to subscribe to: push mode, ordered fields and ordered items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub mode: SubscriptionMode,
    /// Field names in schema order; defines the column order of data lines.
    pub fields: Vec<String>,
    /// Item identifiers; position `n` in data lines refers to `items[n - 1]`.
    pub items: Vec<String>,
}

impl SubscriptionConfig {
    pub fn new<F, I>(mode: SubscriptionMode, fields: F, items: I) -> Self
    where
        F: IntoIterator,
        F::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            mode,
            fields: fields.into_iter().map(Into::into).collect(),
            items: items.into_iter().map(Into::into).collect(),
        }
    }
}

/// One decoded update, handed to the registered handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub subscription_id: SubscriptionId,
    pub item_name: String,
    /// Full field map after merging the delta with the cached values.
    pub values: ItemValues,
}

#[derive(Debug)]
struct SubscriptionEntry {
    id: SubscriptionId,
    config: Arc<SubscriptionConfig>,
    items: HashMap<usize, ItemValues>,
}

/// Holds registered subscriptions in registration order.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    next_id: SubscriptionId,
    entries: Vec<SubscriptionEntry>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, config: SubscriptionConfig) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(SubscriptionEntry {
            id,
            config: Arc::new(config),
            items: HashMap::new(),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn config(&self, id: SubscriptionId) -> Option<&SubscriptionConfig> {
        self.entry(id).map(|entry| entry.config.as_ref())
    }

    /// Configurations in registration order, shareable with the subscribe task.
    pub fn snapshot(&self) -> Vec<(SubscriptionId, Arc<SubscriptionConfig>)> {
        self.entries
            .iter()
            .map(|entry| (entry.id, Arc::clone(&entry.config)))
            .collect()
    }

    /// Cached values for an item position, if any update has been seen.
    pub fn cached(&self, id: SubscriptionId, item_pos: usize) -> Option<&ItemValues> {
        self.entry(id)?.items.get(&item_pos)
    }

    /// Decodes a raw update against the cached values for its item, stores
    /// the merged result and returns it.
    ///
    /// Nothing is cached when the line is rejected.
    pub fn record_update(&mut self, raw: &RawUpdate<'_>) -> Result<Update, StreamError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.id == raw.subscription_id)
            .ok_or_else(|| {
                StreamError::Protocol(format!(
                    "update for unknown subscription {}",
                    raw.subscription_id
                ))
            })?;

        let config = &entry.config;
        let item_name = config
            .items
            .get(raw.item_pos.wrapping_sub(1))
            .cloned()
            .ok_or_else(|| {
                StreamError::Protocol(format!(
                    "item position {} out of range for subscription {} ({} items)",
                    raw.item_pos,
                    entry.id,
                    config.items.len()
                ))
            })?;

        if raw.fields.len() != config.fields.len() {
            return Err(StreamError::Protocol(format!(
                "subscription {} expects {} fields, data line carried {}",
                entry.id,
                config.fields.len(),
                raw.fields.len()
            )));
        }

        let previous = entry.items.get(&raw.item_pos);
        let values: ItemValues = config
            .fields
            .iter()
            .zip(&raw.fields)
            .map(|(field, value)| {
                let last = previous.and_then(|values| values.get(field));
                (field.clone(), decode_field(value, last))
            })
            .collect();

        entry.items.insert(raw.item_pos, values.clone());

        Ok(Update {
            subscription_id: entry.id,
            item_name,
            values,
        })
    }

    /// Forgets every cached item value. Configurations are kept.
    pub fn reset_all(&mut self) {
        for entry in &mut self.entries {
            entry.items.clear();
        }
    }

    fn entry(&self, id: SubscriptionId) -> Option<&SubscriptionEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }
}
