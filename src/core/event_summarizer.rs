// src/core/event_summarizer.rs

//! Deduplicates recurring human-visible messages by key, with time-window
//! suppression, and aggregates repeated counts into one flushed line.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One accumulated, not-yet-flushed message.
struct Accumulated {
    template: String,
    quantity: i64,
    aggregate_fn: fn(i64, i64) -> i64,
}

fn add_i64(a: i64, b: i64) -> i64 {
    a + b
}

/// Deduplicates recurring messages by key with time-window suppression;
/// aggregates counts (component A of the spec).
pub struct EventSummarizer {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Keyed by template string; grouped messages combine their quantities.
    accumulators: HashMap<String, Accumulated>,
    /// Insertion order of accumulator keys, so a flush preserves tick order.
    order: Vec<String>,
    /// `add_once_per_interval` suppression state, keyed by caller-supplied key.
    last_emitted_at: HashMap<String, Instant>,
    /// Disambiguates successive `add_once_per_interval` accumulator keys so
    /// two gated emissions of the same message don't collapse into one slot.
    next_once_id: u64,
}

impl Default for EventSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSummarizer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Groups messages that share `template`, combining their `quantity` via
    /// `aggregate_fn` (default integer add). Formatted once per flush.
    pub fn add(&self, template: impl Into<String>, quantity: i64) {
        self.add_with_aggregate(template, quantity, add_i64);
    }

    pub fn add_with_aggregate(
        &self,
        template: impl Into<String>,
        quantity: i64,
        aggregate_fn: fn(i64, i64) -> i64,
    ) {
        let template = template.into();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.accumulators.get_mut(&template) {
            existing.quantity = aggregate_fn(existing.quantity, quantity);
        } else {
            inner.order.push(template.clone());
            inner.accumulators.insert(
                template.clone(),
                Accumulated {
                    template,
                    quantity,
                    aggregate_fn,
                },
            );
        }
    }

    /// Suppresses `message` if fewer than `interval` elapsed since the last
    /// time a message with the same `key` was emitted.
    pub fn add_once_per_interval(&self, message: impl Into<String>, key: impl Into<String>, interval: Duration) {
        let key = key.into();
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(last) = inner.last_emitted_at.get(&key) {
            if now.duration_since(*last) < interval {
                return;
            }
        }
        inner.last_emitted_at.insert(key, now);
        let message = message.into();
        let once_id = inner.next_once_id;
        inner.next_once_id += 1;
        let accum_key = format!("once:{once_id}:{message}");
        inner.order.push(accum_key.clone());
        inner.accumulators.insert(
            accum_key,
            Accumulated {
                template: message,
                quantity: 1,
                aggregate_fn: add_i64,
            },
        );
    }

    /// Formats every accumulated template once with its aggregated quantity,
    /// in insertion order, and clears the accumulator. Called once per
    /// reconciler tick after the tick's work is done.
    pub fn flush(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        let order = std::mem::take(&mut inner.order);
        let mut accumulators = std::mem::take(&mut inner.accumulators);
        order
            .into_iter()
            .filter_map(|key| accumulators.remove(&key))
            .map(|acc| format_template(&acc.template, acc.quantity))
            .collect()
    }
}

fn format_template(template: &str, quantity: i64) -> String {
    if template.contains("{}") {
        template.replacen("{}", &quantity.to_string(), 1)
    } else {
        template.to_string()
    }
}
