//! The record envelope: the unit of work that crosses every worker
//! boundary in the pipeline graph.
//!
//! Envelopes are pooled. A sensor pipe acquires an exclusively-owned
//! envelope, fills it from one stdout line, and shares it into the graph
//! as a [`SharedEnvelope`]. Downstream ownership is tracked with an
//! explicit atomic reference count equal to the number of consumers that
//! still owe a terminal disposition; the consumer that observes the
//! transition to zero returns the envelope to the pool.

mod pool;

pub use pool::EnvelopePool;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

/// Shared form of an envelope. Cloning is cheap; the payload is never
/// mutated while shared.
pub type SharedEnvelope = Arc<Envelope>;

/// One normalized telemetry event: the common header fields every sensor
/// emits plus an open metadata mapping.
///
/// This is also the wire shape, both on the sensor side (one JSON object
/// per stdout line) and on the file-exporter side (one JSON object per
/// output line).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "eventname", default)]
    pub event_name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Record {
    /// Resolve a rule field against this record.
    ///
    /// The four header names map directly; any other name is looked up in
    /// the metadata mapping, with non-string values coerced to their
    /// canonical JSON text. A missing field resolves to `None` and matches
    /// nothing — never an error.
    pub fn field(&self, name: &str) -> Option<Cow<'_, str>> {
        match name {
            "eventname" => Some(Cow::Borrowed(self.event_name.as_str())),
            "source" => Some(Cow::Borrowed(self.source.as_str())),
            "timestamp" => Some(Cow::Borrowed(self.timestamp.as_str())),
            "log" => Some(Cow::Borrowed(self.log.as_str())),
            other => match &self.metadata {
                Value::Object(map) => map.get(other).map(|value| match value {
                    Value::String(text) => Cow::Borrowed(text.as_str()),
                    not_text => Cow::Owned(not_text.to_string()),
                }),
                _ => None,
            },
        }
    }
}

/// Where an envelope sits in its pooled lifecycle. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolTag {
    /// Freshly allocated or reset, not yet visible to other workers.
    Fresh,
    /// Shared into the worker graph.
    InFlight,
    /// Returned to the pool.
    Recycled,
}

const TAG_FRESH: u8 = 0;
const TAG_IN_FLIGHT: u8 = 1;
const TAG_RECYCLED: u8 = 2;

/// A pooled record with its reference count and lifecycle tag.
#[derive(Debug, Default)]
pub struct Envelope {
    pub record: Record,
    ref_count: AtomicI32,
    tag: AtomicU8,
}

impl Envelope {
    /// Current number of pending terminal dispositions.
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Add `count` pending terminal dispositions. Called by a producer
    /// before it fans the envelope out to that many downstream queues.
    pub fn retain(&self, count: i32) {
        self.ref_count.fetch_add(count, Ordering::AcqRel);
    }

    /// Drop one pending disposition. Returns `true` for the caller that
    /// observed the transition to zero and now owes the pool return.
    pub(crate) fn release(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn tag(&self) -> PoolTag {
        match self.tag.load(Ordering::Relaxed) {
            TAG_IN_FLIGHT => PoolTag::InFlight,
            TAG_RECYCLED => PoolTag::Recycled,
            _ => PoolTag::Fresh,
        }
    }

    pub(crate) fn set_tag(&self, tag: PoolTag) {
        let raw = match tag {
            PoolTag::Fresh => TAG_FRESH,
            PoolTag::InFlight => TAG_IN_FLIGHT,
            PoolTag::Recycled => TAG_RECYCLED,
        };
        self.tag.store(raw, Ordering::Relaxed);
    }

    /// Reset the counters on re-acquisition. Record fields are left for
    /// the caller to overwrite; nothing reads them before that happens
    /// because acquisition hands out exclusive ownership.
    pub(crate) fn reset(&mut self) {
        *self.ref_count.get_mut() = 0;
        *self.tag.get_mut() = TAG_FRESH;
    }
}
