//! Capacity-bounded endpoint table with least-recently-active eviction.

use super::RetentionPolicy;
use crate::config::SketchConfig;
use crate::error::SketchError;
use crate::flow::{EndpointId, FlowRecord};
use crate::sketch::EndpointSketch;
use bytes::Bytes;
use std::collections::hash_map;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// One serialized endpoint fingerprint, ready for the uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSketch {
    pub endpoint: EndpointId,
    pub payload: Bytes,
}

pub struct SketchStore {
    capacity: usize,
    retention: RetentionPolicy,
    /// Zeroed sketch cloned for every newly admitted endpoint.
    blank: EndpointSketch,
    entries: HashMap<EndpointId, EndpointSketch>,
    /// (last_seen_ms, endpoint), oldest activity first.
    by_activity: BTreeSet<(i64, EndpointId)>,
    evictions: u64,
}

impl SketchStore {
    pub fn new(config: SketchConfig, capacity: usize, retention: RetentionPolicy) -> Result<Self, SketchError> {
        let placeholder = EndpointId::Ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let blank = EndpointSketch::new(placeholder, &config, 0)?;
        let capacity = capacity.max(1);
        Ok(Self {
            capacity,
            retention,
            blank,
            entries: HashMap::with_capacity(capacity),
            by_activity: BTreeSet::new(),
            evictions: 0,
        })
    }

    /// Apply one flow to its endpoint's sketch, admitting the endpoint if needed.
    /// Returns the sketch evicted to make room, if any.
    pub fn update(&mut self, endpoint: EndpointId, record: &FlowRecord) -> Option<EndpointSketch> {
        if let Some(sketch) = self.entries.get_mut(&endpoint) {
            self.by_activity.remove(&(sketch.last_seen_ms(), endpoint));
            sketch.observe(record);
            self.by_activity.insert((sketch.last_seen_ms(), endpoint));
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        let mut sketch = self.blank.clone().rebind(endpoint, record.first_ms());
        sketch.observe(record);
        self.by_activity.insert((sketch.last_seen_ms(), endpoint));
        self.entries.insert(endpoint, sketch);
        evicted
    }

    fn evict_oldest(&mut self) -> Option<EndpointSketch> {
        let (last_seen, id) = self.by_activity.pop_first()?;
        let sketch = self.entries.remove(&id)?;
        self.evictions += 1;
        debug!(endpoint = %id, last_seen, "endpoint evicted");
        Some(sketch)
    }

    pub fn get(&self, endpoint: &EndpointId) -> Option<&EndpointSketch> {
        self.entries.get(endpoint)
    }

    pub fn contains(&self, endpoint: &EndpointId) -> bool {
        self.entries.contains_key(endpoint)
    }

    /// Least recently active endpoint and its last-seen time.
    pub fn oldest(&self) -> Option<(EndpointId, i64)> {
        self.by_activity.first().map(|(ts, id)| (*id, *ts))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Serialize every sketch for this window, applying the retention policy as each
    /// entry is visited. The iterator holds the store borrow; nothing else can update
    /// the table while it is alive.
    pub fn drain(&mut self, at_ms: i64) -> Drain<'_> {
        let inner = match self.retention {
            RetentionPolicy::Tumbling => {
                self.by_activity.clear();
                DrainInner::Owned(std::mem::take(&mut self.entries).into_iter())
            }
            RetentionPolicy::Cumulative => DrainInner::Retained {
                iter: self.entries.iter_mut(),
                reset_counters: false,
            },
            RetentionPolicy::RollingCounters => DrainInner::Retained {
                iter: self.entries.iter_mut(),
                reset_counters: true,
            },
        };
        Drain { inner, at_ms }
    }

    /// Serialize and remove everything regardless of policy (shutdown teardown).
    pub fn take_all(&mut self, at_ms: i64) -> Vec<EncodedSketch> {
        self.by_activity.clear();
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|mut sketch| {
                sketch.seal(at_ms);
                EncodedSketch {
                    endpoint: sketch.id(),
                    payload: sketch.serialize(),
                }
            })
            .collect()
    }
}

enum DrainInner<'a> {
    Owned(hash_map::IntoIter<EndpointId, EndpointSketch>),
    Retained {
        iter: hash_map::IterMut<'a, EndpointId, EndpointSketch>,
        reset_counters: bool,
    },
}

/// Lazy, single-pass snapshot of the store produced by [`SketchStore::drain`].
pub struct Drain<'a> {
    inner: DrainInner<'a>,
    at_ms: i64,
}

impl Iterator for Drain<'_> {
    type Item = EncodedSketch;

    fn next(&mut self) -> Option<EncodedSketch> {
        match &mut self.inner {
            DrainInner::Owned(iter) => {
                let (endpoint, mut sketch) = iter.next()?;
                sketch.seal(self.at_ms);
                Some(EncodedSketch {
                    endpoint,
                    payload: sketch.serialize(),
                })
            }
            DrainInner::Retained { iter, reset_counters } => {
                let (endpoint, sketch) = iter.next()?;
                sketch.seal(self.at_ms);
                let payload = sketch.serialize();
                if *reset_counters {
                    sketch.reset_counters(self.at_ms);
                }
                Some(EncodedSketch {
                    endpoint: *endpoint,
                    payload,
                })
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            DrainInner::Owned(iter) => iter.size_hint(),
            DrainInner::Retained { iter, .. } => iter.size_hint(),
        }
    }
}
