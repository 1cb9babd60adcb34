//! Feed state
//!
//! Signals are keyed by id, so the same signal can never be resident twice.
//! A signal is either active or fading; fading ids must still be present,
//! and removal goes through fading unless it is an explicit delete.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use super::types::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalPhase {
    Active,
    Fading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// Already fading out; left alone
    Skipped,
}

#[derive(Debug, Default)]
pub struct SignalFeedState {
    signals: HashMap<String, Signal>,
    /// id -> when it started fading
    fading: HashMap<String, DateTime<Utc>>,
    /// id -> when it was inserted
    newly_added: HashMap<String, DateTime<Utc>>,
}

impl SignalFeedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.signals.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Signal> {
        self.signals.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Signal> {
        self.signals.get_mut(id)
    }

    pub fn signals(&self) -> impl Iterator<Item = &Signal> {
        self.signals.values()
    }

    pub fn phase(&self, id: &str) -> Option<SignalPhase> {
        if !self.signals.contains_key(id) {
            return None;
        }
        Some(if self.fading.contains_key(id) {
            SignalPhase::Fading
        } else {
            SignalPhase::Active
        })
    }

    pub fn is_newly_added(&self, id: &str) -> bool {
        self.newly_added.contains_key(id)
    }

    /// Insert a signal that is not yet present. Returns false for a duplicate.
    pub fn insert_new(&mut self, signal: Signal, now: DateTime<Utc>) -> bool {
        if self.signals.contains_key(&signal.id) {
            return false;
        }
        self.newly_added.insert(signal.id.clone(), now);
        self.signals.insert(signal.id.clone(), signal);
        true
    }

    /// Insert without an entrance marker, for signals loaded from the cache.
    pub fn restore(&mut self, signal: Signal) -> bool {
        if self.signals.contains_key(&signal.id) {
            return false;
        }
        self.signals.insert(signal.id.clone(), signal);
        true
    }

    /// Update in place when present, insert otherwise.
    pub fn upsert(&mut self, signal: Signal, now: DateTime<Utc>) -> Upsert {
        if self.fading.contains_key(&signal.id) {
            return Upsert::Skipped;
        }
        match self.signals.get_mut(&signal.id) {
            Some(existing) => {
                existing.merge_from_cloud(signal);
                Upsert::Updated
            }
            None => {
                self.insert_new(signal, now);
                Upsert::Inserted
            }
        }
    }

    /// Move every expired, still active signal to fading.
    pub fn begin_fading_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .signals
            .values()
            .filter(|s| s.is_expired_at(now) && !self.fading.contains_key(&s.id))
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            self.fading.insert(id.clone(), now);
            self.newly_added.remove(id);
        }
        expired
    }

    pub fn begin_fading(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        if !self.signals.contains_key(id) || self.fading.contains_key(id) {
            return false;
        }
        self.fading.insert(id.to_string(), now);
        self.newly_added.remove(id);
        true
    }

    /// Drop signals that have been fading for at least `fade`.
    pub fn remove_faded(&mut self, now: DateTime<Utc>, fade: Duration) -> Vec<String> {
        let done: Vec<String> = self
            .fading
            .iter()
            .filter(|(_, started)| **started + fade <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &done {
            self.fading.remove(id);
            self.signals.remove(id);
        }
        done
    }

    /// Clear the entrance marker of signals older than `entrance`.
    pub fn settle_entrances(&mut self, now: DateTime<Utc>, entrance: Duration) -> usize {
        let before = self.newly_added.len();
        self.newly_added.retain(|_, added| *added + entrance > now);
        before - self.newly_added.len()
    }

    /// Explicit deletion; the only removal that skips fading.
    pub fn remove(&mut self, id: &str) -> Option<Signal> {
        self.fading.remove(id);
        self.newly_added.remove(id);
        self.signals.remove(id)
    }

    /// Signals in presentation order.
    pub fn sorted(&self, own_node: Option<u32>) -> Vec<&Signal> {
        let mut signals: Vec<&Signal> = self.signals.values().collect();
        signals.sort_by(|a, b| feed_order(a, b, own_node));
        signals
    }
}

/// Presentation order: the local radio's own signals first, then fewer hops
/// (unknown hop count last), then soonest expiry, then newest first. The id
/// breaks any remaining tie so the order is total.
pub fn feed_order(a: &Signal, b: &Signal, own_node: Option<u32>) -> Ordering {
    let is_own = |s: &Signal| own_node.is_some() && s.author.mesh_node == own_node;

    is_own(b)
        .cmp(&is_own(a))
        .then_with(|| match (a.hop_count, b.hop_count) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.expires_at.cmp(&b.expires_at))
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedLoadState {
    Idle,
    Loading,
    /// Last refresh failed; earlier signals stay visible
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub signal: Signal,
    pub phase: SignalPhase,
    pub newly_added: bool,
}

/// Immutable view published after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub version: u64,
    pub entries: Vec<FeedEntry>,
    pub load_state: FeedLoadState,
    pub generated_at: DateTime<Utc>,
}

impl FeedSnapshot {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            entries: Vec::new(),
            load_state: FeedLoadState::Idle,
            generated_at: now,
        }
    }

    pub fn build(
        state: &SignalFeedState,
        own_node: Option<u32>,
        load_state: FeedLoadState,
        version: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let entries = state
            .sorted(own_node)
            .into_iter()
            .map(|signal| FeedEntry {
                phase: state.phase(&signal.id).unwrap_or(SignalPhase::Active),
                newly_added: state.is_newly_added(&signal.id),
                signal: signal.clone(),
            })
            .collect();

        Self {
            version,
            entries,
            load_state,
            generated_at: now,
        }
    }

    pub fn get(&self, id: &str) -> Option<&FeedEntry> {
        self.entries.iter().find(|entry| entry.signal.id == id)
    }

    pub fn phase_of(&self, id: &str) -> Option<SignalPhase> {
        self.get(id).map(|entry| entry.phase)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.signal.id.as_str()).collect()
    }
}
