//! Subscription registry
//!
//! Tracks the channels a connection *intends* to be subscribed to. The
//! registry is replayed in insertion order after every reconnect, regardless
//! of whether the venue ever confirmed the original subscription.

use parking_lot::Mutex;
use std::collections::HashSet;

use super::types::ChannelDescriptor;

#[derive(Default)]
struct Entries {
    order: Vec<ChannelDescriptor>,
    index: HashSet<ChannelDescriptor>,
}

/// Deduplicated, insertion-ordered set of channel descriptors
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<Entries>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the descriptor was already registered.
    pub fn add(&self, descriptor: ChannelDescriptor) -> bool {
        let mut entries = self.entries.lock();
        if !entries.index.insert(descriptor.clone()) {
            return false;
        }
        entries.order.push(descriptor);
        true
    }

    /// Returns `false` if the descriptor was not registered.
    pub fn remove(&self, descriptor: &ChannelDescriptor) -> bool {
        let mut entries = self.entries.lock();
        if !entries.index.remove(descriptor) {
            return false;
        }
        entries.order.retain(|d| d != descriptor);
        true
    }

    pub fn contains(&self, descriptor: &ChannelDescriptor) -> bool {
        self.entries.lock().index.contains(descriptor)
    }

    /// Snapshot of all descriptors in the order they were first added
    pub fn list_in_order(&self) -> Vec<ChannelDescriptor> {
        self.entries.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
