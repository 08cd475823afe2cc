//! Bounded bookkeeping for message ids: duplicate suppression and the
//! acknowledgement state of messages we sent.

use std::collections::{HashSet, VecDeque};

use hsp_protocol::MessageId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Remembers the last `capacity` message ids seen.
pub(crate) struct RecentIds {
    capacity: usize,
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// True the first time `id` is offered while it is remembered.
    pub fn insert(&mut self, id: &MessageId) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        self.order.push_back(id.clone());
        self.seen.insert(id.clone());
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Awaiting,
    Acknowledged,
    Rejected { code: String, message: String },
}

/// Acknowledgement state of sent messages that asked for one.
pub(crate) struct AckTracker {
    capacity: usize,
    states: IndexMap<MessageId, DeliveryState>,
}

impl AckTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            states: IndexMap::new(),
        }
    }

    pub fn track(&mut self, id: MessageId) {
        if self.states.len() >= self.capacity {
            self.states.shift_remove_index(0);
        }
        self.states.insert(id, DeliveryState::Awaiting);
    }

    pub fn forget(&mut self, id: &MessageId) {
        self.states.shift_remove(id);
    }

    /// Record the peer's answer. False for untracked or already answered ids.
    pub fn resolve(&mut self, id: &MessageId, outcome: DeliveryState) -> bool {
        match self.states.get_mut(id) {
            Some(state) if *state == DeliveryState::Awaiting => {
                *state = outcome;
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, id: &MessageId) -> Option<DeliveryState> {
        self.states.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_ids_forget_oldest_beyond_capacity() {
        let mut recent = RecentIds::new(2);
        let (a, b, c) = (MessageId::from("a"), MessageId::from("b"), MessageId::from("c"));
        assert!(recent.insert(&a));
        assert!(!recent.insert(&a));
        assert!(recent.insert(&b));
        assert!(recent.insert(&c));
        assert!(recent.insert(&a));
        assert!(!recent.insert(&c));
    }

    #[test]
    fn first_answer_wins() {
        let mut acks = AckTracker::new(8);
        let id = MessageId::from("m1");
        acks.track(id.clone());
        assert_eq!(acks.state(&id), Some(DeliveryState::Awaiting));
        assert!(acks.resolve(&id, DeliveryState::Acknowledged));
        assert!(!acks.resolve(
            &id,
            DeliveryState::Rejected {
                code: "HSP_HANDLER_FAILED".to_owned(),
                message: "late".to_owned()
            }
        ));
        assert_eq!(acks.state(&id), Some(DeliveryState::Acknowledged));
        assert!(!acks.resolve(&MessageId::from("unknown"), DeliveryState::Acknowledged));
    }
}
