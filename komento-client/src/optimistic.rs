use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::api::{CommentId, Time, UserId};
use crate::tree::DetachedSubtree;

/// Locally-assigned placeholder id for a comment whose server id is not
/// known yet. Never collides with a [`CommentId`]: the two live in separate
/// variants of [`crate::NodeId`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TempId {
    created_at: Time,
    nonce: u32,
}

impl TempId {
    pub fn generate(now: Time) -> TempId {
        TempId {
            created_at: now,
            nonce: rand::random(),
        }
    }

    /// The instant the placeholder was created, reused as the optimistic
    /// node's `created_at` so confirmation matching compares like with like.
    pub fn created_at(&self) -> Time {
        self.created_at
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}-{:08x}", self.created_at.timestamp_millis(), self.nonce)
    }
}

/// Correlates an in-flight write request with its rollback record.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RequestId(u64);

/// What to undo if a write request comes back failed.
#[derive(Clone, Debug)]
pub enum PendingRequest {
    Create {
        temp: TempId,
    },
    Edit {
        id: CommentId,
        prior: EditSnapshot,
    },
    Delete {
        id: CommentId,
        detached: DetachedSubtree,
    },
    Like {
        id: CommentId,
        prior_liked_by: HashSet<UserId>,
    },
}

/// The fields an edit clobbers, captured before the local apply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EditSnapshot {
    pub content: String,
    pub updated_at: Time,
    pub is_edited: bool,
}

/// Ledger of writes sent to the server but not yet answered.
///
/// Confirmation of an optimistic create is not resolved here: the
/// authoritative event drives reconciliation, and the placeholder node in
/// the tree is the memory it matches against. This ledger only remembers
/// enough to roll the local apply back when a request fails.
pub struct PendingWrites {
    requests: HashMap<RequestId, Entry>,
    next: u64,
}

struct Entry {
    request: PendingRequest,
    started: Time,
}

impl PendingWrites {
    pub fn new() -> PendingWrites {
        PendingWrites {
            requests: HashMap::new(),
            next: 0,
        }
    }

    pub fn begin(&mut self, request: PendingRequest, now: Time) -> RequestId {
        let id = RequestId(self.next);
        self.next += 1;
        self.requests.insert(id, Entry { request, started: now });
        id
    }

    /// Takes the rollback record out of the ledger. Returns `None` when the
    /// record was already swept.
    pub fn complete(&mut self, id: RequestId) -> Option<PendingRequest> {
        self.requests.remove(&id).map(|e| e.request)
    }

    /// Drops records older than `max_age`, for requests whose completion was
    /// lost. Returns how many were dropped.
    pub fn sweep_older_than(&mut self, now: Time, max_age: chrono::Duration) -> usize {
        let before = self.requests.len();
        self.requests.retain(|_, e| age(now, e.started) <= max_age);
        before - self.requests.len()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

fn age(now: Time, then: Time) -> chrono::Duration {
    if now >= then {
        now - then
    } else {
        chrono::Duration::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn temp_ids_are_distinct_and_display_with_prefix() {
        let now = Utc::now();
        let a = TempId::generate(now);
        let b = TempId::generate(now);
        assert_ne!(a, b, "nonce should separate ids minted at the same instant");
        assert!(a.to_string().starts_with("tmp-"));
    }

    #[test]
    fn complete_is_one_shot() {
        let mut writes = PendingWrites::new();
        let now = Utc::now();
        let req = writes.begin(
            PendingRequest::Create {
                temp: TempId::generate(now),
            },
            now,
        );
        assert!(writes.complete(req).is_some());
        assert!(writes.complete(req).is_none());
        assert!(writes.is_empty());
    }

    #[test]
    fn sweep_drops_only_stale_records() {
        let mut writes = PendingWrites::new();
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(120);
        writes.begin(PendingRequest::Create { temp: TempId::generate(old) }, old);
        let kept = writes.begin(PendingRequest::Create { temp: TempId::generate(now) }, now);
        assert_eq!(writes.sweep_older_than(now, chrono::Duration::seconds(30)), 1);
        assert_eq!(writes.len(), 1);
        assert!(writes.complete(kept).is_some());
    }
}
