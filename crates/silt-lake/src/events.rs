//! Lake events and the in-process broadcast bus.

use std::fmt;
use std::str::FromStr;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use silt_storage::Id;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{LakeError, LakeResult};

/// Kinds of lake events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A pool was created.
    PoolNew,
    /// A pool was removed.
    PoolDelete,
    /// A pool was renamed.
    PoolUpdate,
    /// A branch tip moved by a commit.
    BranchCommit,
    /// A branch was created or moved without a commit.
    BranchUpdate,
    /// A branch was removed.
    BranchDelete,
}

impl EventKind {
    /// Wire name, also the SSE event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PoolNew => "pool-new",
            EventKind::PoolDelete => "pool-delete",
            EventKind::PoolUpdate => "pool-update",
            EventKind::BranchCommit => "branch-commit",
            EventKind::BranchUpdate => "branch-update",
            EventKind::BranchDelete => "branch-delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = LakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pool-new" => Ok(EventKind::PoolNew),
            "pool-delete" => Ok(EventKind::PoolDelete),
            "pool-update" => Ok(EventKind::PoolUpdate),
            "branch-commit" => Ok(EventKind::BranchCommit),
            "branch-update" => Ok(EventKind::BranchUpdate),
            "branch-delete" => Ok(EventKind::BranchDelete),
            other => Err(LakeError::Invalid(format!("unknown event kind {:?}", other))),
        }
    }
}

/// What an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetail {
    /// Affected pool.
    pub pool_id: Id,
    /// Affected branch, for branch events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// New tip, for commit and update events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<Id>,
}

/// One lake event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Kind.
    pub kind: EventKind,
    /// Detail.
    pub detail: EventDetail,
}

impl Event {
    /// Pool-level event.
    pub fn pool(kind: EventKind, pool_id: Id) -> Self {
        Self {
            kind,
            detail: EventDetail {
                pool_id,
                branch: None,
                commit: None,
            },
        }
    }

    /// Branch-level event.
    pub fn branch(kind: EventKind, pool_id: Id, branch: &str, commit: Option<Id>) -> Self {
        Self {
            kind,
            detail: EventDetail {
                pool_id,
                branch: Some(branch.to_string()),
                commit,
            },
        }
    }
}

/// Stream of events; ends when the source closes.
pub type EventStream = BoxStream<'static, LakeResult<Event>>;

const BUS_CAPACITY: usize = 256;

/// Fan-out of events to every subscriber in the process.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Bus with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Deliver `event` to current subscribers. Having none is fine.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Raw receiver.
    pub fn receiver(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Subscribe as a stream. Lagging subscribers skip what they missed.
    pub fn subscribe(&self) -> EventStream {
        let rx = self.tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_receives_published() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let pool = Id::new();
        bus.publish(Event::pool(EventKind::PoolNew, pool));
        bus.publish(Event::branch(EventKind::BranchCommit, pool, "main", Some(Id::new())));
        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.kind, EventKind::PoolNew);
        let second = events.next().await.unwrap().unwrap();
        assert_eq!(second.detail.branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&EventKind::BranchCommit).unwrap();
        assert_eq!(json, "\"branch-commit\"");
        for kind in [EventKind::PoolNew, EventKind::BranchDelete, EventKind::PoolUpdate] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }
}
