//! QueryScheduler: interval-grouped polling
//!
//! Queries polling at the same interval share one timer task, so a thousand
//! queries on a 5s interval cost one timer, not a thousand. Each tick
//! snapshots the group's members and asks the manager to fetch each one; the
//! manager skips any query whose previous fetch is still in flight, so ticks
//! never overlap per query.

use crate::manager::ManagerInner;
use crate::query::QueryId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// One shared timer and the queries it drives
struct PollingGroup {
    members: Arc<Mutex<BTreeSet<QueryId>>>,
    handle: JoinHandle<()>,
}

/// Owns the polling timers. Held by the manager; holds the manager weakly so
/// the two do not keep each other alive.
pub(crate) struct QueryScheduler {
    manager: Weak<ManagerInner>,
    groups: Mutex<FxHashMap<u128, PollingGroup>>,
}

impl QueryScheduler {
    pub(crate) fn new(manager: Weak<ManagerInner>) -> Self {
        QueryScheduler {
            manager,
            groups: Mutex::new(FxHashMap::default()),
        }
    }

    /// Add `query_id` to the group for `interval`, creating the group's
    /// timer task on first use. Re-adding an already-polling query is a
    /// no-op within its group.
    pub(crate) fn start_polling(&self, query_id: QueryId, interval: Duration) {
        let mut groups = self.groups.lock();
        let group = groups.entry(interval.as_nanos()).or_insert_with(|| {
            let members = Arc::new(Mutex::new(BTreeSet::new()));
            let handle = Self::spawn_group(self.manager.clone(), interval, Arc::clone(&members));
            debug!(?interval, "polling group created");
            PollingGroup { members, handle }
        });
        group.members.lock().insert(query_id);
        debug!(%query_id, ?interval, "polling started");
    }

    /// Remove `query_id` from whichever group holds it, tearing the group's
    /// timer down when it empties.
    pub(crate) fn stop_polling(&self, query_id: QueryId) {
        let mut groups = self.groups.lock();
        groups.retain(|_, group| {
            let mut members = group.members.lock();
            if members.remove(&query_id) {
                debug!(%query_id, "polling stopped");
            }
            if members.is_empty() {
                group.handle.abort();
                false
            } else {
                true
            }
        });
    }

    fn spawn_group(
        manager: Weak<ManagerInner>,
        interval: Duration,
        members: Arc<Mutex<BTreeSet<QueryId>>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would double up with the initial
            // fetch; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                let snapshot: Vec<QueryId> = members.lock().iter().copied().collect();
                for query_id in snapshot {
                    manager.poll_tick(query_id);
                }
            }
        })
    }
}

impl Drop for QueryScheduler {
    fn drop(&mut self) {
        for group in self.groups.lock().values() {
            group.handle.abort();
        }
    }
}
