//! Container garbage collection.
//!
//! Complements the idle registry: while the registry stops containers after
//! inactivity, the sweeper removes container instances outright when there
//! are more than `cap` of them, or when a container has had no connection
//! for `days` days. This also reclaims the stopped containers a failed
//! rollback can leave behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as Days, Utc};
use log::{debug, error};
use thiserror::Error;

use crate::ensure;
use crate::lxd::Connector;
use crate::singleflight::{self, Group};
use crate::store::InMemory;

/// How often the periodic sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Error)]
enum SweepError {
    #[error("sweep interrupted")]
    Interrupted,
}

impl From<singleflight::Interrupted> for SweepError {
    fn from(_: singleflight::Interrupted) -> Self {
        SweepError::Interrupted
    }
}

/// The container sweeper.
pub struct Collector {
    connector: Arc<dyn Connector>,
    store: Arc<InMemory>,
    cap: usize,
    days: u32,
    group: Group<(), SweepError>,
}

impl Collector {
    pub fn new(connector: Arc<dyn Connector>, store: Arc<InMemory>, cap: usize, days: u32) -> Self {
        Self {
            connector,
            store,
            cap,
            days,
            group: Group::new(),
        }
    }

    /// Whether the configuration enables sweeping at all.
    pub fn enabled(&self) -> bool {
        self.cap > 0 || self.days > 0
    }

    /// Run the sweeper on an interval until the process exits.
    pub fn spawn_interval(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                self.collect().await;
            }
        });
    }

    /// Remove containers beyond the cap and, when `days` is set,
    /// unconnected containers older than that many days. Overlapping calls
    /// collapse into one sweep. Problems are logged, never returned: a
    /// failed sweep simply runs again later.
    pub async fn collect(&self) {
        let connector = Arc::clone(&self.connector);
        let store = Arc::clone(&self.store);
        let (cap, days) = (self.cap, self.days);
        let _ = self
            .group
            .work("gc", async move {
                sweep(connector, store, cap, days).await;
                Ok(())
            })
            .await;
    }
}

struct Candidate {
    name: String,
    addr: String,
    num_connections: usize,
    last_connection: chrono::DateTime<Utc>,
}

async fn sweep(connector: Arc<dyn Connector>, store: Arc<InMemory>, cap: usize, days: u32) {
    debug!("gc: running with cap {cap} and days {days}");
    let client = match connector.connect().await {
        Ok(client) => client,
        Err(err) => {
            error!("gc: cannot connect to LXD server: {err}");
            return;
        }
    };
    let containers = match client.all().await {
        Ok(containers) => containers,
        Err(err) => {
            error!("gc: cannot retrieve containers: {err}");
            return;
        }
    };
    let over_cap = cap > 0 && containers.len() > cap;
    if !over_cap && days == 0 {
        debug!("gc: nothing to collect among {} containers", containers.len());
        return;
    }

    let mut candidates = Vec::with_capacity(containers.len());
    for container in &containers {
        let addr = match client.addr(&container.name).await {
            Ok(addr) => addr,
            Err(err) => {
                error!(
                    "gc: cannot retrieve address for container {}: {err}",
                    container.name
                );
                String::new()
            }
        };
        let info = store.info(&addr);
        candidates.push(Candidate {
            name: container.name.clone(),
            addr,
            num_connections: info.num_connections,
            last_connection: info.last_connection,
        });
    }

    // Containers more likely to be collected come first.
    candidates.sort_by(|a, b| {
        a.num_connections
            .cmp(&b.num_connections)
            .then(a.last_connection.cmp(&b.last_connection))
    });

    let beyond_cap = if over_cap {
        candidates.len() - cap
    } else {
        0
    };
    let mut doomed: Vec<Candidate> = candidates.drain(..beyond_cap).collect();

    if days > 0 {
        let threshold = Utc::now() - Days::days(i64::from(days));
        doomed.extend(
            candidates
                .into_iter()
                .filter(|c| c.num_connections == 0 && c.last_connection < threshold),
        );
    }

    for candidate in doomed {
        debug!(
            "gc: removing container {} with {} connections",
            candidate.name, candidate.num_connections
        );
        ensure::teardown(client.as_ref(), &candidate.name).await;
        if !candidate.addr.is_empty() {
            store.forget(&candidate.addr);
        }
    }
    debug!("gc: completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lxd::fakes::{Call, FakeConnector, FakeLxd};

    fn collector(fake: FakeLxd, store: Arc<InMemory>, cap: usize, days: u32) -> Collector {
        Collector::new(Arc::new(FakeConnector::new(fake)), store, cap, days)
    }

    #[tokio::test]
    async fn cap_removes_least_connected_first() {
        let fake = FakeLxd::new().with_running("ts-a").with_running("ts-b");
        let store = Arc::new(InMemory::new());
        // Both report the fake's single address; give it one connection so
        // that both candidates look connected but equally so, and ordering
        // falls back to last connection time.
        store.add_conn("10.0.0.42");

        collector(fake.clone(), store, 1, 0).collect().await;
        assert_eq!(fake.count(|c| matches!(c, Call::Delete(_))), 1);
        assert_eq!(fake.lock().containers.len(), 1);
    }

    #[tokio::test]
    async fn under_cap_with_no_days_is_a_noop() {
        let fake = FakeLxd::new().with_running("ts-a");
        let store = Arc::new(InMemory::new());
        collector(fake.clone(), store, 5, 0).collect().await;
        assert_eq!(fake.count(|c| matches!(c, Call::Delete(_))), 0);
    }

    #[tokio::test]
    async fn recent_unconnected_containers_survive_days_collection() {
        let fake = FakeLxd::new().with_running("ts-a");
        let store = Arc::new(InMemory::new());
        // An unknown address reports zero connections made just now, which
        // is younger than any threshold.
        collector(fake.clone(), store.clone(), 5, 1).collect().await;
        assert_eq!(fake.count(|c| matches!(c, Call::Delete(_))), 0);
    }

    #[tokio::test]
    async fn stale_unconnected_containers_are_removed_by_days() {
        let fake = FakeLxd::new().with_running("ts-a");
        let store = Arc::new(InMemory::new());
        store.add_conn("10.0.0.42");
        store.remove_conn("10.0.0.42");
        store.backdate("10.0.0.42", 3);
        collector(fake.clone(), store.clone(), 5, 1).collect().await;
        assert_eq!(fake.count(|c| matches!(c, Call::Delete(_))), 1);
        // The store reference is dropped along with the container.
        assert_eq!(store.info("10.0.0.42").num_connections, 0);
    }

    #[tokio::test]
    async fn connected_containers_survive_days_collection() {
        let fake = FakeLxd::new().with_running("ts-a");
        let store = Arc::new(InMemory::new());
        store.add_conn("10.0.0.42");
        collector(fake.clone(), store, 5, 1).collect().await;
        assert_eq!(fake.count(|c| matches!(c, Call::Delete(_))), 0);
    }

    #[test]
    fn enabled_only_when_configured() {
        let fake = FakeLxd::new();
        let store = Arc::new(InMemory::new());
        assert!(!collector(fake.clone(), store.clone(), 0, 0).enabled());
        assert!(collector(fake.clone(), store.clone(), 1, 0).enabled());
        assert!(collector(fake, store, 0, 3).enabled());
    }
}
