use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Length of a rendezvous id (hex chars)
pub const RENDEZVOUS_ID_LEN: usize = 12;

/// Fresh rendezvous id: 12 lowercase hex chars (48 random bits)
pub fn new_rendezvous_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(RENDEZVOUS_ID_LEN);
    id
}

struct Pending<C> {
    conn: C,
    created_at: Instant,
}

/// Public connections waiting for the client's data connection.
///
/// Every id is consumed at most once: whoever `take`s it first owns the
/// connection, and the sweeper drops (closes) whatever outlived the TTL.
pub struct PendingConnections<C> {
    entries: DashMap<String, Pending<C>>,
    ttl: Duration,
}

impl<C: Send + Sync + 'static> PendingConnections<C> {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn put(&self, id: String, conn: C) {
        self.entries.insert(
            id,
            Pending {
                conn,
                created_at: Instant::now(),
            },
        );
    }

    /// Remove and return the connection for `id`, if still waiting
    pub fn take(&self, id: &str) -> Option<C> {
        self.entries.remove(id).map(|(_, pending)| pending.conn)
    }

    /// Drop every entry older than the TTL, returning how many went away
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now.duration_since(e.created_at) >= self.ttl)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            // Re-check under the shard lock; a concurrent take may have won
            if self
                .entries
                .remove_if(&id, |_, p| now.duration_since(p.created_at) >= self.ttl)
                .is_some()
            {
                tracing::debug!("Pending connection {} expired", id);
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep every `interval` until `shutdown` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = this.sweep_expired();
                        if removed > 0 {
                            tracing::info!("Expired {} unclaimed connection(s)", removed);
                        }
                    }
                }
            }
        })
    }
}
