//! Thread-safe registry of SSE stream clients.
//!
//! The registry owns one bounded queue per connected client and enforces two
//! hard resource bounds: population (`max_clients`, oldest client evicted at
//! the cap) and per-client queue depth (`max_queue_size`, a full queue gets
//! the client evicted on the next broadcast). A slow consumer never blocks
//! delivery to anyone else.
//!
//! Lock discipline: the registry mutex guards only structural mutation and
//! membership snapshots. Enqueues during a broadcast run against a snapshot
//! of senders, outside the lock.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::events::StreamEvent;

/// Activity metadata for one client, shared between the registry map and
/// broadcast snapshots so `last_active` updates skip the registry lock.
#[derive(Debug)]
struct Activity {
    created_at: Instant,
    connected_at: DateTime<Utc>,
    last_active: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            connected_at: Utc::now(),
            last_active: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last = *self.last_active.lock().unwrap_or_else(|e| e.into_inner());
        now.saturating_duration_since(last)
    }
}

struct ClientSlot {
    tx: mpsc::Sender<StreamEvent>,
    activity: Arc<Activity>,
}

/// Diagnostic snapshot of one registered client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub queue_size: usize,
    pub created: DateTime<Utc>,
    pub last_active_seconds_ago: f64,
    pub age_seconds: f64,
}

/// Insertion-ordered, mutex-guarded set of active stream clients.
pub struct ClientRegistry {
    clients: Mutex<IndexMap<String, ClientSlot>>,
    max_clients: usize,
    max_queue_size: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize, max_queue_size: usize) -> Self {
        Self {
            clients: Mutex::new(IndexMap::new()),
            max_clients,
            max_queue_size,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexMap<String, ClientSlot>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a client and hand back the receiving end of its queue.
    ///
    /// At the population cap the single oldest client is evicted first, so
    /// the registry never exceeds `max_clients`. Re-registering an existing
    /// id replaces its queue rather than duplicating the entry.
    pub fn add(&self, client_id: &str) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(self.max_queue_size);
        let mut clients = self.lock();

        if !clients.contains_key(client_id) && clients.len() >= self.max_clients {
            if let Some((oldest_id, _)) = clients.shift_remove_index(0) {
                tracing::warn!(
                    client_id = %oldest_id,
                    "registry at capacity, evicted oldest client"
                );
            }
        }

        clients.insert(
            client_id.to_string(),
            ClientSlot {
                tx,
                activity: Arc::new(Activity::new()),
            },
        );
        tracing::info!(client_id, total = clients.len(), "stream client registered");
        rx
    }

    /// Remove a client. Idempotent; unknown ids are ignored.
    pub fn remove(&self, client_id: &str) {
        let mut clients = self.lock();
        if clients.shift_remove(client_id).is_some() {
            tracing::info!(client_id, remaining = clients.len(), "stream client removed");
        }
    }

    /// Fan one event out to every registered client.
    ///
    /// Non-blocking per client: a full or closed queue marks the client for
    /// removal instead of waiting (a consumer that cannot drain a
    /// `max_queue_size` buffer is treated as gone). Returns the number of
    /// clients that actually received the event.
    pub fn broadcast(&self, event: &StreamEvent) -> usize {
        let snapshot: Vec<(String, mpsc::Sender<StreamEvent>, Arc<Activity>)> = {
            let clients = self.lock();
            clients
                .iter()
                .map(|(id, slot)| (id.clone(), slot.tx.clone(), slot.activity.clone()))
                .collect()
        };

        let mut dropped = Vec::new();
        for (client_id, tx, activity) in &snapshot {
            match tx.try_send(event.clone()) {
                Ok(()) => activity.touch(),
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(%client_id, "queue full, evicting slow client");
                    dropped.push(client_id.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(%client_id, "queue closed, evicting client");
                    dropped.push(client_id.clone());
                }
            }
        }

        for client_id in &dropped {
            self.remove(client_id);
        }

        snapshot.len() - dropped.len()
    }

    /// Evict every client idle for longer than `max_age` and return their ids.
    pub fn cleanup_inactive(&self, max_age: Duration) -> Vec<String> {
        self.cleanup_inactive_at(Instant::now(), max_age)
    }

    fn cleanup_inactive_at(&self, now: Instant, max_age: Duration) -> Vec<String> {
        let mut clients = self.lock();
        let stale: Vec<String> = clients
            .iter()
            .filter(|(_, slot)| slot.activity.idle_for(now) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for client_id in &stale {
            clients.shift_remove(client_id);
        }

        if !stale.is_empty() {
            tracing::info!(
                removed = stale.len(),
                remaining = clients.len(),
                "cleaned up inactive stream clients"
            );
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Per-client stats for the diagnostic endpoint, in insertion order.
    pub fn stats(&self) -> Vec<(String, ClientStats)> {
        let now = Instant::now();
        let clients = self.lock();
        clients
            .iter()
            .map(|(id, slot)| {
                let stats = ClientStats {
                    queue_size: self.max_queue_size - slot.tx.capacity(),
                    created: slot.activity.connected_at,
                    last_active_seconds_ago: slot.activity.idle_for(now).as_secs_f64(),
                    age_seconds: now
                        .saturating_duration_since(slot.activity.created_at)
                        .as_secs_f64(),
                };
                (id.clone(), stats)
            })
            .collect()
    }

    #[cfg(test)]
    fn backdate_last_active(&self, client_id: &str, by: Duration) {
        let clients = self.lock();
        let slot = clients.get(client_id).expect("client not registered");
        let backdated = Instant::now() - by;
        *slot
            .activity
            .last_active
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = backdated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::events::Metrics;
    use tokio::sync::mpsc::error::TryRecvError;

    fn event(tray: i32) -> StreamEvent {
        StreamEvent::NewData {
            tray_number: tray,
            timestamp: Utc::now(),
            image_saved: false,
            metrics: Metrics {
                length: 1.0,
                width: 1.0,
                area: 1.0,
                weight: 1.0,
                count: 1,
            },
        }
    }

    fn ids(registry: &ClientRegistry) -> Vec<String> {
        registry.stats().into_iter().map(|(id, _)| id).collect()
    }

    #[test]
    fn population_never_exceeds_max_clients() {
        let registry = ClientRegistry::new(3, 10);
        let mut receivers = Vec::new();
        for i in 0..8 {
            receivers.push(registry.add(&format!("c{}", i)));
            assert!(registry.len() <= 3);
        }
        assert_eq!(ids(&registry), vec!["c5", "c6", "c7"]);
    }

    #[test]
    fn at_capacity_exactly_the_oldest_is_evicted() {
        let registry = ClientRegistry::new(2, 10);
        let mut rx_a = registry.add("a");
        let _rx_b = registry.add("b");
        let _rx_c = registry.add("c");

        assert_eq!(ids(&registry), vec!["b", "c"]);
        // a's sender was dropped with its slot
        assert_eq!(rx_a.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn re_adding_an_id_does_not_duplicate_it() {
        let registry = ClientRegistry::new(5, 10);
        let _rx1 = registry.add("same");
        let _rx2 = registry.add("same");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ClientRegistry::new(5, 10);
        let _rx = registry.add("a");
        registry.remove("a");
        registry.remove("a");
        registry.remove("never-existed");
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_delivers_in_order_without_duplication() {
        let registry = ClientRegistry::new(5, 10);
        let mut rx = registry.add("a");

        registry.broadcast(&event(1));
        registry.broadcast(&event(2));
        registry.broadcast(&event(3));

        for expected in [1, 2, 3] {
            match rx.try_recv().unwrap() {
                StreamEvent::NewData { tray_number, .. } => assert_eq!(tray_number, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn full_queue_evicts_only_the_slow_client() {
        // max_clients=2, max_queue_size=1: the scenario from the backpressure
        // policy. A, B registered; C evicts A; X reaches B and C; Y finds B's
        // queue still full and evicts B.
        let registry = ClientRegistry::new(2, 1);
        let _rx_a = registry.add("a");
        let mut rx_b = registry.add("b");
        let mut rx_c = registry.add("c");
        assert_eq!(ids(&registry), vec!["b", "c"]);

        let delivered = registry.broadcast(&event(10));
        assert_eq!(delivered, 2);

        // b has not drained, so this broadcast evicts it
        let delivered = registry.broadcast(&event(20));
        assert_eq!(delivered, 1);
        assert_eq!(ids(&registry), vec!["c"]);

        // b still holds the first event it received, nothing more
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            StreamEvent::NewData { tray_number: 10, .. }
        ));
        assert_eq!(rx_b.try_recv(), Err(TryRecvError::Disconnected));

        // c observed both, in order
        assert!(matches!(
            rx_c.try_recv().unwrap(),
            StreamEvent::NewData { tray_number: 10, .. }
        ));
        assert!(matches!(
            rx_c.try_recv().unwrap(),
            StreamEvent::NewData { tray_number: 20, .. }
        ));
    }

    #[test]
    fn delivered_count_is_population_minus_evicted() {
        let registry = ClientRegistry::new(10, 1);
        let _rx_a = registry.add("a");
        let _rx_b = registry.add("b");
        let _rx_c = registry.add("c");

        assert_eq!(registry.broadcast(&event(1)), 3);
        // nobody drained: every queue is now full
        assert_eq!(registry.broadcast(&event(2)), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn cleanup_removes_exactly_the_idle_clients() {
        let registry = ClientRegistry::new(10, 10);
        let _rx_idle = registry.add("idle");
        let mut rx_fresh = registry.add("fresh");
        registry.backdate_last_active("idle", Duration::from_secs(121));

        let removed = registry.cleanup_inactive(Duration::from_secs(120));
        assert_eq!(removed, vec!["idle".to_string()]);
        assert_eq!(ids(&registry), vec!["fresh"]);

        // the survivor's queue is untouched
        registry.broadcast(&event(5));
        assert!(rx_fresh.try_recv().is_ok());
    }

    #[test]
    fn cleanup_spares_clients_under_the_threshold() {
        let registry = ClientRegistry::new(10, 10);
        let _rx = registry.add("recent");
        registry.backdate_last_active("recent", Duration::from_secs(119));

        let removed = registry.cleanup_inactive(Duration::from_secs(120));
        assert!(removed.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn successful_delivery_refreshes_activity() {
        let registry = ClientRegistry::new(10, 10);
        let _rx = registry.add("busy");
        registry.backdate_last_active("busy", Duration::from_secs(300));

        // the broadcast lands, so the client is active again
        registry.broadcast(&event(1));
        let removed = registry.cleanup_inactive(Duration::from_secs(120));
        assert!(removed.is_empty());
    }

    #[test]
    fn stats_reports_queue_depth() {
        let registry = ClientRegistry::new(10, 10);
        let _rx = registry.add("watched");
        registry.broadcast(&event(1));
        registry.broadcast(&event(2));

        let stats = registry.stats();
        assert_eq!(stats.len(), 1);
        let (id, stats) = &stats[0];
        assert_eq!(id, "watched");
        assert_eq!(stats.queue_size, 2);
    }
}
