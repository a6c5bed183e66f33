use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Keys whose upstream fetch is currently running. The first caller for a key leads the fetch;
/// later callers wait for the leader's guard to drop and then look the key up again.
#[derive(Debug, Default)]
pub struct InFlightSet {
    flights: Mutex<HashMap<String, watch::Receiver<()>>>,
}

pub enum Reservation {
    Leader(FlightGuard),
    Follower(FlightWaiter),
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(self: &Arc<Self>, key: &str) -> Reservation {
        let mut flights = self.flights.lock();
        match flights.entry(key.to_string()) {
            Entry::Occupied(occupied) => Reservation::Follower(FlightWaiter {
                done: occupied.get().clone(),
            }),
            Entry::Vacant(vacant) => {
                let (done_tx, done_rx) = watch::channel(());
                vacant.insert(done_rx);
                Reservation::Leader(FlightGuard {
                    key: key.to_string(),
                    set: Arc::clone(self),
                    _done: done_tx,
                })
            }
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.flights.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held by the leader for the duration of a fetch. Dropping it releases the key and wakes every
/// waiter, whether the fetch succeeded or not.
pub struct FlightGuard {
    key: String,
    set: Arc<InFlightSet>,
    // Dropped after the key is removed, which closes the channel for waiters.
    _done: watch::Sender<()>,
}

impl FlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.set.flights.lock().remove(&self.key);
    }
}

pub struct FlightWaiter {
    done: watch::Receiver<()>,
}

impl FlightWaiter {
    /// Resolves once the leader's guard has been dropped.
    pub async fn wait(mut self) {
        // The leader never sends; the only wake-up is the sender closing.
        while self.done.changed().await.is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_reservation_leads_and_others_follow() {
        let set = Arc::new(InFlightSet::new());
        let Reservation::Leader(guard) = set.reserve("k") else {
            panic!("first reservation should lead");
        };
        assert_eq!(guard.key(), "k");
        assert!(matches!(set.reserve("k"), Reservation::Follower(_)));
        assert!(matches!(set.reserve("other"), Reservation::Leader(_)));
        assert!(set.is_in_flight("k"));
        drop(guard);
        assert!(!set.is_in_flight("k"));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn waiters_wake_when_leader_drops() {
        let set = Arc::new(InFlightSet::new());
        let Reservation::Leader(guard) = set.reserve("k") else {
            panic!("expected leader");
        };
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let Reservation::Follower(waiter) = set.reserve("k") else {
                panic!("expected follower");
            };
            waiters.push(tokio::spawn(waiter.wait()));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.iter().all(|handle| !handle.is_finished()));

        drop(guard);
        for handle in waiters {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("waiter should wake")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn key_can_be_led_again_after_release() {
        let set = Arc::new(InFlightSet::new());
        let Reservation::Leader(first) = set.reserve("k") else {
            panic!("expected leader");
        };
        let Reservation::Follower(waiter) = set.reserve("k") else {
            panic!("expected follower");
        };
        drop(first);
        waiter.wait().await;
        assert!(matches!(set.reserve("k"), Reservation::Leader(_)));
    }
}
