//! Broadcast Hub: live seat-state fan-out per screening.
//!
//! Each subscriber owns a bounded channel. Publishing never waits: a handle
//! whose buffer is full or whose receiver is gone is dropped from the
//! registry, which closes its stream so the client reconnects and refetches a
//! snapshot. Nothing is persisted or replayed.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::models::{ScreeningId, SeatId, SeatStatus};

pub type SubscriberId = u64;

/// Payload pushed to every viewer of a screening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatEvent {
    pub seat_ids: Vec<SeatId>,
    pub status: SeatStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubMessage {
    Seats(SeatEvent),
    KeepAlive,
}

type SubscriberSet = Arc<Mutex<BTreeMap<SubscriberId, mpsc::Sender<HubMessage>>>>;

pub struct BroadcastHub {
    screenings: RwLock<HashMap<ScreeningId, SubscriberSet>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl BroadcastHub {
    /// `buffer` is the number of undelivered messages a subscriber may lag
    /// behind before it is dropped.
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            screenings: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        })
    }

    fn set_for(&self, screening_id: ScreeningId) -> Option<SubscriberSet> {
        self.screenings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&screening_id)
            .cloned()
    }

    /// Registers a new handle. Only events published after this call are delivered.
    pub fn subscribe(self: &Arc<Self>, screening_id: ScreeningId) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        {
            let mut screenings = self.screenings.write().unwrap_or_else(PoisonError::into_inner);
            let set = screenings.entry(screening_id).or_default();
            set.lock().unwrap_or_else(PoisonError::into_inner).insert(id, tx);
        }

        debug!(screening_id, subscriber_id = id, "subscriber registered");
        Subscription {
            id,
            screening_id,
            receiver: rx,
            hub: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, screening_id: ScreeningId, subscriber_id: SubscriberId) {
        let mut screenings = self.screenings.write().unwrap_or_else(PoisonError::into_inner);
        let Some(set) = screenings.get(&screening_id) else {
            return;
        };

        let now_empty = {
            let mut set = set.lock().unwrap_or_else(PoisonError::into_inner);
            set.remove(&subscriber_id);
            set.is_empty()
        };
        if now_empty {
            screenings.remove(&screening_id);
        }
        debug!(screening_id, subscriber_id, "subscriber removed");
    }

    /// Delivers the event to every handle of the screening and returns how many
    /// accepted it. Handles that cannot accept it are removed.
    pub fn publish(&self, screening_id: ScreeningId, event: SeatEvent) -> usize {
        let Some(set) = self.set_for(screening_id) else {
            return 0;
        };
        let status = event.status;
        let message = HubMessage::Seats(event);

        // The set's lock is held for the whole fan-out so that concurrent
        // publishes to one screening reach every handle in the same order.
        let (delivered, dropped) = {
            let mut set = set.lock().unwrap_or_else(PoisonError::into_inner);
            fan_out(&mut set, &message)
        };

        debug!(screening_id, status = status.as_str(), delivered, dropped, "seat event published");
        if dropped > 0 {
            self.prune_if_empty(screening_id);
        }
        delivered
    }

    /// Sends a keep-alive to every open handle of every screening.
    pub fn keep_alive(&self) -> usize {
        let sets: Vec<(ScreeningId, SubscriberSet)> = self
            .screenings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, set)| (*id, set.clone()))
            .collect();

        let mut delivered = 0;
        for (screening_id, set) in sets {
            let (ok, dropped) = {
                let mut set = set.lock().unwrap_or_else(PoisonError::into_inner);
                fan_out(&mut set, &HubMessage::KeepAlive)
            };
            delivered += ok;
            if dropped > 0 {
                self.prune_if_empty(screening_id);
            }
        }
        delivered
    }

    fn prune_if_empty(&self, screening_id: ScreeningId) {
        let mut screenings = self.screenings.write().unwrap_or_else(PoisonError::into_inner);
        let empty = screenings
            .get(&screening_id)
            .map(|set| set.lock().unwrap_or_else(PoisonError::into_inner).is_empty())
            .unwrap_or(false);
        if empty {
            screenings.remove(&screening_id);
        }
    }

    pub fn subscriber_count(&self, screening_id: ScreeningId) -> usize {
        self.set_for(screening_id)
            .map(|set| set.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.screenings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|set| set.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Spawns the periodic keep-alive loop. The task ends once the hub is dropped.
    pub fn spawn_keep_alive(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                let delivered = hub.keep_alive();
                debug!(delivered, "keep-alive sent");
            }
            info!("keep-alive loop stopped");
        })
    }
}

/// Non-blocking send to every handle; failed handles are removed. Returns
/// (delivered, dropped).
fn fan_out(
    set: &mut BTreeMap<SubscriberId, mpsc::Sender<HubMessage>>,
    message: &HubMessage,
) -> (usize, usize) {
    let mut delivered = 0;
    let mut dropped = 0;
    set.retain(|subscriber_id, tx| match tx.try_send(message.clone()) {
        Ok(()) => {
            delivered += 1;
            true
        }
        Err(TrySendError::Full(_)) => {
            debug!(subscriber_id, "subscriber lagging, dropping");
            dropped += 1;
            false
        }
        Err(TrySendError::Closed(_)) => {
            dropped += 1;
            false
        }
    });
    (delivered, dropped)
}

/// Receiving end of a subscription. Dropping it unregisters the handle, so a
/// client disconnect (which drops the response stream) cleans up immediately.
pub struct Subscription {
    id: SubscriberId,
    screening_id: ScreeningId,
    receiver: mpsc::Receiver<HubMessage>,
    hub: Weak<BroadcastHub>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn screening_id(&self) -> ScreeningId {
        self.screening_id
    }

    /// Next message, or `None` once the hub has dropped this handle.
    pub async fn recv(&mut self) -> Option<HubMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = HubMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.screening_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booked(ids: &[SeatId]) -> SeatEvent {
        SeatEvent { seat_ids: ids.to_vec(), status: SeatStatus::Booked }
    }

    #[tokio::test]
    async fn publish_reaches_only_the_screenings_subscribers() {
        let hub = BroadcastHub::new(8);
        let mut a1 = hub.subscribe(1);
        let mut a2 = hub.subscribe(1);
        let mut b = hub.subscribe(2);

        assert_eq!(hub.publish(1, booked(&[10, 11])), 2);

        assert_eq!(a1.recv().await, Some(HubMessage::Seats(booked(&[10, 11]))));
        assert_eq!(a2.recv().await, Some(HubMessage::Seats(booked(&[10, 11]))));
        assert_eq!(b.try_recv(), None);
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let hub = BroadcastHub::new(8);
        let first = hub.subscribe(1);
        let _second = hub.subscribe(1);
        assert_eq!(hub.subscriber_count(1), 2);

        drop(first);
        assert_eq!(hub.subscriber_count(1), 1);
        assert_eq!(hub.total_subscribers(), 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_dropped_without_blocking_others() {
        let hub = BroadcastHub::new(1);
        let mut slow = hub.subscribe(1);
        let mut fast = hub.subscribe(1);

        hub.publish(1, booked(&[1]));
        assert_eq!(fast.recv().await, Some(HubMessage::Seats(booked(&[1]))));

        // slow never read; its buffer of one is still full
        assert_eq!(hub.publish(1, booked(&[2])), 1);
        assert_eq!(fast.recv().await, Some(HubMessage::Seats(booked(&[2]))));
        assert_eq!(hub.subscriber_count(1), 1);

        assert_eq!(slow.recv().await, Some(HubMessage::Seats(booked(&[1]))));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn keep_alive_reaches_every_screening() {
        let hub = BroadcastHub::new(4);
        let mut a = hub.subscribe(1);
        let mut b = hub.subscribe(2);

        assert_eq!(hub.keep_alive(), 2);
        assert_eq!(a.recv().await, Some(HubMessage::KeepAlive));
        assert_eq!(b.recv().await, Some(HubMessage::KeepAlive));
    }

    #[tokio::test]
    async fn keep_alive_failure_removes_handle() {
        let hub = BroadcastHub::new(1);
        let _stuck = hub.subscribe(1);
        hub.keep_alive();
        hub.keep_alive();
        assert_eq!(hub.total_subscribers(), 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let hub = BroadcastHub::new(4);
        assert_eq!(hub.publish(42, booked(&[1])), 0);
    }
}
