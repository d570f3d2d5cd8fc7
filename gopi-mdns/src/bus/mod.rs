//! In-process publish/subscribe fan-out.
//!
//! Every subscriber owns a bounded [`flume`] channel. The bus only keeps the
//! sending half (plus, for [`Delivery::DropOldest`], a receiving clone used to
//! evict), so a dropped [`Subscription`] is noticed on the next emit and its
//! slot is removed.


use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, trace, warn};
use tokio::sync::watch;

use crate::config::MdnsConfig;
use shared::error::{Error, Result};

/// What happens when a subscriber's channel is full.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Lossless emits wait for room (bounded by the bus retry settings);
    /// lossy emits drop the new event.
    #[default]
    Blocking,
    /// The oldest queued event is evicted to make room. Never blocks.
    DropOldest,
}

/// Opaque identifier of a subscription.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

struct Slot<T> {
    id: SubscriptionId,
    tx: flume::Sender<T>,
    // Only kept for DropOldest, to pop the head of a full queue.
    evict: Option<flume::Receiver<T>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Slot {
            id: self.id,
            tx: self.tx.clone(),
            evict: self.evict.clone(),
        }
    }
}

struct State<T> {
    closed: bool,
    slots: Vec<Slot<T>>,
    // Handles that exist and have not been released yet.
    live: HashSet<SubscriptionId>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    next_id: AtomicU64,
    live_count: watch::Sender<usize>,
    capacity: usize,
    retry_count: usize,
    retry_duration: Duration,
}

impl<T> Inner<T> {
    fn release(&self, id: SubscriptionId) -> Result<()> {
        let mut state = self.state.lock()?;
        state.slots.retain(|slot| slot.id != id);
        if state.live.remove(&id) {
            self.live_count.send_replace(state.live.len());
            debug!("bus: released {id}");
        }
        Ok(())
    }
}

/// Single-typed event channel with per-subscriber delivery policy.
pub struct EventBus<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        EventBus {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Creates a bus with `capacity` slots per subscriber. A blocking
    /// delivery waits `retry_count` times `retry_duration` for a full
    /// subscriber; `retry_count == 0` waits indefinitely.
    pub fn new(capacity: usize, retry_count: usize, retry_duration: Duration) -> Self {
        let (live_count, _) = watch::channel(0);
        EventBus {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    closed: false,
                    slots: vec![],
                    live: HashSet::new(),
                }),
                next_id: AtomicU64::new(1),
                live_count,
                capacity: capacity.max(1),
                retry_count,
                retry_duration,
            }),
        }
    }

    pub fn from_config(config: &MdnsConfig) -> Self {
        Self::new(
            config.bus_capacity,
            config.emit_retry_count,
            config.emit_retry_duration,
        )
    }

    /// Registers a new subscriber. Only events emitted after this call are
    /// delivered to it.
    pub fn subscribe(&self, delivery: Delivery) -> Result<Subscription<T>> {
        let mut state = self.inner.state.lock()?;
        if state.closed {
            return Err(Error::ErrBusClosed);
        }
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = flume::bounded(self.inner.capacity);
        let evict = (delivery == Delivery::DropOldest).then(|| rx.clone());
        state.slots.push(Slot { id, tx, evict });
        state.live.insert(id);
        self.inner.live_count.send_replace(state.live.len());
        debug!("bus: subscribed {id} ({delivery:?})");

        Ok(Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Removes a subscriber; its endpoint reports closure once drained.
    /// Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.inner.release(id)
    }

    /// Number of subscribers currently registered.
    pub fn subscribers(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.slots.len())
            .unwrap_or(0)
    }

    /// Delivers `event` to every current subscriber and returns how many
    /// accepted it.
    ///
    /// With `lossy` set, a subscriber with a full [`Delivery::Blocking`]
    /// channel misses the event. Otherwise the emit waits for such
    /// subscribers concurrently, so a slow subscriber never delays delivery
    /// to the others.
    pub async fn emit(&self, event: T, lossy: bool) -> Result<usize> {
        let snapshot = {
            let state = self.inner.state.lock()?;
            if state.closed {
                return Err(Error::ErrBusClosed);
            }
            state.slots.clone()
        };

        let mut delivered = 0;
        let mut dead = vec![];
        let mut waiting = vec![];
        for slot in snapshot {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(flume::TrySendError::Disconnected(_)) => dead.push(slot.id),
                Err(flume::TrySendError::Full(event)) => {
                    if let Some(evict) = &slot.evict {
                        let _ = evict.try_recv();
                        match slot.tx.try_send(event) {
                            Ok(()) => delivered += 1,
                            Err(flume::TrySendError::Disconnected(_)) => dead.push(slot.id),
                            Err(flume::TrySendError::Full(_)) => {
                                trace!("bus: {} still full, event dropped", slot.id);
                            }
                        }
                    } else if lossy {
                        trace!("bus: {} full, lossy event dropped", slot.id);
                    } else {
                        waiting.push(self.wait_send(slot, event));
                    }
                }
            }
        }

        for (id, accepted) in join_all(waiting).await {
            match accepted {
                Some(true) => delivered += 1,
                Some(false) => dead.push(id),
                None => {}
            }
        }

        for id in dead {
            debug!("bus: {id} went away, unsubscribing");
            self.inner.release(id)?;
        }
        Ok(delivered)
    }

    // wait_send blocks on one full subscriber. Returns Some(true) when
    // delivered, Some(false) when the subscriber is gone, None when given up.
    async fn wait_send(&self, slot: Slot<T>, event: T) -> (SubscriptionId, Option<bool>) {
        if self.inner.retry_count == 0 {
            let accepted = slot.tx.send_async(event).await.is_ok();
            return (slot.id, Some(accepted));
        }
        for attempt in 1..=self.inner.retry_count {
            match tokio::time::timeout(
                self.inner.retry_duration,
                slot.tx.send_async(event.clone()),
            )
            .await
            {
                Ok(Ok(())) => return (slot.id, Some(true)),
                Ok(Err(_)) => return (slot.id, Some(false)),
                Err(_) => trace!(
                    "bus: {} still full after attempt {attempt}/{}",
                    slot.id, self.inner.retry_count
                ),
            }
        }
        warn!(
            "bus: {} did not drain within {:?}, event dropped",
            slot.id,
            self.inner.retry_duration * self.inner.retry_count as u32
        );
        (slot.id, None)
    }

    /// Closes every subscriber endpoint and rejects further use, then waits
    /// until every [`Subscription`] handle has been released.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock()?;
            if !state.closed {
                state.closed = true;
                state.slots.clear();
                debug!("bus: closed, {} subscriber(s) to release", state.live.len());
            }
        }
        let mut live = self.inner.live_count.subscribe();
        live.wait_for(|count| *count == 0)
            .await
            .map_err(|_| Error::ErrBusClosed)?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.closed)
            .unwrap_or(true)
    }
}

/// A subscriber endpoint. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: SubscriptionId,
    rx: flume::Receiver<T>,
    bus: Weak<Inner<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next event. Fails with [`Error::ErrBusClosed`] once the
    /// subscription was removed or the bus closed and the queue is drained.
    pub async fn recv(&self) -> Result<T> {
        self.rx.recv_async().await.map_err(|_| Error::ErrBusClosed)
    }

    /// Returns a queued event without waiting.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade()
            && let Err(err) = inner.release(self.id)
        {
            warn!("bus: failed to release {}: {err}", self.id);
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
