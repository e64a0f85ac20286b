//! A single shared half-duplex broadcast medium.
//!
//! At most one transmission occupies the medium at a time. A transmission is
//! committed by [`Channel::attempt_transmit`] and completes once its airtime
//! has elapsed: the medium goes idle, counters are updated and the message is
//! fanned out to every registered listener queue.
//!
//! Completion is settled lazily by whoever touches the channel at or after the
//! airtime end (a busy check, a transmit attempt or [`Channel::advance`]), so
//! the same channel works under wall-clock tasks and under virtual time.

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::TrySendError;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::stats::{ChannelStats, duration_ns};
use super::types::{DEFAULT_P_VALUE, InboundQueue, Message, Priority, PriorityMap};

struct Transmission {
    message: Message,
    sender_id: String,
    started_at: Instant,
    ends_at: Instant,
}

#[derive(Default)]
struct Medium {
    in_flight: Option<Transmission>,
    transmitted: u64,
    busy_time: Duration,
}

pub struct Channel {
    id: String,
    medium: Mutex<CriticalSectionRawMutex, RefCell<Medium>>,
    p_values: RwLock<PriorityMap>,
    time_slot: RwLock<Duration>,
    // Held across settle-and-deliver so broadcasts reach each listener in airtime order.
    listeners: std::sync::Mutex<Vec<Arc<InboundQueue>>>,
    dropped_deliveries: AtomicU64,
    airtime_end: Signal<CriticalSectionRawMutex, Instant>,
}

impl Channel {
    pub fn new(id: impl Into<String>, p_values: PriorityMap, time_slot: Duration) -> Self {
        Self {
            id: id.into(),
            medium: Mutex::new(RefCell::new(Medium::default())),
            p_values: RwLock::new(p_values),
            time_slot: RwLock::new(time_slot),
            listeners: std::sync::Mutex::new(Vec::new()),
            dropped_deliveries: AtomicU64::new(0),
            airtime_end: Signal::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_busy(&self) -> bool {
        self.is_busy_at(Instant::now())
    }

    pub fn is_busy_at(&self, now: Instant) -> bool {
        self.advance(now);
        self.medium.lock(|m| m.borrow().in_flight.is_some())
    }

    /// Try to claim the medium for `tx_duration`.
    ///
    /// Returns `false` without side effects when another transmission holds
    /// the medium. On success the caller is the sole transmitter until the
    /// airtime ends; the broadcast happens then, not here.
    pub fn attempt_transmit(&self, message: &Message, sender_id: &str, tx_duration: Duration) -> bool {
        self.attempt_transmit_at(message, sender_id, tx_duration, Instant::now())
    }

    pub fn attempt_transmit_at(&self, message: &Message, sender_id: &str, tx_duration: Duration, now: Instant) -> bool {
        self.advance(now);
        let ends_at = now + tx_duration;
        let claimed = self.medium.lock(|m| {
            let mut m = m.borrow_mut();
            if m.in_flight.is_some() {
                return false;
            }
            m.in_flight = Some(Transmission {
                message: message.clone(),
                sender_id: sender_id.to_string(),
                started_at: now,
                ends_at,
            });
            true
        });
        if claimed {
            log::debug!("[{}] {} on air from {} until {}", self.id, message.id(), sender_id, ends_at.as_millis());
            self.airtime_end.signal(ends_at);
        } else {
            log::debug!("[{}] {} from {} found the medium claimed", self.id, message.id(), sender_id);
        }
        claimed
    }

    /// Complete the current transmission if its airtime has ended by `now`.
    /// Returns `true` when a broadcast was delivered.
    pub fn advance(&self, now: Instant) -> bool {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let finished = self.medium.lock(|m| {
            let mut m = m.borrow_mut();
            if !m.in_flight.as_ref().is_some_and(|t| t.ends_at <= now) {
                return None;
            }
            let done = m.in_flight.take()?;
            m.transmitted += 1;
            m.busy_time += done.ends_at - done.started_at;
            Some(done)
        });
        let Some(done) = finished else {
            return false;
        };

        for (index, listener) in listeners.iter().enumerate() {
            if let Err(TrySendError::Full(_)) = listener.try_send(done.message.clone()) {
                self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
                log::warn!("[{}] Listener {} queue full, dropped {} from {}", self.id, index, done.message.id(), done.sender_id);
            }
        }
        true
    }

    /// Wait until a committed transmission announces its airtime end.
    pub async fn next_airtime_end(&self) -> Instant {
        self.airtime_end.wait().await
    }

    /// Access probability for `priority`; unmapped priorities use [`DEFAULT_P_VALUE`].
    pub fn p_for_message(&self, priority: Priority) -> f64 {
        let table = self.p_values.read().unwrap_or_else(PoisonError::into_inner);
        table.get(&priority).copied().unwrap_or(DEFAULT_P_VALUE)
    }

    /// Replace the access-probability table with a copy of `table`.
    pub fn update_p_values(&self, table: &PriorityMap) {
        let copy = table.clone();
        *self.p_values.write().unwrap_or_else(PoisonError::into_inner) = copy;
    }

    pub fn p_values(&self) -> PriorityMap {
        self.p_values.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn current_time_slot(&self) -> Duration {
        *self.time_slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update_current_time_slot(&self, time_slot: Duration) {
        *self.time_slot.write().unwrap_or_else(PoisonError::into_inner) = time_slot;
    }

    pub fn register_listener(&self, queue: Arc<InboundQueue>) {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).push(queue);
    }

    pub fn stats(&self) -> ChannelStats {
        let (transmitted, busy_time) = self.medium.lock(|m| {
            let m = m.borrow();
            (m.transmitted, m.busy_time)
        });
        ChannelStats {
            channel_id: self.id.clone(),
            transmitted,
            busy_time_ns: duration_ns(busy_time),
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.medium.lock(|m| {
            let mut m = m.borrow_mut();
            m.transmitted = 0;
            m.busy_time = Duration::from_ticks(0);
        });
        self.dropped_deliveries.store(0, Ordering::Relaxed);
    }

    /// Return to an idle medium with zeroed statistics. A transmission still on
    /// the air is discarded undelivered. Listeners and tables are kept.
    ///
    /// The airtime signal is left alone: its waiter is the channel's airtime
    /// task, which must keep running across episodes. A stale end instant only
    /// makes that task call `advance` once on an idle medium.
    pub fn reset(&self) {
        let _listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        self.medium.lock(|m| m.borrow_mut().in_flight = None);
        self.reset_stats();
    }
}
