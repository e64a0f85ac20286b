//! Send/acknowledge/retry engine shared by every agent role.
//!
//! A message moves `Queued -> InFlight -> {Acknowledged, Exhausted}`, with
//! `InFlight -> Queued` on an ack timeout. The outbound queue, the pending
//! acknowledgement table and the counters live under one lock so each
//! transition is atomic. Channel operations are never performed while that
//! lock is held.

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};
use rand::Rng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use super::channel::Channel;
use super::comm_system::CommunicationSystem;
use super::outbound::{OutboundQueue, QueuedMessage};
use super::stats::{RawStats, duration_ns};
use super::types::{Message, MessageId, Priority};

/// Timing and retry limits of the send/ack/retry engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub transmission_time: Duration,
    pub ack_timeout: Duration,
    pub max_retries: u32,
    /// Polling rounds a message may spend contending before the cycle counts as
    /// a retry. `None` lets a message contend indefinitely.
    pub max_poll_rounds: Option<u32>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transmission_time: Duration::from_millis(80),
            ack_timeout: Duration::from_millis(3000),
            max_retries: 16,
            max_poll_rounds: None,
        }
    }
}

/// Wakes the task waiting for an acknowledgement.
pub type AckSignal = Signal<CriticalSectionRawMutex, ()>;

/// How the timeout of a committed message is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckWait {
    /// A send task races an [`AckSignal`] against the timeout.
    Signal,
    /// Timeouts are found by [`LinkEngine::sweep_timeouts`].
    Sweep,
}

/// Result of one polling round for a queued message.
pub enum PollRound {
    Committed {
        /// When the medium is released again.
        channel_free_at: Instant,
        /// Acknowledgements are retired on commit and never wait for one.
        awaiting_ack: bool,
        waiter: Option<Arc<AckSignal>>,
    },
    /// Try again after this time slot.
    Deferred(Duration),
    /// The message is no longer queued.
    Finished,
}

/// Outcome of an acknowledgement timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Requeued,
    Exhausted,
    /// The message was acknowledged (or reset) before the timeout was handled.
    NotPending,
}

struct PendingAck {
    entry: QueuedMessage,
    sent_at: Instant,
    waiter: Option<Arc<AckSignal>>,
}

#[derive(Default)]
struct LinkState {
    queue: OutboundQueue,
    pending: HashMap<MessageId, PendingAck>,
    poll_rounds: HashMap<MessageId, u32>,
    stats: RawStats,
}

impl LinkState {
    /// Count one retry transition for `entry`, or drop it once the limit is reached.
    fn retry_or_exhaust(&mut self, mut entry: QueuedMessage, max_retries: u32) -> Expiry {
        if entry.retries < max_retries {
            entry.retries += 1;
            self.stats.retries += 1;
            self.queue.enqueue(entry);
            Expiry::Requeued
        } else {
            self.stats.exhausted += 1;
            Expiry::Exhausted
        }
    }

    fn record_delivery(&mut self, entry: &QueuedMessage, now: Instant) {
        self.stats.successful_tx += 1;
        self.stats.total_wait_time_ns += duration_ns(now.saturating_duration_since(entry.first_enqueued_at));
    }
}

pub struct LinkEngine {
    owner_id: String,
    config: LinkConfig,
    state: Mutex<CriticalSectionRawMutex, RefCell<LinkState>>,
}

impl LinkEngine {
    pub fn new(owner_id: impl Into<String>, config: LinkConfig) -> Self {
        Self {
            owner_id: owner_id.into(),
            config,
            state: Mutex::new(RefCell::new(LinkState::default())),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LinkState) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut()))
    }

    /// Queue `message` for transmission. Returns `false` if a message with the
    /// same id is already queued or in flight.
    pub fn enqueue(&self, message: Message, now: Instant) -> bool {
        let id = message.id().clone();
        let accepted = self.with_state(|s| {
            if s.queue.contains(&id) || s.pending.contains_key(&id) {
                return false;
            }
            s.queue.enqueue(QueuedMessage::new(message, now));
            true
        });
        if !accepted {
            log::warn!("[{}] Rejected duplicate message id {}", self.owner_id, id);
        }
        accepted
    }

    /// Head of the outbound queue.
    pub fn peek_head(&self) -> Option<Message> {
        self.with_state(|s| s.queue.peek_highest().map(|e| e.message.clone()))
    }

    fn queued_message(&self, id: &MessageId) -> Option<Message> {
        self.with_state(|s| s.queue.iter().find(|e| e.id() == id).map(|e| e.message.clone()))
    }

    /// Count a channel request, and a failed one if the channel was busy.
    pub fn note_channel_request(&self, busy: bool) {
        self.with_state(|s| {
            s.stats.channel_requests += 1;
            if busy {
                s.stats.failed_channel_requests += 1;
            }
        });
    }

    /// One p-persistence round for the queued message `id`: pick a channel, and
    /// if it is idle transmit with the channel's access probability. Any round
    /// that does not commit defers by one time slot.
    pub fn poll_round<R: Rng>(&self, comms: &CommunicationSystem, id: &MessageId, now: Instant, wait: AckWait, rng: &mut R) -> PollRound {
        let Some(message) = self.queued_message(id) else {
            return PollRound::Finished;
        };
        let channel = comms.select_channel_at(&message, &self.owner_id, now, rng);
        let busy = channel.is_busy_at(now);
        self.note_channel_request(busy);

        if busy {
            log::debug!("[{}] {} finds {} busy", self.owner_id, id, channel.id());
        } else {
            let p = channel.p_for_message(message.priority());
            if rng.gen_range(0.0..1.0) < p {
                if let Some(committed) = self.transmit_on(channel, &message, now, wait) {
                    return committed;
                }
            }
        }

        if let Some(limit) = self.config.max_poll_rounds {
            match self.count_poll_round(id, limit) {
                Some(Expiry::Exhausted) => return PollRound::Finished,
                Some(_) => log::debug!("[{}] {} used up its polling rounds, counted as a retry", self.owner_id, id),
                None => {}
            }
        }
        PollRound::Deferred(channel.current_time_slot())
    }

    fn count_poll_round(&self, id: &MessageId, limit: u32) -> Option<Expiry> {
        let max_retries = self.config.max_retries;
        let outcome = self.with_state(|s| {
            let rounds = s.poll_rounds.entry(id.clone()).or_insert(0);
            *rounds += 1;
            if *rounds < limit {
                return None;
            }
            s.poll_rounds.remove(id);
            let entry = s.queue.remove(id)?;
            Some(s.retry_or_exhaust(entry, max_retries))
        });
        if outcome == Some(Expiry::Exhausted) {
            log::warn!("[{}] {} exhausted its retries while contending", self.owner_id, id);
        }
        outcome
    }

    /// Attempt to put `message` on `channel`. Returns `None` on a collision.
    ///
    /// On commit the message leaves the outbound queue and, unless it is an
    /// acknowledgement, enters the pending table with the commit time.
    pub fn transmit_on(&self, channel: &Channel, message: &Message, now: Instant, wait: AckWait) -> Option<PollRound> {
        self.with_state(|s| s.stats.total_attempts += 1);
        if !channel.attempt_transmit_at(message, &self.owner_id, self.config.transmission_time, now) {
            self.with_state(|s| s.stats.collisions += 1);
            log::debug!("[{}] {} collided on {}", self.owner_id, message.id(), channel.id());
            return None;
        }

        let awaiting_ack = message.requires_ack();
        let waiter = (awaiting_ack && wait == AckWait::Signal).then(|| Arc::new(AckSignal::new()));
        let id = message.id();
        self.with_state(|s| {
            s.poll_rounds.remove(id);
            let Some(entry) = s.queue.remove(id) else {
                return;
            };
            if awaiting_ack {
                s.pending.insert(
                    id.clone(),
                    PendingAck {
                        entry,
                        sent_at: now,
                        waiter: waiter.clone(),
                    },
                );
            } else {
                s.record_delivery(&entry, now);
            }
        });
        log::info!("[{}] {} ({}) committed on {}", self.owner_id, id, message.priority(), channel.id());
        Some(PollRound::Committed {
            channel_free_at: now + self.config.transmission_time,
            awaiting_ack,
            waiter,
        })
    }

    /// Retire the pending message referenced by acknowledgement `ack`.
    /// Malformed or unmatched acknowledgements are ignored.
    pub fn acknowledge(&self, ack: &Message, now: Instant) -> bool {
        let Some(data) = ack.ack_data() else {
            return false;
        };
        let id = data.original_message_id;
        let taken = self.with_state(|s| {
            let pending = s.pending.remove(&id)?;
            s.record_delivery(&pending.entry, now);
            Some(pending)
        });
        match taken {
            Some(pending) => {
                log::info!(
                    "[{}] {} acknowledged after {} ms ({} retries)",
                    self.owner_id,
                    id,
                    now.saturating_duration_since(pending.sent_at).as_millis(),
                    pending.entry.retries
                );
                if let Some(waiter) = pending.waiter {
                    waiter.signal(());
                }
                true
            }
            None => false,
        }
    }

    /// Handle an ack timeout for `id`: re-queue it or drop it when out of retries.
    pub fn expire(&self, id: &MessageId, _now: Instant) -> Expiry {
        let max_retries = self.config.max_retries;
        let outcome = self.with_state(|s| match s.pending.remove(id) {
            Some(pending) => s.retry_or_exhaust(pending.entry, max_retries),
            None => Expiry::NotPending,
        });
        match outcome {
            Expiry::Requeued => log::info!("[{}] {} timed out, re-queued", self.owner_id, id),
            Expiry::Exhausted => log::warn!("[{}] {} exhausted after {} retries", self.owner_id, id, max_retries),
            Expiry::NotPending => {}
        }
        outcome
    }

    /// Expire every sweep-tracked pending message whose timeout has passed.
    pub fn sweep_timeouts(&self, now: Instant) -> Vec<(MessageId, Expiry)> {
        let ack_timeout = self.config.ack_timeout;
        let overdue: Vec<MessageId> = self.with_state(|s| {
            s.pending
                .iter()
                .filter(|(_, p)| p.waiter.is_none() && p.sent_at + ack_timeout <= now)
                .map(|(id, _)| id.clone())
                .collect()
        });
        overdue
            .into_iter()
            .map(|id| {
                let outcome = self.expire(&id, now);
                (id, outcome)
            })
            .collect()
    }

    /// Drop all queued and pending messages and zero the counters. Tasks still
    /// waiting for an acknowledgement are woken and will find nothing pending.
    pub fn reset(&self) {
        let waiters: Vec<Arc<AckSignal>> = self.with_state(|s| {
            let waiters = s.pending.drain().filter_map(|(_, p)| p.waiter).collect();
            *s = LinkState::default();
            waiters
        });
        for waiter in waiters {
            waiter.signal(());
        }
    }

    pub fn raw_stats(&self) -> RawStats {
        self.with_state(|s| RawStats {
            unsent_count: s.queue.len() as u64,
            ..s.stats
        })
    }

    pub fn queue_len(&self) -> usize {
        self.with_state(|s| s.queue.len())
    }

    pub fn pending_count(&self) -> usize {
        self.with_state(|s| s.pending.len())
    }

    pub fn head_priority(&self) -> Option<Priority> {
        self.with_state(|s| s.queue.peek_highest().map(|e| e.message.priority()))
    }

    pub fn is_queued(&self, id: &MessageId) -> bool {
        self.with_state(|s| s.queue.contains(id))
    }

    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.with_state(|s| s.pending.contains_key(id))
    }

    /// Nothing queued and nothing awaiting an acknowledgement.
    pub fn is_idle(&self) -> bool {
        self.with_state(|s| s.queue.is_empty() && s.pending.is_empty())
    }
}
