//! Primary/backup channel pair and the per-message channel choice.

use embassy_time::Instant;
use rand::Rng;
use std::sync::{Arc, PoisonError, RwLock};

use super::channel::Channel;
use super::stats::ChannelStats;
use super::types::{InboundQueue, Message, Priority, PriorityMap};

pub struct CommunicationSystem {
    primary: Arc<Channel>,
    backup: Option<Arc<Channel>>,
    switchover: RwLock<PriorityMap>,
}

impl CommunicationSystem {
    pub fn new(primary: Arc<Channel>, backup: Option<Arc<Channel>>, switchover: &PriorityMap) -> Self {
        Self {
            primary,
            backup,
            switchover: RwLock::new(switchover.clone()),
        }
    }

    pub fn primary(&self) -> &Arc<Channel> {
        &self.primary
    }

    pub fn backup(&self) -> Option<&Arc<Channel>> {
        self.backup.as_ref()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        std::iter::once(&self.primary).chain(self.backup.iter())
    }

    pub fn is_primary(&self, channel: &Channel) -> bool {
        std::ptr::eq(channel, Arc::as_ptr(&self.primary))
    }

    /// Register `queue` on every channel.
    pub fn register_listener(&self, queue: Arc<InboundQueue>) {
        for channel in self.channels() {
            channel.register_listener(queue.clone());
        }
    }

    pub fn select_channel_for_message(&self, message: &Message, sender_id: &str) -> &Arc<Channel> {
        self.select_channel_at(message, sender_id, Instant::now(), &mut rand::thread_rng())
    }

    /// Choose the channel for `message` at `now`.
    ///
    /// The primary is used when there is no backup or the primary is idle.
    /// Otherwise the backup is taken with the switchover probability of the
    /// message's priority (unmapped priorities never switch over).
    pub fn select_channel_at<R: Rng>(&self, message: &Message, sender_id: &str, now: Instant, rng: &mut R) -> &Arc<Channel> {
        let Some(backup) = &self.backup else {
            return &self.primary;
        };
        if !self.primary.is_busy_at(now) {
            return &self.primary;
        }
        let probability = self.switchover_probability(message.priority());
        if rng.gen_range(0.0..1.0) < probability {
            log::debug!("{} switches {} to {} (p={})", sender_id, message.id(), backup.id(), probability);
            backup
        } else {
            &self.primary
        }
    }

    pub fn switchover_probability(&self, priority: Priority) -> f64 {
        let table = self.switchover.read().unwrap_or_else(PoisonError::into_inner);
        table.get(&priority).copied().unwrap_or(0.0)
    }

    /// Replace the switchover table with a copy of `table`.
    pub fn update_switchover_probabilities(&self, table: &PriorityMap) {
        let copy = table.clone();
        *self.switchover.write().unwrap_or_else(PoisonError::into_inner) = copy;
    }

    /// Settle finished transmissions on every channel.
    pub fn advance(&self, now: Instant) {
        for channel in self.channels() {
            channel.advance(now);
        }
    }

    pub fn reset(&self) {
        for channel in self.channels() {
            channel.reset();
        }
    }

    pub fn channel_stats(&self) -> Vec<ChannelStats> {
        self.channels().map(|c| c.stats()).collect()
    }
}
