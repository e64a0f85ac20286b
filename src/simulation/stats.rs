//! Counters collected by agents and channels, and the per-episode report.

use embassy_time::Duration;
use serde::Serialize;

/// Simulation duration in nanoseconds, the unit every report uses.
pub fn duration_ns(duration: Duration) -> u64 {
    duration.as_micros().saturating_mul(1_000)
}

/// Raw counters of one agent's send/ack/retry engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RawStats {
    /// Messages retired as delivered (acknowledged, or committed acknowledgements).
    pub successful_tx: u64,
    /// Transmission attempts that passed the p-persistence draw.
    pub total_attempts: u64,
    /// Attempts that found the medium claimed by someone else.
    pub collisions: u64,
    /// Ack timeouts that sent a message back to the queue.
    pub retries: u64,
    /// Polling rounds or step actions that asked for a channel.
    pub channel_requests: u64,
    /// Channel requests that found the channel busy.
    pub failed_channel_requests: u64,
    /// Sum over delivered messages of the time from first enqueue to delivery.
    pub total_wait_time_ns: u64,
    /// Messages still waiting in the outbound queue.
    pub unsent_count: u64,
    /// Messages dropped after exhausting their retries.
    pub exhausted: u64,
}

impl RawStats {
    /// Add another agent's counters to this one.
    pub fn merge(&mut self, other: &RawStats) {
        self.successful_tx += other.successful_tx;
        self.total_attempts += other.total_attempts;
        self.collisions += other.collisions;
        self.retries += other.retries;
        self.channel_requests += other.channel_requests;
        self.failed_channel_requests += other.failed_channel_requests;
        self.total_wait_time_ns += other.total_wait_time_ns;
        self.unsent_count += other.unsent_count;
        self.exhausted += other.exhausted;
    }

    /// Counters accumulated since `previous`. `unsent_count` is a level, not a
    /// counter, so the current value is kept.
    pub fn delta(&self, previous: &RawStats) -> RawStats {
        RawStats {
            successful_tx: self.successful_tx.saturating_sub(previous.successful_tx),
            total_attempts: self.total_attempts.saturating_sub(previous.total_attempts),
            collisions: self.collisions.saturating_sub(previous.collisions),
            retries: self.retries.saturating_sub(previous.retries),
            channel_requests: self.channel_requests.saturating_sub(previous.channel_requests),
            failed_channel_requests: self.failed_channel_requests.saturating_sub(previous.failed_channel_requests),
            total_wait_time_ns: self.total_wait_time_ns.saturating_sub(previous.total_wait_time_ns),
            unsent_count: self.unsent_count,
            exhausted: self.exhausted.saturating_sub(previous.exhausted),
        }
    }

    pub fn collision_rate(&self) -> f64 {
        ratio(self.collisions, self.total_attempts)
    }

    pub fn contention_rate(&self) -> f64 {
        ratio(self.failed_channel_requests, self.channel_requests)
    }

    /// Mean delivery latency, or `None` before the first delivery.
    pub fn average_wait(&self) -> Option<Duration> {
        (self.successful_tx > 0).then(|| Duration::from_micros(self.total_wait_time_ns / self.successful_tx / 1_000))
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 { 0.0 } else { numerator as f64 / denominator as f64 }
}

/// Usage counters of one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub channel_id: String,
    pub transmitted: u64,
    pub busy_time_ns: u64,
    /// Broadcast copies dropped because a listener queue was full.
    pub dropped_deliveries: u64,
}

impl ChannelStats {
    /// Fraction of `window` the channel spent transmitting, clamped to `[0, 1]`.
    pub fn utilization(&self, window: Duration) -> f64 {
        let window_ns = duration_ns(window);
        if window_ns == 0 {
            return 0.0;
        }
        (self.busy_time_ns as f64 / window_ns as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub stats: RawStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReport {
    #[serde(flatten)]
    pub stats: ChannelStats,
    pub utilization: f64,
}

/// Summary of one episode, serialised as JSON by the binary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeReport {
    pub episode: u32,
    pub duration_ns: u64,
    pub totals: RawStats,
    pub agents: Vec<AgentReport>,
    pub channels: Vec<ChannelReport>,
}

impl EpisodeReport {
    pub fn new(episode: u32, duration: Duration, agents: Vec<AgentReport>, channels: Vec<ChannelStats>) -> Self {
        let mut totals = RawStats::default();
        for agent in &agents {
            totals.merge(&agent.stats);
        }
        let channels = channels
            .into_iter()
            .map(|stats| ChannelReport {
                utilization: stats.utilization(duration),
                stats,
            })
            .collect();
        Self {
            episode,
            duration_ns: duration_ns(duration),
            totals,
            agents,
            channels,
        }
    }
}
