//! Autonomous driving of agents on the embassy executor.
//!
//! - One airtime task per channel completes transmissions when their airtime ends
//! - One listener task per agent handles received broadcasts
//! - One send task per message runs the polling loop until the message is
//!   acknowledged, exhausted or retired

use embassy_executor::Spawner;
use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Instant, Timer};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::agent::Agent;
use super::channel::Channel;
use super::comm_system::CommunicationSystem;
use super::link::{AckWait, Expiry, LinkEngine, PollRound};
use super::types::{Message, MessageId};

pub const MAX_CHANNELS: usize = 2;
pub const MAX_AGENTS: usize = 64;
/// Messages that can be in their polling loop at the same time.
pub const MAX_ACTIVE_SENDS: usize = 256;

/// Counts send tasks that have not finished yet.
#[derive(Debug, Default)]
pub struct SendTracker {
    outstanding: AtomicUsize,
}

impl SendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Complete each transmission on `channel` as soon as its airtime ends.
pub async fn settle_airtime(channel: &Channel) {
    loop {
        let ends_at = channel.next_airtime_end().await;
        Timer::at(ends_at).await;
        channel.advance(Instant::now());
    }
}

/// Hand every message arriving in the agent's inbound queue to the agent and
/// pass any reply to `on_reply`.
pub async fn serve_inbound(agent: &dyn Agent, mut on_reply: impl FnMut(Message)) {
    loop {
        let message = agent.inbound().receive().await;
        if let Some(reply) = agent.receive(&message, Instant::now()) {
            on_reply(reply);
        }
    }
}

/// Polling loop for one queued message.
///
/// Each round picks a channel and, if it is idle, transmits with the
/// channel's access probability; otherwise it sleeps exactly one time slot.
/// After a commit the acknowledgement races the ack timeout, and a timeout
/// sends the message back into contention until its retries are used up.
pub async fn drive_message(link: &LinkEngine, comms: &CommunicationSystem, id: &MessageId) {
    let mut rng = StdRng::from_entropy();
    let ack_timeout = link.config().ack_timeout;
    loop {
        match link.poll_round(comms, id, Instant::now(), AckWait::Signal, &mut rng) {
            PollRound::Deferred(slot) => Timer::after(slot).await,
            PollRound::Finished => return,
            PollRound::Committed { awaiting_ack: false, .. } => return,
            PollRound::Committed { waiter, .. } => {
                let acknowledged = match waiter {
                    Some(waiter) => matches!(select(waiter.wait(), Timer::after(ack_timeout)).await, Either::First(_)),
                    None => false,
                };
                if acknowledged {
                    return;
                }
                match link.expire(id, Instant::now()) {
                    Expiry::Requeued => {}
                    Expiry::Exhausted | Expiry::NotPending => return,
                }
            }
        }
    }
}

#[embassy_executor::task(pool_size = MAX_CHANNELS)]
pub async fn airtime_task(channel: Arc<Channel>) {
    settle_airtime(&channel).await;
}

#[embassy_executor::task(pool_size = MAX_AGENTS)]
pub async fn listener_task(spawner: Spawner, agent: Arc<dyn Agent>, tracker: Arc<SendTracker>) {
    let delay = agent.reply_delay();
    serve_inbound(agent.as_ref(), |reply| spawn_send(spawner, agent.clone(), reply, delay, &tracker)).await;
}

#[embassy_executor::task(pool_size = MAX_ACTIVE_SENDS)]
async fn send_task(agent: Arc<dyn Agent>, message: Message, start_delay: Duration, tracker: Arc<SendTracker>) {
    if start_delay > Duration::from_ticks(0) {
        Timer::after(start_delay).await;
    }
    let id = message.id().clone();
    if agent.enqueue(message) {
        drive_message(agent.link(), agent.comms(), &id).await;
    }
    tracker.finish();
}

/// Queue `message` on `agent` after `start_delay` and drive it to a terminal state.
pub fn spawn_send(spawner: Spawner, agent: Arc<dyn Agent>, message: Message, start_delay: Duration, tracker: &Arc<SendTracker>) {
    let id = message.id().clone();
    tracker.begin();
    match send_task(agent, message, start_delay, tracker.clone()) {
        Ok(token) => spawner.spawn(token),
        Err(e) => {
            tracker.finish();
            log::error!("No free send task for {}: {:?}", id, e);
        }
    }
}

/// Start the airtime task of every channel and a listener task per agent.
pub fn spawn_agent_tasks(spawner: Spawner, comms: &CommunicationSystem, agents: &[Arc<dyn Agent>], tracker: &Arc<SendTracker>) {
    for channel in comms.channels() {
        match airtime_task(channel.clone()) {
            Ok(token) => spawner.spawn(token),
            Err(e) => log::error!("Failed to start airtime task for {}: {:?}", channel.id(), e),
        }
    }
    for agent in agents {
        match listener_task(spawner, agent.clone(), tracker.clone()) {
            Ok(token) => spawner.spawn(token),
            Err(e) => log::error!("Failed to start listener for {}: {:?}", agent.id(), e),
        }
    }
}
