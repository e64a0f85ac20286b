//! Deterministic discrete-event driver for the autonomous polling discipline.
//!
//! Runs the same polling rounds as the async send tasks, but over virtual time
//! with a seeded RNG, so whole episodes replay identically and finish without
//! waiting on the host clock.

use embassy_time::{Duration, Instant};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::agent::Agent;
use super::comm_system::CommunicationSystem;
use super::link::{AckWait, Expiry, PollRound};
use super::types::{Message, MessageId};

/// Handle of an agent registered with the scheduler.
pub type AgentIndex = usize;

enum Event {
    Enqueue { agent: AgentIndex, message: Message },
    Poll { agent: AgentIndex, id: MessageId },
    AirtimeEnd,
    AckDeadline { agent: AgentIndex, id: MessageId },
}

pub struct EpisodeScheduler {
    comms: Arc<CommunicationSystem>,
    agents: Vec<Arc<dyn Agent>>,
    // Keyed by (time in ticks, insertion order) so simultaneous events run FIFO.
    events: BTreeMap<(u64, u64), Event>,
    next_seq: u64,
    now: Instant,
    rng: StdRng,
}

impl EpisodeScheduler {
    pub fn new(comms: Arc<CommunicationSystem>, seed: u64) -> Self {
        Self {
            comms,
            agents: Vec::new(),
            events: BTreeMap::new(),
            next_seq: 0,
            now: Instant::from_ticks(0),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn add_agent(&mut self, agent: Arc<dyn Agent>) -> AgentIndex {
        self.agents.push(agent);
        self.agents.len() - 1
    }

    pub fn agent(&self, index: AgentIndex) -> Option<&Arc<dyn Agent>> {
        self.agents.get(index)
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Queue `message` on `agent` at virtual time `at`.
    pub fn schedule_message(&mut self, agent: AgentIndex, at: Instant, message: Message) {
        self.push(at, Event::Enqueue { agent, message });
    }

    /// Process every event due at or before `deadline`, then move the clock to
    /// `deadline`. Returns the number of events processed.
    pub fn run_until(&mut self, deadline: Instant) -> usize {
        let mut processed = 0;
        while self.events.first_key_value().is_some_and(|(&(at, _), _)| at <= deadline.as_ticks()) {
            self.step();
            processed += 1;
        }
        self.now = self.now.max(deadline);
        processed
    }

    /// Run until no events remain or `horizon` is reached. Returns `true` when
    /// the event queue drained before the horizon.
    pub fn run_to_completion(&mut self, horizon: Instant) -> bool {
        while let Some((&(at, _), _)) = self.events.first_key_value() {
            if at > horizon.as_ticks() {
                return false;
            }
            self.step();
        }
        true
    }

    fn push(&mut self, at: Instant, event: Event) {
        let at = at.max(self.now);
        self.events.insert((at.as_ticks(), self.next_seq), event);
        self.next_seq += 1;
    }

    fn step(&mut self) {
        let Some(((at, _), event)) = self.events.pop_first() else {
            return;
        };
        self.now = Instant::from_ticks(at);
        match event {
            Event::Enqueue { agent, message } => self.on_enqueue(agent, message),
            Event::Poll { agent, id } => self.on_poll(agent, id),
            Event::AirtimeEnd => self.deliver(),
            Event::AckDeadline { agent, id } => self.on_ack_deadline(agent, id),
        }
    }

    fn on_enqueue(&mut self, agent: AgentIndex, message: Message) {
        let Some(target) = self.agents.get(agent) else {
            log::warn!("Message {} scheduled for unknown agent {}", message.id(), agent);
            return;
        };
        let id = message.id().clone();
        if target.enqueue_at(message, self.now) {
            self.push(self.now, Event::Poll { agent, id });
        }
    }

    fn on_poll(&mut self, agent: AgentIndex, id: MessageId) {
        let Some(target) = self.agents.get(agent).cloned() else {
            return;
        };
        let link = target.link();
        match link.poll_round(&self.comms, &id, self.now, AckWait::Sweep, &mut self.rng) {
            PollRound::Deferred(slot) => {
                let slot = slot.max(Duration::from_ticks(1));
                self.push(self.now + slot, Event::Poll { agent, id });
            }
            PollRound::Committed {
                channel_free_at,
                awaiting_ack,
                ..
            } => {
                self.push(channel_free_at, Event::AirtimeEnd);
                if awaiting_ack {
                    let deadline = self.now + link.config().ack_timeout;
                    self.push(deadline, Event::AckDeadline { agent, id });
                }
            }
            PollRound::Finished => {}
        }
    }

    fn on_ack_deadline(&mut self, agent: AgentIndex, id: MessageId) {
        let Some(target) = self.agents.get(agent).cloned() else {
            return;
        };
        if target.link().expire(&id, self.now) == Expiry::Requeued {
            self.push(self.now, Event::Poll { agent, id });
        }
    }

    /// Settle finished airtime and let every agent handle its inbound queue.
    /// Replies are queued after the agent's reply delay.
    fn deliver(&mut self) {
        self.comms.advance(self.now);
        for index in 0..self.agents.len() {
            let agent = self.agents[index].clone();
            while let Ok(message) = agent.inbound().try_receive() {
                if let Some(reply) = agent.receive(&message, self.now) {
                    let at = self.now + agent.reply_delay();
                    self.push(at, Event::Enqueue { agent: index, message: reply });
                }
            }
        }
    }
}
