//! Communicating entities: the common [`Agent`] contract and its two roles.
//!
//! Both roles compose a [`LinkEngine`] for the send/ack/retry state machine
//! and differ only in how they react to received traffic. An agent can be
//! driven by autonomous polling tasks (see `agent_task`) or stepped one
//! discrete action at a time through [`Agent::step`].

use embassy_time::{Duration, Instant};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::comm_system::CommunicationSystem;
use super::link::{AckWait, LinkConfig, LinkEngine};
use super::stats::RawStats;
use super::types::{InboundQueue, Message, MessageError, MessageHeader, MessageId, MessageType, Priority};

/// Action chosen by an external controller for one discrete step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    Wait,
    SendPrimary,
    SendBackup,
}

/// Snapshot of what an agent can see before choosing an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub has_message: bool,
    pub top_priority: Option<Priority>,
    pub primary_busy: bool,
    pub backup_busy: bool,
    pub outbound_queue_length: usize,
    pub pending_ack_count: usize,
}

/// Immediate result of one discrete step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Waited,
    NoMessage,
    NoBackupChannel,
    ChannelBusy,
    Collision,
    Committed,
}

impl StepOutcome {
    /// Scalar form used as a raw reward signal.
    pub fn value(self) -> f32 {
        match self {
            StepOutcome::Committed => 1.0,
            StepOutcome::Collision => -1.0,
            StepOutcome::Waited | StepOutcome::NoMessage | StepOutcome::NoBackupChannel | StepOutcome::ChannelBusy => 0.0,
        }
    }
}

impl From<StepOutcome> for f32 {
    fn from(outcome: StepOutcome) -> Self {
        outcome.value()
    }
}

impl Serialize for StepOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f32(self.value())
    }
}

pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    fn link(&self) -> &LinkEngine;
    fn comms(&self) -> &CommunicationSystem;
    fn inbound(&self) -> &Arc<InboundQueue>;

    /// React to one received broadcast. A returned message is queued for sending.
    fn receive(&self, message: &Message, now: Instant) -> Option<Message>;

    /// Delay between receiving a message and queueing the reply in autonomous mode.
    fn reply_delay(&self) -> Duration {
        Duration::from_ticks(0)
    }

    fn enqueue(&self, message: Message) -> bool {
        self.enqueue_at(message, Instant::now())
    }

    fn enqueue_at(&self, message: Message, now: Instant) -> bool {
        self.link().enqueue(message, now)
    }

    fn observation(&self) -> Observation {
        self.observation_at(Instant::now())
    }

    fn observation_at(&self, now: Instant) -> Observation {
        let comms = self.comms();
        let link = self.link();
        let outbound_queue_length = link.queue_len();
        Observation {
            has_message: outbound_queue_length > 0,
            top_priority: link.head_priority(),
            primary_busy: comms.primary().is_busy_at(now),
            backup_busy: comms.backup().is_some_and(|b| b.is_busy_at(now)),
            outbound_queue_length,
            pending_ack_count: link.pending_count(),
        }
    }

    fn step(&self, action: AgentAction) -> StepOutcome {
        self.step_at(action, Instant::now())
    }

    /// Apply one discrete action to the head of the outbound queue.
    ///
    /// Finished airtime is settled, received traffic handled (replies are
    /// queued at once) and overdue acknowledgements expired first. The action
    /// then makes at most one busy check and one transmit attempt; nothing
    /// sleeps.
    fn step_at(&self, action: AgentAction, now: Instant) -> StepOutcome {
        let comms = self.comms();
        let link = self.link();
        comms.advance(now);
        self.drain_inbound(now);
        link.sweep_timeouts(now);

        let channel = match action {
            AgentAction::Wait => return StepOutcome::Waited,
            AgentAction::SendPrimary => comms.primary(),
            AgentAction::SendBackup => match comms.backup() {
                Some(backup) => backup,
                None => return StepOutcome::NoBackupChannel,
            },
        };
        let Some(message) = link.peek_head() else {
            return StepOutcome::NoMessage;
        };
        let busy = channel.is_busy_at(now);
        link.note_channel_request(busy);
        if busy {
            return StepOutcome::ChannelBusy;
        }
        match link.transmit_on(channel, &message, now, AckWait::Sweep) {
            Some(_) => StepOutcome::Committed,
            None => StepOutcome::Collision,
        }
    }

    /// Handle everything waiting in the inbound queue, queueing replies immediately.
    fn drain_inbound(&self, now: Instant) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.inbound().try_receive() {
            handled += 1;
            if let Some(reply) = self.receive(&message, now) {
                self.enqueue_at(reply, now);
            }
        }
        handled
    }

    fn reset(&self) {
        self.link().reset();
        self.inbound().clear();
    }

    fn raw_stats(&self) -> RawStats {
        self.link().raw_stats()
    }
}

fn listen_on(comms: &CommunicationSystem) -> Arc<InboundQueue> {
    let inbound = Arc::new(InboundQueue::new());
    comms.register_listener(inbound.clone());
    inbound
}

pub struct Aircraft {
    icao_address: String,
    flight_id: String,
    link: LinkEngine,
    comms: Arc<CommunicationSystem>,
    inbound: Arc<InboundQueue>,
}

impl Aircraft {
    /// Create an aircraft listening on every channel of `comms`.
    pub fn new(icao_address: impl Into<String>, flight_id: impl Into<String>, comms: Arc<CommunicationSystem>, config: LinkConfig) -> Self {
        let icao_address = icao_address.into();
        Self {
            link: LinkEngine::new(icao_address.clone(), config),
            inbound: listen_on(&comms),
            icao_address,
            flight_id: flight_id.into(),
            comms,
        }
    }

    pub fn icao_address(&self) -> &str {
        &self.icao_address
    }

    pub fn flight_id(&self) -> &str {
        &self.flight_id
    }

    /// Build a downlink message from this aircraft. Without an explicit
    /// priority the message type's default applies.
    pub fn message<T: Serialize + ?Sized>(
        &self,
        message_id: MessageId,
        message_type: MessageType,
        priority: Option<Priority>,
        data: &T,
        timestamp: Instant,
    ) -> Result<Message, MessageError> {
        let header = MessageHeader {
            sender_id: self.icao_address.clone(),
            origin_id: self.flight_id.clone(),
            message_id,
            timestamp,
            message_type,
        };
        Message::new(header, priority.unwrap_or(message_type.default_priority()), data)
    }
}

impl Agent for Aircraft {
    fn id(&self) -> &str {
        &self.icao_address
    }

    fn link(&self) -> &LinkEngine {
        &self.link
    }

    fn comms(&self) -> &CommunicationSystem {
        &self.comms
    }

    fn inbound(&self) -> &Arc<InboundQueue> {
        &self.inbound
    }

    fn receive(&self, message: &Message, now: Instant) -> Option<Message> {
        if message.message_type() == MessageType::Acknowledgement {
            self.link.acknowledge(message, now);
        }
        None
    }
}

pub struct GroundStation {
    station_id: String,
    processing_delay: Duration,
    link: LinkEngine,
    comms: Arc<CommunicationSystem>,
    inbound: Arc<InboundQueue>,
    // Acknowledgements issued per original message; repeated ones get a suffix.
    acks_issued: Mutex<HashMap<MessageId, u32>>,
}

impl GroundStation {
    pub fn new(station_id: impl Into<String>, processing_delay: Duration, comms: Arc<CommunicationSystem>, config: LinkConfig) -> Self {
        let station_id = station_id.into();
        Self {
            link: LinkEngine::new(station_id.clone(), config),
            inbound: listen_on(&comms),
            station_id,
            processing_delay,
            comms,
            acks_issued: Mutex::new(HashMap::new()),
        }
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    fn ack_id(original: &MessageId, issue: u32) -> MessageId {
        if issue <= 1 {
            MessageId::new(format!("ACK-{original}"))
        } else {
            MessageId::new(format!("ACK-{original}/{issue}"))
        }
    }

    /// Acknowledgement for `original`, unless an earlier one is still queued.
    fn acknowledgement_for(&self, original: &Message, now: Instant) -> Option<Message> {
        let mut issued = self.acks_issued.lock().unwrap_or_else(PoisonError::into_inner);
        let count = issued.entry(original.id().clone()).or_insert(0);
        if *count > 0 && self.link.is_queued(&Self::ack_id(original.id(), *count)) {
            log::debug!("[{}] Acknowledgement for {} still queued", self.station_id, original.id());
            return None;
        }
        *count += 1;
        let ack_id = Self::ack_id(original.id(), *count);
        match Message::acknowledgement(original, ack_id, &self.station_id, &self.station_id, now) {
            Ok(ack) => Some(ack),
            Err(e) => {
                log::error!("[{}] Could not acknowledge {}: {}", self.station_id, original.id(), e);
                None
            }
        }
    }
}

impl Agent for GroundStation {
    fn id(&self) -> &str {
        &self.station_id
    }

    fn link(&self) -> &LinkEngine {
        &self.link
    }

    fn comms(&self) -> &CommunicationSystem {
        &self.comms
    }

    fn inbound(&self) -> &Arc<InboundQueue> {
        &self.inbound
    }

    fn receive(&self, message: &Message, now: Instant) -> Option<Message> {
        if message.sender_id() == self.station_id {
            return None;
        }
        if message.message_type() == MessageType::Acknowledgement {
            self.link.acknowledge(message, now);
            return None;
        }
        log::info!("[{}] Received {} ({:?}) from {}", self.station_id, message.id(), message.message_type(), message.origin_id());
        self.acknowledgement_for(message, now)
    }

    fn reply_delay(&self) -> Duration {
        self.processing_delay
    }

    fn reset(&self) {
        self.link.reset();
        self.inbound.clear();
        self.acks_issued.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::channel::Channel;
    use crate::simulation::types::priority_map;
    use crate::simulation::types::test_support::message;
    use serde_json::json;

    const SLOT: Duration = Duration::from_millis(320);
    const TX: Duration = Duration::from_millis(80);

    fn comms(with_backup: bool) -> Arc<CommunicationSystem> {
        let primary = Arc::new(Channel::new("VHF1", priority_map(0.9, 0.7, 0.4, 0.2), SLOT));
        let backup = with_backup.then(|| Arc::new(Channel::new("VHF2", priority_map(0.95, 0.8, 0.2, 0.1), SLOT)));
        Arc::new(CommunicationSystem::new(primary, backup, &priority_map(1.0, 0.8, 0.3, 0.05)))
    }

    fn pair(comms: &Arc<CommunicationSystem>) -> (Aircraft, GroundStation) {
        let aircraft = Aircraft::new("A70000", "CES-1001", comms.clone(), LinkConfig::default());
        let ground = GroundStation::new("GND_CTL", Duration::from_millis(200), comms.clone(), LinkConfig::default());
        (aircraft, ground)
    }

    #[test]
    fn discrete_round_trip_delivers_and_acknowledges() {
        let comms = comms(false);
        let (aircraft, ground) = pair(&comms);
        let t0 = Instant::from_millis(10_000);
        let report = aircraft
            .message(MessageId::new("CES-1001-1"), MessageType::PositionReport, None, &json!({"lat": 31.7}), t0)
            .unwrap();
        assert!(aircraft.enqueue_at(report, t0));

        assert_eq!(aircraft.step_at(AgentAction::SendPrimary, t0), StepOutcome::Committed);
        let obs = aircraft.observation_at(t0);
        assert!(obs.primary_busy);
        assert_eq!((obs.outbound_queue_length, obs.pending_ack_count), (0, 1));

        let t1 = t0 + TX;
        assert_eq!(ground.step_at(AgentAction::Wait, t1), StepOutcome::Waited);
        assert_eq!(ground.observation_at(t1).top_priority, Some(Priority::High));
        assert_eq!(ground.step_at(AgentAction::SendPrimary, t1), StepOutcome::Committed);

        let t2 = t1 + TX;
        assert_eq!(aircraft.step_at(AgentAction::Wait, t2), StepOutcome::Waited);
        assert!(aircraft.link().is_idle());
        let stats = aircraft.raw_stats();
        assert_eq!(stats.successful_tx, 1);
        assert_eq!(stats.total_wait_time_ns, 160_000_000);
        assert_eq!(ground.raw_stats().successful_tx, 1);
    }

    #[test]
    fn step_reports_missing_message_backup_and_busy_channel() {
        let comms = comms(false);
        let (aircraft, ground) = pair(&comms);
        let t0 = Instant::from_millis(0);
        assert_eq!(aircraft.step_at(AgentAction::SendPrimary, t0), StepOutcome::NoMessage);
        assert_eq!(aircraft.step_at(AgentAction::SendBackup, t0), StepOutcome::NoBackupChannel);

        ground.enqueue_at(message("GND-1", "GND_CTL", Priority::Low), t0);
        assert_eq!(ground.step_at(AgentAction::SendPrimary, t0), StepOutcome::Committed);
        aircraft.enqueue_at(message("CES-1001-1", "A70000", Priority::Critical), t0);
        assert_eq!(aircraft.step_at(AgentAction::SendPrimary, t0 + Duration::from_millis(10)), StepOutcome::ChannelBusy);

        let stats = aircraft.raw_stats();
        assert_eq!((stats.channel_requests, stats.failed_channel_requests, stats.total_attempts), (1, 1, 0));
    }

    #[test]
    fn backup_step_uses_backup_channel() {
        let comms = comms(true);
        let (aircraft, _ground) = pair(&comms);
        let t0 = Instant::from_millis(0);
        aircraft.enqueue_at(message("CES-1001-1", "A70000", Priority::Critical), t0);
        assert_eq!(aircraft.step_at(AgentAction::SendBackup, t0), StepOutcome::Committed);
        let obs = aircraft.observation_at(t0);
        assert!(obs.backup_busy);
        assert!(!obs.primary_busy);
    }

    #[test]
    fn step_outcome_scalar_values() {
        assert_eq!(f32::from(StepOutcome::Committed), 1.0);
        assert_eq!(f32::from(StepOutcome::Collision), -1.0);
        assert_eq!(StepOutcome::ChannelBusy.value(), 0.0);
        assert_eq!(serde_json::to_value(StepOutcome::Collision).unwrap(), json!(-1.0));
    }

    #[test]
    fn ground_ignores_own_traffic_and_dedups_queued_acks() {
        let comms = comms(false);
        let (_aircraft, ground) = pair(&comms);
        let t0 = Instant::from_millis(0);
        assert!(ground.receive(&message("GND-1", "GND_CTL", Priority::High), t0).is_none());

        let downlink = message("CES-1001-1", "A70000", Priority::Medium);
        let ack = ground.receive(&downlink, t0).unwrap();
        assert_eq!(ack.id().as_str(), "ACK-CES-1001-1");
        assert_eq!(ack.priority(), Priority::Medium);
        assert!(ground.enqueue_at(ack, t0));
        assert!(ground.receive(&downlink, t0).is_none());

        assert_eq!(ground.step_at(AgentAction::SendPrimary, t0), StepOutcome::Committed);
        let again = ground.receive(&downlink, t0 + TX).unwrap();
        assert_eq!(again.id().as_str(), "ACK-CES-1001-1/2");
    }

    #[test]
    fn unacknowledged_discrete_message_times_out_during_steps() {
        let comms = comms(false);
        let aircraft = Aircraft::new(
            "A70001",
            "CES-2002",
            comms.clone(),
            LinkConfig {
                max_retries: 0,
                ..LinkConfig::default()
            },
        );
        let t0 = Instant::from_millis(0);
        aircraft.enqueue_at(message("CES-2002-1", "A70001", Priority::High), t0);
        assert_eq!(aircraft.step_at(AgentAction::SendPrimary, t0), StepOutcome::Committed);
        aircraft.step_at(AgentAction::Wait, t0 + Duration::from_millis(3000));
        let stats = aircraft.raw_stats();
        assert_eq!((stats.exhausted, stats.successful_tx), (1, 0));
        assert!(aircraft.link().is_idle());
    }

    #[test]
    fn reset_clears_link_and_inbox() {
        let comms = comms(false);
        let (aircraft, ground) = pair(&comms);
        let t0 = Instant::from_millis(0);
        aircraft.enqueue_at(message("CES-1001-1", "A70000", Priority::High), t0);
        aircraft.step_at(AgentAction::SendPrimary, t0);
        comms.advance(t0 + TX);
        assert_eq!(ground.inbound().len(), 1);

        aircraft.reset();
        ground.reset();
        assert!(aircraft.link().is_idle());
        assert_eq!(ground.inbound().len(), 0);
        assert_eq!(aircraft.raw_stats(), RawStats::default());
    }
}
