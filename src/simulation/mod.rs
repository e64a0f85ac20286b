//! Datalink simulation core.
//!
//! Simulates a shared half-duplex broadcast medium with priority-aware
//! p-persistence access, acknowledgement-based delivery and failover to a
//! backup channel.
//!
//! ## Module Organization
//!
//! - `types`: Messages, priorities and probability tables
//! - `channel`: One shared medium with lazy airtime completion and listener fan-out
//! - `comm_system`: Primary/backup channel pair and per-message channel choice
//! - `outbound`: Per-agent priority queue
//! - `link`: Send/ack/retry engine composed by every agent
//! - `agent`: The `Agent` contract, `Aircraft` and `GroundStation`
//! - `agent_task`: Autonomous polling tasks on the embassy executor
//! - `scheduler`: The same polling discipline in virtual time
//! - `episode`: Fleet construction and the episode loop
//! - `stats`: Counters and episode reports

pub mod agent;
pub mod agent_task;
pub mod channel;
pub mod comm_system;
pub mod episode;
pub mod link;
pub mod outbound;
pub mod scheduler;
pub mod stats;
pub mod types;

pub use agent::{Agent, AgentAction, Aircraft, GroundStation, Observation, StepOutcome};
pub use episode::{Episode, episode_task};
pub use stats::{EpisodeReport, RawStats};
