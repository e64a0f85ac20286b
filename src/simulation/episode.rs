//! Episode runtime: builds the fleet for a scenario and drives repeated
//! episodes, either on the embassy executor against the simulation clock or
//! in virtual time through the discrete-event scheduler.
//!
//! Flow of one autonomous episode:
//! 1) Reset channels and agents in place.
//! 2) Walk the planned schedule, spawning a send task for each message at its time.
//! 3) Wait until every send task has finished and the medium is quiet.
//! 4) Publish an [`EpisodeReport`].

use embassy_executor::Spawner;
use embassy_time::{Duration, Instant, Timer};
use std::sync::Arc;
use std::sync::mpsc;

use crate::common::config::SimulationConfig;
use crate::common::scenario::{PlannedMessage, Scenario, ScenarioError};

use super::agent::{Agent, Aircraft, GroundStation};
use super::agent_task::{SendTracker, spawn_agent_tasks, spawn_send};
use super::comm_system::CommunicationSystem;
use super::scheduler::EpisodeScheduler;
use super::stats::{AgentReport, EpisodeReport};
use super::types::Message;

/// How often a finished schedule checks whether all traffic has settled.
const SETTLE_CHECK_INTERVAL: Duration = Duration::from_millis(50);

pub struct Episode {
    comms: Arc<CommunicationSystem>,
    ground: Arc<GroundStation>,
    aircraft: Vec<Arc<Aircraft>>,
    tracker: Arc<SendTracker>,
}

impl Episode {
    pub fn new(config: &SimulationConfig, scenario: &Scenario) -> Self {
        let comms = config.build_comms();
        let link = config.link_config();
        let ground = Arc::new(GroundStation::new(
            scenario.ground_station_id.clone(),
            config.processing_delay(),
            comms.clone(),
            link,
        ));
        let aircraft = scenario
            .aircraft
            .iter()
            .map(|a| Arc::new(Aircraft::new(a.icao_address.clone(), a.flight_id.clone(), comms.clone(), link)))
            .collect();
        Self {
            comms,
            ground,
            aircraft,
            tracker: Arc::new(SendTracker::new()),
        }
    }

    pub fn comms(&self) -> &Arc<CommunicationSystem> {
        &self.comms
    }

    pub fn ground(&self) -> &Arc<GroundStation> {
        &self.ground
    }

    pub fn aircraft(&self) -> &[Arc<Aircraft>] {
        &self.aircraft
    }

    /// Ground station first, then the fleet in scenario order.
    pub fn agents(&self) -> Vec<Arc<dyn Agent>> {
        let mut agents: Vec<Arc<dyn Agent>> = Vec::with_capacity(self.aircraft.len() + 1);
        agents.push(self.ground.clone());
        agents.extend(self.aircraft.iter().map(|a| a.clone() as Arc<dyn Agent>));
        agents
    }

    /// Build the downlink message for `planned`, stamped with `timestamp`.
    pub fn materialize(&self, planned: &PlannedMessage, timestamp: Instant) -> Result<(Arc<Aircraft>, Message), ScenarioError> {
        let aircraft = self
            .aircraft
            .iter()
            .find(|a| a.flight_id() == planned.flight_id)
            .ok_or_else(|| ScenarioError::ValidationError(format!("Unknown flight {}", planned.flight_id)))?;
        let message = aircraft
            .message(planned.message_id.clone(), planned.message_type, Some(planned.priority), &planned.payload, timestamp)
            .map_err(|e| ScenarioError::ValidationError(format!("{}: {}", planned.message_id, e)))?;
        Ok((aircraft.clone(), message))
    }

    pub fn reset(&self) {
        self.comms.reset();
        for agent in self.agents() {
            agent.reset();
        }
    }

    /// No send task running, nothing queued, pending or unread, and no airtime in progress.
    pub fn is_settled(&self) -> bool {
        self.tracker.outstanding() == 0
            && self.agents().iter().all(|a| a.link().is_idle() && a.inbound().is_empty())
            && !self.comms.channels().any(|c| c.is_busy())
    }

    pub fn report(&self, episode: u32, duration: Duration) -> EpisodeReport {
        let agents = self
            .agents()
            .iter()
            .map(|a| AgentReport {
                agent_id: a.id().to_string(),
                stats: a.raw_stats(),
            })
            .collect();
        EpisodeReport::new(episode, duration, agents, self.comms.channel_stats())
    }

    /// Run `plan` to completion in virtual time with a seeded RNG. Returns
    /// `None` if traffic has not settled by `horizon`.
    pub fn run_virtual(&self, episode: u32, plan: &[PlannedMessage], seed: u64, horizon: Duration) -> Result<Option<EpisodeReport>, ScenarioError> {
        self.reset();
        let mut scheduler = EpisodeScheduler::new(self.comms.clone(), seed);
        scheduler.add_agent(self.ground.clone());
        let indices: Vec<_> = self.aircraft.iter().map(|a| scheduler.add_agent(a.clone())).collect();

        for planned in plan {
            let at = Instant::from_millis(planned.at_ms);
            let (aircraft, message) = self.materialize(planned, at)?;
            let index = self
                .aircraft
                .iter()
                .position(|a| Arc::ptr_eq(a, &aircraft))
                .map(|position| indices[position])
                .ok_or_else(|| ScenarioError::ValidationError(format!("Unknown flight {}", planned.flight_id)))?;
            scheduler.schedule_message(index, at, message);
        }

        let start = scheduler.now();
        if !scheduler.run_to_completion(start + horizon) {
            log::warn!("Episode {} did not settle within {} s of virtual time", episode, horizon.as_secs());
            return Ok(None);
        }
        Ok(Some(self.report(episode, scheduler.now() - start)))
    }
}

/// Run `episodes` back-to-back episodes of `plan` on the simulation clock and
/// send each report to `report_tx`.
#[embassy_executor::task]
pub async fn episode_task(spawner: Spawner, episode: Arc<Episode>, plan: Vec<PlannedMessage>, episodes: u32, report_tx: mpsc::Sender<EpisodeReport>) {
    spawn_agent_tasks(spawner, &episode.comms, &episode.agents(), &episode.tracker);

    for n in 1..=episodes {
        episode.reset();
        let start = Instant::now();
        log::info!("Episode {} started: {} aircraft, {} scheduled messages", n, episode.aircraft.len(), plan.len());

        for planned in &plan {
            Timer::at(start + Duration::from_millis(planned.at_ms)).await;
            match episode.materialize(planned, Instant::now()) {
                Ok((aircraft, message)) => spawn_send(spawner, aircraft, message, Duration::from_ticks(0), &episode.tracker),
                Err(e) => log::error!("Skipping scheduled message: {}", e),
            }
        }

        while !episode.is_settled() {
            Timer::after(SETTLE_CHECK_INTERVAL).await;
        }

        let report = episode.report(n, Instant::now() - start);
        log::info!(
            "Episode {} finished after {} ms: {} delivered, {} exhausted, {} collisions",
            n,
            report.duration_ns / 1_000_000,
            report.totals.successful_tx,
            report.totals.exhausted,
            report.totals.collisions
        );
        if report_tx.send(report).is_err() {
            log::warn!("Report receiver closed, stopping after episode {}", n);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::types::priority_map;
    use crate::time_driver::{TEST_GUARD, set_speed_percent};
    use embassy_executor::Executor;

    const SCENARIO: &str = r#"{
        "ground_station_id": "GND_CTL_SEU",
        "aircraft": [
            {"icao_address": "A70000", "flight_id": "CES-1001"},
            {"icao_address": "A70001", "flight_id": "CSN-3302"},
            {"icao_address": "A70002", "flight_id": "CCA-1502"}
        ],
        "schedule": [
            {"at_ms": 0, "flight_id": "CES-1001", "message_type": "OOOI_REPORT", "payload": {"event": "OUT"}},
            {"at_ms": 0, "flight_id": "CSN-3302", "message_type": "OOOI_REPORT", "payload": {"event": "OUT"}},
            {"at_ms": 100, "flight_id": "CCA-1502", "message_type": "AIRCRAFT_FAULT", "payload": {"code": "HYD-2"}},
            {"at_ms": 400, "flight_id": "CES-1001", "message_type": "WEATHER_REPORT"},
            {"at_ms": 900, "flight_id": "CSN-3302", "message_type": "FREE_TEXT", "payload": "REQ GATE"},
            {"at_ms": 900, "flight_id": "CCA-1502", "message_type": "POSITION_REPORT", "priority": "LOW"}
        ]
    }"#;

    fn episode() -> (Episode, Vec<PlannedMessage>) {
        let scenario = Scenario::from_json_str(SCENARIO).unwrap();
        (Episode::new(&SimulationConfig::default(), &scenario), scenario.planned_messages())
    }

    #[test]
    fn agents_share_one_communication_system() {
        let (episode, _) = episode();
        let agents = episode.agents();
        assert_eq!(agents.len(), 4);
        assert_eq!(agents[0].id(), "GND_CTL_SEU");
        assert!(agents.iter().all(|a| std::ptr::eq(a.comms(), episode.comms().as_ref())));
        assert!(episode.is_settled());
    }

    #[test]
    fn virtual_episode_delivers_or_exhausts_everything() {
        let (episode, plan) = episode();
        let report = episode.run_virtual(1, &plan, 2024, Duration::from_secs(6 * 3_600)).unwrap().unwrap();

        let downlink: u64 = report.agents.iter().filter(|a| a.agent_id != "GND_CTL_SEU").map(|a| a.stats.successful_tx + a.stats.exhausted).sum();
        assert_eq!(downlink, plan.len() as u64);
        assert_eq!(report.totals.unsent_count, 0);
        assert_eq!(report.channels.len(), 2);
        assert!(report.channels.iter().all(|c| (0.0..=1.0).contains(&c.utilization)));
        assert!(episode.agents().iter().all(|a| a.link().is_idle()));
    }

    #[test]
    fn reset_between_virtual_episodes_starts_from_zero() {
        let (episode, plan) = episode();
        let first = episode.run_virtual(1, &plan, 7, Duration::from_secs(6 * 3_600)).unwrap().unwrap();
        let second = episode.run_virtual(2, &plan, 7, Duration::from_secs(6 * 3_600)).unwrap().unwrap();
        assert_eq!(first.totals.successful_tx, second.totals.successful_tx);
        assert_eq!(second.episode, 2);
    }

    #[test]
    fn materialize_stamps_ids_and_priorities() {
        let (episode, plan) = episode();
        let (aircraft, message) = episode.materialize(&plan[2], Instant::from_millis(100)).unwrap();
        assert_eq!(aircraft.flight_id(), "CCA-1502");
        assert_eq!(message.id().as_str(), "CCA-1502-1");
        assert_eq!(message.sender_id(), "A70002");
        assert_eq!(message.origin_id(), "CCA-1502");
        assert_eq!(message.priority(), crate::simulation::types::Priority::Critical);

        let stray = PlannedMessage {
            flight_id: "XXX-0".to_string(),
            ..plan[0].clone()
        };
        assert!(episode.materialize(&stray, Instant::from_millis(0)).is_err());
    }

    #[test]
    fn second_autonomous_episode_repeats_the_first() {
        let _g = TEST_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let scenario = Scenario::from_json_str(
            r#"{
            "ground_station_id": "GND_CTL_SEU",
            "aircraft": [{"icao_address": "A70000", "flight_id": "CES-1001"}],
            "schedule": [
                {"at_ms": 0, "flight_id": "CES-1001", "message_type": "OOOI_REPORT", "payload": {"event": "OUT"}},
                {"at_ms": 1000, "flight_id": "CES-1001", "message_type": "POSITION_REPORT"},
                {"at_ms": 2000, "flight_id": "CES-1001", "message_type": "FREE_TEXT", "payload": "REQ GATE"}
            ]
        }"#,
        )
        .unwrap();
        let mut config = SimulationConfig::default();
        config.enable_backup_channel = false;
        config.primary.p_values = priority_map(1.0, 1.0, 1.0, 1.0);
        let episode = Arc::new(Episode::new(&config, &scenario));
        let plan = scenario.planned_messages();
        let scheduled = plan.len() as u64;

        set_speed_percent(1000);
        let (report_tx, report_rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("episode-test-executor".to_string())
            .spawn(move || {
                let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
                executor.run(|spawner| match episode_task(spawner, episode, plan, 2, report_tx) {
                    Ok(token) => spawner.spawn(token),
                    Err(e) => log::error!("Failed to start episode task: {:?}", e),
                });
            })
            .unwrap();
        let first = report_rx.recv_timeout(std::time::Duration::from_secs(30));
        let second = report_rx.recv_timeout(std::time::Duration::from_secs(30));
        set_speed_percent(100);

        let (first, second) = (first.unwrap(), second.unwrap());
        for report in [&first, &second] {
            let aircraft = report.agents.iter().find(|a| a.agent_id == "A70000").unwrap();
            assert_eq!(aircraft.stats.successful_tx, scheduled, "episode {}", report.episode);
            assert_eq!((report.totals.retries, report.totals.exhausted), (0, 0), "episode {}", report.episode);
        }
        assert_eq!(first.totals.successful_tx, second.totals.successful_tx);
    }
}
