//! Declarative traffic scenario: the fleet, the ground station and the
//! downlink schedule of one episode.

use anyhow::Context;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;

use crate::simulation::types::{MessageId, MessageType, Priority};

#[derive(Debug)]
pub enum ScenarioError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioError::FileReadError(msg) => write!(f, "Failed to read file: {}", msg),
            ScenarioError::ParseError(msg) => write!(f, "Failed to parse JSON: {}", msg),
            ScenarioError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ScenarioError {}

#[derive(Debug, Clone, Deserialize)]
pub struct AircraftSpec {
    pub icao_address: String,
    pub flight_id: String,
}

/// One downlink message in the schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduledMessage {
    /// Offset from the start of the episode (ms).
    pub at_ms: u64,
    pub flight_id: String,
    pub message_type: MessageType,
    /// Overrides the message type's default priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub ground_station_id: String,
    pub aircraft: Vec<AircraftSpec>,
    #[serde(default)]
    pub schedule: Vec<ScheduledMessage>,
}

/// A scheduled message with its run-unique id assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMessage {
    pub at_ms: u64,
    pub message_id: MessageId,
    pub flight_id: String,
    pub message_type: MessageType,
    pub priority: Priority,
    pub payload: serde_json::Value,
}

impl Scenario {
    pub fn from_json_str(data: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = serde_json::from_str(data)
            .context("Invalid JSON format")
            .map_err(|e| ScenarioError::ParseError(format!("{:#}", e)))?;
        validate_scenario(&scenario).map_err(ScenarioError::ValidationError)?;
        Ok(scenario)
    }

    /// The schedule in time order with ids `<flight>-<n>`, numbered per flight.
    /// Entries at the same time keep their file order.
    pub fn planned_messages(&self) -> Vec<PlannedMessage> {
        let mut entries: Vec<&ScheduledMessage> = self.schedule.iter().collect();
        entries.sort_by_key(|e| e.at_ms);

        let mut sequence: HashMap<&str, u32> = HashMap::new();
        entries
            .into_iter()
            .map(|entry| {
                let n = sequence.entry(entry.flight_id.as_str()).or_insert(0);
                *n += 1;
                PlannedMessage {
                    at_ms: entry.at_ms,
                    message_id: MessageId::new(format!("{}-{}", entry.flight_id, n)),
                    flight_id: entry.flight_id.clone(),
                    message_type: entry.message_type,
                    priority: entry.priority.unwrap_or(entry.message_type.default_priority()),
                    payload: entry.payload.clone(),
                }
            })
            .collect()
    }
}

pub fn load_scenario(path: &str) -> Result<Scenario, ScenarioError> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path))
        .map_err(|e| ScenarioError::FileReadError(format!("{:#}", e)))?;
    Scenario::from_json_str(&data)
}

pub fn validate_scenario(scenario: &Scenario) -> Result<(), String> {
    if scenario.ground_station_id.trim().is_empty() {
        return Err("ground_station_id must not be empty".to_string());
    }

    let mut addresses = HashSet::new();
    let mut flights = HashSet::new();
    for aircraft in &scenario.aircraft {
        if aircraft.icao_address == scenario.ground_station_id {
            return Err(format!("Aircraft {} uses the ground station id", aircraft.icao_address));
        }
        if !addresses.insert(aircraft.icao_address.as_str()) {
            return Err(format!("Duplicate icao_address found: {}", aircraft.icao_address));
        }
        if !flights.insert(aircraft.flight_id.as_str()) {
            return Err(format!("Duplicate flight_id found: {}", aircraft.flight_id));
        }
    }

    for entry in &scenario.schedule {
        if !flights.contains(entry.flight_id.as_str()) {
            return Err(format!("Schedule entry at {} ms refers to unknown flight {}", entry.at_ms, entry.flight_id));
        }
        if entry.message_type == MessageType::Acknowledgement {
            return Err(format!("Schedule entry at {} ms: acknowledgements are generated, not scheduled", entry.at_ms));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "ground_station_id": "GND_CTL_SEU",
        "aircraft": [
            {"icao_address": "A70000", "flight_id": "CES-1001"},
            {"icao_address": "A70001", "flight_id": "CSN-3302"}
        ],
        "schedule": [
            {"at_ms": 5000, "flight_id": "CES-1001", "message_type": "POSITION_REPORT", "payload": {"lat": 31.7}},
            {"at_ms": 1000, "flight_id": "CSN-3302", "message_type": "OOOI_REPORT", "payload": {"event": "OUT"}},
            {"at_ms": 1000, "flight_id": "CES-1001", "message_type": "FREE_TEXT", "priority": "CRITICAL"},
            {"at_ms": 9000, "flight_id": "CES-1001", "message_type": "WEATHER_REPORT"}
        ]
    }"#;

    #[test]
    fn plan_orders_by_time_and_numbers_per_flight() {
        let scenario = Scenario::from_json_str(SAMPLE).unwrap();
        let plan = scenario.planned_messages();
        let ids: Vec<&str> = plan.iter().map(|p| p.message_id.as_str()).collect();
        assert_eq!(ids, vec!["CSN-3302-1", "CES-1001-1", "CES-1001-2", "CES-1001-3"]);
        assert_eq!(plan[1].priority, Priority::Critical);
        assert_eq!(plan[2].priority, Priority::High);
        assert_eq!(plan[3].priority, Priority::Medium);
        assert_eq!(plan[3].payload, serde_json::Value::Null);
    }

    #[test]
    fn unknown_flight_and_duplicates_are_rejected() {
        let unknown = r#"{"ground_station_id": "G", "aircraft": [{"icao_address": "A1", "flight_id": "F1"}],
            "schedule": [{"at_ms": 0, "flight_id": "F9", "message_type": "LINK_TEST"}]}"#;
        assert!(matches!(Scenario::from_json_str(unknown), Err(ScenarioError::ValidationError(_))));

        let duplicate = r#"{"ground_station_id": "G", "aircraft": [
            {"icao_address": "A1", "flight_id": "F1"}, {"icao_address": "A1", "flight_id": "F2"}]}"#;
        assert!(matches!(Scenario::from_json_str(duplicate), Err(ScenarioError::ValidationError(_))));

        let scheduled_ack = r#"{"ground_station_id": "G", "aircraft": [{"icao_address": "A1", "flight_id": "F1"}],
            "schedule": [{"at_ms": 0, "flight_id": "F1", "message_type": "ACKNOWLEDGEMENT"}]}"#;
        assert!(matches!(Scenario::from_json_str(scheduled_ack), Err(ScenarioError::ValidationError(_))));
    }

    #[test]
    fn bundled_scenario_loads() {
        let scenario = load_scenario(concat!(env!("CARGO_MANIFEST_DIR"), "/scenarios/shanghai_departures.json")).unwrap();
        assert_eq!(scenario.aircraft.len(), 3);
        let plan = scenario.planned_messages();
        assert_eq!(plan.len(), scenario.schedule.len());
        assert!(plan.windows(2).all(|w| w[0].at_ms <= w[1].at_ms));
    }

    #[test]
    fn malformed_json_and_missing_file() {
        assert!(matches!(Scenario::from_json_str("{"), Err(ScenarioError::ParseError(_))));
        assert!(matches!(
            Scenario::from_json_str(r#"{"ground_station_id": "G", "aircraft": [], "schedule": [{"at_ms": 0, "flight_id": "F", "message_type": "TELEX"}]}"#),
            Err(ScenarioError::ParseError(_))
        ));
        assert!(matches!(load_scenario("/nonexistent/scenario.json"), Err(ScenarioError::FileReadError(_))));
    }
}
