//! Simulation parameters loaded from a TOML file.
//!
//! Every key is optional; missing keys keep the values of
//! [`SimulationConfig::default`].
//!
//! ```toml
//! enable-backup-channel = true
//! transmission-time-ms = 80
//! ack-timeout-ms = 3000
//! max-retries = 16
//!
//! [primary]
//! id = "VHF-PRIMARY"
//! time-slot-ms = 320
//! p-values = { CRITICAL = 0.9, HIGH = 0.7, MEDIUM = 0.4, LOW = 0.2 }
//!
//! [switchover-probabilities]
//! CRITICAL = 1.0
//! HIGH = 0.8
//! ```

use embassy_time::Duration;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use crate::simulation::channel::Channel;
use crate::simulation::comm_system::CommunicationSystem;
use crate::simulation::link::LinkConfig;
use crate::simulation::types::{PriorityMap, priority_map};
use crate::time_driver::{MAX_SPEED_PERCENT, MIN_SPEED_PERCENT};

#[derive(Debug)]
pub enum ConfigError {
    FileRead(String),
    Parse(String),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(msg) => write!(f, "Failed to read config file: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Failed to parse config file: {}", msg),
            ConfigError::Validation(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// One broadcast channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelConfig {
    pub id: String,
    /// p-persistence time slot (ms).
    pub time_slot_ms: u64,
    /// Access probability per priority. Missing priorities use 0.1.
    pub p_values: PriorityMap,
}

impl ChannelConfig {
    pub fn primary() -> Self {
        Self {
            id: "VHF-PRIMARY".to_string(),
            time_slot_ms: 320,
            p_values: priority_map(0.9, 0.7, 0.4, 0.2),
        }
    }

    pub fn backup() -> Self {
        Self {
            id: "VHF-BACKUP".to_string(),
            time_slot_ms: 320,
            p_values: priority_map(0.95, 0.8, 0.2, 0.1),
        }
    }

    pub fn build(&self) -> Channel {
        Channel::new(self.id.clone(), self.p_values.clone(), Duration::from_millis(self.time_slot_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SimulationConfig {
    pub enable_backup_channel: bool,
    #[serde(default = "ChannelConfig::primary")]
    pub primary: ChannelConfig,
    #[serde(default = "ChannelConfig::backup")]
    pub backup: ChannelConfig,
    /// Probability of moving a message to the backup when the primary is busy.
    /// Missing priorities never switch over.
    pub switchover_probabilities: PriorityMap,
    /// Airtime of one message (ms).
    pub transmission_time_ms: u64,
    /// Time to wait for an acknowledgement after a commit (ms).
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    /// Polling rounds before a contending message counts a retry. Unbounded if unset.
    pub max_poll_rounds: Option<u32>,
    /// Ground station delay before acknowledging (ms).
    pub processing_delay_ms: u64,
    /// Simulation clock speed in percent of wall-clock time.
    pub speed_percent: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enable_backup_channel: true,
            primary: ChannelConfig::primary(),
            backup: ChannelConfig::backup(),
            switchover_probabilities: priority_map(1.0, 0.8, 0.3, 0.05),
            transmission_time_ms: 80,
            ack_timeout_ms: 3000,
            max_retries: 16,
            max_poll_rounds: None,
            processing_delay_ms: 200,
            speed_percent: 100,
        }
    }
}

impl SimulationConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(config_path).map_err(|e| ConfigError::FileRead(format!("{}: {}", config_path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        for channel in [&self.primary, &self.backup] {
            if channel.time_slot_ms == 0 {
                return invalid(format!("Channel {} has a zero time slot", channel.id));
            }
            check_probabilities(&format!("p-values of {}", channel.id), &channel.p_values)?;
        }
        if self.enable_backup_channel && self.primary.id == self.backup.id {
            return invalid(format!("Primary and backup channel share the id {}", self.primary.id));
        }
        check_probabilities("switchover-probabilities", &self.switchover_probabilities)?;
        if self.transmission_time_ms == 0 {
            return invalid("transmission-time-ms must be positive".to_string());
        }
        if self.ack_timeout_ms == 0 {
            return invalid("ack-timeout-ms must be positive".to_string());
        }
        if self.max_poll_rounds == Some(0) {
            return invalid("max-poll-rounds must be positive when set".to_string());
        }
        if !(MIN_SPEED_PERCENT..=MAX_SPEED_PERCENT).contains(&self.speed_percent) {
            return invalid(format!(
                "speed-percent {} outside {}..={}",
                self.speed_percent, MIN_SPEED_PERCENT, MAX_SPEED_PERCENT
            ));
        }
        Ok(())
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            transmission_time: Duration::from_millis(self.transmission_time_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_retries: self.max_retries,
            max_poll_rounds: self.max_poll_rounds,
        }
    }

    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }

    /// Build the channels and the communication system they form.
    pub fn build_comms(&self) -> Arc<CommunicationSystem> {
        let primary = Arc::new(self.primary.build());
        let backup = self.enable_backup_channel.then(|| Arc::new(self.backup.build()));
        Arc::new(CommunicationSystem::new(primary, backup, &self.switchover_probabilities))
    }
}

fn check_probabilities(table: &str, values: &PriorityMap) -> Result<(), ConfigError> {
    match values.iter().find(|(_, p)| !(0.0..=1.0).contains(*p)) {
        Some((priority, p)) => Err(ConfigError::Validation(format!("{} for {} is {}, expected 0..=1", table, priority, p))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::types::Priority;

    #[test]
    fn empty_file_gives_defaults() {
        let config = SimulationConfig::from_toml_str("").unwrap();
        assert_eq!(config, SimulationConfig::default());
        assert_eq!(config.link_config(), LinkConfig::default());
        assert_eq!(config.processing_delay(), Duration::from_millis(200));
    }

    #[test]
    fn partial_tables_override_selected_values() {
        let config = SimulationConfig::from_toml_str(
            r#"
            enable-backup-channel = false
            max-retries = 3
            max-poll-rounds = 50

            [primary]
            id = "VHF1"
            time-slot-ms = 100
            p-values = { CRITICAL = 1.0, LOW = 0.05 }

            [switchover-probabilities]
            CRITICAL = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.link_config().max_poll_rounds, Some(50));
        assert_eq!(config.backup, ChannelConfig::backup());

        let comms = config.build_comms();
        assert!(comms.backup().is_none());
        assert_eq!(comms.primary().id(), "VHF1");
        assert_eq!(comms.primary().current_time_slot(), Duration::from_millis(100));
        assert_eq!(comms.primary().p_for_message(Priority::Medium), 0.1);
        assert_eq!(comms.switchover_probability(Priority::Critical), 0.5);
        assert_eq!(comms.switchover_probability(Priority::High), 0.0);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            "[primary]\nid = \"P\"\ntime-slot-ms = 0\np-values = {}",
            "[switchover-probabilities]\nHIGH = 1.5",
            "transmission-time-ms = 0",
            "ack-timeout-ms = 0",
            "max-poll-rounds = 0",
            "speed-percent = 5000",
        ];
        for case in cases {
            assert!(matches!(SimulationConfig::from_toml_str(case), Err(ConfigError::Validation(_))), "accepted: {case}");
        }
        assert!(matches!(SimulationConfig::from_toml_str("max-retries = \"many\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn bundled_config_loads() {
        let config = SimulationConfig::load(Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/scenarios/config.toml"))).unwrap();
        assert_eq!(config.speed_percent, 400);
        assert_eq!(config.backup.p_values, ChannelConfig::backup().p_values);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let result = SimulationConfig::load(Path::new("/nonexistent/acars/config.toml"));
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }
}
