//! Controller configuration.
//!
//! All durations are plain integer fields (`*_ms` / `*_secs`) so the struct
//! deserializes from any `config`-supported source; typed accessors convert
//! to [`Duration`]. `validate` enforces the cross-field constraints the
//! protocol depends on, most importantly that a leader lease is strictly
//! shorter than the election timeout.

use std::path::Path;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftStoreConfig {
    /// Base tick driving the consensus library, in milliseconds.
    #[serde(default = "default_raft_base_tick_interval_ms")]
    pub raft_base_tick_interval_ms: u64,

    /// Ticks without leader contact before an election is started.
    #[serde(default = "default_raft_election_timeout_ticks")]
    pub raft_election_timeout_ticks: usize,

    /// Ticks between leader heartbeats.
    #[serde(default = "default_raft_heartbeat_ticks")]
    pub raft_heartbeat_ticks: usize,

    #[serde(default = "default_raft_max_size_per_msg")]
    pub raft_max_size_per_msg: u64,

    #[serde(default = "default_raft_max_inflight_msgs")]
    pub raft_max_inflight_msgs: usize,

    /// Run pre-vote rounds before bumping the term.
    #[serde(default = "default_true")]
    pub prevote: bool,

    /// Hard cap on one marshalled log entry.
    #[serde(default = "default_raft_entry_max_size")]
    pub raft_entry_max_size: u64,

    /// Length of the leader lease window, in milliseconds.
    #[serde(default = "default_raft_store_max_leader_lease_ms")]
    pub raft_store_max_leader_lease_ms: u64,

    /// Window during which a freshly added peer may not receive leadership.
    #[serde(default = "default_raft_reject_transfer_leader_duration_secs")]
    pub raft_reject_transfer_leader_duration_secs: u64,

    /// Maximum log entries a transfer target may lag behind.
    #[serde(default = "default_leader_transfer_max_log_lag")]
    pub leader_transfer_max_log_lag: u64,

    /// After this long without a leader, the peer asks the placement driver
    /// whether it is still a member.
    #[serde(default = "default_max_leader_missing_duration_secs")]
    pub max_leader_missing_duration_secs: u64,

    /// After this long without a leader, an initialized voter is reported as
    /// abnormal.
    #[serde(default = "default_abnormal_leader_missing_duration_secs")]
    pub abnormal_leader_missing_duration_secs: u64,

    #[serde(default)]
    pub allow_remove_leader: bool,

    /// Maximum log gap between the slowest member and the leader for a merge
    /// to be proposed.
    #[serde(default = "default_merge_max_log_gap")]
    pub merge_max_log_gap: u64,

    #[serde(default = "default_true")]
    pub sync_log: bool,
}

fn default_raft_base_tick_interval_ms() -> u64 {
    1000
}

fn default_raft_election_timeout_ticks() -> usize {
    10
}

fn default_raft_heartbeat_ticks() -> usize {
    2
}

fn default_raft_max_size_per_msg() -> u64 {
    1024 * 1024
}

fn default_raft_max_inflight_msgs() -> usize {
    256
}

fn default_raft_entry_max_size() -> u64 {
    8 * 1024 * 1024
}

fn default_raft_store_max_leader_lease_ms() -> u64 {
    9_000
}

fn default_raft_reject_transfer_leader_duration_secs() -> u64 {
    3
}

fn default_leader_transfer_max_log_lag() -> u64 {
    10
}

fn default_max_leader_missing_duration_secs() -> u64 {
    2 * 60 * 60
}

fn default_abnormal_leader_missing_duration_secs() -> u64 {
    10 * 60
}

fn default_merge_max_log_gap() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for RaftStoreConfig {
    fn default() -> RaftStoreConfig {
        RaftStoreConfig {
            raft_base_tick_interval_ms: default_raft_base_tick_interval_ms(),
            raft_election_timeout_ticks: default_raft_election_timeout_ticks(),
            raft_heartbeat_ticks: default_raft_heartbeat_ticks(),
            raft_max_size_per_msg: default_raft_max_size_per_msg(),
            raft_max_inflight_msgs: default_raft_max_inflight_msgs(),
            prevote: true,
            raft_entry_max_size: default_raft_entry_max_size(),
            raft_store_max_leader_lease_ms: default_raft_store_max_leader_lease_ms(),
            raft_reject_transfer_leader_duration_secs:
                default_raft_reject_transfer_leader_duration_secs(),
            leader_transfer_max_log_lag: default_leader_transfer_max_log_lag(),
            max_leader_missing_duration_secs: default_max_leader_missing_duration_secs(),
            abnormal_leader_missing_duration_secs:
                default_abnormal_leader_missing_duration_secs(),
            allow_remove_leader: false,
            merge_max_log_gap: default_merge_max_log_gap(),
            sync_log: true,
        }
    }
}

impl RaftStoreConfig {
    pub fn raft_store_max_leader_lease(&self) -> Duration {
        Duration::from_millis(self.raft_store_max_leader_lease_ms)
    }

    pub fn raft_reject_transfer_leader_duration(&self) -> Duration {
        Duration::from_secs(self.raft_reject_transfer_leader_duration_secs)
    }

    pub fn max_leader_missing_duration(&self) -> Duration {
        Duration::from_secs(self.max_leader_missing_duration_secs)
    }

    pub fn abnormal_leader_missing_duration(&self) -> Duration {
        Duration::from_secs(self.abnormal_leader_missing_duration_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.raft_heartbeat_ticks == 0 {
            return Err(Error::Config(ConfigError::Message(
                "raft_heartbeat_ticks must be greater than 0".to_owned(),
            )));
        }
        if self.raft_election_timeout_ticks <= self.raft_heartbeat_ticks {
            return Err(Error::Config(ConfigError::Message(format!(
                "raft_election_timeout_ticks ({}) must be greater than raft_heartbeat_ticks ({})",
                self.raft_election_timeout_ticks, self.raft_heartbeat_ticks
            ))));
        }
        if self.raft_entry_max_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "raft_entry_max_size must be greater than 0".to_owned(),
            )));
        }

        // A lease reaching past the election timeout would let an old leader
        // serve local reads after a new one was elected.
        let election_timeout_ms =
            self.raft_base_tick_interval_ms * self.raft_election_timeout_ticks as u64;
        if self.raft_store_max_leader_lease_ms >= election_timeout_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "raft_store_max_leader_lease_ms ({}) must be less than the election timeout ({} ms)",
                self.raft_store_max_leader_lease_ms, election_timeout_ms
            ))));
        }

        if self.merge_max_log_gap == 0 {
            return Err(Error::Config(ConfigError::Message(
                "merge_max_log_gap must be greater than 0".to_owned(),
            )));
        }
        if self.abnormal_leader_missing_duration_secs > self.max_leader_missing_duration_secs {
            return Err(Error::Config(ConfigError::Message(format!(
                "abnormal_leader_missing_duration_secs ({}) must not exceed \
                 max_leader_missing_duration_secs ({})",
                self.abnormal_leader_missing_duration_secs, self.max_leader_missing_duration_secs
            ))));
        }
        Ok(())
    }

    /// Loads and validates a configuration file (TOML, YAML or JSON).
    pub fn from_file(path: &Path) -> Result<RaftStoreConfig> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .build()?;
        let cfg: RaftStoreConfig = cfg.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }
}
