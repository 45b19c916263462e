//! Server and client configuration

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_DATA_SIZE;
use crate::wire::Limits;
use crate::{Error, Result};

/// Protocol version constant
pub const PROTOCOL_VERSION: &str = "1.0.0";

pub const DEFAULT_LEADER_ADDR: &str = "127.0.0.1:4442";
pub const DEFAULT_FOLLOWER_ADDR: &str = "127.0.0.1:4443";

/// Which of the two servers a process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    /// DPF party bit held by this role
    pub fn party(self) -> u8 {
        match self {
            Role::Leader => 0,
            Role::Follower => 1,
        }
    }

    pub fn is_leader(self) -> bool {
        self == Role::Leader
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => f.write_str("leader"),
            Role::Follower => f.write_str("follower"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "leader" => Ok(Role::Leader),
            "follower" => Ok(Role::Follower),
            other => Err(Error::InvalidConfig(format!("unknown role {:?}", other))),
        }
    }
}

/// What a server does when the audit rejects a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditPolicy {
    /// Log the failure and keep the applied write
    #[default]
    Warn,
    /// Re-apply the query to revert the write and report rejection
    Rollback,
}

impl fmt::Display for AuditPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditPolicy::Warn => f.write_str("warn"),
            AuditPolicy::Rollback => f.write_str("rollback"),
        }
    }
}

impl FromStr for AuditPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "warn" => Ok(AuditPolicy::Warn),
            "rollback" => Ok(AuditPolicy::Rollback),
            other => Err(Error::InvalidConfig(format!("unknown audit policy {:?}", other))),
        }
    }
}

/// Configuration for a leader or follower process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub role: Role,
    pub leader_addr: String,
    pub follower_addr: String,
    /// Cover rows created at startup
    #[serde(default)]
    pub num_rows: u32,
    #[serde(default = "default_data_size")]
    pub data_size: u32,
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    #[serde(default)]
    pub audit_policy: AuditPolicy,
    /// Sealing keys; required on the follower
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_max_rows_per_request")]
    pub max_rows_per_request: u32,
    #[serde(default = "default_max_data_size")]
    pub max_data_size: u32,
}

fn default_data_size() -> u32 {
    DEFAULT_DATA_SIZE
}

fn default_num_threads() -> usize {
    8
}

fn default_max_rows_per_request() -> u32 {
    1 << 16
}

fn default_max_data_size() -> u32 {
    1 << 20
}

fn default_queue_depth() -> usize {
    64
}

impl ServerConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            leader_addr: DEFAULT_LEADER_ADDR.into(),
            follower_addr: DEFAULT_FOLLOWER_ADDR.into(),
            num_rows: 0,
            data_size: DEFAULT_DATA_SIZE,
            num_threads: default_num_threads(),
            audit_policy: AuditPolicy::default(),
            key_file: None,
            max_rows_per_request: default_max_rows_per_request(),
            max_data_size: default_max_data_size(),
        }
    }

    pub fn leader() -> Self {
        Self::new(Role::Leader)
    }

    pub fn follower() -> Self {
        Self::new(Role::Follower)
    }

    pub fn with_addrs(mut self, leader: impl Into<String>, follower: impl Into<String>) -> Self {
        self.leader_addr = leader.into();
        self.follower_addr = follower.into();
        self
    }

    pub fn with_rows(mut self, num_rows: u32, data_size: u32) -> Self {
        self.num_rows = num_rows;
        self.data_size = data_size;
        self
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_audit_policy(mut self, policy: AuditPolicy) -> Self {
        self.audit_policy = policy;
        self
    }

    /// Address this server listens on
    pub fn listen_addr(&self) -> &str {
        match self.role {
            Role::Leader => &self.leader_addr,
            Role::Follower => &self.follower_addr,
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_rows_per_request: self.max_rows_per_request,
            max_data_size: self.max_data_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::InvalidConfig("num_threads must be at least 1".into()));
        }
        if self.data_size > self.max_data_size {
            return Err(Error::InvalidConfig(format!(
                "data_size {} exceeds max_data_size {}",
                self.data_size, self.max_data_size
            )));
        }
        if self.max_rows_per_request == 0 {
            return Err(Error::InvalidConfig("max_rows_per_request must be positive".into()));
        }
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

/// Configuration for a client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub leader_addr: String,
    pub follower_addr: String,
    #[serde(default = "default_data_size")]
    pub data_size: u32,
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// Rows already on the servers when the session starts (their cover rows)
    #[serde(default)]
    pub existing_rows: u32,
    /// Label attached to this session's log lines
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Commands buffered ahead of the workers
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            leader_addr: DEFAULT_LEADER_ADDR.into(),
            follower_addr: DEFAULT_FOLLOWER_ADDR.into(),
            data_size: DEFAULT_DATA_SIZE,
            num_threads: default_num_threads(),
            existing_rows: 0,
            run_id: String::new(),
            key_file: None,
            queue_depth: default_queue_depth(),
        }
    }
}

impl ClientConfig {
    pub fn with_addrs(mut self, leader: impl Into<String>, follower: impl Into<String>) -> Self {
        self.leader_addr = leader.into();
        self.follower_addr = follower.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::InvalidConfig("num_threads must be at least 1".into()));
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfig("queue_depth must be at least 1".into()));
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}
