//! Configuration for the session layer and server front-end.
//!
//! Configuration structs follow the same conventions throughout: `Default`
//! gives sane single-node values, `from_env()` applies environment variable
//! overrides, and `validate()` returns every problem found rather than
//! stopping at the first.
//!
//! # Environment Variables
//!
//! - `CONCORD_SESSION_TIMEOUT_MS`: default session timeout
//! - `CONCORD_EVENT_BUFFER_BOUND`: pending-event buffer bound per session
//! - `CONCORD_COMMAND_GAP_THRESHOLD`: commits a sequence gap may stay open
//! - `CONCORD_LINEARIZABLE_LEASE_MS`: leader lease for bounded reads
//! - `CONCORD_POOL_CAPACITY`: buffer pool bound (0 = unbounded)

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_COMMAND_GAP_THRESHOLD, DEFAULT_EVENT_BUFFER_BOUND, DEFAULT_LINEARIZABLE_LEASE_MS,
    DEFAULT_MAX_CONNECTIONS_PER_IP, DEFAULT_MAX_TOTAL_CONNECTIONS, DEFAULT_POOL_CAPACITY,
    DEFAULT_SESSION_TIMEOUT_MS,
};

/// Options recognized by the session layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Duration after which, absent keep-alives, a session expires.
    pub session_timeout: Duration,

    /// Bound on a session's pending (unacknowledged) event buffer, in
    /// entries. Exceeding it expires the session.
    pub event_buffer_bound: usize,

    /// Number of commits a command sequence gap may stay open before the
    /// session is expired with a sequence-gap failure.
    pub command_gap_threshold: u64,

    /// How long a confirmed leadership observation may serve
    /// bounded-linearizable reads without a fresh round-trip.
    pub linearizable_lease: Duration,

    /// Buffer pool bound in buffers (0 = unbounded).
    pub pool_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS),
            event_buffer_bound: DEFAULT_EVENT_BUFFER_BOUND,
            command_gap_threshold: DEFAULT_COMMAND_GAP_THRESHOLD,
            linearizable_lease: Duration::from_millis(DEFAULT_LINEARIZABLE_LEASE_MS),
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Create configuration with environment variable overrides applied.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            session_timeout: env_ms("CONCORD_SESSION_TIMEOUT_MS")
                .unwrap_or(defaults.session_timeout),
            event_buffer_bound: env_parse("CONCORD_EVENT_BUFFER_BOUND")
                .unwrap_or(defaults.event_buffer_bound),
            command_gap_threshold: env_parse("CONCORD_COMMAND_GAP_THRESHOLD")
                .unwrap_or(defaults.command_gap_threshold),
            linearizable_lease: env_ms("CONCORD_LINEARIZABLE_LEASE_MS")
                .unwrap_or(defaults.linearizable_lease),
            pool_capacity: env_parse("CONCORD_POOL_CAPACITY").unwrap_or(defaults.pool_capacity),
        }
    }

    /// Validate the configuration, returning all problems found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.session_timeout.is_zero() {
            errors.push("session_timeout must be non-zero".to_string());
        }
        if self.event_buffer_bound == 0 {
            errors.push("event_buffer_bound must be at least 1".to_string());
        }
        if self.command_gap_threshold == 0 {
            errors.push("command_gap_threshold must be at least 1".to_string());
        }
        if self.linearizable_lease.is_zero() {
            errors.push("linearizable_lease must be non-zero".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Configuration for the TCP server front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind (e.g. "127.0.0.1:8700").
    pub bind_addr: String,

    /// Addresses of all cluster members, advertised in connect/register
    /// responses.
    pub members: Vec<String>,

    /// Maximum connections from a single IP.
    pub max_connections_per_ip: usize,

    /// Maximum total connections (0 = unlimited).
    pub max_total_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8700".to_string(),
            members: vec!["127.0.0.1:8700".to_string()],
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            max_total_connections: DEFAULT_MAX_TOTAL_CONNECTIONS,
        }
    }
}

impl ServerConfig {
    /// Validate the configuration, returning all problems found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.bind_addr.is_empty() {
            errors.push("bind_addr must not be empty".to_string());
        }
        if self.members.is_empty() {
            errors.push("members must contain at least this node".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_ms(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = SessionConfig {
            session_timeout: Duration::ZERO,
            event_buffer_bound: 0,
            command_gap_threshold: 0,
            linearizable_lease: Duration::ZERO,
            pool_capacity: 0,
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_server_config_requires_members() {
        let config = ServerConfig {
            members: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
