//! Configuration helpers and per-connection tunables.
//!
//! Settings are read from a [`config::Config`] with instance namespacing:
//! `{name}.{key}` takes priority over `{key}`, which takes priority over the
//! hard-coded default.

use ::config::Config;
use std::time::Duration;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

// Hard-coded defaults applied when a key is absent everywhere.
const DEFAULT_RECV_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 500;
const DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 0;
const DEFAULT_MIN_PACKET_LEN: usize = 0;
const DEFAULT_MAX_PACKET_LEN: usize = 65535;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Per-connection tunables honored by every worker loop.
///
/// # Configuration Keys
///
/// - `recv_buffer_size`: maximum bytes read per loop iteration
/// - `socket_timeout_ms`: blocking read/accept deadline; also bounds how long
///   `stop()` waits for the worker to notice the request
/// - `inactivity_timeout_ms`: maximum silent period before the connection
///   self-terminates; 0 disables the check
/// - `min_packet_len` / `max_packet_len`: payload size classification bounds
/// - `connect_timeout_ms`: outbound connection establishment deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunables {
    /// Maximum number of bytes read in one loop iteration.
    pub recv_buffer_size: usize,
    /// Deadline for each blocking read/accept.
    pub socket_timeout: Duration,
    /// Maximum silent period before self-termination; `None` disables it.
    ///
    /// Enforcement is polling, so its resolution is bounded below by
    /// `socket_timeout`.
    pub inactivity_timeout: Option<Duration>,
    /// Payloads shorter than this are routed to the undersized-packet event.
    pub min_packet_len: usize,
    /// Payloads longer than this are routed to the oversized-packet event.
    pub max_packet_len: usize,
    /// Deadline for outbound connection establishment.
    pub connect_timeout: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            socket_timeout: Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS),
            inactivity_timeout: None,
            min_packet_len: DEFAULT_MIN_PACKET_LEN,
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

impl Tunables {
    /// Builds tunables from configuration with instance namespacing.
    ///
    /// Configuration lookup follows this priority:
    /// 1. `{name}.{key}` (e.g., `api_server.socket_timeout_ms`)
    /// 2. `{key}` (e.g., `socket_timeout_ms`)
    /// 3. Hard-coded default
    pub fn from_config(config: &Config, name: &str) -> Self {
        let recv_buffer_size = get_namespaced_usize(config, name, "recv_buffer_size")
            .unwrap_or(DEFAULT_RECV_BUFFER_SIZE);
        let socket_timeout_ms = get_namespaced_u64(config, name, "socket_timeout_ms")
            .unwrap_or(DEFAULT_SOCKET_TIMEOUT_MS);
        let inactivity_timeout_ms = get_namespaced_u64(config, name, "inactivity_timeout_ms")
            .unwrap_or(DEFAULT_INACTIVITY_TIMEOUT_MS);
        let min_packet_len =
            get_namespaced_usize(config, name, "min_packet_len").unwrap_or(DEFAULT_MIN_PACKET_LEN);
        let max_packet_len =
            get_namespaced_usize(config, name, "max_packet_len").unwrap_or(DEFAULT_MAX_PACKET_LEN);
        let connect_timeout_ms = get_namespaced_u64(config, name, "connect_timeout_ms")
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);

        Self {
            recv_buffer_size,
            socket_timeout: Duration::from_millis(socket_timeout_ms),
            inactivity_timeout: if inactivity_timeout_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(inactivity_timeout_ms))
            },
            min_packet_len,
            max_packet_len,
            connect_timeout: Duration::from_millis(connect_timeout_ms),
        }
    }
}
