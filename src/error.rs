use thiserror::Error;

/// The error type for commlink operations.
///
/// This encompasses all errors that can occur when running connections,
/// including transport I/O, configuration lookup, and TLS setup.
///
/// Per-connection worker errors never cross connection boundaries: they are
/// delivered through the `error` field of the terminated event. Synchronous
/// errors (construction, send, address migration) are returned to the caller.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// Attempted to send on a connection that has no bound transport.
    ///
    /// This happens after `stop()` or during the down-window of a failed
    /// address migration.
    #[error("Connection has no bound transport")]
    NotConnected,

    /// No data arrived within the configured inactivity window.
    ///
    /// Delivered as the terminal error of the terminated event; never
    /// returned synchronously.
    #[error("Inactivity timeout after {0} ms of silence")]
    InactivityTimeout(u64),

    /// Datagram send without an explicit destination on a socket that has no
    /// default peer bound.
    #[error("No default peer bound for datagram send")]
    NoDefaultPeer,

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[cfg(feature = "tls")]
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[cfg(feature = "tls")]
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[cfg(feature = "tls")]
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[cfg(feature = "tls")]
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[cfg(feature = "tls")]
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// TLS handshake failed while opening or accepting a connection.
    #[cfg(feature = "tls")]
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Attempted to bind a TLS server but server configuration is missing.
    ///
    /// When using the TLS transport, `tls_server_cert` and `tls_server_key`
    /// configuration keys are required for listening endpoints.
    #[cfg(feature = "tls")]
    #[error("TLS server configuration not provided - required for bind()")]
    TlsServerConfigMissing,

    /// Attempted to connect with TLS but client configuration is missing.
    #[cfg(feature = "tls")]
    #[error("TLS client configuration not provided - required for connect()")]
    TlsClientConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[cfg(feature = "tls")]
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[cfg(feature = "tls")]
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for `transport_type` configuration key.
    ///
    /// Must be one of: "tcp" or "tls" (when the TLS feature is enabled).
    #[error("Invalid transport type '{got}', expected one of: {}", .valid.join(", "))]
    InvalidTransportType { got: String, valid: Vec<String> },
}

impl Error {
    /// Whether an I/O error represents a read/accept deadline expiry rather
    /// than a hard failure.
    pub(crate) fn is_timeout(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        )
    }
}
