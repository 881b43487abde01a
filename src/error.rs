use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoreError {
    #[error("tunnel '{0}' not found in config")]
    UnknownTunnel(String),

    #[error("group '{0}' not found in config")]
    UnknownGroup(String),

    #[error("port conflict: {port} already used by tunnel '{incumbent}'")]
    PortConflict { port: u16, incumbent: String },

    #[error("tunnel '{0}' is not running")]
    NotRunning(String),

    #[error("request is missing a host")]
    HostRequired,

    #[error("failed to connect to host '{host}': {source}")]
    TransportFailed {
        host: String,
        #[source]
        source: Box<BoreError>,
    },

    #[error("no SSH authentication methods available: {0}")]
    AuthUnavailable(String),

    #[error("failed to reach proxy host '{proxy}': {message}")]
    ProxyUnreachable { proxy: String, message: String },

    #[error("SSH handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("timed out dialing {0}")]
    DialTimeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("SSH session not connected")]
    NotConnected,

    #[error("keepalive failed: {0}")]
    KeepaliveFailed(String),

    #[error("failed to listen on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen on remote {addr}: {message}")]
    RemoteBindFailed { addr: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("state file error: {0}")]
    State(String),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BoreError>;
