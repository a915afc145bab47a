use thiserror::Error;

/// Failures from the small utility layer (ids, DNS, HTTP fetch).
#[derive(Debug, Error)]
pub enum UtilError {
    /// The OS random source refused to produce bytes. Fatal at boot.
    #[error("os random source unavailable: {0}")]
    RngUnavailable(String),

    #[error("failed to resolve {host}: {reason}")]
    ResolveFailed { host: String, reason: String },

    #[error("http fetch failed: {0}")]
    FetchFailed(String),

    #[error("http fetch returned status {0}")]
    FetchStatus(u16),

    #[error("http fetch response is not json")]
    FetchNotJson,

    #[error("invalid peer address {0:?}")]
    BadAddress(String),
}

/// Token creation/verification failures. Verification errors are all
/// reported to callers as one opaque rejection path; the variants exist so
/// logs can tell them apart.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("unsupported token version")]
    VersionMismatch,

    #[error("token expired")]
    Expired,

    #[error("token type mismatch")]
    TypeMismatch,

    #[error("token signature mismatch")]
    SignatureMismatch,

    #[error("token signature required")]
    SignatureMissing,
}

/// Socket-layer failures for WireClient/WireServer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame")]
    Malformed,

    #[error("invalid wire config: {0}")]
    Config(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("connection destroyed")]
    Destroyed,
}

/// Top-level fabric failures. Only construction can fail; once running the
/// cluster degrades locally and never propagates peer errors upward.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid cluster config: {0}")]
    Config(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Util(#[from] UtilError),
}
