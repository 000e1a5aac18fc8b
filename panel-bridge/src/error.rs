use thiserror::Error;

/// Fatal errors. Anything here stops the bridge; per-command failures are reported through
/// [`crate::executor::WriteOutcome`] instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    MQTTClientError(#[from] rumqttc::ClientError),

    #[error(transparent)]
    MQTTConnectionError(#[from] rumqttc::ConnectionError),

    #[error(transparent)]
    JSONError(#[from] serde_json::Error),

    #[error("SendError")]
    SendError,

    #[error("{0}")]
    Other(std::borrow::Cow<'static, str>),
}

impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Self::Other(s.into())
    }
}

/// A required setting is missing or invalid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{name}`: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectErrorKind {
    Timeout,
    Refused,
    Protocol,
}

impl std::fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectErrorKind::Timeout => "timed out",
            ConnectErrorKind::Refused => "refused",
            ConnectErrorKind::Protocol => "protocol error",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("connection {kind}: {detail}")]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub detail: String,
}

impl ConnectError {
    pub fn new(kind: ConnectErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::Timeout, detail)
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let kind = match err.kind() {
            TimedOut => ConnectErrorKind::Timeout,
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
            | AddrNotAvailable | NotFound => ConnectErrorKind::Refused,
            _ => ConnectErrorKind::Protocol,
        };
        Self::new(kind, err.to_string())
    }
}

/// Caller input that can never be written. Raised before any network traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("panel index {index} out of range (panel count {count})")]
    PanelIndex { index: u16, count: u16 },

    #[error("power level {value} outside 0..={max}")]
    PowerLevel { value: i64, max: u16 },

    #[error("panel index {index} overflows the address space from base {base}")]
    AddressOverflow { base: u16, index: u16 },

    #[error("{mode} mode cannot take a {given} value")]
    ValueKind {
        mode: crate::config::ControlMode,
        given: &'static str,
    },
}

/// Failure of a single coil/register write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The unit answered with a Modbus exception.
    #[error("{0}")]
    Device(String),

    /// Timeout, reset or an unparseable response. The session is no longer trusted.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected")]
    NotConnected,
}
