use std::fmt;

/// Errors produced by the protocol core.
///
/// Framing/checksum/addressing errors are recoverable at the [`crate::rcu::session::Session`]
/// level and never reach a caller directly; they are logged and counted
/// instead. Transport and configuration errors always propagate.
#[derive(thiserror::Error, Debug)]
pub enum RcuError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    #[error("unexpected sender address {0:#04x}")]
    Addressing(u8),

    #[error("parameter {0:#04x} is not writable")]
    NotWritable(u8),

    #[error("value {value} out of range [{min}, {max}] for parameter {index:#04x}")]
    OutOfRange {
        index: u8,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("write to parameter {0:#04x} timed out waiting for master ACK/NAK")]
    WriteTimeout(u8),

    #[error("write to parameter {0:#04x} was rejected by the master")]
    WriteRejected(u8),

    #[error("configuration error: {0}")]
    Config(String),
}

/// A lower-level transport failure: the serial port could not be opened,
/// read from, or written to.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("failed to open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Port(#[from] serialport::Error),
    #[error("transport closed")]
    Closed,
}

/// A non-fatal annotation attached to a decoded value when its parameter index
/// was absent from the [`crate::rcu::registry::Registry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownParameterWarning {
    pub index: u8,
    pub assumed_width: u8,
}

impl fmt::Display for UnknownParameterWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter {:#04x} not found in registry, assumed width {}",
            self.index, self.assumed_width
        )
    }
}
