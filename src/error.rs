use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::remote_object::protocol::Fault;

/// Coarse classification of every failure the crate can report.
///
/// Remote faults keep the kind of the error that was raised on the server, so
/// callers can tell configuration, network, data-integrity and logic faults
/// apart regardless of which side of the wire they happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Protocol,
    Cancelled,
    Timeout,
    ChannelInvalidated,
    Integrity,
    Validation,
    NotFound,
    Scheduler,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ChannelInvalidated => "channel-invalidated",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Scheduler => "scheduler",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Failed to encode or decode message: {0}")]
    CodecError(#[from] bincode::Error),

    #[error("Transport failure while calling {type_name}.{method}: {message}")]
    TransportError { type_name: String, method: String, message: String },

    #[error("Protocol violation: {0}")]
    ProtocolError(String),

    #[error("Remote fault ({}): {}", .0.kind, .0.message)]
    RemoteFault(Fault),

    #[error("Call {type_name}.{method} was interrupted")]
    Cancelled { type_name: String, method: String },

    #[error("Call {type_name}.{method} timed out after {elapsed:?}")]
    Timeout { type_name: String, method: String, elapsed: Duration },

    #[error("Channel to '{0}' holds an unanswered request; reconnect the proxy before calling again")]
    ChannelInvalidated(String),

    #[error("Transfer exceeded expected size for '{path}': {actual} > {expected} bytes")]
    TransferExceededSize { path: String, expected: u64, actual: u64 },

    #[error("Transfer corrupted for '{path}': content hash does not match")]
    TransferCorrupted { path: String },

    #[error("Workflow validation failed: {0}")]
    ValidationError(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Scheduler error: {0}")]
    SchedulerError(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IoError(_) => ErrorKind::Io,
            Error::DeserializationError(_) | Error::ConfigurationError(_) => ErrorKind::Configuration,
            Error::CodecError(_) | Error::ProtocolError(_) => ErrorKind::Protocol,
            Error::TransportError { .. } => ErrorKind::Transport,
            Error::RemoteFault(fault) => fault.kind,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::ChannelInvalidated(_) => ErrorKind::ChannelInvalidated,
            Error::TransferExceededSize { .. } | Error::TransferCorrupted { .. } => ErrorKind::Integrity,
            Error::ValidationError(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::SchedulerError(_) => ErrorKind::Scheduler,
        }
    }

    /// Converts the error into its wire form, recording `hop` as the newest
    /// trace entry. A fault that already came from further upstream keeps its
    /// trace and grows by one entry.
    pub fn into_fault(self, hop: &str) -> Fault {
        match self {
            Error::RemoteFault(mut fault) => {
                fault.append_trace(format!("{hop}: forwarded {} fault", fault.kind));
                fault
            }
            other => {
                let mut fault = Fault::new(other.kind(), other.to_string());
                fault.append_trace(format!("{hop}: {}", source_chain(&other)));
                fault
            }
        }
    }
}

fn source_chain(error: &dyn std::error::Error) -> String {
    let mut chain = error.to_string();
    let mut current = error.source();
    while let Some(source) = current {
        chain.push_str("\n  caused by: ");
        chain.push_str(&source.to_string());
        current = source.source();
    }
    chain
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_fault_keeps_original_kind() {
        let local = Error::TransferCorrupted { path: "a.img".into() };
        let fault = local.into_fault("WorkflowEngine.send_piece");
        let remote = Error::RemoteFault(fault);

        assert_eq!(remote.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn forwarded_fault_accumulates_trace() {
        let first = Error::NotFound("transfer 3".into()).into_fault("hop-1");
        let second = Error::RemoteFault(first).into_fault("hop-2");

        assert_eq!(second.trace.len(), 2);
        assert!(second.trace[0].starts_with("hop-1"));
        assert!(second.trace[1].starts_with("hop-2"));
        assert_eq!(second.kind, ErrorKind::NotFound);
    }
}
