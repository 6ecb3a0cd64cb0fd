use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};

/// One remote call: which object, which operation, and its encoded argument record.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request {
    pub type_name: String,
    pub instance_id: String,
    pub method: String,
    pub args: Vec<u8>,
}

/// The answer to a [`Request`]: the encoded reply record, or the error raised
/// while serving it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Response {
    Value(Vec<u8>),
    Fault(Fault),
}

/// Cross-process representation of an error.
///
/// `trace` holds one formatted entry per process the error went through,
/// oldest first.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Vec<String>,
}

impl Fault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Fault { kind, message: message.into(), trace: Vec::new() }
    }

    pub fn append_trace(&mut self, entry: String) {
        self.trace.push(entry);
    }

    pub fn formatted_trace(&self) -> String {
        self.trace.iter().enumerate().map(|(hop, entry)| format!("  #{hop} {entry}")).collect::<Vec<_>>().join("\n")
    }
}

/// Address of a registered object: `type_name:instance_id:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle {
    pub type_name: String,
    pub instance_id: String,
    pub port: u16,
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.type_name, self.instance_id, self.port)
    }
}

impl FromStr for ObjectHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim().split(':').collect();
        let [type_name, instance_id, port] = fields.as_slice() else {
            return Err(Error::ProtocolError(format!("object handle '{s}' must have the form type_name:instance_id:port")));
        };
        if type_name.is_empty() || instance_id.is_empty() {
            return Err(Error::ProtocolError(format!("object handle '{s}' has an empty field")));
        }
        let port = port.parse::<u16>().map_err(|e| Error::ProtocolError(format!("object handle '{s}' has an invalid port: {e}")))?;

        Ok(ObjectHandle { type_name: type_name.to_string(), instance_id: instance_id.to_string(), port })
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
