//! Messages exchanged between the pool and its execution context.
//!
//! Every frame is one [`WireMessage`] encoded with MessagePack. Call payloads
//! and results travel as nested MessagePack bytes so the protocol never needs
//! to know the task types.

use serde::{Deserialize, Serialize};
use sluice_queue::Aborted;
use thiserror::Error;

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireMessage {
    /// Run the handler on `payload`. `abortable` calls get a signal that a
    /// later [`WireMessage::Abort`] with the same id fires.
    Call {
        id: u64,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
        abortable: bool,
    },
    Abort {
        id: u64,
    },
    /// Sent once by the execution context when it accepts calls.
    Ready,
    /// Stop accepting calls, finish the running ones, then acknowledge.
    Terminate,
    Terminated,
    Response {
        id: u64,
        outcome: Outcome,
    },
}

impl WireMessage {
    /// Serialize this frame to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize a frame from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Result of one call as it crosses the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(#[serde(with = "serde_bytes")] Vec<u8>),
    Err(RemoteError),
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// The call's signal fired and the handler gave up.
    Aborted,
    /// The handler hit a tokio timeout.
    Timeout,
    /// Any other handler error.
    Handler,
    /// The handler panicked.
    Panicked,
    /// The payload or result could not be (de)serialized.
    Decode,
    /// The call arrived after termination began.
    Terminating,
}

/// A handler error rebuilt on the pool side.
///
/// Errors do not survive the boundary as values, so the execution context
/// flattens them: the kind keeps cancellation and timeouts distinguishable,
/// `message` is the outermost error and `chain` the sources below it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    #[serde(default)]
    pub chain: Vec<String>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            chain: Vec::new(),
        }
    }

    /// Flatten a handler error, classifying cancellation and timeouts.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        let kind = if error.chain().any(|e| e.is::<Aborted>()) {
            RemoteErrorKind::Aborted
        } else if error.chain().any(|e| e.is::<tokio::time::error::Elapsed>()) {
            RemoteErrorKind::Timeout
        } else {
            RemoteErrorKind::Handler
        };
        Self {
            kind,
            message: error.to_string(),
            chain: error.chain().skip(1).map(ToString::to_string).collect(),
        }
    }
}

/// Helper module for serde to handle `Vec<u8>` as raw bytes in MessagePack.
mod serde_bytes {
    use std::fmt;

    use serde::de::{SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        d.deserialize_bytes(BytesVisitor)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte array")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element()? {
                bytes.push(byte);
            }
            Ok(bytes)
        }
    }
}
