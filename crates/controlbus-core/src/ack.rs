//! Command acknowledgments.
//!
//! Every command publish carries a unique (origin, seq_num) pair; every
//! acknowledgment carries the same pair plus a code. A command sees zero or
//! more non-terminal acknowledgments followed by exactly one terminal one.

use std::sync::OnceLock;

use apache_avro::{AvroSchema, Schema};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Maximum length of the human-readable `result` field of an ack.
pub const MAX_RESULT_LEN: usize = 256;

/// Acknowledgment codes, with their fixed wire integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckCode {
    /// Command was received and queued for execution.
    Ack,
    /// Handler is running; more acknowledgments will follow.
    InProgress,
    /// Terminal: handler finished successfully.
    Complete,
    /// Terminal: handler failed or the command was rejected.
    Failed,
    /// Terminal: handler was cancelled.
    Aborted,
    /// Terminal: handler signalled a timeout.
    Timeout,
    /// Terminal: the sender is not authorized.
    NoPerm,
}

impl AckCode {
    pub fn wire(&self) -> i32 {
        match self {
            AckCode::Ack => 300,
            AckCode::InProgress => 301,
            AckCode::Complete => 303,
            AckCode::NoPerm => -300,
            AckCode::Failed => -302,
            AckCode::Aborted => -303,
            AckCode::Timeout => -304,
        }
    }

    pub fn from_wire(code: i32) -> Option<AckCode> {
        match code {
            300 => Some(AckCode::Ack),
            301 => Some(AckCode::InProgress),
            303 => Some(AckCode::Complete),
            -300 => Some(AckCode::NoPerm),
            -302 => Some(AckCode::Failed),
            -303 => Some(AckCode::Aborted),
            -304 => Some(AckCode::Timeout),
            _ => None,
        }
    }

    /// Terminal codes close the command instance; no acknowledgment with the
    /// same command id may follow one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AckCode::Ack | AckCode::InProgress)
    }

    /// Terminal codes that indicate the command did not complete.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AckCode::Failed | AckCode::Aborted | AckCode::Timeout | AckCode::NoPerm
        )
    }
}

impl Serialize for AckCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.wire())
    }
}

impl<'de> Deserialize<'de> for AckCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i32::deserialize(deserializer)?;
        AckCode::from_wire(code)
            .ok_or_else(|| D::Error::custom(format!("unknown ack code {code}")))
    }
}

impl std::fmt::Display for AckCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AckCode::Ack => "ack",
            AckCode::InProgress => "in-progress",
            AckCode::Complete => "complete",
            AckCode::Failed => "failed",
            AckCode::Aborted => "aborted",
            AckCode::Timeout => "timeout",
            AckCode::NoPerm => "no-perm",
        };
        f.write_str(name)
    }
}

/// One acknowledgment message for a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// Origin of the command being acknowledged.
    pub origin: i64,
    /// Sequence number of the command being acknowledged.
    pub seq_num: i64,
    /// Acknowledgment code.
    pub code: AckCode,
    /// Error number; 0 unless the code is a failure.
    pub error: i32,
    /// Human-readable explanation, at most [`MAX_RESULT_LEN`] characters.
    pub result: String,
    /// Hint for how much longer the caller should wait, in seconds;
    /// 0.0 if the handler gives no estimate.
    pub timeout: f64,
}

impl Ack {
    pub fn new(origin: i64, seq_num: i64, code: AckCode) -> Self {
        Self {
            origin,
            seq_num,
            code,
            error: 0,
            result: String::new(),
            timeout: 0.0,
        }
    }

    /// Set the result string, truncating to at most [`MAX_RESULT_LEN`]
    /// bytes. Truncation lands on a char boundary so multi-byte text
    /// cannot panic the caller.
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        let mut result = result.into();
        if result.len() > MAX_RESULT_LEN {
            let mut cut = MAX_RESULT_LEN;
            while !result.is_char_boundary(cut) {
                cut -= 1;
            }
            result.truncate(cut);
        }
        self.result = result;
        self
    }

    pub fn with_error(mut self, error: i32) -> Self {
        self.error = error;
        self
    }
}

/// Avro schema for the acknowledgment topic payload.
pub const ACK_SCHEMA_JSON: &str = r#"
{
    "type": "record",
    "name": "Ackcmd",
    "namespace": "controlbus",
    "fields": [
        {"name": "origin", "type": "long"},
        {"name": "seq_num", "type": "long"},
        {"name": "code", "type": "int"},
        {"name": "error", "type": "int"},
        {"name": "result", "type": "string"},
        {"name": "timeout", "type": "double"}
    ]
}
"#;

impl AvroSchema for Ack {
    fn get_schema() -> Schema {
        static SCHEMA: OnceLock<Schema> = OnceLock::new();
        SCHEMA
            .get_or_init(|| {
                Schema::parse_str(ACK_SCHEMA_JSON).expect("builtin ackcmd schema is valid")
            })
            .clone()
    }
}
