//! Message envelope and wire framing.
//!
//! Every record published to the broker is framed as
//! `[magic(0x00)][schema_id: i32 BE][envelope datum]` where the datum is an
//! Avro-encoded [`Envelope`]. The envelope carries origin identity and
//! ordering metadata plus the payload as an opaque Avro datum encoded
//! against the topic's registered schema. The schema id in the frame is the
//! id of that payload schema.

use std::io::Cursor;
use std::sync::OnceLock;

use apache_avro::types::Value;
use apache_avro::Schema;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::topic::TopicKey;

/// Magic byte marking a schema-id frame.
const MAGIC_BYTE: u8 = 0x00;

const ENVELOPE_SCHEMA_JSON: &str = r#"
{
    "type": "record",
    "name": "Envelope",
    "namespace": "controlbus",
    "fields": [
        {"name": "origin", "type": "long"},
        {"name": "identity", "type": "string"},
        {"name": "seq_num", "type": "long"},
        {"name": "send_timestamp", "type": "double"},
        {"name": "payload", "type": "bytes"}
    ]
}
"#;

/// The fixed Avro schema for [`Envelope`]. Parsed once.
pub fn envelope_schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        Schema::parse_str(ENVELOPE_SCHEMA_JSON).expect("builtin envelope schema is valid")
    })
}

/// Wire metadata common to every message, plus the encoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Process-unique id of the publisher.
    pub origin: i64,
    /// Human-readable publisher identity (usually the component name).
    pub identity: String,
    /// Monotonic send sequence number; doubles as the command id on
    /// command topics.
    pub seq_num: i64,
    /// Publish time, seconds since the Unix epoch.
    pub send_timestamp: f64,
    /// Payload Avro datum, encoded against the topic schema.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encode this envelope plus the schema-id frame into one wire record.
    pub fn encode(&self, schema_id: i32) -> Result<Bytes> {
        let value = Value::Record(vec![
            ("origin".to_string(), Value::Long(self.origin)),
            ("identity".to_string(), Value::String(self.identity.clone())),
            ("seq_num".to_string(), Value::Long(self.seq_num)),
            (
                "send_timestamp".to_string(),
                Value::Double(self.send_timestamp),
            ),
            ("payload".to_string(), Value::Bytes(self.payload.clone())),
        ]);
        let datum = apache_avro::to_avro_datum(envelope_schema(), value)
            .map_err(|e| Error::Encode(e.to_string()))?;

        let mut buf = BytesMut::with_capacity(5 + datum.len());
        buf.put_u8(MAGIC_BYTE);
        buf.put_i32(schema_id);
        buf.put_slice(&datum);
        Ok(buf.freeze())
    }

    /// Decode a framed wire record into `(payload_schema_id, envelope)`.
    pub fn decode(record: &[u8]) -> Result<(i32, Envelope)> {
        if record.len() < 5 {
            return Err(Error::Framing(format!(
                "record too short ({} bytes) to carry a schema id",
                record.len()
            )));
        }
        if record[0] != MAGIC_BYTE {
            return Err(Error::Framing(format!(
                "bad magic byte 0x{:02x}, expected 0x00",
                record[0]
            )));
        }
        let mut id_bytes = &record[1..5];
        let schema_id = id_bytes.get_i32();

        let mut reader = Cursor::new(&record[5..]);
        let value = apache_avro::from_avro_datum(envelope_schema(), &mut reader, None)
            .map_err(|e| Error::Decode(e.to_string()))?;
        Ok((schema_id, Envelope::from_value(value)?))
    }

    fn from_value(value: Value) -> Result<Envelope> {
        let Value::Record(fields) = value else {
            return Err(Error::MalformedEnvelope(
                "envelope datum is not a record".to_string(),
            ));
        };
        let mut origin = None;
        let mut identity = None;
        let mut seq_num = None;
        let mut send_timestamp = None;
        let mut payload = None;
        for (name, value) in fields {
            match (name.as_str(), value) {
                ("origin", Value::Long(v)) => origin = Some(v),
                ("identity", Value::String(v)) => identity = Some(v),
                ("seq_num", Value::Long(v)) => seq_num = Some(v),
                ("send_timestamp", Value::Double(v)) => send_timestamp = Some(v),
                ("payload", Value::Bytes(v)) => payload = Some(v),
                (name, value) => {
                    return Err(Error::MalformedEnvelope(format!(
                        "unexpected field {name}={value:?}"
                    )))
                }
            }
        }
        match (origin, identity, seq_num, send_timestamp, payload) {
            (Some(origin), Some(identity), Some(seq_num), Some(send_timestamp), Some(payload)) => {
                Ok(Envelope {
                    origin,
                    identity,
                    seq_num,
                    send_timestamp,
                    payload,
                })
            }
            _ => Err(Error::MalformedEnvelope(
                "envelope record is missing fields".to_string(),
            )),
        }
    }

    /// Decode the payload datum against `schema`, producing the generic
    /// Avro value carried by a [`Sample`].
    pub fn decode_payload(&self, schema: &Schema) -> Result<Value> {
        let mut reader = Cursor::new(&self.payload[..]);
        apache_avro::from_avro_datum(schema, &mut reader, None)
            .map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Encode a typed payload into an Avro datum against `schema`.
pub fn encode_payload<T: serde::Serialize>(schema: &Schema, payload: &T) -> Result<Vec<u8>> {
    let value = apache_avro::to_value(payload)
        .map_err(|e| Error::Encode(e.to_string()))?
        .resolve(schema)
        .map_err(|e| Error::Encode(e.to_string()))?;
    apache_avro::to_avro_datum(schema, value).map_err(|e| Error::Encode(e.to_string()))
}

/// A decoded message as delivered to topic readers.
///
/// Samples are immutable value objects; ownership passes from the consumer
/// task through the session queue to the reader.
#[derive(Debug, Clone)]
pub struct Sample {
    pub topic: TopicKey,
    pub origin: i64,
    pub identity: String,
    pub seq_num: i64,
    pub send_timestamp: f64,
    pub rcv_timestamp: f64,
    /// Decoded payload as a generic Avro value; typed readers convert it.
    pub data: Value,
}

impl Sample {
    /// Convert the payload into a concrete type.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        apache_avro::from_value::<T>(&self.data).map_err(|e| Error::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Motors {
        position: f64,
        velocity: f64,
    }

    fn motors_schema() -> Schema {
        Schema::parse_str(
            r#"{
                "type": "record",
                "name": "Motors",
                "fields": [
                    {"name": "position", "type": "double"},
                    {"name": "velocity", "type": "double"}
                ]
            }"#,
        )
        .unwrap()
    }

    fn sample_envelope(payload: Vec<u8>) -> Envelope {
        Envelope {
            origin: 42,
            identity: "Rotator".to_string(),
            seq_num: 7,
            send_timestamp: 1_700_000_000.5,
            payload,
        }
    }

    #[test]
    fn envelope_round_trip() {
        let schema = motors_schema();
        let payload = encode_payload(
            &schema,
            &Motors {
                position: 1.25,
                velocity: -0.5,
            },
        )
        .unwrap();
        let env = sample_envelope(payload);

        let wire = env.encode(31).unwrap();
        assert_eq!(wire[0], 0x00);

        let (schema_id, decoded) = Envelope::decode(&wire).unwrap();
        assert_eq!(schema_id, 31);
        assert_eq!(decoded, env);

        let value = decoded.decode_payload(&schema).unwrap();
        let motors: Motors = apache_avro::from_value(&value).unwrap();
        assert_eq!(motors.position, 1.25);
        assert_eq!(motors.velocity, -0.5);
    }

    #[test]
    fn nan_payload_encodes_to_stable_bytes() {
        let schema = motors_schema();
        let motors = Motors {
            position: f64::NAN,
            velocity: 0.0,
        };
        let a = encode_payload(&schema, &motors).unwrap();
        let b = encode_payload(&schema, &motors).unwrap();
        // Byte-level equality is what write deduplication relies on:
        // NaN compares equal to NaN once encoded.
        assert_eq!(a, b);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let err = Envelope::decode(&[0xff, 0, 0, 0, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[test]
    fn decode_rejects_short_record() {
        let err = Envelope::decode(&[0x00, 0, 1]).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }
}
