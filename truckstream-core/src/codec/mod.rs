//! Conversion between schema-registry framed payloads and typed records.
//!
//! Every payload starts with a five byte header: the magic byte `0x00` followed by the
//! big-endian schema id. The rest is the record body encoded as MessagePack with named
//! fields. The schema id must resolve to the stream the payload was received on.
mod payload;
mod registry;

use std::sync::Arc;

use thiserror::Error;

use crate::types::{StreamTag, TrafficRecord, TruckRecord, TypedRecord};
use payload::{TrafficPayload, TruckPayload};
pub use registry::{SchemaId, SchemaRegistry, StaticSchemaRegistry};

const MAGIC_BYTE: u8 = 0;
const HEADER_LEN: usize = 5;

/// Turns raw payloads into [TypedRecord]s.
///
/// The decoder is stateless and cheap to clone, every decode worker holds its own clone.
#[derive(Clone)]
pub struct RecordDecoder {
    registry: Arc<dyn SchemaRegistry>,
}

impl RecordDecoder {
    /// Create a decoder resolving schema ids with the given registry
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Decode a payload received on the stream identified by `tag`
    pub fn decode(&self, tag: StreamTag, payload: &[u8]) -> Result<TypedRecord, DecodeError> {
        let (schema_id, body) = split_header(payload)?;
        match self.registry.lookup(schema_id) {
            None => return Err(DecodeError::UnknownSchema(schema_id)),
            Some(registered) if registered != tag => {
                return Err(DecodeError::SchemaMismatch {
                    schema_id,
                    registered,
                    received: tag,
                })
            }
            Some(_) => (),
        }
        let record = match tag {
            StreamTag::Truck => {
                let payload: TruckPayload = rmp_serde::from_slice(body)?;
                TypedRecord::Truck(TruckRecord::try_from(payload)?)
            }
            StreamTag::Traffic => {
                let payload: TrafficPayload = rmp_serde::from_slice(body)?;
                TypedRecord::Traffic(TrafficRecord::try_from(payload)?)
            }
        };
        Ok(record)
    }
}

fn split_header(payload: &[u8]) -> Result<(SchemaId, &[u8]), DecodeError> {
    if payload.len() < HEADER_LEN {
        return Err(DecodeError::Truncated(payload.len()));
    }
    let (header, body) = payload.split_at(HEADER_LEN);
    if header[0] != MAGIC_BYTE {
        return Err(DecodeError::MagicByte(header[0]));
    }
    let schema_id = SchemaId::from_be_bytes([header[1], header[2], header[3], header[4]]);
    Ok((schema_id, body))
}

/// Produces framed payloads in the format understood by [RecordDecoder]
#[derive(Clone)]
pub struct RecordEncoder {
    registry: Arc<dyn SchemaRegistry>,
}

impl RecordEncoder {
    /// Create an encoder taking schema ids from the given registry
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Encode a record with the schema registered for its stream
    pub fn encode(&self, record: &TypedRecord) -> Result<Vec<u8>, EncodeError> {
        let tag = record.tag();
        let schema_id = self
            .registry
            .schema_for(tag)
            .ok_or(EncodeError::NoSchema(tag))?;
        let body = match record {
            TypedRecord::Truck(t) => rmp_serde::to_vec_named(&TruckPayload::from(t))?,
            TypedRecord::Traffic(t) => rmp_serde::to_vec_named(&TrafficPayload::from(t))?,
        };
        Ok(frame(schema_id, body))
    }
}

fn frame(schema_id: SchemaId, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(MAGIC_BYTE);
    out.extend_from_slice(&schema_id.to_be_bytes());
    out.extend(body);
    out
}

/// Reasons a payload could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Fewer bytes than the magic byte and schema id need
    #[error("Payload of {0} bytes is shorter than the wire header")]
    Truncated(usize),
    /// The first byte is not the wire format's zero magic byte
    #[error("Expected magic byte 0x00, got {0:#04x}")]
    MagicByte(u8),
    /// The registry does not know the schema id in the header
    #[error("Schema id {0} is not registered")]
    UnknownSchema(SchemaId),
    /// The schema belongs to the other stream
    #[error("Schema {schema_id} describes the {registered} stream but payload arrived on {received}")]
    SchemaMismatch {
        schema_id: SchemaId,
        registered: StreamTag,
        received: StreamTag,
    },
    /// The body is not a valid encoding of the record
    #[error("Payload body does not match the schema")]
    Body(#[from] rmp_serde::decode::Error),
    /// The body decoded but a mandatory field was null
    #[error("Required field `{0}` is absent")]
    MissingField(&'static str),
}

/// Reasons a record could not be encoded
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("No schema registered for the {0} stream")]
    NoSchema(StreamTag),
    #[error("Failed to serialize record body")]
    Body(#[from] rmp_serde::encode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{registry, traffic, truck};

    fn codec() -> (RecordEncoder, RecordDecoder) {
        let registry = registry();
        (
            RecordEncoder::new(registry.clone()),
            RecordDecoder::new(registry),
        )
    }

    #[test]
    fn decodes_what_was_encoded() {
        let (enc, dec) = codec();
        let truck = TypedRecord::Truck(truck("D1", 10_000));
        let traffic = TypedRecord::Traffic(traffic("D1", 50_000, 70));

        let bytes = enc.encode(&truck).unwrap();
        assert_eq!(dec.decode(StreamTag::Truck, &bytes).unwrap(), truck);
        let bytes = enc.encode(&traffic).unwrap();
        assert_eq!(dec.decode(StreamTag::Traffic, &bytes).unwrap(), traffic);
    }

    #[test]
    fn writes_registry_header() {
        let (enc, _) = codec();
        let bytes = enc.encode(&TypedRecord::Traffic(traffic("R", 0, 1))).unwrap();
        assert_eq!(&bytes[..5], &[0, 0, 0, 0, 2]);
    }

    #[test]
    fn rejects_short_payload() {
        let (_, dec) = codec();
        assert!(matches!(
            dec.decode(StreamTag::Truck, &[0, 0, 1]),
            Err(DecodeError::Truncated(3))
        ));
    }

    #[test]
    fn rejects_bad_magic_byte() {
        let (enc, dec) = codec();
        let mut bytes = enc.encode(&TypedRecord::Truck(truck("D1", 0))).unwrap();
        bytes[0] = 7;
        assert!(matches!(
            dec.decode(StreamTag::Truck, &bytes),
            Err(DecodeError::MagicByte(7))
        ));
    }

    #[test]
    fn rejects_unknown_schema() {
        let (_, dec) = codec();
        let bytes = frame(99, vec![]);
        assert!(matches!(
            dec.decode(StreamTag::Truck, &bytes),
            Err(DecodeError::UnknownSchema(99))
        ));
    }

    /// a traffic payload arriving on the truck stream must not be decoded
    #[test]
    fn rejects_schema_of_other_stream() {
        let (enc, dec) = codec();
        let bytes = enc.encode(&TypedRecord::Traffic(traffic("R", 0, 1))).unwrap();
        assert!(matches!(
            dec.decode(StreamTag::Truck, &bytes),
            Err(DecodeError::SchemaMismatch {
                schema_id: 2,
                registered: StreamTag::Traffic,
                received: StreamTag::Truck
            })
        ));
    }

    #[test]
    fn rejects_garbage_body() {
        let (_, dec) = codec();
        let bytes = frame(1, vec![0xc1, 0xff, 0x00]);
        assert!(matches!(
            dec.decode(StreamTag::Truck, &bytes),
            Err(DecodeError::Body(_))
        ));
    }

    #[test]
    fn rejects_missing_key() {
        let (_, dec) = codec();
        let body = TrafficPayload {
            correlation_key: None,
            event_time: Some(5),
            route_id: 1,
            congestion_level: 3,
        };
        let bytes = frame(2, rmp_serde::to_vec_named(&body).unwrap());
        assert!(matches!(
            dec.decode(StreamTag::Traffic, &bytes),
            Err(DecodeError::MissingField("correlation_key"))
        ));
    }

    #[test]
    fn rejects_empty_key() {
        let (_, dec) = codec();
        let body = TrafficPayload {
            correlation_key: Some(String::new()),
            event_time: Some(5),
            route_id: 1,
            congestion_level: 3,
        };
        let bytes = frame(2, rmp_serde::to_vec_named(&body).unwrap());
        assert!(matches!(
            dec.decode(StreamTag::Traffic, &bytes),
            Err(DecodeError::MissingField("correlation_key"))
        ));
    }

    #[test]
    fn rejects_missing_timestamp() {
        let (_, dec) = codec();
        let mut body = TruckPayload::from(&truck("D1", 0));
        body.event_time = None;
        let bytes = frame(1, rmp_serde::to_vec_named(&body).unwrap());
        assert!(matches!(
            dec.decode(StreamTag::Truck, &bytes),
            Err(DecodeError::MissingField("event_time"))
        ));
    }

    #[test]
    fn encoder_needs_schema() {
        let enc = RecordEncoder::new(Arc::new(StaticSchemaRegistry::new()));
        assert!(matches!(
            enc.encode(&TypedRecord::Truck(truck("D1", 0))),
            Err(EncodeError::NoSchema(StreamTag::Truck))
        ));
    }
}
