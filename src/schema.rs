//! Schema-registry backed event codec.
//!
//! Payloads are framed registry-style: a magic byte, the big-endian schema id,
//! then the JSON body. Schema ids are obtained once per logical event type at
//! startup and cached for the process lifetime; encoding never re-registers.

use crate::error::{LedgerError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Leading byte of every framed payload.
pub const WIRE_MAGIC: u8 = 0x00;

/// Frame prefix: magic byte + u32 schema id.
const HEADER_LEN: usize = 5;

/// Versioned schema storage, keyed by subject and id.
pub trait SchemaRegistry: Send + Sync {
    /// Registers `definition` under `subject`, returning its schema id.
    /// Re-registering the same definition for a subject returns the existing
    /// id.
    fn register(&self, subject: &str, definition: &str) -> Result<u32>;

    fn resolve(&self, schema_id: u32) -> Result<Option<String>>;
}

pub type SchemaRegistryRef = Arc<dyn SchemaRegistry>;

#[derive(Default)]
struct RegistryState {
    by_id: HashMap<u32, String>,
    by_subject: HashMap<String, (u32, String)>,
    next_id: u32,
}

/// In-process registry. Ids start at 1 and are stable for the process
/// lifetime.
#[derive(Default)]
pub struct InMemorySchemaRegistry {
    state: Mutex<RegistryState>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchemaRegistry for InMemorySchemaRegistry {
    fn register(&self, subject: &str, definition: &str) -> Result<u32> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| LedgerError::StoreUnavailable("schema registry poisoned".into()))?;

        if let Some((id, existing)) = state.by_subject.get(subject) {
            if existing == definition {
                return Ok(*id);
            }
            return Err(LedgerError::Encoding(format!(
                "subject {subject} already registered with a different definition"
            )));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.by_id.insert(id, definition.to_string());
        state
            .by_subject
            .insert(subject.to_string(), (id, definition.to_string()));
        Ok(id)
    }

    fn resolve(&self, schema_id: u32) -> Result<Option<String>> {
        let state = self
            .state
            .lock()
            .map_err(|_| LedgerError::StoreUnavailable("schema registry poisoned".into()))?;
        Ok(state.by_id.get(&schema_id).cloned())
    }
}

/// Encodes and decodes one logical event type against the registry.
///
/// Pure and stateless beyond the cached schema id, so it can be shared freely
/// between the engine and consumers.
pub struct SchemaCodec {
    registry: SchemaRegistryRef,
    subject: String,
    schema_id: u32,
}

impl SchemaCodec {
    /// Registers `definition` under `subject` and caches the returned id.
    pub fn for_subject(
        registry: SchemaRegistryRef,
        subject: impl Into<String>,
        definition: &str,
    ) -> Result<Self> {
        let subject = subject.into();
        let schema_id = registry.register(&subject, definition)?;
        tracing::debug!(subject = %subject, schema_id, "schema registered");
        Ok(Self {
            registry,
            subject,
            schema_id,
        })
    }

    pub fn schema_id(&self) -> u32 {
        self.schema_id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn encode<T: Serialize>(&self, payload: &T) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| LedgerError::Encoding(format!("serialize: {e}")))?;

        let mut framed = Vec::with_capacity(HEADER_LEN + body.len());
        framed.push(WIRE_MAGIC);
        framed.extend_from_slice(&self.schema_id.to_be_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    /// Decodes a framed payload, returning the embedded schema id alongside
    /// the body. Payloads whose id the registry cannot resolve are rejected
    /// with `SchemaResolution` rather than decoded best-effort.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<(u32, T)> {
        if bytes.len() < HEADER_LEN {
            return Err(LedgerError::Encoding(format!(
                "payload too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != WIRE_MAGIC {
            return Err(LedgerError::Encoding(format!(
                "bad magic byte: {:#04x}",
                bytes[0]
            )));
        }

        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&bytes[1..HEADER_LEN]);
        let schema_id = u32::from_be_bytes(id_bytes);

        if self.registry.resolve(schema_id)?.is_none() {
            return Err(LedgerError::SchemaResolution(schema_id));
        }

        let payload = serde_json::from_slice(&bytes[HEADER_LEN..])
            .map_err(|e| LedgerError::Encoding(format!("deserialize: {e}")))?;
        Ok((schema_id, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    fn codec() -> SchemaCodec {
        let registry = Arc::new(InMemorySchemaRegistry::new());
        SchemaCodec::for_subject(registry, "ping-value", "{\"type\":\"record\"}").unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = codec();
        let bytes = codec.encode(&Ping { n: 7 }).unwrap();
        assert_eq!(bytes[0], WIRE_MAGIC);

        let (id, back): (u32, Ping) = codec.decode(&bytes).unwrap();
        assert_eq!(id, codec.schema_id());
        assert_eq!(back, Ping { n: 7 });
    }

    #[test]
    fn test_register_is_idempotent_per_subject() {
        let registry = Arc::new(InMemorySchemaRegistry::new());
        let a = registry.register("s", "{}").unwrap();
        let b = registry.register("s", "{}").unwrap();
        assert_eq!(a, b);

        let other = registry.register("t", "{}").unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_conflicting_definition_rejected() {
        let registry = Arc::new(InMemorySchemaRegistry::new());
        registry.register("s", "{\"v\":1}").unwrap();
        assert!(matches!(
            registry.register("s", "{\"v\":2}"),
            Err(LedgerError::Encoding(_))
        ));
    }

    #[test]
    fn test_unknown_schema_id_rejected() {
        let codec = codec();
        let mut bytes = codec.encode(&Ping { n: 1 }).unwrap();
        // Stamp an id the registry has never issued.
        bytes[1..5].copy_from_slice(&999u32.to_be_bytes());

        match codec.decode::<Ping>(&bytes) {
            Err(LedgerError::SchemaResolution(id)) => assert_eq!(id, 999),
            other => panic!("expected SchemaResolution, got {other:?}"),
        }
    }

    #[test]
    fn test_short_and_unframed_payloads_rejected() {
        let codec = codec();
        assert!(matches!(
            codec.decode::<Ping>(&[0x00, 0x01]),
            Err(LedgerError::Encoding(_))
        ));
        assert!(matches!(
            codec.decode::<Ping>(b"{\"n\":1}"),
            Err(LedgerError::Encoding(_))
        ));
    }
}
