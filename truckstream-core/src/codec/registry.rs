use indexmap::IndexMap;

use crate::types::StreamTag;

/// Id under which a schema is registered
pub type SchemaId = u32;

/// Resolves the schema ids found in the wire header
pub trait SchemaRegistry: Send + Sync + 'static {
    /// Stream tag described by the schema, `None` if the id is unknown
    fn lookup(&self, id: SchemaId) -> Option<StreamTag>;

    /// Schema used to encode records of the given stream
    fn schema_for(&self, tag: StreamTag) -> Option<SchemaId>;
}

/// A fixed in-memory registry
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaRegistry {
    schemas: IndexMap<SchemaId, StreamTag>,
}

impl StaticSchemaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema id for a stream.
    /// The first id registered for a stream is the one used for encoding.
    pub fn register(mut self, id: SchemaId, tag: StreamTag) -> Self {
        self.schemas.insert(id, tag);
        self
    }
}

impl SchemaRegistry for StaticSchemaRegistry {
    fn lookup(&self, id: SchemaId) -> Option<StreamTag> {
        self.schemas.get(&id).copied()
    }

    fn schema_for(&self, tag: StreamTag) -> Option<SchemaId> {
        self.schemas
            .iter()
            .find(|(_, t)| **t == tag)
            .map(|(id, _)| *id)
    }
}
