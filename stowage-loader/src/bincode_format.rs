use stowage_base::{FormatError, ObjectGraph};

use crate::storage::ContentDeserializer;

/// Reads object graphs written by [`serialize_object_graph`]
#[derive(Default)]
pub struct BincodeDeserializer;

impl ContentDeserializer for BincodeDeserializer {
    fn deserialize(
        &self,
        data: &[u8],
    ) -> Result<ObjectGraph, FormatError> {
        profiling::scope!("BincodeDeserializer::deserialize");
        bincode::deserialize::<ObjectGraph>(data)
            .map_err(|e| FormatError::new(format!("Failed to deserialize object graph: {}", e)))
    }
}

/// Produces the bytes [`BincodeDeserializer`] expects. Used by tools and tests that write content.
pub fn serialize_object_graph(graph: &ObjectGraph) -> Result<Vec<u8>, FormatError> {
    bincode::serialize(graph)
        .map_err(|e| FormatError::new(format!("Failed to serialize object graph: {}", e)))
}
