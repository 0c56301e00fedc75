use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FormatError;
use crate::hashing::HashMap;

/// Identifies an object within a single content file
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct LocalId(pub u64);

/// Identifies the type of an object. The scene host uses this to decide what to instantiate.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Default, Serialize, Deserialize)]
pub struct ObjectTypeId(pub Uuid);

impl ObjectTypeId {
    pub const fn null() -> Self {
        ObjectTypeId(Uuid::nil())
    }

    pub fn parse_str(input: &str) -> Result<Self, uuid::Error> {
        Ok(ObjectTypeId(Uuid::parse_str(input)?))
    }

    pub fn from_u128(u: u128) -> Self {
        ObjectTypeId(Uuid::from_u128(u))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for ObjectTypeId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("ObjectTypeId").field(&self.0).finish()
    }
}

/// A reference from one object to another
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub enum ObjectRef {
    // An object in the same file
    Local(LocalId),
    // An object in one of the files this file was loaded with as dependencies. `dependency` indexes
    // into the dependency list passed to the load call.
    External { dependency: u32, local_id: LocalId },
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ContentObject {
    pub local_id: LocalId,
    pub type_id: ObjectTypeId,
    pub name: String,
    pub payload: Vec<u8>,
    pub references: Vec<ObjectRef>,
}

/// Handle to a scene living in the host's scene graph
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct SceneHandle(pub u64);

// Serialized form of an ObjectGraph, the lookup table is rebuilt on load
#[derive(Serialize, Deserialize)]
struct ObjectGraphData {
    objects: Vec<Arc<ContentObject>>,
}

/// The full set of objects deserialized from one content file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "ObjectGraphData", into = "ObjectGraphData")]
pub struct ObjectGraph {
    objects: Vec<Arc<ContentObject>>,
    lookup: HashMap<LocalId, usize>,
}

impl ObjectGraph {
    pub fn new(objects: Vec<ContentObject>) -> Result<Self, FormatError> {
        Self::from_shared(objects.into_iter().map(Arc::new).collect())
    }

    fn from_shared(objects: Vec<Arc<ContentObject>>) -> Result<Self, FormatError> {
        let mut lookup = HashMap::default();
        for (index, object) in objects.iter().enumerate() {
            let old = lookup.insert(object.local_id, index);
            if old.is_some() {
                return Err(FormatError::new(format!(
                    "Duplicate local id {:?} in object graph",
                    object.local_id
                )));
            }
        }

        Ok(ObjectGraph { objects, lookup })
    }

    pub fn objects(&self) -> &[Arc<ContentObject>] {
        &self.objects
    }

    pub fn get(
        &self,
        local_id: LocalId,
    ) -> Option<&Arc<ContentObject>> {
        self.lookup.get(&local_id).map(|&index| &self.objects[index])
    }

    pub fn contains(
        &self,
        local_id: LocalId,
    ) -> bool {
        self.lookup.contains_key(&local_id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl TryFrom<ObjectGraphData> for ObjectGraph {
    type Error = FormatError;

    fn try_from(data: ObjectGraphData) -> Result<Self, Self::Error> {
        ObjectGraph::from_shared(data.objects)
    }
}

impl From<ObjectGraph> for ObjectGraphData {
    fn from(graph: ObjectGraph) -> Self {
        ObjectGraphData {
            objects: graph.objects,
        }
    }
}
