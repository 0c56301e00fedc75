use std::fmt;
use std::sync::Arc;

use crate::error::{ContentError, ContentResult};

const MAX_NAMESPACE_LENGTH: usize = 64;

/// Names a logical storage root, for example the content store produced by one build. Cheap to
/// clone and compare. The loader only uses it to resolve filenames.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentNamespace {
    name: Arc<str>,
}

impl ContentNamespace {
    pub fn new(name: &str) -> ContentResult<Self> {
        if name.is_empty() || name.len() > MAX_NAMESPACE_LENGTH {
            return Err(ContentError::ConfigurationError(format!(
                "Content namespace name must be 1 to {} characters long, got {:?}",
                MAX_NAMESPACE_LENGTH, name
            )));
        }

        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(ContentError::ConfigurationError(format!(
                "Content namespace name {:?} contains invalid character {:?}",
                name, c
            )));
        }

        Ok(ContentNamespace { name: name.into() })
    }

    pub fn default_namespace() -> Self {
        ContentNamespace {
            name: "default".into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for ContentNamespace {
    fn default() -> Self {
        Self::default_namespace()
    }
}

impl fmt::Debug for ContentNamespace {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("ContentNamespace").field(&&*self.name).finish()
    }
}

impl fmt::Display for ContentNamespace {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.name)
    }
}
