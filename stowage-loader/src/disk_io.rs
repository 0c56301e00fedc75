use std::io;
use std::path::{Component, Path, PathBuf};
use stowage_base::ContentNamespace;

use crate::storage::ContentStoreReader;

/// Reads content files from `<root>/<namespace>/<filename>`
pub struct DiskContentStore {
    root_path: PathBuf,
}

impl DiskContentStore {
    /// Returns None if the root is not a directory
    pub fn open(root_path: impl Into<PathBuf>) -> Option<Self> {
        let root_path = root_path.into();
        if !root_path.is_dir() {
            log::warn!("Content root {:?} is not a directory", root_path);
            return None;
        }

        Some(DiskContentStore { root_path })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    // Filenames must stay inside the namespace directory
    fn content_path(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
    ) -> io::Result<PathBuf> {
        let relative = Path::new(filename);
        let escapes_root = filename.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes_root {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid content filename {:?}", filename),
            ));
        }

        Ok(self.root_path.join(namespace.name()).join(relative))
    }
}

impl ContentStoreReader for DiskContentStore {
    fn read(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
    ) -> io::Result<Vec<u8>> {
        profiling::scope!("DiskContentStore::read");
        let path = self.content_path(namespace, filename)?;
        log::trace!("Start read {:?}", path);
        std::fs::read(path)
    }
}
