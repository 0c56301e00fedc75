use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use stowage_base::hashing::HashMap;
use stowage_base::ContentNamespace;

use crate::storage::ContentStoreReader;

/// In-memory [`ContentStoreReader`]. Handy for tests and demos.
///
/// Files can be added while the loader is running. An optional delay is applied to every read to
/// simulate slow storage.
#[derive(Default)]
pub struct RamContentStore {
    files: RwLock<HashMap<(ContentNamespace, String), Vec<u8>>>,
    read_delay: RwLock<Duration>,
    read_counts: RwLock<HashMap<(ContentNamespace, String), usize>>,
    total_reads: AtomicUsize,
}

impl RamContentStore {
    pub fn insert(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
        data: Vec<u8>,
    ) {
        self.files
            .write()
            .insert((namespace.clone(), filename.to_string()), data);
    }

    pub fn remove(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
    ) -> Option<Vec<u8>> {
        self.files
            .write()
            .remove(&(namespace.clone(), filename.to_string()))
    }

    pub fn set_read_delay(
        &self,
        delay: Duration,
    ) {
        *self.read_delay.write() = delay;
    }

    /// Number of times the file was read, including failed reads
    pub fn read_count(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
    ) -> usize {
        self.read_counts
            .read()
            .get(&(namespace.clone(), filename.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.total_reads.load(Ordering::Acquire)
    }
}

impl ContentStoreReader for RamContentStore {
    fn read(
        &self,
        namespace: &ContentNamespace,
        filename: &str,
    ) -> io::Result<Vec<u8>> {
        profiling::scope!("RamContentStore::read");
        let key = (namespace.clone(), filename.to_string());
        *self.read_counts.write().entry(key.clone()).or_insert(0) += 1;
        self.total_reads.fetch_add(1, Ordering::AcqRel);

        let delay = *self.read_delay.read();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        self.files.read().get(&key).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}/{} not found", namespace, filename),
            )
        })
    }
}
