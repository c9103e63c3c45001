use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use place_canvas::{Chunk, ChunkCoord};

use crate::keys::{chunk_key, last_placed_key};
use crate::{decode_chunk, decode_timestamp, encode_chunk, ChunkStore};

/// Process-local store. Contents die with the process.
///
/// Counts writes (deletes included) per key and can be switched to fail every call, which makes
/// it the backend of choice for exercising the canvas manager.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<String, String>>>,
    writes: Arc<Mutex<HashMap<String, usize>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation returns an error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn chunk_writes(&self, coord: ChunkCoord) -> usize {
        self.write_count(&chunk_key(coord))
    }

    pub fn last_placed_writes(&self, user_id: &str) -> usize {
        self.write_count(&last_placed_key(user_id))
    }

    pub fn total_writes(&self) -> usize {
        lock(&self.writes)
            .map(|w| w.values().sum::<usize>())
            .unwrap_or(0)
    }

    fn write_count(&self, key: &str) -> usize {
        lock(&self.writes)
            .map(|w| w.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.check_available()?;
        Ok(lock(&self.records)?.get(key).cloned())
    }

    fn set(&self, key: String, value: String) -> anyhow::Result<()> {
        self.check_available()?;
        *lock(&self.writes)?.entry(key.clone()).or_insert(0) += 1;
        lock(&self.records)?.insert(key, value);
        Ok(())
    }

    fn remove(&self, key: String) -> anyhow::Result<()> {
        self.check_available()?;
        lock(&self.records)?.remove(&key);
        *lock(&self.writes)?.entry(key).or_insert(0) += 1;
        Ok(())
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("memory store marked unavailable");
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> anyhow::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
}

impl ChunkStore for MemoryStore {
    fn save_chunk(&self, coord: ChunkCoord, chunk: &Chunk) -> anyhow::Result<()> {
        self.set(chunk_key(coord), encode_chunk(chunk)?)
    }

    fn load_chunk(&self, coord: ChunkCoord) -> anyhow::Result<Option<Chunk>> {
        let key = chunk_key(coord);
        self.get(&key)?
            .map(|raw| decode_chunk(&key, &raw))
            .transpose()
    }

    fn delete_chunk(&self, coord: ChunkCoord) -> anyhow::Result<()> {
        self.remove(chunk_key(coord))
    }

    fn save_last_placed(&self, user_id: &str, timestamp_ms: i64) -> anyhow::Result<()> {
        self.set(last_placed_key(user_id), timestamp_ms.to_string())
    }

    fn get_last_placed(&self, user_id: &str) -> anyhow::Result<Option<i64>> {
        let key = last_placed_key(user_id);
        self.get(&key)?
            .map(|raw| decode_timestamp(&key, &raw))
            .transpose()
    }
}
