use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::{engine::general_purpose, Engine as _};
use place_canvas::{Chunk, ChunkCoord};

use crate::keys::{chunk_key, last_placed_key};
use crate::{decode_chunk, decode_timestamp, encode_chunk, ChunkStore};

/// One file per record under `base`. File names are the URL-safe base64 of the
/// record key, so opaque user ids cannot reach outside the directory.
pub struct FileStore {
    base: PathBuf,
    tmp_seq: AtomicU64,
}

impl FileStore {
    pub fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = base.as_ref().to_path_buf();
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }
        Ok(Self {
            base: path,
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.base
            .join(general_purpose::URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }

    fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        match fs::read_to_string(self.record_path(key)) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow::anyhow!("read {key}: {err}")),
        }
    }

    // Write-then-rename: readers see the old record or the new one, never a torn
    // file. Both the data and the rename are synced before returning.
    fn write(&self, key: &str, content: &str) -> anyhow::Result<()> {
        let path = self.record_path(key);
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self.base.join(format!(".tmp-{}-{seq}", std::process::id()));
        let result = write_synced(&tmp, content)
            .and_then(|()| fs::rename(&tmp, &path))
            .and_then(|()| sync_dir(&self.base));
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(anyhow::anyhow!("write {key}: {err}"));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => sync_dir(&self.base).map_err(|err| anyhow::anyhow!("remove {key}: {err}")),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(anyhow::anyhow!("remove {key}: {err}")),
        }
    }
}

fn write_synced(path: &Path, content: &str) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

// Directory handles cannot be synced here; the rename is as durable as the platform makes it.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

impl ChunkStore for FileStore {
    fn save_chunk(&self, coord: ChunkCoord, chunk: &Chunk) -> anyhow::Result<()> {
        self.write(&chunk_key(coord), &encode_chunk(chunk)?)
    }

    fn load_chunk(&self, coord: ChunkCoord) -> anyhow::Result<Option<Chunk>> {
        let key = chunk_key(coord);
        self.read(&key)?
            .map(|raw| decode_chunk(&key, &raw))
            .transpose()
    }

    fn delete_chunk(&self, coord: ChunkCoord) -> anyhow::Result<()> {
        self.remove(&chunk_key(coord))
    }

    fn save_last_placed(&self, user_id: &str, timestamp_ms: i64) -> anyhow::Result<()> {
        self.write(&last_placed_key(user_id), &timestamp_ms.to_string())
    }

    fn get_last_placed(&self, user_id: &str) -> anyhow::Result<Option<i64>> {
        let key = last_placed_key(user_id);
        self.read(&key)?
            .map(|raw| decode_timestamp(&key, &raw))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use place_canvas::LocalCoord;
    use tempfile::TempDir;

    #[test]
    fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let coord = ChunkCoord::new(4, 9);
        let mut chunk = Chunk::filled("#FFFFFF");
        chunk.set(LocalCoord::new(2, 3), "#ABCDEF");
        {
            let store = FileStore::new(dir.path()).unwrap();
            store.save_chunk(coord, &chunk).unwrap();
            store.save_last_placed("user-1", 1_700_000_000_000).unwrap();
        }
        let store = FileStore::new(dir.path()).unwrap();
        assert_eq!(store.load_chunk(coord).unwrap(), Some(chunk));
        assert_eq!(
            store.get_last_placed("user-1").unwrap(),
            Some(1_700_000_000_000)
        );
        assert!(store.load_chunk(ChunkCoord::new(0, 0)).unwrap().is_none());
    }

    #[test]
    fn hostile_user_ids_stay_inside_base() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("data")).unwrap();
        store.save_last_placed("../../etc/passwd", 5).unwrap();
        assert_eq!(store.get_last_placed("../../etc/passwd").unwrap(), Some(5));
        let entries = fs::read_dir(store.base_path()).unwrap().count();
        assert_eq!(entries, 1);
        assert!(!dir.path().join("etc").exists());
    }

    #[test]
    fn stores_timestamps_as_text() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.save_last_placed("u", 42).unwrap();
        let raw = fs::read_to_string(store.record_path(&last_placed_key("u"))).unwrap();
        assert_eq!(raw, "42");
    }

    #[test]
    fn corrupt_chunk_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let coord = ChunkCoord::new(0, 0);
        fs::write(store.record_path(&chunk_key(coord)), "{not json").unwrap();
        assert!(store.load_chunk(coord).is_err());
    }

    #[test]
    fn overwrites_leave_only_the_record() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let coord = ChunkCoord::new(1, 1);
        for color in ["#000000", "#111111", "#222222"] {
            store.save_chunk(coord, &Chunk::filled(color)).unwrap();
        }
        let names: Vec<_> = fs::read_dir(store.base_path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].to_string_lossy().starts_with(".tmp-"));
        assert_eq!(store.load_chunk(coord).unwrap(), Some(Chunk::filled("#222222")));
    }

    #[test]
    fn delete_removes_the_record_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let coord = ChunkCoord::new(2, 5);
        store.save_chunk(coord, &Chunk::filled("#FFFFFF")).unwrap();
        store.delete_chunk(coord).unwrap();
        store.delete_chunk(coord).unwrap();
        assert!(store.load_chunk(coord).unwrap().is_none());
        assert_eq!(fs::read_dir(store.base_path()).unwrap().count(), 0);
    }
}
