pub mod file;
pub mod keys;
pub mod memory;
pub mod redis_store;

use place_canvas::{chunk_span, Chunk, ChunkCoord};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Persistent home of chunks and per-user placement timestamps.
///
/// Implementations block; async callers should run them on a blocking pool.
/// Saves are idempotent upserts. Absent records are `Ok(None)`; malformed
/// records are errors.
pub trait ChunkStore: Send + Sync {
    fn save_chunk(&self, coord: ChunkCoord, chunk: &Chunk) -> anyhow::Result<()>;
    fn load_chunk(&self, coord: ChunkCoord) -> anyhow::Result<Option<Chunk>>;
    /// Remove the chunk record. Deleting an absent record succeeds.
    fn delete_chunk(&self, coord: ChunkCoord) -> anyhow::Result<()>;
    fn save_last_placed(&self, user_id: &str, timestamp_ms: i64) -> anyhow::Result<()>;
    fn get_last_placed(&self, user_id: &str) -> anyhow::Result<Option<i64>>;

    /// Every chunk intersecting the tile rectangle, loaded once each.
    fn get_region(
        &self,
        start_x: i64,
        start_y: i64,
        width: i64,
        height: i64,
    ) -> anyhow::Result<RegionChunks> {
        let xs = chunk_span(start_x, width);
        let ys = chunk_span(start_y, height);
        let mut rows = Vec::new();
        if !xs.is_empty() {
            for cy in ys.clone() {
                let row = xs
                    .clone()
                    .map(|cx| self.load_chunk(ChunkCoord::new(cx, cy)))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                rows.push(row);
            }
        }
        Ok(RegionChunks {
            origin: ChunkCoord::new(xs.start, ys.start),
            rows,
        })
    }
}

/// Chunk-granular view of a region: `rows[dy][dx]` is the chunk at
/// `origin + (dx, dy)`, or `None` if it was never persisted.
#[derive(Debug, Clone, Default)]
pub struct RegionChunks {
    pub origin: ChunkCoord,
    pub rows: Vec<Vec<Option<Chunk>>>,
}

impl RegionChunks {
    pub fn into_present(self) -> Vec<(ChunkCoord, Chunk)> {
        let origin = self.origin;
        self.rows
            .into_iter()
            .enumerate()
            .flat_map(|(dy, row)| {
                row.into_iter().enumerate().filter_map(move |(dx, chunk)| {
                    chunk.map(|chunk| {
                        (
                            ChunkCoord::new(origin.x + dx as i64, origin.y + dy as i64),
                            chunk,
                        )
                    })
                })
            })
            .collect()
    }
}

pub(crate) fn encode_chunk(chunk: &Chunk) -> anyhow::Result<String> {
    Ok(serde_json::to_string(chunk)?)
}

pub(crate) fn decode_chunk(key: &str, raw: &str) -> anyhow::Result<Chunk> {
    serde_json::from_str(raw).map_err(|err| anyhow::anyhow!("corrupt record {key}: {err}"))
}

pub(crate) fn decode_timestamp(key: &str, raw: &str) -> anyhow::Result<i64> {
    raw.trim()
        .parse()
        .map_err(|err| anyhow::anyhow!("corrupt record {key}: {err}"))
}
