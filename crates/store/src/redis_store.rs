use std::ops::Range;
use std::sync::Mutex;

use redis::Commands;

use place_canvas::{chunk_span, Chunk, ChunkCoord};

use crate::keys::{chunk_key, last_placed_key};
use crate::{decode_chunk, decode_timestamp, encode_chunk, ChunkStore, RegionChunks};

/// Plain `GET`/`SET` on the canvas record keys, readable by any other
/// deployment sharing the same Redis database.
///
/// One connection is kept open and shared. A failed command drops it and the
/// next call reconnects.
pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
}

impl RedisStore {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    /// Fails fast at startup instead of on the first placement.
    pub fn ping(&self) -> anyhow::Result<()> {
        self.with_conn(|conn| redis::cmd("PING").query::<String>(conn))?;
        Ok(())
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> anyhow::Result<T> {
        let mut slot = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("redis connection lock poisoned"))?;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.client.get_connection()?,
        };
        let value = op(&mut conn)?;
        *slot = Some(conn);
        Ok(value)
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.with_conn(|conn| conn.get(key))
    }

    fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.with_conn(|conn| conn.set(key, value))
    }
}

impl ChunkStore for RedisStore {
    fn save_chunk(&self, coord: ChunkCoord, chunk: &Chunk) -> anyhow::Result<()> {
        self.set(&chunk_key(coord), encode_chunk(chunk)?)
    }

    fn load_chunk(&self, coord: ChunkCoord) -> anyhow::Result<Option<Chunk>> {
        let key = chunk_key(coord);
        self.get(&key)?
            .map(|raw| decode_chunk(&key, &raw))
            .transpose()
    }

    fn delete_chunk(&self, coord: ChunkCoord) -> anyhow::Result<()> {
        self.with_conn(|conn| conn.del(chunk_key(coord)))
    }

    fn save_last_placed(&self, user_id: &str, timestamp_ms: i64) -> anyhow::Result<()> {
        self.set(&last_placed_key(user_id), timestamp_ms.to_string())
    }

    fn get_last_placed(&self, user_id: &str) -> anyhow::Result<Option<i64>> {
        let key = last_placed_key(user_id);
        self.get(&key)?
            .map(|raw| decode_timestamp(&key, &raw))
            .transpose()
    }

    /// One `MGET` per chunk row.
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
                let keys = row_keys(xs.clone(), cy);
                let raws: Vec<Option<String>> =
                    self.with_conn(|conn| redis::cmd("MGET").arg(&keys).query(conn))?;
                if raws.len() != keys.len() {
                    anyhow::bail!("MGET returned {} values for {} keys", raws.len(), keys.len());
                }
                let row = keys
                    .iter()
                    .zip(raws)
                    .map(|(key, raw)| raw.map(|raw| decode_chunk(key, &raw)).transpose())
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

fn row_keys(xs: Range<i64>, cy: i64) -> Vec<String> {
    xs.map(|cx| chunk_key(ChunkCoord::new(cx, cy))).collect()
}
