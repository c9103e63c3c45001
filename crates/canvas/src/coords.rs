use serde::{Deserialize, Serialize};

/// Tiles per chunk edge. Fixed because it determines the persisted chunk shape.
pub const CHUNK_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i64,
    pub y: i64,
}

impl ChunkCoord {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// Offset of a tile inside its chunk, each axis in `0..CHUNK_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalCoord {
    pub x: usize,
    pub y: usize,
}

impl LocalCoord {
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

/// Split a global tile coordinate into its chunk and the offset within it.
///
/// Floor division, so `-1` lands in chunk `-1` at offset `CHUNK_SIZE - 1`.
pub fn to_chunk_coordinates(x: i64, y: i64) -> (ChunkCoord, LocalCoord) {
    let size = CHUNK_SIZE as i64;
    let chunk = ChunkCoord::new(x.div_euclid(size), y.div_euclid(size));
    let local = LocalCoord::new(x.rem_euclid(size) as usize, y.rem_euclid(size) as usize);
    (chunk, local)
}

pub fn to_global_coordinates(chunk: ChunkCoord, local: LocalCoord) -> (i64, i64) {
    let size = CHUNK_SIZE as i64;
    (
        chunk.x * size + local.x as i64,
        chunk.y * size + local.y as i64,
    )
}

/// Chunk coordinates covering the half-open tile span `[start, start + len)`.
pub fn chunk_span(start: i64, len: i64) -> std::ops::Range<i64> {
    let size = CHUNK_SIZE as i64;
    if len <= 0 {
        return 0..0;
    }
    start.div_euclid(size)..(start + len - 1).div_euclid(size) + 1
}
