use serde::{Deserialize, Serialize};

use crate::coords::{LocalCoord, CHUNK_SIZE};

/// A `CHUNK_SIZE` x `CHUNK_SIZE` block of tile colors, stored row-major as
/// `tiles[local_y][local_x]`.
///
/// Serializes as a bare array of rows, the shape chunk records are persisted in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<String>>", into = "Vec<Vec<String>>")]
pub struct Chunk {
    tiles: Vec<Vec<String>>,
}

impl Chunk {
    /// A chunk with every tile set to `color`.
    pub fn filled(color: &str) -> Self {
        Self {
            tiles: vec![vec![color.to_string(); CHUNK_SIZE]; CHUNK_SIZE],
        }
    }

    pub fn get(&self, local: LocalCoord) -> &str {
        &self.tiles[local.y][local.x]
    }

    pub fn set(&mut self, local: LocalCoord, color: &str) {
        self.tiles[local.y][local.x] = color.to_string();
    }

    pub fn rows(&self) -> impl Iterator<Item = &[String]> {
        self.tiles.iter().map(Vec::as_slice)
    }

    /// True when every tile holds `color`.
    pub fn is_uniform(&self, color: &str) -> bool {
        self.tiles.iter().flatten().all(|tile| tile == color)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("chunk must be {size}x{size}, found {rows} rows with widths {widths:?}", size = CHUNK_SIZE)]
pub struct ChunkShapeError {
    rows: usize,
    widths: Vec<usize>,
}

impl TryFrom<Vec<Vec<String>>> for Chunk {
    type Error = ChunkShapeError;

    fn try_from(tiles: Vec<Vec<String>>) -> Result<Self, Self::Error> {
        if tiles.len() != CHUNK_SIZE || tiles.iter().any(|row| row.len() != CHUNK_SIZE) {
            return Err(ChunkShapeError {
                rows: tiles.len(),
                widths: tiles.iter().map(Vec::len).collect(),
            });
        }
        Ok(Self { tiles })
    }
}

impl From<Chunk> for Vec<Vec<String>> {
    fn from(chunk: Chunk) -> Self {
        chunk.tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_chunk_is_uniform() {
        let chunk = Chunk::filled("#FFFFFF");
        assert_eq!(chunk.rows().count(), CHUNK_SIZE);
        assert!(chunk.rows().all(|row| row.len() == CHUNK_SIZE));
        assert!(chunk.is_uniform("#FFFFFF"));
    }

    #[test]
    fn set_addresses_row_then_column() {
        let mut chunk = Chunk::filled("#FFFFFF");
        chunk.set(LocalCoord::new(3, 7), "#123456");
        assert_eq!(chunk.get(LocalCoord::new(3, 7)), "#123456");
        assert_eq!(chunk.get(LocalCoord::new(7, 3)), "#FFFFFF");
        let row: Vec<Vec<String>> = chunk.into();
        assert_eq!(row[7][3], "#123456");
    }

    #[test]
    fn serializes_as_nested_arrays() {
        let chunk = Chunk::filled("#000000");
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.starts_with("[[\"#000000\""));
        let back: Chunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn rejects_wrong_shape() {
        let err = serde_json::from_str::<Chunk>("[[\"#000000\"]]").unwrap_err();
        assert!(err.to_string().contains("chunk must be 16x16"));
    }
}
