use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;

pub const TILE_SIZE: u32 = 16;
pub const CANVAS_WIDTH: i64 = 1000;
pub const CANVAS_HEIGHT: i64 = 1000;
pub const DEFAULT_COLOR: &str = "#FFFFFF";
pub const COOLDOWN_MS: i64 = 1000;
pub const MAX_REGION_TILES: u64 = 1_000_000;

/// Canvas extent and placement rules, fixed for the lifetime of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    pub width: i64,
    pub height: i64,
    pub default_color: String,
    pub cooldown_ms: i64,
    /// Pixel size of a tile on screen; only forwarded to clients.
    pub tile_size: u32,
    pub max_region_tiles: u64,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: CANVAS_WIDTH,
            height: CANVAS_HEIGHT,
            default_color: DEFAULT_COLOR.to_string(),
            cooldown_ms: COOLDOWN_MS,
            tile_size: TILE_SIZE,
            max_region_tiles: MAX_REGION_TILES,
        }
    }
}

impl CanvasConfig {
    pub fn is_within_bounds(&self, x: i64, y: i64) -> bool {
        x >= 0 && x < self.width && y >= 0 && y < self.height
    }

    pub fn create_empty_chunk(&self) -> Chunk {
        Chunk::filled(&self.default_color)
    }
}

/// `#` followed by exactly six hex digits.
pub fn is_valid_color(color: &str) -> bool {
    match color.strip_prefix('#') {
        Some(hex) => hex.len() == 6 && hex.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}
