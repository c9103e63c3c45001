use place_canvas::ChunkCoord;

pub fn chunk_key(coord: ChunkCoord) -> String {
    format!("canvas:chunk:{}:{}", coord.x, coord.y)
}

pub fn last_placed_key(user_id: &str) -> String {
    format!("canvas:lastplaced:{user_id}")
}
