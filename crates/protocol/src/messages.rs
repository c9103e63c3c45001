use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub id: String,
    pub ts: i64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHello {
    pub server_version: String,
    pub client_id: String,
    pub canvas: CanvasInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasInfo {
    pub width: i64,
    pub height: i64,
    pub chunk_size: usize,
    pub tile_size: u32,
    pub default_color: String,
    pub cooldown_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPlaceTile {
    pub x: i64,
    pub y: i64,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequestRegion {
    pub start_x: i64,
    pub start_y: i64,
    pub width: i64,
    pub height: i64,
}

/// A committed placement. Sent to the placer and broadcast as `server.tile_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TilePlacement {
    pub x: i64,
    pub y: i64,
    pub color: String,
    pub chunk_x: i64,
    pub chunk_y: i64,
    pub local_x: usize,
    pub local_y: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPlaceResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<TilePlacement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRegionUpdate {
    pub start_x: i64,
    pub start_y: i64,
    /// Row-major, `data[dy][dx]`; `None` outside the canvas.
    pub data: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNotice {
    pub text: String,
}
