/// Why a canvas operation was declined or failed. No variant leaves partial state behind.
#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("coordinates ({x}, {y}) out of bounds")]
    OutOfBounds { x: i64, y: i64 },
    #[error("cooldown active, retry in {retry_after_ms} ms")]
    CooldownActive { retry_after_ms: i64 },
    #[error("invalid color {0:?}")]
    InvalidColor(String),
    #[error("region of {tiles} tiles exceeds limit of {max}")]
    RegionTooLarge { tiles: u64, max: u64 },
    #[error("region at ({x}, {y}) extends past the coordinate range")]
    InvalidRegion { x: i64, y: i64 },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),
}

impl CanvasError {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            CanvasError::OutOfBounds { .. } => "out_of_bounds",
            CanvasError::CooldownActive { .. } => "cooldown_active",
            CanvasError::InvalidColor(_) => "invalid_color",
            CanvasError::RegionTooLarge { .. } => "region_too_large",
            CanvasError::InvalidRegion { .. } => "invalid_region",
            CanvasError::StoreUnavailable(_) => "internal_error",
        }
    }

    /// Text shown to the requesting client. Store details stay in the logs.
    pub fn client_message(&self) -> &'static str {
        match self {
            CanvasError::OutOfBounds { .. } => "Coordinates out of bounds",
            CanvasError::CooldownActive { .. } => "Cooldown not expired",
            CanvasError::InvalidColor(_) => "Invalid color",
            CanvasError::RegionTooLarge { .. } => "Region too large",
            CanvasError::InvalidRegion { .. } => "Invalid region",
            CanvasError::StoreUnavailable(_) => "Internal server error",
        }
    }

    pub fn retry_after_ms(&self) -> Option<i64> {
        match self {
            CanvasError::CooldownActive { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}
