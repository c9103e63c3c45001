pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Opaque identity for a connection. Placement cooldowns are keyed by it.
pub fn new_connection_id() -> String {
    format!("c_{}", uuid::Uuid::new_v4().simple())
}
