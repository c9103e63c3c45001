pub mod envelope;
pub mod messages;

pub use messages::*;
