pub mod chunk;
pub mod config;
pub mod coords;
pub mod error;

pub use chunk::*;
pub use config::*;
pub use coords::*;
pub use error::*;
