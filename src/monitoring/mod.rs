pub mod database;
pub mod engine;
pub mod normalize;
pub mod types;

pub use database::{PropertyStore, StoreError};
pub use engine::{ChangeEngine, EngineConfig};
pub use types::*;
