pub mod config;
pub mod error;
pub mod ids;
pub mod types;

pub use error::{FactoryError, Result};
pub use ids::*;
