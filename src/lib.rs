pub mod config;
pub mod error;
pub mod keys;
pub mod provider;
pub mod routes;
pub mod storage;

pub use config::EngineSettings;
pub use error::{EngineError, EngineResult, ErrorKind};
pub use keys::KeyEngine;
