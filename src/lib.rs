pub mod config;
pub mod db;
pub mod downloader;
pub mod engine;
pub mod enumerate;
mod error;
pub mod extract;
pub mod fetch;
pub mod gallery;
pub mod joblog;
pub mod jobs;
pub mod memory_store;
pub mod paths;
pub mod repair;
pub mod resolver;
pub mod store;

pub use engine::Engine;
pub use error::{EngineError, Result};
