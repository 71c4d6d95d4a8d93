extern crate alloc;

pub mod aggregate;
pub mod config;
pub mod database;
pub mod error;
pub mod export;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod pool;
pub mod processor;
pub mod router;
pub mod stage;
pub mod storage;
pub mod summary;

pub use error::{Error, Result};
