pub mod app;
pub mod error;
pub mod generation;
pub mod models;
pub mod platform;
pub mod quota;

pub use error::{AdapterError, AdapterResult, Error, ErrorKind, Result};
