pub mod config;
pub mod error;
pub mod network;
pub mod service;
pub mod utils;

pub use error::{QuickshareError, Result};
