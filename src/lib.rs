pub mod client;
pub mod monitoring;
pub mod recorder;
pub mod storage;
pub mod types;
pub mod utils;

pub use crate::types::*;
