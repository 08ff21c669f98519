pub mod config;
pub mod contact;
pub mod core;
pub mod error;
pub mod fleet;
pub mod log;
pub mod orchestration;
pub mod payload;
pub mod state;
pub mod util;

pub use error::{Error, Result};
