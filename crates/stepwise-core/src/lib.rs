pub mod config;
pub mod error;
pub mod orchestration;
pub mod provider;
pub mod session;
pub mod store;
pub mod types;
pub mod webhook;

pub use error::{Result, StepwiseError};
