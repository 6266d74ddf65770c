pub mod config;
pub mod serve;
pub mod sign;
pub mod validate;
