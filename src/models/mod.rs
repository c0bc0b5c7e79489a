pub mod config;
pub mod subtitle;
