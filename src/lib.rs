pub mod admin;
pub mod command;
pub mod config;
pub mod credentials;
pub mod fleet;
pub mod mqtt;
pub mod persistence;
