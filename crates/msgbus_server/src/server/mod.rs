#![forbid(unsafe_code)]

pub mod auth;
pub mod channel_log;
pub mod connection_manager;
pub mod dispatcher;
pub mod endpoint;
pub mod health;
pub mod session;

#[cfg(test)]
mod connection_manager_tests;

#[cfg(test)]
mod endpoint_tests;
