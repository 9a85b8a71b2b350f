#![forbid(unsafe_code)]

//! Long-polling message bus server: channel log, held-connection registry and HTTP endpoint.

pub mod config;
pub mod server;

pub use server::channel_log::{ChannelLog, ChannelLogConfig, InMemoryChannelLog};
pub use server::connection_manager::{ConnectionManager, ConnectionManagerConfig};
pub use server::dispatcher::{DispatcherConfig, spawn_dispatcher};
pub use server::endpoint::{
	AppRequest, DEFAULT_MAX_BODY_BYTES, EndpointConfig, Fallback, MessageBusService, serve, spawn_server,
};
