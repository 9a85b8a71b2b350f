#![forbid(unsafe_code)]

use msgbus_domain::Message;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::channel_log::ChannelLog;
use crate::server::connection_manager::ConnectionManager;

/// Settings for the publish dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	pub debug_log_messages: bool,

	pub log_upstream_lag: bool,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			debug_log_messages: false,
			log_upstream_lag: true,
		}
	}
}

/// Task that consumes publish notifications and hands them to the connection manager.
///
/// Publishers never touch the registry directly; dispatch always happens on this task.
#[derive(Debug)]
pub struct Dispatcher {
	cfg: DispatcherConfig,
	manager: ConnectionManager,
	publish_rx: broadcast::Receiver<Message>,
}

impl Dispatcher {
	pub fn new(publish_rx: broadcast::Receiver<Message>, manager: ConnectionManager, cfg: DispatcherConfig) -> Self {
		Self {
			cfg,
			manager,
			publish_rx,
		}
	}

	/// Create a dispatcher by subscribing to the log's publish notifications.
	pub fn from_channel_log(log: &dyn ChannelLog, manager: ConnectionManager, cfg: DispatcherConfig) -> Self {
		Self::new(log.subscribe(), manager, cfg)
	}

	/// Run until the log's notification channel is closed.
	pub async fn run(mut self) {
		info!("dispatcher started");

		loop {
			let message = match self.publish_rx.recv().await {
				Ok(msg) => msg,
				Err(broadcast::error::RecvError::Lagged(n)) => {
					if self.cfg.log_upstream_lag {
						warn!(
							lagged = n,
							"dispatcher lagged on publish notifications; held clients pick the messages up on their next poll"
						);
					}
					continue;
				}
				Err(broadcast::error::RecvError::Closed) => {
					info!("dispatcher exiting (publish notifications closed)");
					break;
				}
			};

			let completed = self.manager.notify(&message);

			if self.cfg.debug_log_messages {
				debug!(
					channel = %message.channel,
					message_id = message.message_id,
					completed,
					"dispatched message"
				);
			}
		}
	}
}

/// Spawn a dispatcher task for `log` into `manager`.
pub fn spawn_dispatcher(log: &dyn ChannelLog, manager: ConnectionManager, cfg: DispatcherConfig) -> JoinHandle<()> {
	let dispatcher = Dispatcher::from_channel_log(log, manager, cfg);
	tokio::spawn(dispatcher.run())
}
