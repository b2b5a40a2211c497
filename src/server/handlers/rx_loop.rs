//! RX event loop.

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::server::{Command, Server, ServerError};

impl Server {
    /// Run the receive event loop.
    ///
    /// Multiplexes three sources:
    /// - packet batches from the UDP receive tasks
    /// - commands from [`ServerHandle`](crate::server::ServerHandle)s
    /// - the maintenance tick (session timers, introducers, peer tests)
    ///
    /// Takes ownership of the batch channel and runs until every socket's
    /// receive task has gone away.
    pub async fn run_rx_loop(&mut self) -> Result<(), ServerError> {
        let mut batch_rx = self.batch_rx.take().ok_or(ServerError::NotStarted)?;
        let mut command_rx = self.command_rx.take().ok_or(ServerError::NotStarted)?;

        let mut tick = tokio::time::interval(self.router_config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("RX event loop started");

        loop {
            tokio::select! {
                batch = batch_rx.recv() => {
                    match batch {
                        Some(batch) => self.process_batch(batch).await,
                        None => break,
                    }
                }
                Some(command) = command_rx.recv() => {
                    self.handle_command(command).await;
                }
                _ = tick.tick() => {
                    self.on_tick(tokio::time::Instant::now().into_std()).await;
                }
            }
        }

        self.command_rx = Some(command_rx);
        info!("RX event loop stopped");
        Ok(())
    }

    pub(in crate::server) async fn handle_command(&mut self, command: Command) {
        let result = match command {
            Command::Send { target, messages } => self.send(&target, messages).await,
            Command::SendTo { ident, messages } => self.send_to(&ident, messages).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "Outbound send failed");
        }
    }
}
