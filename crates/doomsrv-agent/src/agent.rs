use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex;

use doomsrv_proto::{Message, ServerConfiguration};

use crate::config::AgentConfig;
use crate::connection::{Connection, ConnectionListener, format_error_chain};
use crate::scheduler::{self, ConsoleOutputScheduler};
use crate::supervisor::{ServerSupervisor, SupervisorError};

/// Routes inbound controller messages to the supervisor and maps results
/// back to reply messages. One agent supervises at most one server.
pub struct Agent {
    executable: PathBuf,
    work_dir: PathBuf,
    connection: OnceLock<Connection>,
    supervisor: Mutex<Option<Arc<ServerSupervisor>>>,
}

impl Agent {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            work_dir: config.work_dir.clone(),
            connection: OnceLock::new(),
            supervisor: Mutex::new(None),
        }
    }

    /// Wires the controller connection after `Connection::connect`, which
    /// needs the agent as its listener first. Must be called before the
    /// first RunServer arrives; the console scheduler sends through it.
    pub fn attach_connection(&self, connection: Connection) {
        if self.connection.set(connection).is_err() {
            tracing::warn!("connection already attached");
        }
    }

    async fn run_server(&self, configuration: ServerConfiguration) -> Message {
        let mut slot = self.supervisor.lock().await;
        if slot.is_some() {
            return Message::ServerStarted {
                error: Some("a server is already running".to_string()),
            };
        }

        let (console_tx, console_rx) = scheduler::console_queue();
        match ServerSupervisor::run(&self.executable, &self.work_dir, &configuration, console_tx)
            .await
        {
            Ok(supervisor) => {
                match self.connection.get() {
                    Some(connection) => {
                        ConsoleOutputScheduler::spawn(console_rx, connection.clone());
                    }
                    None => tracing::warn!("no connection attached; console output is not forwarded"),
                }
                *slot = Some(Arc::new(supervisor));
                Message::ServerStarted { error: None }
            }
            Err(error) => {
                tracing::error!(%error, "server launch failed");
                let error = anyhow::Error::from(error);
                Message::ServerStarted {
                    error: Some(format_error_chain(&error)),
                }
            }
        }
    }

    async fn console_command(&self, command: Vec<String>) -> Result<Message, SupervisorError> {
        let supervisor = self
            .supervisor
            .lock()
            .await
            .clone()
            .ok_or(SupervisorError::NoServer)?;
        let lines = supervisor.execute_console(&command).await?;
        Ok(Message::ConsoleResult { lines })
    }

    /// Stops the supervised server, if any. Called on agent shutdown.
    pub async fn shutdown(&self) {
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor.stop().await;
        }
    }
}

impl ConnectionListener for Agent {
    async fn on_message(&self, message: Message) -> anyhow::Result<Option<Message>> {
        match message {
            Message::RunServer { configuration } => {
                Ok(Some(self.run_server(configuration).await))
            }
            Message::ConsoleCommand { command } => Ok(Some(self.console_command(command).await?)),
            other => {
                tracing::debug!(msg = ?other, "ignoring message not addressed to the agent");
                Ok(None)
            }
        }
    }
}
