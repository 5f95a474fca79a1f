use std::sync::Arc;

use crate::connection::{Connection, ConnectionState};

mod agent;
mod config;
mod connection;
mod scheduler;
mod supervisor;
mod waiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config::AgentConfig::from_env()?;
    tracing::info!(
        url = %config.control_url,
        executable = %config.executable.display(),
        work_dir = %config.work_dir.display(),
        "doomsrv-agent starting"
    );

    let agent = Arc::new(agent::Agent::new(&config));
    let connection = Connection::connect(
        agent.clone(),
        config.control_url.clone(),
        config.credential.clone(),
    );
    agent.attach_connection(connection.clone());

    let mut states = connection.state_watch();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted by signal");
        }
        _ = states.wait_for(|s| *s == ConnectionState::Disconnected) => {
            tracing::info!("connection reached its terminal state");
        }
    }

    connection.shutdown().await;
    agent.shutdown().await;
    Ok(())
}
