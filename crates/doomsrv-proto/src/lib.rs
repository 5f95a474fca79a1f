use std::collections::BTreeMap;

/// Configuration for one server launch: extra command-line arguments plus the
/// config files to materialize under the work dir before spawning.
///
/// Paths in `configs` are relative to the agent's work dir. The agent rejects
/// absolute or escaping paths before touching the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfiguration {
    pub command_line: Vec<String>,
    pub configs: BTreeMap<String, Vec<String>>,
}

/// Messages exchanged between the agent and the controller over the
/// persistent connection. JSON text frames tagged by `type`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// First frame after the transport opens; carries the agent key.
    Hello { token: String },
    /// Controller's verdict on the Hello token.
    Authenticated { successful: bool },
    /// Launch the configured server binary.
    RunServer { configuration: ServerConfiguration },
    /// Reply to RunServer; `error` is set when the launch failed.
    ServerStarted { error: Option<String> },
    /// Run a console command batch against the running server.
    ConsoleCommand { command: Vec<String> },
    /// Reply to ConsoleCommand with the captured output lines.
    ConsoleResult { lines: Vec<String> },
    /// Unsolicited periodic batch of captured server console output.
    ConsoleBuffer { lines: Vec<String> },
    /// Reported when handling an inbound message failed.
    Error { message: String },
}
