use std::{fmt, io, sync::Arc, time::Duration};

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite, tungstenite::Message as WsMessage,
};

use doomsrv_proto::Message;

/// Fixed delay before re-attempting the transport connect after a
/// disconnect.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Opaque authentication token presented in the Hello frame.
#[derive(Clone)]
pub struct Credential {
    token: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Authenticating,
    Listening,
    Reconnecting,
    Disconnected,
}

/// Handles one decoded inbound message and optionally produces a reply.
/// Invoked synchronously on the connection's receive task, one message at a
/// time; a returned error becomes an Error reply, never a crashed loop.
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_message(
        &self,
        message: Message,
    ) -> impl Future<Output = anyhow::Result<Option<Message>>> + Send;
}

/// Handle to the controller connection. Cloneable; `send` writes over the
/// currently open transport, while the connect/reconnect loop runs on its
/// own task and never blocks senders.
#[derive(Clone)]
pub struct Connection {
    sink: Arc<Mutex<Option<WsSink>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

enum SessionEnd {
    TransportClosed,
    AuthRejected,
    Shutdown,
}

impl Connection {
    /// Starts the connect/reconnect loop in the background and returns the
    /// send handle immediately.
    pub fn connect<L: ConnectionListener>(
        listener: Arc<L>,
        url: impl Into<String>,
        credential: Credential,
    ) -> Connection {
        Self::connect_with_backoff(listener, url, credential, RECONNECT_BACKOFF)
    }

    pub(crate) fn connect_with_backoff<L: ConnectionListener>(
        listener: Arc<L>,
        url: impl Into<String>,
        credential: Credential,
        backoff: Duration,
    ) -> Connection {
        let (state_tx, state_rx) = watch::channel(ConnectionState::NotConnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connection = Connection {
            sink: Arc::new(Mutex::new(None)),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
        };

        tokio::spawn(run_loop(
            connection.clone(),
            listener,
            url.into(),
            credential,
            backoff,
            shutdown_rx,
        ));
        connection
    }

    /// Serializes and writes a message over the open transport. Fails with
    /// `NotConnected` when no transport is currently open.
    pub async fn send(&self, message: &Message) -> io::Result<()> {
        let text = serde_json::to_string(message).map_err(io::Error::other)?;
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport is not open",
            ));
        };
        sink.send(WsMessage::Text(text.into()))
            .await
            .map_err(ws_error_to_io)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch handle for state transitions; used by main to wait for terminal
    /// disconnect and by tests to observe the machine.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Intentional close: drives the state machine to Disconnected without a
    /// reconnect attempt.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::debug!(?state, "connection state");
        let _ = self.state_tx.send(state);
    }
}

async fn run_loop<L: ConnectionListener>(
    connection: Connection,
    listener: Arc<L>,
    url: String,
    credential: Credential,
    backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                tracing::info!(%url, "connected to controller");
                connection.set_state(ConnectionState::Authenticating);
                let (sink, stream) = ws.split();
                *connection.sink.lock().await = Some(sink);

                let hello = Message::Hello {
                    token: credential.token().to_string(),
                };
                let end = match connection.send(&hello).await {
                    Ok(()) => {
                        run_session(&connection, listener.as_ref(), stream, &mut shutdown).await
                    }
                    Err(error) => {
                        tracing::warn!(%error, "failed to send hello");
                        SessionEnd::TransportClosed
                    }
                };

                if let Some(mut sink) = connection.sink.lock().await.take() {
                    let _ = sink.close().await;
                }

                match end {
                    SessionEnd::AuthRejected => {
                        tracing::error!("authentication rejected by controller");
                        connection.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Shutdown => break,
                    SessionEnd::TransportClosed => {
                        tracing::info!("disconnected from controller");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%error, "controller connect failed");
            }
        }

        if *shutdown.borrow() {
            break;
        }
        connection.set_state(ConnectionState::Reconnecting);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
    }

    connection.set_state(ConnectionState::Disconnected);
    tracing::info!("connection closed");
}

/// Receives and dispatches frames until the transport closes, the controller
/// rejects authentication or a shutdown is requested. Dispatch is strictly
/// serial: a slow listener delays the next inbound frame.
async fn run_session<L: ConnectionListener>(
    connection: &Connection,
    listener: &L,
    mut stream: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = shutdown.changed() => return SessionEnd::Shutdown,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                tracing::warn!(%error, "transport error");
                return SessionEnd::TransportClosed;
            }
            None => return SessionEnd::TransportClosed,
        };

        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => return SessionEnd::TransportClosed,
            _ => continue,
        };
        let message = match serde_json::from_str::<Message>(&text) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, frame = %text.as_str(), "undecodable frame");
                continue;
            }
        };

        match connection.state() {
            ConnectionState::Authenticating => match message {
                Message::Authenticated { successful: true } => {
                    tracing::info!("authenticated");
                    connection.set_state(ConnectionState::Listening);
                }
                Message::Authenticated { successful: false } => {
                    return SessionEnd::AuthRejected;
                }
                unexpected => {
                    tracing::warn!(msg = ?unexpected, "unexpected message while authenticating");
                }
            },
            ConnectionState::Listening => {
                let reply = match listener.on_message(message).await {
                    Ok(reply) => reply,
                    Err(error) => Some(Message::Error {
                        message: format_error_chain(&error),
                    }),
                };
                if let Some(reply) = reply
                    && let Err(error) = connection.send(&reply).await
                {
                    tracing::warn!(%error, "failed to send reply");
                }
            }
            state => {
                tracing::warn!(?state, "message received in unexpected state");
            }
        }
    }
}

fn ws_error_to_io(error: tungstenite::Error) -> io::Error {
    match error {
        tungstenite::Error::Io(io) => io,
        other => io::Error::other(other),
    }
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    struct NoReply;

    impl ConnectionListener for NoReply {
        async fn on_message(&self, _message: Message) -> anyhow::Result<Option<Message>> {
            Ok(None)
        }
    }

    struct Scripted;

    impl ConnectionListener for Scripted {
        async fn on_message(&self, message: Message) -> anyhow::Result<Option<Message>> {
            match message {
                Message::RunServer { .. } => Ok(Some(Message::ServerStarted { error: None })),
                Message::ConsoleCommand { .. } => Err(anyhow::anyhow!("boom")),
                _ => Ok(None),
            }
        }
    }

    fn authenticated(successful: bool) -> WsMessage {
        WsMessage::Text(
            serde_json::to_string(&Message::Authenticated { successful })
                .unwrap()
                .into(),
        )
    }

    async fn read_message<S>(ws: &mut WebSocketStream<S>) -> Message
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            let frame = ws.next().await.expect("peer closed").unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn wait_for(
        states: &mut watch::Receiver<ConnectionState>,
        want: ConnectionState,
    ) {
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == want))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_authentication_is_terminal() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        tokio::spawn({
            let accepts = accepts.clone();
            async move {
                loop {
                    let (stream, _) = tcp.accept().await.unwrap();
                    accepts.fetch_add(1, Ordering::SeqCst);
                    let mut ws = accept_async(stream).await.unwrap();
                    let hello = read_message(&mut ws).await;
                    assert!(matches!(hello, Message::Hello { token } if token == "k"));
                    ws.send(authenticated(false)).await.unwrap();
                    ws.close(None).await.ok();
                }
            }
        });

        let connection = Connection::connect_with_backoff(
            Arc::new(NoReply),
            format!("ws://{addr}"),
            Credential::new("k"),
            Duration::from_millis(50),
        );
        let mut states = connection.state_watch();
        wait_for(&mut states, ConnectionState::Disconnected).await;

        // No reconnect after the terminal state, even past the backoff.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_close_while_listening_reconnects_once_after_backoff() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        tokio::spawn({
            let accepts = accepts.clone();
            async move {
                loop {
                    let (stream, _) = tcp.accept().await.unwrap();
                    let n = accepts.fetch_add(1, Ordering::SeqCst);
                    let mut ws = accept_async(stream).await.unwrap();
                    let _hello = read_message(&mut ws).await;
                    ws.send(authenticated(true)).await.unwrap();
                    if n == 0 {
                        // Drop the first session to force a reconnect.
                        ws.close(None).await.ok();
                    } else {
                        // Keep the second session open.
                        while ws.next().await.is_some() {}
                    }
                }
            }
        });

        let connection = Connection::connect_with_backoff(
            Arc::new(NoReply),
            format!("ws://{addr}"),
            Credential::new("k"),
            Duration::from_millis(100),
        );
        let mut states = connection.state_watch();
        wait_for(&mut states, ConnectionState::Listening).await;
        wait_for(&mut states, ConnectionState::Reconnecting).await;
        wait_for(&mut states, ConnectionState::Listening).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 2);

        connection.shutdown().await;
        wait_for(&mut states, ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn listener_replies_and_errors_flow_back() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = tcp.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _hello = read_message(&mut ws).await;
            ws.send(authenticated(true)).await.unwrap();

            // A message the listener answers.
            let run = Message::RunServer {
                configuration: doomsrv_proto::ServerConfiguration {
                    command_line: Vec::new(),
                    configs: Default::default(),
                },
            };
            ws.send(WsMessage::Text(serde_json::to_string(&run).unwrap().into()))
                .await
                .unwrap();
            assert_eq!(
                read_message(&mut ws).await,
                Message::ServerStarted { error: None }
            );

            // A message the listener fails on: converted to an Error reply.
            let cmd = Message::ConsoleCommand {
                command: vec!["say hi".to_string()],
            };
            ws.send(WsMessage::Text(serde_json::to_string(&cmd).unwrap().into()))
                .await
                .unwrap();
            let Message::Error { message } = read_message(&mut ws).await else {
                panic!("expected an error reply");
            };
            assert!(message.contains("boom"));

            // Undecodable frames are inert; the session keeps running.
            ws.send(WsMessage::Text("{not json".into())).await.unwrap();
            ws.send(WsMessage::Text(serde_json::to_string(&run).unwrap().into()))
                .await
                .unwrap();
            assert_eq!(
                read_message(&mut ws).await,
                Message::ServerStarted { error: None }
            );
            done_tx.send(()).unwrap();
        });

        let connection = Connection::connect_with_backoff(
            Arc::new(Scripted),
            format!("ws://{addr}"),
            Credential::new("k"),
            Duration::from_millis(50),
        );
        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .expect("controller script did not finish")
            .unwrap();
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn unexpected_message_while_authenticating_is_ignored() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = tcp.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _hello = read_message(&mut ws).await;
            // Not an Authenticated message: must not change state.
            let cmd = Message::ConsoleCommand {
                command: vec!["say hi".to_string()],
            };
            ws.send(WsMessage::Text(serde_json::to_string(&cmd).unwrap().into()))
                .await
                .unwrap();
            ws.send(authenticated(true)).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let connection = Connection::connect_with_backoff(
            Arc::new(NoReply),
            format!("ws://{addr}"),
            Credential::new("k"),
            Duration::from_millis(50),
        );
        let mut states = connection.state_watch();
        wait_for(&mut states, ConnectionState::Listening).await;
        connection.shutdown().await;
    }

    #[tokio::test]
    async fn send_fails_when_the_transport_is_not_open() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::NotConnected);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let connection = Connection {
            sink: Arc::new(Mutex::new(None)),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
        };

        let err = connection
            .send(&Message::ConsoleBuffer { lines: Vec::new() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn credential_debug_redacts_the_token() {
        let credential = Credential::new("super-secret");
        assert_eq!(format!("{credential:?}"), "Credential(<redacted>)");
    }

    #[test]
    fn error_chain_formatting_joins_causes() {
        let err = anyhow::anyhow!("root").context("mid").context("top");
        assert_eq!(format_error_chain(&err), "top: mid: root");
    }
}
