use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

/// Sentinel printed by the server once it is ready to accept stdin.
pub(crate) const SERVER_READY_SENTINEL: &str = "DoomServerReady";
/// Sentinel echoed back by the server's own command loop.
pub(crate) const CONSOLE_READY_SENTINEL: &str = "DoomConsoleReady";
/// Probe sent to the server to verify its command/echo loop is alive.
pub(crate) const CONSOLE_READY_PROBE: &str = "echo DoomConsoleReady";
/// Sentinel terminating a console command result.
pub(crate) const CONSOLE_RESULT_END_SENTINEL: &str = "DoomConsoleResultEnd";

/// Consumes server stdout lines one at a time while installed in the
/// [`HandlerSlot`]. Delivery happens under the slot lock, so an installed
/// handler sees every line from the moment `install` returns.
pub(crate) trait OutputHandler: Send {
    fn on_line(&mut self, line: &str);
}

/// Holds at most one output handler. Install, detach and line delivery all
/// run under the same mutex, so no line can reach a stale handler and none
/// is lost between install and the first delivery.
#[derive(Clone, Default)]
pub(crate) struct HandlerSlot {
    inner: Arc<Mutex<Option<Box<dyn OutputHandler>>>>,
}

impl HandlerSlot {
    pub(crate) fn install(&self, handler: Box<dyn OutputHandler>) {
        let mut slot = self.inner.lock().expect("output handler slot poisoned");
        if slot.replace(handler).is_some() {
            tracing::warn!("replaced an output handler that was still installed");
        }
    }

    pub(crate) fn detach(&self) {
        let mut slot = self.inner.lock().expect("output handler slot poisoned");
        *slot = None;
    }

    pub(crate) fn deliver(&self, line: &str) {
        let mut slot = self.inner.lock().expect("output handler slot poisoned");
        if let Some(handler) = slot.as_mut() {
            handler.on_line(line);
        }
    }
}

/// Drives the readiness handshake after spawn: when the server prints
/// `DoomServerReady` it sends the echo probe over stdin, and when the server
/// echoes `DoomConsoleReady` back it signals completion.
pub(crate) struct ServerInitWaiter {
    stdin_tx: mpsc::UnboundedSender<String>,
    probe_sent: bool,
    done: Option<oneshot::Sender<()>>,
}

impl ServerInitWaiter {
    pub(crate) fn new(stdin_tx: mpsc::UnboundedSender<String>) -> (Self, oneshot::Receiver<()>) {
        let (done_tx, done_rx) = oneshot::channel();
        (
            Self {
                stdin_tx,
                probe_sent: false,
                done: Some(done_tx),
            },
            done_rx,
        )
    }
}

impl OutputHandler for ServerInitWaiter {
    fn on_line(&mut self, line: &str) {
        if line.contains(SERVER_READY_SENTINEL) {
            if self.probe_sent {
                return;
            }
            self.probe_sent = true;
            if self.stdin_tx.send(CONSOLE_READY_PROBE.to_string()).is_err() {
                tracing::warn!("server stdin closed before the readiness probe could be sent");
            }
        } else if line.contains(CONSOLE_READY_SENTINEL)
            && let Some(done) = self.done.take()
        {
            let _ = done.send(());
        }
    }
}

/// Collects console command output until the `DoomConsoleResultEnd` line,
/// which is excluded from the result and signals completion.
pub(crate) struct ConsoleResultWaiter {
    lines: Vec<String>,
    done: Option<oneshot::Sender<Vec<String>>>,
}

impl ConsoleResultWaiter {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Vec<String>>) {
        let (done_tx, done_rx) = oneshot::channel();
        (
            Self {
                lines: Vec::new(),
                done: Some(done_tx),
            },
            done_rx,
        )
    }
}

impl OutputHandler for ConsoleResultWaiter {
    fn on_line(&mut self, line: &str) {
        if self.done.is_none() {
            // The supervisor detaches this handler right after completion, so
            // a line landing here means the server kept talking past the
            // terminator. Keep the pump alive but make the defect visible.
            tracing::error!(line = %line, "console output after the result terminator; dropping");
            return;
        }

        if line.contains(CONSOLE_RESULT_END_SENTINEL) {
            let lines = std::mem::take(&mut self.lines);
            if let Some(done) = self.done.take() {
                let _ = done.send(lines);
            }
        } else {
            self.lines.push(line.to_string());
        }
    }
}
