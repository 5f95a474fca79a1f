use std::io;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use doomsrv_proto::Message;

use crate::connection::Connection;

/// Bound of the capture queue between the stdout reader and the scheduler.
/// The producer blocks when the queue is full; backpressure, not loss.
pub const CONSOLE_BUFFER_CAPACITY: usize = 1000;
/// How often captured console output is flushed to the controller.
pub const CONSOLE_PUMP_PERIOD: Duration = Duration::from_millis(500);

/// Outbound seam used by the scheduler, so ticks can be tested against a
/// recording sink instead of a live controller connection.
pub trait MessageSink: Send + Sync + 'static {
    fn send_message(&self, message: &Message) -> impl Future<Output = io::Result<()>> + Send;
}

impl MessageSink for Connection {
    async fn send_message(&self, message: &Message) -> io::Result<()> {
        self.send(message).await
    }
}

pub fn console_queue() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(CONSOLE_BUFFER_CAPACITY)
}

pub struct ConsoleOutputScheduler;

impl ConsoleOutputScheduler {
    /// Spawns the periodic pump: each tick drains up to the queue capacity
    /// and forwards one ConsoleBuffer when anything was captured. Send
    /// failures are logged and never cancel later ticks. The task ends once
    /// the producer side is gone and the queue is drained.
    pub fn spawn<S: MessageSink>(
        mut queue: mpsc::Receiver<String>,
        sink: S,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CONSOLE_PUMP_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut closed = false;

            while !closed {
                ticker.tick().await;

                let mut batch = Vec::new();
                while batch.len() < CONSOLE_BUFFER_CAPACITY {
                    match queue.try_recv() {
                        Ok(line) => batch.push(line),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            closed = true;
                            break;
                        }
                    }
                }

                if batch.is_empty() {
                    continue;
                }
                let message = Message::ConsoleBuffer { lines: batch };
                if let Err(error) = sink.send_message(&message).await {
                    tracing::warn!(%error, "failed to forward console buffer");
                }
            }
            tracing::debug!("console capture queue closed; scheduler done");
        })
    }
}
