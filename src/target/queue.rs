use super::transport::Transport;
use crate::error::{DebugError, Result};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

struct Request {
    command: String,
    reply: Sender<Result<String>>,
}

/// A submitted command whose response has not been collected yet.
#[must_use = "the response must be waited for"]
pub struct Pending {
    command: String,
    receiver: Receiver<Result<String>>,
}

impl Pending {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Blocks until the response arrives.
    pub fn wait(self) -> Result<String> {
        self.receiver.recv().map_err(|_| {
            DebugError::Target(format!("command queue closed before '{}' completed", self.command))
        })?
    }
}

/// Serializes commands to a transport.
///
/// One worker thread owns the transport and handles requests strictly in
/// submission order, one at a time.
pub struct CommandQueue {
    sender: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
}

impl CommandQueue {
    pub fn spawn<T: Transport + Send + 'static>(mut transport: T) -> Self {
        let (sender, receiver) = mpsc::channel::<Request>();
        let worker = thread::spawn(move || {
            for request in receiver {
                let response = transport.run(&request.command);
                if request.reply.send(response).is_err() {
                    trace!(command = %request.command, "response dropped by caller");
                }
            }
            debug!("command queue worker finished");
        });
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    pub fn submit(&self, command: &str) -> Result<Pending> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| DebugError::Target("command queue closed".to_string()))?;
        let (reply, receiver) = mpsc::channel();
        sender
            .send(Request {
                command: command.to_string(),
                reply,
            })
            .map_err(|_| DebugError::Target("command queue worker gone".to_string()))?;
        Ok(Pending {
            command: command.to_string(),
            receiver,
        })
    }

    /// Submits and waits.
    pub fn run(&self, command: &str) -> Result<String> {
        self.submit(command)?.wait()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                debug!("command queue worker panicked");
            }
        }
    }
}
