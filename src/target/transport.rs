use super::PauseHandle;
use crate::error::{DebugError, Result};
use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Every response ends with a prompt line `command<state>> `, e.g.
/// `command> ` or `command@cpu-step> `.
pub const PROMPT_PREFIX: &str = "command";
pub const PROMPT_SUFFIX: &str = "> ";

/// Sends one command and returns its whole response.
pub trait Transport {
    fn run(&mut self, command: &str) -> Result<String>;
}

/// Text line protocol: a command line goes out, the response is everything
/// up to the next prompt line. The text between `command` and `> ` is the
/// simulator's state.
///
/// Writes are serialized through a shared writer so an out-of-band interrupt
/// can be sent while a response is awaited. Every interrupt yields one extra
/// prompt, which is drained before the next response is read.
pub struct LineTransport<R, W> {
    reader: R,
    writer: Arc<Mutex<W>>,
    interrupts: Arc<AtomicUsize>,
    state: String,
}

impl LineTransport<BufReader<TcpStream>, TcpStream> {
    pub fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        let mut transport = Self::new(reader, stream);
        let banner = transport.read_response()?;
        debug!(address, banner = banner.lines().next().unwrap_or(""), "connected");
        Ok(transport)
    }
}

impl<R: BufRead, W: Write> LineTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer: Arc::new(Mutex::new(writer)),
            interrupts: Arc::new(AtomicUsize::new(0)),
            state: String::new(),
        }
    }

    /// State shown in the last prompt, e.g. `@cpu-step`. Empty when running normally.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Sends a blank line, which stops a running target.
    pub fn interrupter(&self) -> PauseHandle
    where
        W: Send + 'static,
    {
        let writer = Arc::clone(&self.writer);
        let interrupts = Arc::clone(&self.interrupts);
        PauseHandle::new(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| DebugError::Target("transport writer poisoned".to_string()))?;
            interrupts.fetch_add(1, Ordering::SeqCst);
            writer.write_all(b"\n")?;
            writer.flush()?;
            debug!("interrupt sent");
            Ok(())
        })
    }

    /// Reads up to and including the next prompt line; returns the text before it.
    pub fn read_response(&mut self) -> Result<String> {
        let mut response = Vec::new();
        let mut line_start = 0;
        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed while waiting for prompt",
                )
                .into());
            }
            let mut used = 0;
            let mut complete = false;
            for &byte in available {
                response.push(byte);
                used += 1;
                if byte == b'\n' {
                    line_start = response.len();
                } else if is_prompt(&response[line_start..]) {
                    complete = true;
                    break;
                }
            }
            self.reader.consume(used);
            if complete {
                break;
            }
        }
        let prompt = String::from_utf8_lossy(&response[line_start..]).into_owned();
        let state = &prompt[PROMPT_PREFIX.len()..prompt.len() - PROMPT_SUFFIX.len()];
        if state != self.state {
            debug!(state, "simulator state changed");
            self.state = state.to_string();
        }
        response.truncate(line_start);
        let text = String::from_utf8_lossy(&response).replace('\r', "");
        Ok(text.trim_end_matches('\n').to_string())
    }
}

fn is_prompt(line: &[u8]) -> bool {
    line.len() >= PROMPT_PREFIX.len() + PROMPT_SUFFIX.len()
        && line.starts_with(PROMPT_PREFIX.as_bytes())
        && line.ends_with(PROMPT_SUFFIX.as_bytes())
}

impl<R: BufRead, W: Write> Transport for LineTransport<R, W> {
    fn run(&mut self, command: &str) -> Result<String> {
        let stale = {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| DebugError::Target("transport writer poisoned".to_string()))?;
            let stale = self.interrupts.swap(0, Ordering::SeqCst);
            writer.write_all(command.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            stale
        };
        trace!(command, "=>");
        for _ in 0..stale {
            self.read_response()?;
        }
        let response = self.read_response()?;
        trace!(response = %response, "<=");
        Ok(response)
    }
}
