//! Scripted adapter for exercising drivers without hardware.
//!
//! Every write and bus-level action is appended to a shared [`CommandLog`] so a
//! test can keep inspecting the traffic after the adapter has been moved into an
//! [`InstrumentLink`](crate::instrument::link::InstrumentLink). Queries are
//! answered from a table keyed by the exact command text.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::Adapter;
use crate::error::{AppResult, DaqError};

/// Log entry written for a hardware trigger assertion.
pub const LOG_TRIGGER: &str = "<GET>";
/// Log entry written for a device clear.
pub const LOG_CLEAR: &str = "<DCL>";
/// Log entry written for an interface clear.
pub const LOG_IFC: &str = "<IFC>";

/// Shared, append-only record of what was sent to a [`MockAdapter`].
#[derive(Debug, Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<String>>>);

impl CommandLog {
    fn push(&self, entry: String) {
        if let Ok(mut log) = self.0.lock() {
            log.push(entry);
        }
    }

    /// Snapshot of every entry so far.
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Number of entries exactly equal to `command`.
    pub fn count(&self, command: &str) -> usize {
        self.entries().iter().filter(|c| c.as_str() == command).count()
    }

    /// Whether any entry starts with `prefix`.
    pub fn any_starts_with(&self, prefix: &str) -> bool {
        self.entries().iter().any(|c| c.starts_with(prefix))
    }

    /// Position of the first entry equal to `command`.
    pub fn position(&self, command: &str) -> Option<usize> {
        self.entries().iter().position(|c| c == command)
    }

    /// Forget everything logged so far.
    pub fn clear(&self) {
        if let Ok(mut log) = self.0.lock() {
            log.clear();
        }
    }
}

#[derive(Debug)]
struct Script {
    replies: VecDeque<Vec<u8>>,
}

impl Script {
    /// Next reply; the last one repeats forever.
    fn next(&mut self) -> Option<Vec<u8>> {
        if self.replies.len() > 1 {
            self.replies.pop_front()
        } else {
            self.replies.front().cloned()
        }
    }
}

/// In-memory adapter with canned replies.
#[derive(Debug)]
pub struct MockAdapter {
    log: CommandLog,
    scripts: HashMap<String, Script>,
    failing: Vec<String>,
    rx: VecDeque<u8>,
    timeout: Duration,
}

impl MockAdapter {
    /// New mock plus the handle to its command log.
    pub fn new() -> (Self, CommandLog) {
        let log = CommandLog::default();
        let adapter = Self {
            log: log.clone(),
            scripts: HashMap::new(),
            failing: Vec::new(),
            rx: VecDeque::new(),
            timeout: Duration::from_millis(300),
        };
        (adapter, log)
    }

    /// Answer `command` with `reply` plus a newline, every time.
    pub fn with_response(self, command: &str, reply: &str) -> Self {
        self.with_responses(command, &[reply])
    }

    /// Answer `command` with each reply in turn, repeating the last one.
    pub fn with_responses(mut self, command: &str, replies: &[&str]) -> Self {
        let replies = replies
            .iter()
            .map(|r| format!("{}\n", r).into_bytes())
            .collect();
        self.scripts.insert(command.to_string(), Script { replies });
        self
    }

    /// Answer `command` with raw bytes, every time.
    pub fn with_binary_response(mut self, command: &str, reply: Vec<u8>) -> Self {
        self.scripts.insert(
            command.to_string(),
            Script {
                replies: VecDeque::from(vec![reply]),
            },
        );
        self
    }

    /// Make writes of `command` fail with a bus error.
    pub fn failing_on(mut self, command: &str) -> Self {
        self.failing.push(command.to_string());
        self
    }

    /// Current timeout, as last set by the driver.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Adapter for MockAdapter {
    fn info(&self) -> String {
        "MockAdapter".to_string()
    }

    fn write_line(&mut self, line: &str) -> AppResult<()> {
        self.log.push(line.to_string());
        if self.failing.iter().any(|f| f == line) {
            return Err(DaqError::Bus(format!("mock failure on '{}'", line)));
        }
        if let Some(reply) = self.scripts.get_mut(line).and_then(Script::next) {
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn read_line(&mut self) -> AppResult<String> {
        match self.rx.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line: Vec<u8> = self.rx.drain(..=pos).collect();
                Ok(String::from_utf8_lossy(&line).trim().to_string())
            }
            None => Err(DaqError::Bus(format!(
                "Mock read timeout after {:?}",
                self.timeout
            ))),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> AppResult<()> {
        if self.rx.len() < buf.len() {
            return Err(DaqError::Bus(format!(
                "Mock read timeout: wanted {} bytes, have {}",
                buf.len(),
                self.rx.len()
            )));
        }
        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> AppResult<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn assert_trigger(&mut self) -> AppResult<()> {
        self.log.push(LOG_TRIGGER.to_string());
        Ok(())
    }

    fn clear(&mut self) -> AppResult<()> {
        self.rx.clear();
        self.log.push(LOG_CLEAR.to_string());
        Ok(())
    }

    fn send_ifc(&mut self) -> AppResult<()> {
        self.log.push(LOG_IFC.to_string());
        Ok(())
    }

    fn send_command_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.log.push(format!("<CMD {:02X?}>", bytes));
        Ok(())
    }
}
