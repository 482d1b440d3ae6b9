//! A scripted in-memory transport, for exercising the driver without an
//! instrument attached

use crate::transport::{Transport, TransportError};
use std::collections::VecDeque;

/// Records every command written and answers reads from a queue of scripted
/// replies. Reading with an empty queue behaves like an instrument that
/// never answers.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    written: Vec<String>,
    replies: VecDeque<Vec<u8>>,
    disconnected: bool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `read` or `read_raw`
    pub fn push_reply(&mut self, reply: impl Into<Vec<u8>>) {
        self.replies.push_back(reply.into());
    }

    /// Queue a newline-terminated text reply
    pub fn push_text(&mut self, reply: &str) {
        self.push_reply(format!("{reply}\n"));
    }

    /// Make every following transfer fail as if the cable was pulled
    pub fn disconnect(&mut self) {
        self.disconnected = true;
    }

    pub fn written(&self) -> &[String] {
        &self.written
    }

    pub fn count_written(&self, command: &str) -> usize {
        self.written.iter().filter(|c| *c == command).count()
    }

    /// Replies that were queued but never read
    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    fn next_reply(&mut self) -> Result<Vec<u8>, TransportError> {
        if self.disconnected {
            return Err(TransportError::Disconnected);
        }
        self.replies.pop_front().ok_or(TransportError::Timeout)
    }
}

impl Transport for LoopbackTransport {
    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        if self.disconnected {
            return Err(TransportError::Disconnected);
        }
        self.written.push(command.to_string());
        Ok(())
    }

    fn read(&mut self) -> Result<String, TransportError> {
        let mut reply = String::from_utf8(self.next_reply()?)?;
        if reply.ends_with('\n') {
            reply.pop();
        }
        Ok(reply)
    }

    fn read_raw(&mut self) -> Result<Vec<u8>, TransportError> {
        self.next_reply()
    }
}
