//! Command templates and the multi-chunk exchange state machine.
//!
//! A chunked command splits its hex arguments over several APDUs. Every chunk
//! but the last carries the template's `more` P1 marker; the last carries the
//! `last` marker. The exchange is driven from outside: ask for the next
//! command, send it, feed the result back.

use crate::channel::status::{CommandResult, Status};
use crate::error::{Result, SimError};

/// APDU header (CLA INS P1 P2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTemplate {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}

impl CommandTemplate {
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self { cla, ins, p1, p2 }
    }

    pub const fn with_p1(self, p1: u8) -> Self {
        Self { p1, ..self }
    }

    fn header(&self) -> String {
        format!(
            "{:02X}{:02X}{:02X}{:02X}",
            self.cla, self.ins, self.p1, self.p2
        )
    }

    /// Command with data: header, Lc and the hex payload
    pub fn render(&self, data_hex: &str) -> String {
        format!("{}{:02X}{}", self.header(), data_hex.len() / 2, data_hex)
    }

    /// Command expecting `le` response bytes (256 is encoded as 00)
    pub fn render_le(&self, le: usize) -> String {
        format!("{}{:02X}", self.header(), (le & 0xFF) as u8)
    }
}

/// A template whose P1 byte marks continuation versus final chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedTemplate {
    pub template: CommandTemplate,
    pub more: u8,
    pub last: u8,
}

impl ChunkedTemplate {
    pub const fn new(template: CommandTemplate, more: u8, last: u8) -> Self {
        Self {
            template,
            more,
            last,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Idle,
    /// Chunk `i` is on the wire, its result not yet seen
    ChunkSent(usize),
    /// Chunk `i` was accepted and the next one may go out
    AwaitingMore(usize),
    Done,
    Failed,
}

/// State machine for a single chunked command
#[derive(Debug)]
pub struct ChunkedExchange {
    template: ChunkedTemplate,
    chunks: Vec<String>,
    state: ChunkState,
}

impl ChunkedExchange {
    /// Split `args_hex` into chunks of at most `chunk_size` hex characters
    pub fn new(template: ChunkedTemplate, args_hex: &str, chunk_size: usize) -> Result<Self> {
        if args_hex.len() % 2 != 0 || !args_hex.is_ascii() {
            return Err(SimError::Framing(
                "chunked arguments must be an even-length hex string".to_string(),
            ));
        }
        if chunk_size < 2 || chunk_size % 2 != 0 {
            return Err(SimError::Config(format!(
                "invalid chunk size {chunk_size}"
            )));
        }
        let chunks = if args_hex.is_empty() {
            vec![String::new()]
        } else {
            args_hex
                .as_bytes()
                .chunks(chunk_size)
                .map(|c| String::from_utf8_lossy(c).into_owned())
                .collect()
        };
        Ok(Self {
            template,
            chunks,
            state: ChunkState::Idle,
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ChunkState::Done | ChunkState::Failed)
    }

    /// Render the next chunk command, or `None` when nothing is left to send
    pub fn next_command(&mut self) -> Option<String> {
        let index = match self.state {
            ChunkState::Idle => 0,
            ChunkState::AwaitingMore(i) => i + 1,
            ChunkState::ChunkSent(_) | ChunkState::Done | ChunkState::Failed => return None,
        };
        let marker = if index + 1 == self.chunks.len() {
            self.template.last
        } else {
            self.template.more
        };
        self.state = ChunkState::ChunkSent(index);
        Some(
            self.template
                .template
                .with_p1(marker)
                .render(&self.chunks[index]),
        )
    }

    /// Feed back the result of the chunk last returned by [`next_command`](Self::next_command)
    pub fn on_result(&mut self, result: &CommandResult) -> Result<()> {
        let ChunkState::ChunkSent(index) = self.state else {
            return Err(SimError::InvalidState(format!(
                "chunk result received in state {:?}",
                self.state
            )));
        };
        let is_last = index + 1 == self.chunks.len();
        self.state = match (&result.status, is_last) {
            (Status::Ok, false) => ChunkState::AwaitingMore(index),
            (Status::Ok | Status::MoreData(_), true) => ChunkState::Done,
            _ => ChunkState::Failed,
        };
        Ok(())
    }
}
