//! Mock modem link for tests and development

use crate::hardware::{speed_changed, LinkResult, ModemLink};
use std::collections::VecDeque;

/// Scripted in-memory modem link
///
/// Tests queue receive bytes with [`push_line`](MockLink::push_line) /
/// [`push_bytes`](MockLink::push_bytes), inspect everything the engine
/// wrote, and can make the fake modem acknowledge attention commands only
/// at one specific speed for probing scenarios.
pub struct MockLink {
    rx: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    opened_at: Vec<u32>,
    current_baud: Option<u32>,
    answers_at: Option<u32>,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            writes: Vec::new(),
            opened_at: Vec::new(),
            current_baud: None,
            answers_at: None,
        }
    }

    /// Make the fake modem answer `OK` to anything written, but only
    /// while the link is open at `baud`
    pub fn answer_only_at(&mut self, baud: u32) {
        self.answers_at = Some(baud);
    }

    /// Queue raw bytes on the receive side
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().copied());
    }

    /// Queue one answer line, terminated the way the modem terminates it
    pub fn push_line(&mut self, line: &str) {
        self.push_bytes(line.as_bytes());
        self.push_bytes(b"\r\n");
    }

    /// Every `write_bytes` call made by the engine, in order
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// Writes decoded as text, for command assertions
    pub fn written_text(&self) -> Vec<String> {
        self.writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Speeds passed to open/reopen, in order (no-op reopens excluded)
    pub fn opened_at(&self) -> &[u32] {
        &self.opened_at
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ModemLink for MockLink {
    fn open(&mut self, baud: u32) -> LinkResult<()> {
        speed_changed(None, baud)?;
        self.opened_at.push(baud);
        self.current_baud = Some(baud);
        self.rx.clear();
        Ok(())
    }

    fn reopen(&mut self, baud: u32) -> LinkResult<()> {
        if speed_changed(self.current_baud, baud)? {
            self.opened_at.push(baud);
            self.current_baud = Some(baud);
        }
        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) {
        self.writes.push(data.to_vec());
        if let Some(answer_baud) = self.answers_at {
            if self.current_baud == Some(answer_baud) {
                self.rx.extend(b"\r\nOK\r\n".iter().copied());
            }
        }
    }

    fn bytes_available(&self) -> usize {
        self.rx.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn current_baud(&self) -> Option<u32> {
        self.current_baud
    }
}
