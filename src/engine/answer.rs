//! Answer accumulator: raw modem bytes to completed lines

/// Outcome of feeding one byte into the accumulator
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    /// Byte absorbed (or dropped), line still incomplete
    Pending,
    /// A line feed completed this line; the buffer was cleared
    Line(String),
    /// The line exceeded the maximum length; the buffer was reset and
    /// the partial content discarded
    Overflow,
}

/// Bounded accumulator for the answer line currently being received
///
/// NUL and carriage-return bytes are dropped; a line feed emits the bytes
/// collected since the previous one. Content survives across polls until
/// a line completes, the buffer overflows, or the engine clears it when
/// a new command starts.
pub struct AnswerBuffer {
    buf: Vec<u8>,
    max_len: usize,
}

impl AnswerBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_len),
            max_len,
        }
    }

    /// Feed one received byte
    pub fn push(&mut self, byte: u8) -> Push {
        match byte {
            0 | b'\r' => Push::Pending,
            b'\n' => {
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                Push::Line(line)
            }
            _ => {
                if self.buf.len() >= self.max_len {
                    self.buf.clear();
                    Push::Overflow
                } else {
                    self.buf.push(byte);
                    Push::Pending
                }
            }
        }
    }

    /// Partial content accumulated so far, for timeout classification
    pub fn partial(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
