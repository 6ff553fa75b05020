//! Line-oriented frame decoder for the upstream event stream.
//!
//! Wire format (one field per line, `\n` or `\r\n` terminated):
//!
//! ```text
//! event: tool_start
//! data: {"name":"Read","id":"t1"}
//!
//! data: {"content":"hello"}
//! ```
//!
//! An `event:` line sets the current frame type, which stays in effect until
//! the next `event:` line (the initial type is `chunk`). Every `data:` line
//! yields one frame carrying the current type. Blank lines close an event and
//! lines starting with `:` are keep-alive comments.

/// Frame type used until the stream names one explicitly.
pub const DEFAULT_FRAME_TYPE: &str = "chunk";

/// One decoded `(type, payload)` unit, payload still undecoded JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event_type: String,
    pub data: String,
}

/// Incremental decoder: feed it arbitrary byte chunks, get complete frames back.
///
/// Chunks may split lines (and multi-byte characters) anywhere; incomplete
/// trailing bytes are held until the next `feed` or the final `finish`.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    current_type: String,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            current_type: DEFAULT_FRAME_TYPE.to_string(),
        }
    }

    /// Append `bytes` and return every frame completed by them, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut pending = std::mem::take(&mut self.pending);
        pending.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut start = 0usize;
        while let Some(offset) = pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            // Lines end on '\n', so a complete line never splits a UTF-8 sequence.
            let line = String::from_utf8_lossy(&pending[start..end]);
            if let Some(frame) = self.process_line(line.trim_end_matches('\r')) {
                frames.push(frame);
            }
            start = end + 1;
        }

        pending.drain(..start);
        self.pending = pending;
        frames
    }

    /// Flush a trailing line that was never newline-terminated.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.pending.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&pending);
        self.process_line(line.trim_end_matches('\r'))
    }

    fn process_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() || line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => {
                self.current_type = if value.is_empty() {
                    DEFAULT_FRAME_TYPE.to_string()
                } else {
                    value.to_string()
                };
                None
            }
            "data" => Some(Frame {
                event_type: self.current_type.clone(),
                data: value.to_string(),
            }),
            _ => None,
        }
    }
}
