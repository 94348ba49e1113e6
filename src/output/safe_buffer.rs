/*!
 * Safe Output Buffer
 *
 * Bounded line buffer for child output. Keeps the start of each line and
 * the most recent lines so a noisy child cannot exhaust memory. An
 * unterminated line is held back only up to the bytes its kept prefix
 * could need.
 */

use super::drain::OutputHandler;
use crate::core::errors::{PopenError, PopenResult};
use crate::core::limits::{DEFAULT_MAX_LINE_COUNT, DEFAULT_MAX_LINE_LENGTH, ELLIPSIS};

/// Longest UTF-8 encoding of one character
const MAX_CHAR_WIDTH: usize = 4;

/// Start of a line whose terminator has not arrived yet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PendingLine {
    bytes: Vec<u8>,
    truncated: bool,
}

impl PendingLine {
    /// Append up to `limit` bytes in total; anything past it is dropped
    fn extend(&mut self, data: &[u8], limit: usize) {
        if self.truncated {
            return;
        }
        let room = limit.saturating_sub(self.bytes.len());
        if data.len() > room {
            self.bytes.extend_from_slice(&data[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(data);
        }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty() && !self.truncated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeOutputBuffer {
    lines: Vec<String>,
    max_line_count: usize,
    max_line_length: usize,
    pending_stdout: PendingLine,
    pending_stderr: PendingLine,
}

impl SafeOutputBuffer {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            max_line_count: DEFAULT_MAX_LINE_COUNT,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            pending_stdout: PendingLine::default(),
            pending_stderr: PendingLine::default(),
        }
    }

    /// Buffer with custom limits
    ///
    /// At least two lines (the elision marker and one line) and lines
    /// longer than the ellipsis itself.
    pub fn with_limits(max_line_count: usize, max_line_length: usize) -> PopenResult<Self> {
        if max_line_count <= 1 {
            return Err(PopenError::InvalidState(format!(
                "max_line_count must be greater than 1, got {}",
                max_line_count
            )));
        }
        if max_line_length <= ELLIPSIS.len() {
            return Err(PopenError::InvalidState(format!(
                "max_line_length must be greater than {}, got {}",
                ELLIPSIS.len(),
                max_line_length
            )));
        }
        Ok(Self {
            max_line_count,
            max_line_length,
            ..Self::new()
        })
    }

    /// Append one line
    ///
    /// A single trailing line terminator is removed. When full, the oldest
    /// line is dropped and the first line becomes the ellipsis marker.
    /// Lines longer than the limit are cut to their start plus an ellipsis.
    pub fn push_line(&mut self, line: &str) {
        let line = chomp(line);
        let line = if line.chars().count() > self.max_line_length {
            self.elide(line)
        } else {
            line.to_string()
        };
        self.push_entry(line);
    }

    fn elide(&self, line: &str) -> String {
        let keep = self.max_line_length - ELLIPSIS.len();
        let mut truncated: String = line.chars().take(keep).collect();
        truncated.push_str(ELLIPSIS);
        truncated
    }

    fn push_entry(&mut self, line: String) {
        if self.lines.len() >= self.max_line_count {
            self.lines.remove(0);
            if let Some(first) = self.lines.first_mut() {
                *first = ELLIPSIS.to_string();
            }
        }
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Buffered lines joined by newlines
    pub fn display_text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    #[inline]
    pub fn max_line_count(&self) -> usize {
        self.max_line_count
    }

    #[inline]
    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }

    /// Push any unterminated output still held back
    pub fn flush_pending(&mut self) {
        for pending in [
            std::mem::take(&mut self.pending_stdout),
            std::mem::take(&mut self.pending_stderr),
        ] {
            if !pending.is_empty() {
                self.push_pending(pending);
            }
        }
    }

    fn push_pending(&mut self, pending: PendingLine) {
        let text = String::from_utf8_lossy(&pending.bytes);
        if pending.truncated {
            let line = self.elide(&text);
            self.push_entry(line);
        } else {
            self.push_line(&text);
        }
    }

    fn push_bytes(&mut self, data: &[u8], stderr: bool) {
        let mut pending = if stderr {
            std::mem::take(&mut self.pending_stderr)
        } else {
            std::mem::take(&mut self.pending_stdout)
        };
        // Enough bytes for max_line_length characters of any width
        let limit = self.max_line_length * MAX_CHAR_WIDTH;

        let mut rest = data;
        while let Some(offset) = rest.iter().position(|&b| b == b'\n') {
            pending.extend(&rest[..offset], limit);
            self.push_pending(std::mem::take(&mut pending));
            rest = &rest[offset + 1..];
        }
        pending.extend(rest, limit);

        if stderr {
            self.pending_stderr = pending;
        } else {
            self.pending_stdout = pending;
        }
    }
}

impl Default for SafeOutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputHandler for SafeOutputBuffer {
    fn on_stdout(&mut self, data: &[u8]) {
        self.push_bytes(data, false);
    }

    fn on_stderr(&mut self, data: &[u8]) {
        self.push_bytes(data, true);
    }

    fn on_finished(&mut self) {
        self.flush_pending();
    }
}

fn chomp(line: &str) -> &str {
    line.strip_suffix("\r\n")
        .or_else(|| line.strip_suffix('\n'))
        .or_else(|| line.strip_suffix('\r'))
        .unwrap_or(line)
}
