//! Boundary to the terminal emulation engine.
//!
//! The broker does not interpret escape sequences. A session hands every
//! chunk of process output to a [`TerminalEmulator`] and lets it keep
//! whatever screen model it wants. [`ScrollbackEmulator`] is the plain
//! stand-in used by the daemon: it keeps the last N lines of text and
//! discards control sequences.

use std::collections::VecDeque;
use std::sync::Arc;

/// Consumer of a session's output stream.
pub trait TerminalEmulator: Send {
    /// Feed raw process output.
    fn append(&mut self, bytes: &[u8]);

    /// The visible area changed size.
    fn resize(&mut self, cols: u16, rows: u16);

    /// Text content, oldest line first.
    fn transcript_text(&self) -> String;
}

/// Creates an emulator for a session's first size.
pub type EmulatorFactory = Arc<dyn Fn(u16, u16) -> Box<dyn TerminalEmulator> + Send + Sync>;

/// Default number of lines kept by [`ScrollbackEmulator`].
pub const DEFAULT_SCROLLBACK_LINES: usize = 2000;

/// Factory producing [`ScrollbackEmulator`]s with `max_lines` of history.
pub fn scrollback_factory(max_lines: usize) -> EmulatorFactory {
    Arc::new(move |cols, rows| {
        Box::new(ScrollbackEmulator::new(cols, rows, max_lines)) as Box<dyn TerminalEmulator>
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Esc,
    Csi,
    Osc,
    OscEsc,
}

/// Line-oriented text history.
#[derive(Debug)]
pub struct ScrollbackEmulator {
    lines: VecDeque<String>,
    current: Vec<u8>,
    max_lines: usize,
    cols: u16,
    rows: u16,
    escape: Escape,
}

impl ScrollbackEmulator {
    pub fn new(cols: u16, rows: u16, max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            current: Vec::new(),
            max_lines: max_lines.max(1),
            cols,
            rows,
            escape: Escape::None,
        }
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    /// Completed lines currently held.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    fn push_line(&mut self) {
        let line = String::from_utf8_lossy(&self.current).into_owned();
        self.current.clear();
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn feed(&mut self, byte: u8) {
        match self.escape {
            Escape::Esc => {
                self.escape = match byte {
                    b'[' => Escape::Csi,
                    b']' => Escape::Osc,
                    _ => Escape::None,
                };
                return;
            }
            Escape::Csi => {
                // Final byte of a control sequence.
                if (0x40..=0x7e).contains(&byte) {
                    self.escape = Escape::None;
                }
                return;
            }
            Escape::Osc => {
                match byte {
                    0x07 => self.escape = Escape::None,
                    0x1b => self.escape = Escape::OscEsc,
                    _ => {}
                }
                return;
            }
            Escape::OscEsc => {
                self.escape = if byte == b'\\' {
                    Escape::None
                } else {
                    Escape::Osc
                };
                return;
            }
            Escape::None => {}
        }

        match byte {
            0x1b => self.escape = Escape::Esc,
            b'\n' => self.push_line(),
            b'\r' => {}
            b'\t' => self.current.push(b'\t'),
            0x08 => {
                self.current.pop();
            }
            b if b < 0x20 || b == 0x7f => {}
            b => self.current.push(b),
        }
    }
}

impl TerminalEmulator for ScrollbackEmulator {
    fn append(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.feed(byte);
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    fn transcript_text(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        text.push_str(&String::from_utf8_lossy(&self.current));
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_lines() {
        let mut emu = ScrollbackEmulator::new(80, 24, 10);
        emu.append(b"hello\r\nworld\r\npartial");
        assert_eq!(emu.transcript_text(), "hello\nworld\npartial");
        assert_eq!(emu.line_count(), 2);
    }

    #[test]
    fn test_strips_escape_sequences() {
        let mut emu = ScrollbackEmulator::new(80, 24, 10);
        emu.append(b"\x1b[1;32mgreen\x1b[0m\n\x1b]0;title\x07after\n");
        assert_eq!(emu.transcript_text(), "green\nafter\n");
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let mut emu = ScrollbackEmulator::new(80, 24, 10);
        emu.append(b"a\x1b[");
        emu.append(b"31mb\n");
        assert_eq!(emu.transcript_text(), "ab\n");
    }

    #[test]
    fn test_backspace() {
        let mut emu = ScrollbackEmulator::new(80, 24, 10);
        emu.append(b"abc\x08d\n");
        assert_eq!(emu.transcript_text(), "abd\n");
    }

    #[test]
    fn test_history_is_bounded() {
        let mut emu = ScrollbackEmulator::new(80, 24, 3);
        for i in 0..10 {
            emu.append(format!("line {}\n", i).as_bytes());
        }
        assert_eq!(emu.transcript_text(), "line 7\nline 8\nline 9\n");
    }

    #[test]
    fn test_factory_and_resize() {
        let factory = scrollback_factory(5);
        let mut emu = factory(100, 30);
        emu.resize(120, 40);
        emu.append(b"x");
        assert_eq!(emu.transcript_text(), "x");
    }
}
