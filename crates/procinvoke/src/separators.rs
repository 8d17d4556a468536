//! Line separator policy and the incremental splitter driven by output readers

use std::collections::BTreeSet;

/// How output bytes are cut into records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineSeparators {
    /// Any enabled newline convention ends a line
    NewLine {
        /// `\n`
        unix: bool,
        /// `\r`
        legacy_mac: bool,
        /// `\r\n`
        windows: bool,
    },
    /// Any of these bytes ends a line
    Custom(BTreeSet<u8>),
    /// No splitting: the whole stream is one record
    None,
}

impl Default for LineSeparators {
    fn default() -> Self {
        Self::NewLine {
            unix: true,
            legacy_mac: false,
            windows: false,
        }
    }
}

impl LineSeparators {
    /// Accept `\n`, `\r` and `\r\n`
    pub fn any_newline() -> Self {
        Self::NewLine {
            unix: true,
            legacy_mac: true,
            windows: true,
        }
    }

    pub fn custom(bytes: impl IntoIterator<Item = u8>) -> Self {
        Self::Custom(bytes.into_iter().collect())
    }
}

/// Buffers a byte stream and yields `(line, eol)` pairs
///
/// Bytes are pushed as they are read; [`LineSplitter::finish`] marks the end
/// of the stream so trailing bytes come out with an empty delimiter.
#[derive(Debug)]
pub struct LineSplitter {
    separators: LineSeparators,
    buffer: Vec<u8>,
    start: usize,
    scanned: usize,
    finished: bool,
}

enum Scan {
    Found { end: usize, eol_len: usize },
    NeedMore,
}

impl LineSplitter {
    pub fn new(separators: LineSeparators) -> Self {
        Self {
            separators,
            buffer: Vec::new(),
            start: 0,
            scanned: 0,
            finished: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start * 2 >= self.buffer.len() {
            self.buffer.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Bytes held but not yet emitted
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.start
    }

    pub fn next_line(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        match self.scan() {
            Scan::Found { end, eol_len } => {
                let line = self.buffer[self.start..end].to_vec();
                let eol = self.buffer[end..end + eol_len].to_vec();
                self.start = end + eol_len;
                self.scanned = self.start;
                Some((line, eol))
            }
            Scan::NeedMore if self.finished && self.pending() > 0 => {
                let line = self.buffer[self.start..].to_vec();
                self.start = self.buffer.len();
                self.scanned = self.start;
                Some((line, Vec::new()))
            }
            Scan::NeedMore => None,
        }
    }

    fn scan(&mut self) -> Scan {
        let len = self.buffer.len();
        match &self.separators {
            LineSeparators::None => {
                self.scanned = len;
                Scan::NeedMore
            }
            LineSeparators::Custom(set) => {
                let from = self.scanned;
                match self.buffer[from..].iter().position(|b| set.contains(b)) {
                    Some(offset) => Scan::Found {
                        end: from + offset,
                        eol_len: 1,
                    },
                    None => {
                        self.scanned = len;
                        Scan::NeedMore
                    }
                }
            }
            LineSeparators::NewLine {
                unix,
                legacy_mac,
                windows,
            } => {
                let (unix, legacy_mac, windows) = (*unix, *legacy_mac, *windows);
                let mut i = self.scanned;
                while i < len {
                    match self.buffer[i] {
                        b'\n' if unix => return Scan::Found { end: i, eol_len: 1 },
                        b'\r' if windows => match self.buffer.get(i + 1) {
                            Some(b'\n') => return Scan::Found { end: i, eol_len: 2 },
                            Some(_) if legacy_mac => return Scan::Found { end: i, eol_len: 1 },
                            Some(_) => {}
                            None if self.finished => {
                                if legacy_mac {
                                    return Scan::Found { end: i, eol_len: 1 };
                                }
                            }
                            None => {
                                // The next push decides between `\r` and `\r\n`.
                                self.scanned = i;
                                return Scan::NeedMore;
                            }
                        },
                        b'\r' if legacy_mac => return Scan::Found { end: i, eol_len: 1 },
                        _ => {}
                    }
                    i += 1;
                }
                self.scanned = len;
                Scan::NeedMore
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(separators: LineSeparators, chunks: &[&[u8]]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut splitter = LineSplitter::new(separators);
        let mut out = Vec::new();
        for chunk in chunks {
            splitter.push(chunk);
            while let Some(line) = splitter.next_line() {
                out.push(line);
            }
        }
        splitter.finish();
        while let Some(line) = splitter.next_line() {
            out.push(line);
        }
        out
    }

    fn pairs(expected: &[(&str, &str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
        expected
            .iter()
            .map(|(l, e)| (l.as_bytes().to_vec(), e.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_unix_newlines_with_trailing_data() {
        assert_eq!(
            split(LineSeparators::default(), &[b"a\nb", b"\nc"]),
            pairs(&[("a", "\n"), ("b", "\n"), ("c", "")])
        );
    }

    #[test]
    fn test_default_keeps_carriage_returns() {
        assert_eq!(
            split(LineSeparators::default(), &[b"ok\r\n"]),
            pairs(&[("ok\r", "\n")])
        );
    }

    #[test]
    fn test_windows_waits_for_byte_after_carriage_return() {
        let windows_only = LineSeparators::NewLine {
            unix: false,
            legacy_mac: false,
            windows: true,
        };
        assert_eq!(
            split(windows_only.clone(), &[b"ok\r", b"\nnext\n"]),
            pairs(&[("ok", "\r\n"), ("next\n", "")])
        );
        assert_eq!(split(windows_only, &[b"a\rb"]), pairs(&[("a\rb", "")]));
    }

    #[test]
    fn test_all_newlines() {
        assert_eq!(
            split(LineSeparators::any_newline(), &[b"a\r", b"b\r\nc\nd\r"]),
            pairs(&[("a", "\r"), ("b", "\r\n"), ("c", "\n"), ("d", "\r")])
        );
    }

    #[test]
    fn test_custom_separator() {
        assert_eq!(
            split(LineSeparators::custom([b'k']), &[b"ok\r\n"]),
            pairs(&[("o", "k"), ("\r\n", "")])
        );
        assert_eq!(
            split(LineSeparators::custom([b',', b';']), &[b"1;2,,3"]),
            pairs(&[("1", ";"), ("2", ","), ("", ","), ("3", "")])
        );
    }

    #[test]
    fn test_no_splitting() {
        assert_eq!(
            split(LineSeparators::None, &[b"a\nb\n", b"c"]),
            pairs(&[("a\nb\nc", "")])
        );
        assert!(split(LineSeparators::None, &[]).is_empty());
        assert!(split(LineSeparators::custom([]), &[b""]).is_empty());
    }

    #[test]
    fn test_pending_tracks_unemitted_bytes() {
        let mut splitter = LineSplitter::new(LineSeparators::default());
        splitter.push(b"abc\nde");
        assert_eq!(splitter.pending(), 6);
        assert!(splitter.next_line().is_some());
        assert_eq!(splitter.pending(), 2);
        assert!(splitter.next_line().is_none());
    }
}
