use crate::streambuf::Streambuf;

/// Locates the end of an SMTP `DATA` body: the line containing a lone `.`.
/// Restartable by construction — all state needed to resume a scan after
/// more bytes are committed lives in `self`, so splitting the same input at
/// any two boundaries and calling [`scan`](EomParser::scan) once per split
/// yields the same [`EomResult::Found`] offsets as one call over the whole
/// buffer. Grounded on NwSMTP's `eom_parser.cpp`/`.h`.
pub struct EomParser {
    state: State,
    scanned: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    LineStart,
    InLine,
    Dot,
    DotCr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EomResult {
    NotFound,
    /// `body_end` is the offset (exclusive) of the last byte of real
    /// message content; `terminator_end` is the offset right after the
    /// terminating `.\r\n`.
    Found { body_end: usize, terminator_end: usize },
}

impl EomParser {
    pub fn new() -> EomParser {
        EomParser {
            state: State::LineStart,
            scanned: 0,
        }
    }

    pub fn scan(&mut self, buf: &Streambuf) -> EomResult {
        while self.scanned < buf.len() {
            let b = buf.get(self.scanned).expect("offset within len");
            self.state = match (self.state, b) {
                (State::LineStart, b'.') => State::Dot,
                (State::LineStart, b'\n') => State::LineStart,
                (State::LineStart, _) => State::InLine,
                (State::InLine, b'\n') => State::LineStart,
                (State::InLine, _) => State::InLine,
                (State::Dot, b'\r') => State::DotCr,
                (State::Dot, _) => State::InLine,
                (State::DotCr, b'\n') => {
                    let dot_pos = self.scanned - 2;
                    let terminator_end = self.scanned + 1;
                    self.scanned = terminator_end;
                    self.state = State::LineStart;
                    return EomResult::Found {
                        body_end: dot_pos,
                        terminator_end,
                    };
                }
                (State::DotCr, _) => State::InLine,
            };
            self.scanned += 1;
        }
        EomResult::NotFound
    }
}

impl Default for EomParser {
    fn default() -> Self {
        EomParser::new()
    }
}

/// Collapses any run of two or more `\r` immediately before a `\n` down to a
/// single `\r\n`, streaming across chunk boundaries by holding back a
/// trailing run of bare `\r` until it's known whether a `\n` follows.
#[derive(Default)]
pub struct CrlfCollapser {
    pending_crs: usize,
}

impl CrlfCollapser {
    pub fn new() -> CrlfCollapser {
        CrlfCollapser::default()
    }

    pub fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            match b {
                b'\r' => self.pending_crs += 1,
                b'\n' if self.pending_crs > 0 => {
                    out.push(b'\r');
                    out.push(b'\n');
                    self.pending_crs = 0;
                }
                _ => {
                    out.extend(std::iter::repeat(b'\r').take(self.pending_crs));
                    self.pending_crs = 0;
                    out.push(b);
                }
            }
        }
    }

    /// Flushes any held-back bare `\r`s once no more input is coming.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        out.extend(std::iter::repeat(b'\r').take(self.pending_crs));
        self.pending_crs = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    fn feed(buf: &mut Streambuf, data: &[u8]) {
        let space = buf.prepare(data.len());
        space.copy_from_slice(data);
        buf.commit(data.len());
    }

    #[test]
    fn finds_empty_body() {
        let mut buf = Streambuf::new(Pool::new(64));
        feed(&mut buf, b".\r\n");
        let mut parser = EomParser::new();
        assert_eq!(
            parser.scan(&buf),
            EomResult::Found {
                body_end: 0,
                terminator_end: 3
            }
        );
    }

    #[test]
    fn finds_terminator_after_body() {
        let mut buf = Streambuf::new(Pool::new(64));
        feed(&mut buf, b"Hello\r\n.\r\n");
        let mut parser = EomParser::new();
        assert_eq!(
            parser.scan(&buf),
            EomResult::Found {
                body_end: 7,
                terminator_end: 10
            }
        );
    }

    #[test]
    fn fragment_invariant() {
        let whole = b"Hello world\r\n.\r\n";
        for split in 0..whole.len() {
            let mut buf = Streambuf::new(Pool::new(64));
            let mut parser = EomParser::new();
            feed(&mut buf, &whole[..split]);
            let first = parser.scan(&buf);
            feed(&mut buf, &whole[split..]);
            let second = parser.scan(&buf);
            let result = match (first, second) {
                (EomResult::Found { .. }, _) => first,
                (EomResult::NotFound, r) => r,
            };
            assert_eq!(
                result,
                EomResult::Found {
                    body_end: 13,
                    terminator_end: 16
                },
                "split at {} produced {:?}/{:?}",
                split,
                first,
                second
            );
        }
    }

    #[test]
    fn dot_mid_line_is_not_a_terminator() {
        let mut buf = Streambuf::new(Pool::new(64));
        feed(&mut buf, b"a.b\r\n.\r\n");
        let mut parser = EomParser::new();
        assert_eq!(
            parser.scan(&buf),
            EomResult::Found {
                body_end: 5,
                terminator_end: 8
            }
        );
    }

    #[test]
    fn collapses_cr_runs_before_lf() {
        let mut collapser = CrlfCollapser::new();
        let mut out = Vec::new();
        collapser.push(b"a\r\r\r\nb\r\nc", &mut out);
        collapser.finish(&mut out);
        assert_eq!(out, b"a\r\nb\r\nc");
    }

    #[test]
    fn collapse_holds_back_cr_across_calls() {
        let mut collapser = CrlfCollapser::new();
        let mut out = Vec::new();
        collapser.push(b"a\r\r", &mut out);
        collapser.push(b"\r\nb", &mut out);
        collapser.finish(&mut out);
        assert_eq!(out, b"a\r\nb");
    }
}
