use std::ops::Range;

use crate::streambuf::Streambuf;

/// One parsed header field: `name_range` is just the field name (before the
/// `:`), `value_range` is everything after the `:` up to (but not
/// including) the line's terminating CRLF, folded continuation lines
/// included, `full_range` is the whole field including the name and the
/// terminating CRLF.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeaderField {
    pub name_range: Range<usize>,
    pub value_range: Range<usize>,
    pub full_range: Range<usize>,
}

/// Scans `buf` from `start` for RFC 5322 header fields, stopping at the
/// first blank line. Malformed lines (no `:`, or a continuation with no
/// preceding field) are skipped rather than aborting the whole parse.
/// Returns the parsed fields plus the offset where the message body
/// begins. Grounded on NwSMTP's `header_parser.cpp`/`.h`.
pub fn parse_headers(buf: &Streambuf, start: usize) -> (Vec<HeaderField>, usize) {
    let mut fields: Vec<HeaderField> = Vec::new();
    let mut pos = start;
    let len = buf.len();

    loop {
        let line_start = pos;
        let (line_end, next_line_start, blank) = scan_line(buf, pos, len);
        if blank {
            return (fields, next_line_start);
        }
        if next_line_start > len || line_start >= len {
            // truncated input: caller should request more bytes and retry
            return (fields, line_start);
        }

        let is_continuation = matches!(buf.get(line_start), Some(b' ') | Some(b'\t'));
        if is_continuation {
            if let Some(field) = fields.last_mut() {
                field.value_range.end = line_end;
                field.full_range.end = next_line_start;
            }
            // else: continuation with no preceding field, skip silently
        } else if let Some(colon) = find_colon(buf, line_start, line_end) {
            fields.push(HeaderField {
                name_range: line_start..colon,
                value_range: (colon + 1)..line_end,
                full_range: line_start..next_line_start,
            });
        }
        // else: malformed line with no colon, skip

        pos = next_line_start;
    }
}

/// Returns `(line_end, next_line_start, is_blank_line)`, where `line_end`
/// excludes the terminating CRLF/LF.
fn scan_line(buf: &Streambuf, start: usize, len: usize) -> (usize, usize, bool) {
    let mut i = start;
    while i < len {
        match buf.get(i) {
            Some(b'\n') => {
                let line_end = if i > start && buf.get(i - 1) == Some(b'\r') {
                    i - 1
                } else {
                    i
                };
                return (line_end, i + 1, line_end == start);
            }
            _ => i += 1,
        }
    }
    (len, len + 1, false)
}

fn find_colon(buf: &Streambuf, start: usize, end: usize) -> Option<usize> {
    (start..end).find(|&i| buf.get(i) == Some(b':'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    fn buf_with(data: &[u8]) -> Streambuf {
        let mut buf = Streambuf::new(Pool::new(64));
        let space = buf.prepare(data.len());
        space.copy_from_slice(data);
        buf.commit(data.len());
        buf
    }

    fn text(buf: &Streambuf, r: Range<usize>) -> String {
        let mut scratch = Vec::new();
        String::from_utf8(buf.contiguous(r.start, r.end, &mut scratch).to_vec()).unwrap()
    }

    #[test]
    fn parses_simple_headers_and_finds_body() {
        let buf = buf_with(b"From: a@example.org\r\nTo: b@example.org\r\n\r\nbody");
        let (fields, body_start) = parse_headers(&buf, 0);
        assert_eq!(fields.len(), 2);
        assert_eq!(text(&buf, fields[0].name_range.clone()), "From");
        assert_eq!(text(&buf, fields[0].value_range.clone()), " a@example.org");
        assert_eq!(text(&buf, fields[1].name_range.clone()), "To");
        assert_eq!(&text(&buf, body_start..buf.len()), "body");
    }

    #[test]
    fn folds_continuation_lines_into_the_value() {
        let buf = buf_with(b"Subject: hello\r\n world\r\n\r\n");
        let (fields, _) = parse_headers(&buf, 0);
        assert_eq!(fields.len(), 1);
        assert_eq!(text(&buf, fields[0].value_range.clone()), " hello\r\n world");
    }

    #[test]
    fn skips_malformed_lines() {
        let buf = buf_with(b"not a header line\r\nSubject: ok\r\n\r\n");
        let (fields, _) = parse_headers(&buf, 0);
        assert_eq!(fields.len(), 1);
        assert_eq!(text(&buf, fields[0].name_range.clone()), "Subject");
    }
}
