use std::io::IoSlice;

use nom::{
    bytes::streaming::{tag, take, take_until},
    combinator::{map_res, opt},
    sequence::{pair, terminated},
    IResult,
};

use crate::misc::MaybeUtf8;

/// The three-digit numeric status code of an SMTP reply, as defined by
/// RFC 5321 section 4.2.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplyCode {
    code: u16,
    digits: [u8; 3],
}

const fn code_digits(code: u16) -> [u8; 3] {
    [
        b'0' + ((code % 1000) / 100) as u8,
        b'0' + ((code % 100) / 10) as u8,
        b'0' + (code % 10) as u8,
    ]
}

#[cfg_attr(test, allow(dead_code))]
impl ReplyCode {
    pub const SYSTEM_STATUS: ReplyCode = ReplyCode { code: 211, digits: code_digits(211) };
    pub const HELP_MESSAGE: ReplyCode = ReplyCode { code: 214, digits: code_digits(214) };
    pub const SERVICE_READY: ReplyCode = ReplyCode { code: 220, digits: code_digits(220) };
    pub const CLOSING_CHANNEL: ReplyCode = ReplyCode { code: 221, digits: code_digits(221) };
    pub const AUTH_SUCCESSFUL: ReplyCode = ReplyCode { code: 235, digits: code_digits(235) };
    pub const OKAY: ReplyCode = ReplyCode { code: 250, digits: code_digits(250) };
    pub const USER_NOT_LOCAL_WILL_FORWARD: ReplyCode = ReplyCode { code: 251, digits: code_digits(251) };
    pub const CANNOT_VRFY_BUT_PLEASE_TRY: ReplyCode = ReplyCode { code: 252, digits: code_digits(252) };
    pub const AUTH_CONTINUE: ReplyCode = ReplyCode { code: 334, digits: code_digits(334) };
    pub const START_MAIL_INPUT: ReplyCode = ReplyCode { code: 354, digits: code_digits(354) };
    pub const SERVICE_NOT_AVAILABLE: ReplyCode = ReplyCode { code: 421, digits: code_digits(421) };
    pub const MAILBOX_TEMPORARILY_UNAVAILABLE: ReplyCode = ReplyCode { code: 450, digits: code_digits(450) };
    pub const LOCAL_ERROR: ReplyCode = ReplyCode { code: 451, digits: code_digits(451) };
    pub const INSUFFICIENT_STORAGE: ReplyCode = ReplyCode { code: 452, digits: code_digits(452) };
    pub const UNABLE_TO_ACCEPT_PARAMETERS: ReplyCode = ReplyCode { code: 455, digits: code_digits(455) };
    pub const COMMAND_UNRECOGNIZED: ReplyCode = ReplyCode { code: 500, digits: code_digits(500) };
    pub const SYNTAX_ERROR: ReplyCode = ReplyCode { code: 501, digits: code_digits(501) };
    pub const COMMAND_UNIMPLEMENTED: ReplyCode = ReplyCode { code: 502, digits: code_digits(502) };
    pub const BAD_SEQUENCE: ReplyCode = ReplyCode { code: 503, digits: code_digits(503) };
    pub const PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode { code: 504, digits: code_digits(504) };
    pub const AUTH_REQUIRED: ReplyCode = ReplyCode { code: 530, digits: code_digits(530) };
    pub const AUTH_MECHANISM_TOO_WEAK: ReplyCode = ReplyCode { code: 534, digits: code_digits(534) };
    pub const AUTH_CREDENTIALS_INVALID: ReplyCode = ReplyCode { code: 535, digits: code_digits(535) };
    pub const MAILBOX_UNAVAILABLE: ReplyCode = ReplyCode { code: 550, digits: code_digits(550) };
    pub const POLICY_REASON: ReplyCode = ReplyCode { code: 550, digits: code_digits(550) };
    pub const USER_NOT_LOCAL: ReplyCode = ReplyCode { code: 551, digits: code_digits(551) };
    pub const EXCEEDED_STORAGE: ReplyCode = ReplyCode { code: 552, digits: code_digits(552) };
    pub const MAILBOX_NAME_INCORRECT: ReplyCode = ReplyCode { code: 553, digits: code_digits(553) };
    pub const TRANSACTION_FAILED: ReplyCode = ReplyCode { code: 554, digits: code_digits(554) };
    pub const MAIL_OR_RCPT_PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode { code: 555, digits: code_digits(555) };

    #[inline]
    pub fn custom(code: u16) -> ReplyCode {
        assert!(code < 1000);
        ReplyCode {
            code,
            digits: code_digits(code),
        }
    }

    #[inline]
    pub fn code(&self) -> u16 {
        self.code
    }

    /// The class of the reply, as defined by the first digit of the code.
    pub fn kind(&self) -> ReplyCodeKind {
        match self.code / 100 {
            1 => ReplyCodeKind::PositivePreliminary,
            2 => ReplyCodeKind::PositiveCompletion,
            3 => ReplyCodeKind::PositiveIntermediate,
            4 => ReplyCodeKind::TransientNegative,
            _ => ReplyCodeKind::PermanentNegative,
        }
    }

    /// The category of the reply, as defined by the second digit of the code.
    pub fn category(&self) -> ReplyCodeCategory {
        match (self.code / 10) % 10 {
            0 => ReplyCodeCategory::Syntax,
            1 => ReplyCodeCategory::Information,
            2 => ReplyCodeCategory::Connections,
            5 => ReplyCodeCategory::MailSystem,
            _ => ReplyCodeCategory::Unspecified,
        }
    }

    #[inline]
    fn digits(&self) -> &[u8; 3] {
        &self.digits
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeKind {
    PositivePreliminary,
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeCategory {
    Syntax,
    Information,
    Connections,
    MailSystem,
    Unspecified,
}

const fn digits(mut v: u8) -> ([u8; 3], usize) {
    let mut buf = [0u8; 3];
    if v >= 100 {
        buf[0] = b'0' + v / 100;
        v %= 100;
        buf[1] = b'0' + v / 10;
        v %= 10;
        buf[2] = b'0' + v;
        (buf, 3)
    } else if v >= 10 {
        buf[0] = b'0' + v / 10;
        v %= 10;
        buf[1] = b'0' + v;
        (buf, 2)
    } else {
        buf[0] = b'0' + v;
        (buf, 1)
    }
}

const fn render(class_digit: u8, subject: u8, detail: u8) -> ([u8; 9], u8) {
    let mut buf = [0u8; 9];
    buf[0] = b'0' + class_digit;
    buf[1] = b'.';
    let mut len = 2usize;

    let (s_buf, s_len) = digits(subject);
    let mut i = 0;
    while i < s_len {
        buf[len] = s_buf[i];
        len += 1;
        i += 1;
    }

    buf[len] = b'.';
    len += 1;

    let (d_buf, d_len) = digits(detail);
    let mut j = 0;
    while j < d_len {
        buf[len] = d_buf[j];
        len += 1;
        j += 1;
    }

    (buf, len as u8)
}

/// Enhanced status code as defined by RFC 3463, of the form
/// `class.subject.detail`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnhancedReplyCode {
    class: EnhancedReplyCodeClass,
    subject: u8,
    detail: u8,
    rendered: [u8; 9],
    rendered_len: u8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnhancedReplyCodeClass {
    Success,
    TransientFailure,
    PermanentFailure,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnhancedReplyCodeSubject {
    Undefined,
    Addressing,
    Mailbox,
    MailSystem,
    Network,
    MailDelivery,
    Content,
    Policy,
    Other(u8),
}

#[cfg_attr(test, allow(dead_code))]
impl EnhancedReplyCode {
    pub const SUCCESS_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode::new_success(0, 0);
    pub const SUCCESS_DEST_VALID: EnhancedReplyCode = EnhancedReplyCode::new_success(1, 5);
    pub const SUCCESS_AUTHENTICATING: EnhancedReplyCode = EnhancedReplyCode::new_success(7, 0);
    pub const TRANSIENT_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode::new_transient(0, 0);
    pub const TRANSIENT_MAILBOX_FULL: EnhancedReplyCode = EnhancedReplyCode::new_transient(2, 2);
    pub const TRANSIENT_SYSTEM_INCORRECTLY_CONFIGURED: EnhancedReplyCode =
        EnhancedReplyCode::new_transient(3, 5);
    pub const TRANSIENT_TOO_MANY_RECIPIENTS: EnhancedReplyCode =
        EnhancedReplyCode::new_transient(5, 3);
    pub const TRANSIENT_ROUTING_FAILED: EnhancedReplyCode =
        EnhancedReplyCode::new_transient(4, 4);
    pub const PERMANENT_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode::new_permanent(0, 0);
    pub const PERMANENT_BAD_DEST_MAILBOX: EnhancedReplyCode =
        EnhancedReplyCode::new_permanent(1, 1);
    pub const PERMANENT_INVALID_COMMAND: EnhancedReplyCode =
        EnhancedReplyCode::new_permanent(5, 1);
    pub const PERMANENT_LINE_TOO_LONG: EnhancedReplyCode = EnhancedReplyCode::new_permanent(5, 2);
    pub const PERMANENT_AUTH_REQUIRED: EnhancedReplyCode = EnhancedReplyCode::new_permanent(7, 0);
    pub const PERMANENT_AUTH_CREDENTIALS_INVALID: EnhancedReplyCode =
        EnhancedReplyCode::new_permanent(7, 8);

    pub const fn new_success(subject: u8, detail: u8) -> EnhancedReplyCode {
        let (rendered, rendered_len) = render(2, subject, detail);
        EnhancedReplyCode {
            class: EnhancedReplyCodeClass::Success,
            subject,
            detail,
            rendered,
            rendered_len,
        }
    }

    pub const fn new_transient(subject: u8, detail: u8) -> EnhancedReplyCode {
        let (rendered, rendered_len) = render(4, subject, detail);
        EnhancedReplyCode {
            class: EnhancedReplyCodeClass::TransientFailure,
            subject,
            detail,
            rendered,
            rendered_len,
        }
    }

    pub const fn new_permanent(subject: u8, detail: u8) -> EnhancedReplyCode {
        let (rendered, rendered_len) = render(5, subject, detail);
        EnhancedReplyCode {
            class: EnhancedReplyCodeClass::PermanentFailure,
            subject,
            detail,
            rendered,
            rendered_len,
        }
    }

    pub fn class(&self) -> EnhancedReplyCodeClass {
        self.class
    }

    pub fn subject(&self) -> EnhancedReplyCodeSubject {
        match self.subject {
            0 => EnhancedReplyCodeSubject::Undefined,
            1 => EnhancedReplyCodeSubject::Addressing,
            2 => EnhancedReplyCodeSubject::Mailbox,
            3 => EnhancedReplyCodeSubject::MailSystem,
            4 => EnhancedReplyCodeSubject::Network,
            5 => EnhancedReplyCodeSubject::MailDelivery,
            6 => EnhancedReplyCodeSubject::Content,
            7 => EnhancedReplyCodeSubject::Policy,
            n => EnhancedReplyCodeSubject::Other(n),
        }
    }

    pub fn detail(&self) -> u8 {
        self.detail
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.rendered[..self.rendered_len as usize]
    }

    fn parse(buf: &[u8]) -> IResult<&[u8], EnhancedReplyCode> {
        use nom::character::streaming::digit1;

        let (rest, class) = map_res(take(1usize), |d: &[u8]| -> Result<u8, ()> {
            match d[0] {
                b'2' => Ok(2),
                b'4' => Ok(4),
                b'5' => Ok(5),
                _ => Err(()),
            }
        })(buf)?;
        let (rest, _) = tag(".")(rest)?;
        let (rest, subject) = map_res(digit1, |d: &[u8]| {
            std::str::from_utf8(d).unwrap().parse::<u8>()
        })(rest)?;
        let (rest, _) = tag(".")(rest)?;
        let (rest, detail) = map_res(digit1, |d: &[u8]| {
            std::str::from_utf8(d).unwrap().parse::<u8>()
        })(rest)?;

        let code = match class {
            2 => EnhancedReplyCode::new_success(subject, detail),
            4 => EnhancedReplyCode::new_transient(subject, detail),
            _ => EnhancedReplyCode::new_permanent(subject, detail),
        };
        Ok((rest, code))
    }
}

/// A full, possibly multi-line, SMTP reply. All lines share the same
/// [`ReplyCode`](ReplyCode); an [`EnhancedReplyCode`](EnhancedReplyCode), if
/// present, is carried once for the whole reply and is rendered as a prefix
/// of the first line's text on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply<S = String> {
    pub code: ReplyCode,
    pub ecode: Option<EnhancedReplyCode>,
    pub text: Vec<MaybeUtf8<S>>,
}

impl<S> Reply<S>
where
    S: AsRef<str>,
{
    /// Serializes this reply as a sequence of `IoSlice`s, ready to be
    /// passed to a vectored write. Entirely zero-copy: everything is
    /// borrowed from `self`.
    #[inline]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> + '_ {
        let nlines = self.text.len().max(1);
        (0..nlines).flat_map(move |i| {
            let is_last = i + 1 == nlines;
            let sep: &'static [u8] = if is_last { b" " } else { b"-" };
            let code_slice = IoSlice::new(self.code.digits());
            let sep_slice = IoSlice::new(sep);
            let ecode_parts: Box<dyn Iterator<Item = IoSlice> + '_> = if i == 0 {
                if let Some(ref ecode) = self.ecode {
                    Box::new(
                        std::iter::once(IoSlice::new(ecode.as_bytes()))
                            .chain(std::iter::once(IoSlice::new(b" "))),
                    )
                } else {
                    Box::new(std::iter::empty())
                }
            } else {
                Box::new(std::iter::empty())
            };
            let text_slice = self
                .text
                .get(i)
                .map(|t| IoSlice::new(t.as_str().as_bytes()));
            std::iter::once(code_slice)
                .chain(std::iter::once(sep_slice))
                .chain(ecode_parts)
                .chain(text_slice)
                .chain(std::iter::once(IoSlice::new(b"\r\n")))
        })
    }
}

impl<S> Reply<S>
where
    S: AsRef<str>,
{
    pub fn send_to(&self, w: &mut dyn std::io::Write) -> std::io::Result<()> {
        let nlines = self.text.len().max(1);
        for i in 0..nlines {
            let is_last = i + 1 == nlines;
            w.write_all(self.code.digits())?;
            w.write_all(if is_last { b" " } else { b"-" })?;
            if i == 0 {
                if let Some(ref ecode) = self.ecode {
                    w.write_all(ecode.as_bytes())?;
                    w.write_all(b" ")?;
                }
            }
            if let Some(t) = self.text.get(i) {
                w.write_all(t.as_str().as_bytes())?;
            }
            w.write_all(b"\r\n")?;
        }
        Ok(())
    }
}

impl Reply<&str> {
    pub fn into_owned(self) -> Reply<String> {
        Reply {
            code: self.code,
            ecode: self.ecode,
            text: self.text.into_iter().map(|t| t.into_owned()).collect(),
        }
    }

    /// Parses one complete (possibly multi-line) reply from `buf`.
    pub fn parse(buf: &[u8]) -> IResult<&[u8], Reply<&str>> {
        reply(buf)
    }
}

fn reply_line(buf: &[u8]) -> IResult<&[u8], (ReplyCode, bool, &[u8])> {
    let (rest, (code, sep)) = pair(
        map_res(take(3usize), |d: &[u8]| {
            std::str::from_utf8(d)
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
                .filter(|c| *c < 1000)
                .map(ReplyCode::custom)
                .ok_or(())
        }),
        map_res(take(1usize), |d: &[u8]| match d[0] {
            b' ' => Ok(true),
            b'-' => Ok(false),
            _ => Err(()),
        }),
    )(buf)?;
    let (rest, line) = terminated(take_until("\r\n"), tag("\r\n"))(rest)?;
    Ok((rest, (code, sep, line)))
}

fn reply(buf: &[u8]) -> IResult<&[u8], Reply<&str>> {
    let (mut rest, (first_code, mut is_last, first_line)) = reply_line(buf)?;

    let (first_line, ecode) = match opt(terminated(EnhancedReplyCode::parse, tag(" ")))(first_line)
    {
        Ok((text, ecode)) => (text, ecode),
        Err(_) => (first_line, None),
    };

    let mut lines = vec![first_line];
    while !is_last {
        let (rest2, (code, last, line)) = reply_line(rest)?;
        if code != first_code {
            return Err(nom::Err::Failure(nom::error::Error::new(
                rest,
                nom::error::ErrorKind::Verify,
            )));
        }
        rest = rest2;
        is_last = last;
        lines.push(line);
    }

    let text = lines
        .into_iter()
        .map(|l| MaybeUtf8::from(unsafe { std::str::from_utf8_unchecked(l) }))
        .collect();

    Ok((
        rest,
        Reply {
            code: first_code,
            ecode,
            text,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_last() {
        let r = Reply {
            code: ReplyCode::COMMAND_UNIMPLEMENTED,
            ecode: None,
            text: vec![MaybeUtf8::Ascii("test")],
        };
        let mut res = Vec::new();
        r.send_to(&mut res).unwrap();
        assert_eq!(res, b"502 test\r\n");
    }

    #[test]
    fn parse_single_line() {
        let (rem, r) = Reply::parse(b"250 All is well\r\n").unwrap();
        assert!(rem.is_empty());
        assert_eq!(r.code, ReplyCode::OKAY);
        assert_eq!(r.text, vec![MaybeUtf8::Ascii("All is well")]);
    }

    #[test]
    fn parse_multi_line() {
        let (rem, r) = Reply::parse(b"250-one\r\n250-two\r\n250 three\r\n").unwrap();
        assert!(rem.is_empty());
        assert_eq!(r.code, ReplyCode::OKAY);
        assert_eq!(r.text.len(), 3);
    }

    #[test]
    fn parse_enhanced() {
        let (rem, r) = Reply::parse(b"250 2.1.5 Recipient ok\r\n").unwrap();
        assert!(rem.is_empty());
        assert_eq!(r.ecode, Some(EnhancedReplyCode::SUCCESS_DEST_VALID));
        assert_eq!(r.text, vec![MaybeUtf8::Ascii("Recipient ok")]);
    }

    #[test]
    fn parse_incomplete() {
        assert!(Reply::parse(b"250-one\r\n").unwrap_err().is_incomplete());
    }

    #[test]
    fn round_trip() {
        let r = Reply {
            code: ReplyCode::OKAY,
            ecode: Some(EnhancedReplyCode::SUCCESS_DEST_VALID),
            text: vec![MaybeUtf8::Ascii("Recipient ok".to_string())],
        };
        let mut buf = Vec::new();
        r.send_to(&mut buf).unwrap();
        let (rem, parsed) = Reply::parse(&buf).unwrap();
        assert!(rem.is_empty());
        assert_eq!(parsed.code, r.code);
        assert_eq!(parsed.ecode, r.ecode);
    }
}
