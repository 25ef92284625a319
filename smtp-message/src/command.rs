use std::io::IoSlice;

use auto_enums::auto_enum;
use nom::{
    branch::alt,
    bytes::streaming::{is_not, tag, tag_no_case},
    character::streaming::alphanumeric1,
    combinator::{map, map_res, opt},
    multi::many0,
    sequence::{pair, preceded, terminated},
    IResult,
};

use crate::misc::{email_with_path, Email, Hostname, MaybeUtf8, Path};

/// The name of an ESMTP parameter, as found after `MAIL FROM:<...>` or
/// `RCPT TO:<...>` (eg. `SIZE`, `BODY`, `SMTPUTF8`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParameterName<S = String>(pub S);

impl<S> ParameterName<S>
where
    S: AsRef<str>,
{
    #[inline]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> {
        std::iter::once(IoSlice::new(self.0.as_ref().as_bytes()))
    }
}

/// The list of ESMTP parameters following a `MAIL`/`RCPT` command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Parameters<S = String>(pub Vec<(ParameterName<S>, Option<MaybeUtf8<S>>)>);

impl<S> Parameters<S>
where
    S: AsRef<str>,
{
    #[inline]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> + '_ {
        self.0.iter().flat_map(|(name, value)| {
            std::iter::once(IoSlice::new(b" "))
                .chain(name.as_io_slices())
                .chain(value.iter().flat_map(|v| {
                    std::iter::once(IoSlice::new(b"=")).chain(v.as_io_slices())
                }))
        })
    }
}

fn parameter(buf: &[u8]) -> IResult<&[u8], (ParameterName<&str>, Option<MaybeUtf8<&str>>)> {
    pair(
        map(map_res(alphanumeric1, std::str::from_utf8), ParameterName),
        opt(preceded(
            tag("="),
            map(map_res(is_not(" \r"), std::str::from_utf8), MaybeUtf8::from),
        )),
    )(buf)
}

fn parameters(buf: &[u8]) -> IResult<&[u8], Parameters<&str>> {
    map(many0(preceded(tag(" "), parameter)), Parameters)(buf)
}

/// The SASL mechanism named in an `AUTH` command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

/// A parsed SMTP/ESMTP command, as sent by a client in a single (non-`DATA`)
/// line. `DATA`'s message body is handled separately through
/// [`EscapedDataReader`](crate::EscapedDataReader), as it is not a single
/// line of text.
#[derive(Clone, Debug, PartialEq)]
pub enum Command<S = String> {
    /// `AUTH <mechanism> [<initial-response>]`. `initial_response` carries
    /// the still-base64-encoded text exactly as sent; decoding happens at
    /// the SASL layer, not here, the same way `Mail`/`Rcpt` keep their
    /// email addresses as parsed-but-uninterpreted `Email<S>`.
    Auth {
        mechanism: AuthMechanism,
        initial_response: Option<MaybeUtf8<S>>,
    },
    Data,
    Ehlo {
        hostname: Hostname<S>,
    },
    Expn {
        name: MaybeUtf8<S>,
    },
    Helo {
        hostname: Hostname<S>,
    },
    Help {
        subject: MaybeUtf8<S>,
    },
    Mail {
        path: Option<Path<S>>,
        email: Option<Email<S>>,
        params: Parameters<S>,
    },
    Noop {
        string: MaybeUtf8<S>,
    },
    Quit,
    Rcpt {
        path: Option<Path<S>>,
        email: Email<S>,
        params: Parameters<S>,
    },
    Rset,
    Starttls,
    Vrfy {
        name: MaybeUtf8<S>,
    },
}

impl<S> Command<S>
where
    S: AsRef<str>,
{
    #[auto_enum(Iterator)]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> + '_ {
        match self {
            Command::Auth {
                mechanism,
                initial_response,
            } => std::iter::once(IoSlice::new(b"AUTH "))
                .chain(std::iter::once(IoSlice::new(match mechanism {
                    AuthMechanism::Plain => b"PLAIN",
                    AuthMechanism::Login => b"LOGIN",
                })))
                .chain(initial_response.iter().flat_map(|r| {
                    std::iter::once(IoSlice::new(b" ")).chain(r.as_io_slices())
                }))
                .chain(std::iter::once(IoSlice::new(b"\r\n"))),
            Command::Data => std::iter::once(IoSlice::new(b"DATA\r\n")),
            Command::Ehlo { hostname } => std::iter::once(IoSlice::new(b"EHLO "))
                .chain(hostname.as_io_slices())
                .chain(std::iter::once(IoSlice::new(b"\r\n"))),
            Command::Expn { name } => std::iter::once(IoSlice::new(b"EXPN "))
                .chain(name.as_io_slices())
                .chain(std::iter::once(IoSlice::new(b"\r\n"))),
            Command::Helo { hostname } => std::iter::once(IoSlice::new(b"HELO "))
                .chain(hostname.as_io_slices())
                .chain(std::iter::once(IoSlice::new(b"\r\n"))),
            Command::Help { subject } => std::iter::once(IoSlice::new(b"HELP "))
                .chain(subject.as_io_slices())
                .chain(std::iter::once(IoSlice::new(b"\r\n"))),
            Command::Mail {
                path,
                email,
                params,
            } => std::iter::once(IoSlice::new(b"MAIL FROM:<"))
                .chain(path.iter().flat_map(|p| {
                    p.as_io_slices().chain(std::iter::once(IoSlice::new(b":")))
                }))
                .chain(email.iter().flat_map(|e| e.as_io_slices()))
                .chain(std::iter::once(IoSlice::new(b">")))
                .chain(params.as_io_slices())
                .chain(std::iter::once(IoSlice::new(b"\r\n"))),
            Command::Noop { string } => std::iter::once(IoSlice::new(b"NOOP "))
                .chain(string.as_io_slices())
                .chain(std::iter::once(IoSlice::new(b"\r\n"))),
            Command::Quit => std::iter::once(IoSlice::new(b"QUIT\r\n")),
            Command::Rcpt {
                path,
                email,
                params,
            } => std::iter::once(IoSlice::new(b"RCPT TO:<"))
                .chain(path.iter().flat_map(|p| {
                    p.as_io_slices().chain(std::iter::once(IoSlice::new(b":")))
                }))
                .chain(email.as_io_slices())
                .chain(std::iter::once(IoSlice::new(b">")))
                .chain(params.as_io_slices())
                .chain(std::iter::once(IoSlice::new(b"\r\n"))),
            Command::Rset => std::iter::once(IoSlice::new(b"RSET\r\n")),
            Command::Starttls => std::iter::once(IoSlice::new(b"STARTTLS\r\n")),
            Command::Vrfy { name } => std::iter::once(IoSlice::new(b"VRFY "))
                .chain(name.as_io_slices())
                .chain(std::iter::once(IoSlice::new(b"\r\n"))),
        }
    }
}

impl Command<&str> {
    /// Parses a single SMTP command line out of `buf`.
    pub fn parse(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
        command(buf)
    }
}

fn crlf(buf: &[u8]) -> IResult<&[u8], &[u8]> {
    tag("\r\n")(buf)
}

fn text_line(buf: &[u8]) -> IResult<&[u8], MaybeUtf8<&str>> {
    map(map_res(is_not("\r"), std::str::from_utf8), MaybeUtf8::from)(buf)
}

fn opt_text_line(buf: &[u8]) -> IResult<&[u8], MaybeUtf8<&str>> {
    map(
        opt(preceded(
            tag(" "),
            map_res(is_not("\r"), std::str::from_utf8),
        )),
        |s: Option<&str>| MaybeUtf8::from(s.unwrap_or("")),
    )(buf)
}

fn mail_path_email(buf: &[u8]) -> IResult<&[u8], (Option<Path<&str>>, Option<Email<&str>>)> {
    alt((
        map(tag("<>"), |_| (None, None)),
        map(
            email_with_path(b" \r\n", b" \r\n@", b" \r\n>", b" \r\n@>"),
            |(path, email)| (path, Some(email)),
        ),
    ))(buf)
}

fn command_mail(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    let (buf, (path, email)) = mail_path_email(buf)?;
    let (buf, params) = parameters(buf)?;
    let (buf, _) = crlf(buf)?;
    Ok((
        buf,
        Command::Mail {
            path,
            email,
            params,
        },
    ))
}

fn command_rcpt(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    let (buf, (path, email)) =
        email_with_path(b" \r\n", b" \r\n@", b" \r\n>", b" \r\n@>")(buf)?;
    let (buf, params) = parameters(buf)?;
    let (buf, _) = crlf(buf)?;
    Ok((
        buf,
        Command::Rcpt {
            path,
            email,
            params,
        },
    ))
}

fn command_auth(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    let (buf, mechanism) = alt((
        map(tag_no_case("PLAIN"), |_| AuthMechanism::Plain),
        map(tag_no_case("LOGIN"), |_| AuthMechanism::Login),
    ))(buf)?;
    let (buf, initial_response) = opt(preceded(
        tag(" "),
        map(map_res(is_not("\r"), std::str::from_utf8), MaybeUtf8::from),
    ))(buf)?;
    let (buf, _) = crlf(buf)?;
    Ok((
        buf,
        Command::Auth {
            mechanism,
            initial_response,
        },
    ))
}

fn command(buf: &[u8]) -> IResult<&[u8], Command<&str>> {
    alt((
        preceded(tag_no_case("AUTH "), command_auth),
        map(preceded(tag_no_case("DATA"), crlf), |_| Command::Data),
        map(
            preceded(
                tag_no_case("EHLO "),
                terminated(Hostname::parse_until(b"\r\n"), crlf),
            ),
            |hostname| Command::Ehlo { hostname },
        ),
        map(
            preceded(tag_no_case("EXPN "), terminated(text_line, crlf)),
            |name| Command::Expn { name },
        ),
        map(
            preceded(
                tag_no_case("HELO "),
                terminated(Hostname::parse_until(b"\r\n"), crlf),
            ),
            |hostname| Command::Helo { hostname },
        ),
        map(
            preceded(tag_no_case("HELP"), terminated(opt_text_line, crlf)),
            |subject| Command::Help { subject },
        ),
        preceded(tag_no_case("MAIL FROM:"), command_mail),
        map(
            preceded(tag_no_case("NOOP"), terminated(opt_text_line, crlf)),
            |string| Command::Noop { string },
        ),
        map(preceded(tag_no_case("QUIT"), crlf), |_| Command::Quit),
        preceded(tag_no_case("RCPT TO:"), command_rcpt),
        map(preceded(tag_no_case("RSET"), crlf), |_| Command::Rset),
        map(preceded(tag_no_case("STARTTLS"), crlf), |_| {
            Command::Starttls
        }),
        map(
            preceded(tag_no_case("VRFY "), terminated(text_line, crlf)),
            |name| Command::Vrfy { name },
        ),
    ))(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_data() {
        assert_eq!(Command::parse(b"DATA\r\n").unwrap().1, Command::Data);
    }

    #[test]
    fn parse_ehlo() {
        let (rem, cmd) = Command::parse(b"EHLO foo.bar.baz\r\n").unwrap();
        assert!(rem.is_empty());
        match cmd {
            Command::Ehlo { hostname } => {
                assert_eq!(hostname.raw(), &"foo.bar.baz");
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn parse_mail_null_sender() {
        let (rem, cmd) = Command::parse(b"MAIL FROM:<>\r\n").unwrap();
        assert!(rem.is_empty());
        match cmd {
            Command::Mail { email, .. } => assert!(email.is_none()),
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn parse_mail_with_params() {
        let (rem, cmd) =
            Command::parse(b"MAIL FROM:<hello@world.example> SIZE=12345 SMTPUTF8\r\n").unwrap();
        assert!(rem.is_empty());
        match cmd {
            Command::Mail { email, params, .. } => {
                assert!(email.is_some());
                assert_eq!(params.0.len(), 2);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn parse_rcpt() {
        let (rem, cmd) = Command::parse(b"RCPT TO:<foo@bar.baz>\r\n").unwrap();
        assert!(rem.is_empty());
        match cmd {
            Command::Rcpt { email, .. } => {
                assert_eq!(email.hostname.as_ref().unwrap().raw(), &"bar.baz");
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn parse_auth_plain_with_initial_response() {
        let (rem, cmd) = Command::parse(b"AUTH PLAIN AGEAcGFzcw==\r\n").unwrap();
        assert!(rem.is_empty());
        match cmd {
            Command::Auth {
                mechanism,
                initial_response,
            } => {
                assert_eq!(mechanism, AuthMechanism::Plain);
                assert_eq!(initial_response.unwrap().raw(), &"AGEAcGFzcw==");
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn parse_auth_login_without_initial_response() {
        let (rem, cmd) = Command::parse(b"AUTH LOGIN\r\n").unwrap();
        assert!(rem.is_empty());
        match cmd {
            Command::Auth {
                mechanism,
                initial_response,
            } => {
                assert_eq!(mechanism, AuthMechanism::Login);
                assert!(initial_response.is_none());
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn parse_incomplete() {
        assert!(Command::parse(b"EHLO foo").unwrap_err().is_incomplete());
    }

    #[test]
    fn do_send_ok() {
        let cmd = Command::Vrfy {
            name: MaybeUtf8::Ascii("fubar"),
        };
        let v: Vec<u8> = cmd
            .as_io_slices()
            .flat_map(|s| s.to_vec().into_iter())
            .collect();
        assert_eq!(v, b"VRFY fubar\r\n");
    }
}
