//! The default packet parser.
//!
//! The stack consumes parsing through the [`SipParser`] trait so an
//! application can plug a full grammar of its own; the built-in [`Parser`]
//! is a line parser that understands the start line, the header frame and
//! the body split, and hands everything it does not type to
//! [`Header::Other`](crate::headers::Header).

use bytes::Bytes;

use crate::error::{Error, Result, SipParserError};
use crate::headers::{Header, Headers};
use crate::message::{Request, RequestLine, Response, SipMsg, StatusCode, StatusLine, Uri, SIPV2};

/// A parsed message plus the first recoverable error hit while parsing it.
///
/// A message with `error` set reached the end of the pipeline with enough
/// mandatory structure to be routed, but carried at least one line the
/// parser could not make sense of.
#[derive(Debug, Clone)]
pub struct ParsedMsg {
    /// The parsed message.
    pub msg: SipMsg,
    /// The first recoverable parse error, if any.
    pub error: Option<SipParserError>,
}

/// The message parser used by the transport layer.
pub trait SipParser: Sync + Send + 'static {
    /// Parses one packet into a message.
    fn parse_packet(&self, bytes: &[u8]) -> Result<ParsedMsg>;
}

/// The built-in line parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct Parser;

impl Parser {
    /// Parses one SIP message out of `bytes`.
    ///
    /// Unrecognizable packets produce [`Error::Broken`]; recognizable ones
    /// with mangled header lines come back with
    /// [`ParsedMsg::error`] set.
    pub fn parse_sip_msg(&self, bytes: &[u8]) -> Result<ParsedMsg> {
        let (head, body) = split_head_body(bytes);

        let head = std::str::from_utf8(head)
            .map_err(|_| Error::Broken(SipParserError::new("Header section is not UTF-8")))?;

        let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));
        let start_line = lines.next().unwrap_or_default().trim_end();

        let mut error = None;
        let mut headers = Headers::with_capacity(8);

        for line in lines {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            // Folded continuation lines belong to a header the core treats
            // as opaque anyway.
            if line.starts_with(' ') || line.starts_with('\t') {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                if error.is_none() {
                    error = Some(SipParserError::new(format!("Invalid header line: {line:?}")));
                }
                continue;
            };
            match Header::parse(name.trim(), value) {
                Ok(header) => headers.push(header),
                Err(err) => {
                    if error.is_none() {
                        error = Some(SipParserError::new(err.to_string()));
                    }
                }
            }
        }

        let body = body_bytes(&headers, body);
        let msg = if let Some(rest) = start_line.strip_prefix(SIPV2) {
            // Response: "SIP/2.0 <code> <reason>"
            let rest = rest.trim_start();
            let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            let code: u16 = code
                .parse()
                .map_err(|_| Error::Broken(SipParserError::new("Invalid status code")))?;

            SipMsg::Response(Response {
                status_line: StatusLine::new(StatusCode(code), reason.trim()),
                headers,
                body,
            })
        } else {
            // Request: "<method> <uri> SIP/2.0"
            let mut parts = start_line.split_whitespace();
            let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
                (Some(m), Some(u), Some(v)) => (m, u, v),
                _ => {
                    return Err(Error::Broken(SipParserError::new(format!(
                        "Invalid start line: {start_line:?}"
                    ))))
                }
            };
            if version != SIPV2 {
                return Err(Error::Broken(SipParserError::new("Unknown SIP version")));
            }

            SipMsg::Request(Request {
                req_line: RequestLine {
                    method: method.into(),
                    uri: Uri::new(uri),
                },
                headers,
                body,
            })
        };

        Ok(ParsedMsg { msg, error })
    }
}

impl SipParser for Parser {
    fn parse_packet(&self, bytes: &[u8]) -> Result<ParsedMsg> {
        self.parse_sip_msg(bytes)
    }
}

fn split_head_body(bytes: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find_subslice(bytes, b"\r\n\r\n") {
        (&bytes[..pos], &bytes[pos + 4..])
    } else if let Some(pos) = find_subslice(bytes, b"\n\n") {
        (&bytes[..pos], &bytes[pos + 2..])
    } else {
        (bytes, &[])
    }
}

fn body_bytes(headers: &Headers, body: &[u8]) -> Option<Bytes> {
    let len = match headers.content_length() {
        Some(len) => (len as usize).min(body.len()),
        None => body.len(),
    };
    if len == 0 {
        None
    } else {
        Some(Bytes::copy_from_slice(&body[..len]))
    }
}

pub(crate) fn find_subslice(src: &[u8], needle: &[u8]) -> Option<usize> {
    src.windows(needle.len()).position(|w| w == needle)
}
