use std::io;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::{Payload, MAX_MSG_SIZE};
use crate::parser::find_subslice;

/// Splits a byte stream into SIP message frames.
///
/// Framing needs `Content-Length`; when a message head arrives without it,
/// the head alone is emitted and the buffer is advanced to the next message
/// boundary, so the layer above can reject it with a 400 without poisoning
/// the rest of the stream.
#[derive(Default)]
pub(crate) struct StreamingDecoder;

impl Decoder for StreamingDecoder {
    type Error = io::Error;
    type Item = Payload;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Absorb a stray pong when more data follows it.
        while src.len() > 2 && src.starts_with(b"\r\n") && !src.starts_with(b"\r\n\r\n") {
            src.advance(2);
        }
        // A keep-alive ping travels upward so it can be answered.
        if src.starts_with(b"\r\n\r\n") {
            let ping = src.split_to(4).freeze();
            return Ok(Some(Payload::new(ping)));
        }
        // A lone CRLF may be half of a ping still in flight.
        if src.as_ref() == b"\r\n" {
            return Ok(None);
        }

        // Find header end.
        let hdr_end = b"\n\r\n";
        let pos = find_subslice(src, hdr_end);
        let Some(pos) = pos else {
            if src.len() > MAX_MSG_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Header section exceeds the message size limit",
                ));
            }
            return Ok(None);
        };
        let body_start = pos + 3;
        let hdr_end = pos + 1;

        // Find "Content-Length" header
        let mut content_length = None;

        let lines = src[..hdr_end].split(|&b| b == b'\n');
        for line in lines {
            let mut split = line.splitn(2, |&c| c == b':');
            let Some(name) = split.next() else {
                continue;
            };
            let name = name.trim_ascii();
            if name.eq_ignore_ascii_case(b"content-length") || name == b"l" {
                let Some(value) = split.next() else {
                    continue;
                };
                let Ok(value_str) = std::str::from_utf8(value) else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Invalid UTF-8 in Content-Length header",
                    ));
                };
                if let Ok(parsed_value) = value_str.trim().parse::<usize>() {
                    content_length = Some(parsed_value);
                }
            }
        }

        let Some(c_len) = content_length else {
            // No framing information. Hand the head upward for rejection
            // and drain to the next message boundary.
            let head = src.split_to(body_start).freeze();
            return Ok(Some(Payload::new(head)));
        };

        let expected_msg_size = body_start + c_len;
        if expected_msg_size > MAX_MSG_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Message exceeds the size limit",
            ));
        }
        if src.len() < expected_msg_size {
            src.reserve(expected_msg_size - src.len());
            return Ok(None);
        }
        let src_bytes = src.split_to(expected_msg_size);
        let src_bytes = src_bytes.freeze();

        Ok(Some(Payload::new(src_bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: &[u8] = b"OPTIONS sip:bob@h SIP/2.0\r\n\
        Via: SIP/2.0/TCP h:5060;branch=z9hG4bKa\r\n\
        Content-Length: 4\r\n\r\nping";

    #[test]
    fn test_whole_message() {
        let mut decoder = StreamingDecoder;
        let mut buf = BytesMut::from(MSG);

        let payload = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(payload.buf(), MSG);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_body_waits() {
        let mut decoder = StreamingDecoder;
        let mut buf = BytesMut::from(&MSG[..MSG.len() - 2]);

        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&MSG[MSG.len() - 2..]);
        assert!(decoder.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_two_pipelined_messages() {
        let mut decoder = StreamingDecoder;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(MSG);
        buf.extend_from_slice(MSG);

        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_missing_content_length_drains_to_boundary() {
        let head = b"INVITE sip:bob@h SIP/2.0\r\n\
            Via: SIP/2.0/TCP h:5060;branch=z9hG4bKb\r\n\r\n";
        let mut decoder = StreamingDecoder;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(head);
        buf.extend_from_slice(MSG);

        let first = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.buf(), head);

        // The next message on the stream is intact.
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.buf(), MSG);
    }

    #[test]
    fn test_keep_alive_ping_is_framed() {
        let mut decoder = StreamingDecoder;
        let mut buf = BytesMut::from(&b"\r\n\r\n"[..]);

        let ping = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ping.buf(), b"\r\n\r\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stray_pong_before_message() {
        let mut decoder = StreamingDecoder;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(MSG);

        let payload = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(payload.buf(), MSG);
    }
}
