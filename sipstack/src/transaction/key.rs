//! Transaction matching keys per RFC 3261 §17.1.3 / §17.2.3 with the
//! RFC 2543 fallback for branches lacking the magic cookie.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::headers::{CSeq, CallId, FromTo, Via};
use crate::message::{SipMethod, Uri};

/// A transaction key in one of its two canonical forms.
///
/// Keys are normalized at construction (host and method case folded, ACK
/// folded into INVITE) so equality and hashing are plain field
/// comparisons, and [`TsxKey::encode`] is stable across processes.
#[derive(PartialEq, Eq, Hash, Clone, Debug, Serialize, Deserialize)]
pub enum TsxKey {
    /// Fallback matching for RFC 2543 era peers.
    Rfc2543(Rfc2543),
    /// Magic-cookie matching.
    Rfc3261(Rfc3261),
}

#[derive(PartialEq, Eq, Hash, Clone, Debug, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Rfc3261 {
    /// The branch parameter, compared byte for byte.
    pub branch: String,
    /// The sent-by of the topmost Via, lowercased.
    pub sent_by: String,
    /// The uppercased method token, ACK folded to INVITE.
    pub method: String,
}

#[derive(PartialEq, Eq, Hash, Clone, Debug, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Rfc2543 {
    pub method: String,
    pub uri: String,
    pub from_tag: String,
    pub to_tag: String,
    pub call_id: String,
    pub cseq: u32,
    /// The topmost Via: rendered verbatim for server keys, reduced to the
    /// lowercased sent-by for client keys.
    pub via: String,
}

fn folded_method_token(method: &SipMethod) -> String {
    method.folded().as_str().to_ascii_uppercase()
}

impl TsxKey {
    /// Builds the server-side key from the parts of an incoming request.
    pub fn create_server(
        via: &Via,
        cseq: &CSeq,
        from: &FromTo,
        to: &FromTo,
        call_id: &CallId,
        uri: &Uri,
    ) -> Result<Self> {
        if via.is_rfc3261_branch() {
            // Valid branch for RFC 3261.
            return Ok(TsxKey::Rfc3261(Rfc3261 {
                branch: via.branch().unwrap_or_default().to_string(),
                sent_by: via.sent_by().to_string().to_ascii_lowercase(),
                method: folded_method_token(cseq.method()),
            }));
        }

        Self::create_rfc2543(via.to_string(), cseq, from, to, call_id, uri)
    }

    /// Builds the client-side key from the parts of a message belonging to
    /// a transaction this endpoint initiated.
    pub fn create_client(
        via: &Via,
        cseq: &CSeq,
        from: &FromTo,
        to: &FromTo,
        call_id: &CallId,
        _uri: &Uri,
    ) -> Result<Self> {
        if via.is_rfc3261_branch() {
            // CANCEL matches its own transaction, not the INVITE it
            // cancels, so the method is not folded here.
            return Ok(TsxKey::Rfc3261(Rfc3261 {
                branch: via.branch().unwrap_or_default().to_string(),
                sent_by: via.sent_by().to_string().to_ascii_lowercase(),
                method: cseq.method().as_str().to_ascii_uppercase(),
            }));
        }

        // Responses carry no request URI, and the UAS stamps received and
        // rport into the Via it echoes, so client side fallback keys
        // reduce the Via to its sent-by and leave the URI out on both the
        // create and the match path.
        Self::create_rfc2543(
            via.sent_by().to_string().to_ascii_lowercase(),
            cseq,
            from,
            to,
            call_id,
            &Uri::default(),
        )
    }

    fn create_rfc2543(
        via: String,
        cseq: &CSeq,
        from: &FromTo,
        to: &FromTo,
        call_id: &CallId,
        uri: &Uri,
    ) -> Result<Self> {
        let Some(from_tag) = from.tag() else {
            return Err(Error::MissingRequiredHeader("From tag"));
        };

        let is_invite_tsx = matches!(cseq.method().folded(), SipMethod::Invite);
        let to_tag = match to.tag() {
            // ACK carries the To tag of the response it acknowledges; the
            // INVITE it belongs to was keyed without one.
            Some(_) if is_invite_tsx => "",
            Some(tag) => tag,
            None if is_invite_tsx => "",
            None => return Err(Error::MissingRequiredHeader("To tag")),
        };

        Ok(TsxKey::Rfc2543(Rfc2543 {
            method: folded_method_token(cseq.method()),
            uri: uri.as_str().to_string(),
            from_tag: from_tag.to_string(),
            to_tag: to_tag.to_string(),
            call_id: call_id.as_str().to_string(),
            cseq: cseq.cseq,
            via,
        }))
    }

    /// The canonical byte encoding used for stable hashing and
    /// inter-process comparison.
    pub fn encode(&self) -> Vec<u8> {
        const SEP: u8 = 0x1f;
        let mut out = Vec::with_capacity(64);

        match self {
            TsxKey::Rfc3261(key) => {
                out.extend_from_slice(b"3261");
                for field in [&key.branch, &key.sent_by, &key.method] {
                    out.push(SEP);
                    out.extend_from_slice(field.as_bytes());
                }
            }
            TsxKey::Rfc2543(key) => {
                out.extend_from_slice(b"2543");
                for field in [
                    &key.method,
                    &key.uri,
                    &key.from_tag,
                    &key.to_tag,
                    &key.call_id,
                ] {
                    out.push(SEP);
                    out.extend_from_slice(field.as_bytes());
                }
                out.push(SEP);
                out.extend_from_slice(key.cseq.to_string().as_bytes());
                out.push(SEP);
                out.extend_from_slice(key.via.as_bytes());
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(via: &str, cseq: &str, from: &str, to: &str) -> (Via, CSeq, FromTo, FromTo, CallId, Uri) {
        (
            Via::parse(via).unwrap(),
            CSeq::parse(cseq).unwrap(),
            FromTo::parse(from).unwrap(),
            FromTo::parse(to).unwrap(),
            CallId::new("1@h"),
            Uri::new("sip:bob@h"),
        )
    }

    #[test]
    fn test_rfc3261_server_key_folds_ack() {
        let (via, cseq, from, to, cid, uri) = parts(
            "SIP/2.0/UDP Client.Example.COM:5060;branch=z9hG4bKabc",
            "1 INVITE",
            "<sip:a@h>;tag=x",
            "<sip:b@h>",
        );
        let invite = TsxKey::create_server(&via, &cseq, &from, &to, &cid, &uri).unwrap();

        let ack_cseq = CSeq::parse("1 ACK").unwrap();
        let to_tagged = FromTo::parse("<sip:b@h>;tag=y").unwrap();
        let ack = TsxKey::create_server(&via, &ack_cseq, &from, &to_tagged, &cid, &uri).unwrap();

        assert_eq!(invite, ack);
    }

    #[test]
    fn test_rfc3261_sent_by_case_insensitive() {
        let (via, cseq, from, to, cid, uri) = parts(
            "SIP/2.0/UDP CLIENT.example.com:5060;branch=z9hG4bKabc",
            "1 OPTIONS",
            "<sip:a@h>;tag=x",
            "<sip:b@h>;tag=y",
        );
        let a = TsxKey::create_server(&via, &cseq, &from, &to, &cid, &uri).unwrap();

        let via_lower = Via::parse("SIP/2.0/UDP client.example.com:5060;branch=z9hG4bKabc").unwrap();
        let b = TsxKey::create_server(&via_lower, &cseq, &from, &to, &cid, &uri).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn test_branch_is_case_sensitive() {
        let (via, cseq, from, to, cid, uri) = parts(
            "SIP/2.0/UDP h:5060;branch=z9hG4bKabc",
            "1 OPTIONS",
            "<sip:a@h>;tag=x",
            "<sip:b@h>;tag=y",
        );
        let a = TsxKey::create_server(&via, &cseq, &from, &to, &cid, &uri).unwrap();

        let via2 = Via::parse("SIP/2.0/UDP h:5060;branch=z9hG4bKABC").unwrap();
        let b = TsxKey::create_server(&via2, &cseq, &from, &to, &cid, &uri).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_rfc2543_fallback() {
        let (via, cseq, from, to, cid, uri) = parts(
            "SIP/2.0/UDP h:5060;branch=1",
            "1 INVITE",
            "<sip:a@h>;tag=x",
            "<sip:b@h>",
        );
        let key = TsxKey::create_server(&via, &cseq, &from, &to, &cid, &uri).unwrap();

        assert_matches!(key, TsxKey::Rfc2543(_));

        // The ACK for a non-2xx final response matches the INVITE even
        // though the To now carries a tag.
        let ack_cseq = CSeq::parse("1 ACK").unwrap();
        let to_tagged = FromTo::parse("<sip:b@h>;tag=y").unwrap();
        let ack = TsxKey::create_server(&via, &ack_cseq, &from, &to_tagged, &cid, &uri).unwrap();

        assert_eq!(key, ack);
    }

    #[test]
    fn test_rfc2543_client_key_matches_stamped_response() {
        // The Via as the request left this endpoint.
        let (via, cseq, from, to, cid, uri) = parts(
            "SIP/2.0/UDP Client.Example.COM:5060;rport;branch=1",
            "1 OPTIONS",
            "<sip:a@h>;tag=x",
            "<sip:b@h>;tag=y",
        );
        let request_key = TsxKey::create_client(&via, &cseq, &from, &to, &cid, &uri).unwrap();

        assert_matches!(request_key, TsxKey::Rfc2543(_));

        // The Via as echoed by the UAS, with received and rport stamped.
        let echoed = Via::parse(
            "SIP/2.0/UDP client.example.com:5060;rport=5080;received=10.0.0.1;branch=1",
        )
        .unwrap();
        let response_key =
            TsxKey::create_client(&echoed, &cseq, &from, &to, &cid, &Uri::default()).unwrap();

        assert_eq!(request_key, response_key);
        assert_eq!(request_key.encode(), response_key.encode());
    }

    #[test]
    fn test_rfc2543_requires_from_tag() {
        let (via, cseq, from, to, cid, uri) = parts(
            "SIP/2.0/UDP h:5060",
            "1 OPTIONS",
            "<sip:a@h>",
            "<sip:b@h>;tag=y",
        );
        let err = TsxKey::create_server(&via, &cseq, &from, &to, &cid, &uri).unwrap_err();

        assert_matches!(err, Error::MissingRequiredHeader("From tag"));
    }
}
