use crate::{
    sip::{HasHeaders, HostPort, Method, Request, Response},
    transaction::BRANCH_MAGIC,
    Result,
};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

impl fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionRole::Client => write!(f, "c"),
            TransactionRole::Server => write!(f, "s"),
        }
    }
}

/// Key of a transaction whose top Via carries an RFC 3261 branch.
///
/// Server keys include the Via sent-by, client keys leave it empty: the
/// branch was generated here and is unique on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rfc3261 {
    pub role: TransactionRole,
    pub branch: String,
    pub method: Method,
    pub sent_by: HostPort,
}

/// Key of a transaction from a pre-RFC 3261 peer, built from the dialog
/// identifiers and the CSeq.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rfc2543 {
    pub role: TransactionRole,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: String,
    pub call_id: String,
    pub via_host_port: HostPort,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum TransactionKey {
    RFC3261(Rfc3261),
    RFC2543(Rfc2543),
    Invalid,
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKey::RFC3261(key) => write!(
                f,
                "{}.{}({})[{}]",
                key.role, key.method, key.branch, key.sent_by
            ),
            TransactionKey::RFC2543(key) => write!(
                f,
                "{}.{} {}/{} {}[{}]",
                key.role, key.method, key.call_id, key.cseq, key.from_tag, key.via_host_port
            ),
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

// ACK belongs to the INVITE transaction it acknowledges, CANCEL has its own.
fn key_method(method: &Method) -> Method {
    match method {
        Method::Ack => Method::Invite,
        other => other.clone(),
    }
}

impl TransactionKey {
    pub fn from_request(req: &Request, role: TransactionRole) -> Result<Self> {
        let via = req.via()?;
        let method = key_method(&req.method);
        match via.branch() {
            Some(branch) if branch.starts_with(BRANCH_MAGIC) => {
                let sent_by = match role {
                    TransactionRole::Server => via.sent_by.clone(),
                    TransactionRole::Client => HostPort::default(),
                };
                Ok(TransactionKey::RFC3261(Rfc3261 {
                    role,
                    branch: branch.to_string(),
                    method,
                    sent_by,
                }))
            }
            _ => Ok(TransactionKey::RFC2543(Rfc2543 {
                role,
                method,
                cseq: req.cseq()?.seq,
                from_tag: req.from_header()?.tag().unwrap_or_default().to_string(),
                call_id: req.call_id()?.to_string(),
                via_host_port: via.sent_by,
            })),
        }
    }

    /// Key of the client transaction a response belongs to.
    pub fn from_response(resp: &Response) -> Result<Self> {
        let via = resp.via()?;
        let cseq = resp.cseq()?;
        let method = key_method(&cseq.method);
        match via.branch() {
            Some(branch) if branch.starts_with(BRANCH_MAGIC) => {
                Ok(TransactionKey::RFC3261(Rfc3261 {
                    role: TransactionRole::Client,
                    branch: branch.to_string(),
                    method,
                    sent_by: HostPort::default(),
                }))
            }
            _ => Ok(TransactionKey::RFC2543(Rfc2543 {
                role: TransactionRole::Client,
                method,
                cseq: cseq.seq,
                from_tag: resp.from_header()?.tag().unwrap_or_default().to_string(),
                call_id: resp.call_id()?.to_string(),
                via_host_port: via.sent_by,
            })),
        }
    }

    /// Same transaction identity with another method, used to find the
    /// INVITE a CANCEL refers to.
    pub fn with_method(&self, method: Method) -> Self {
        match self {
            TransactionKey::RFC3261(key) => TransactionKey::RFC3261(Rfc3261 {
                method,
                ..key.clone()
            }),
            TransactionKey::RFC2543(key) => TransactionKey::RFC2543(Rfc2543 {
                method,
                ..key.clone()
            }),
            TransactionKey::Invalid => TransactionKey::Invalid,
        }
    }

    pub fn method(&self) -> Option<&Method> {
        match self {
            TransactionKey::RFC3261(key) => Some(&key.method),
            TransactionKey::RFC2543(key) => Some(&key.method),
            TransactionKey::Invalid => None,
        }
    }

    pub fn role(&self) -> Option<TransactionRole> {
        match self {
            TransactionKey::RFC3261(key) => Some(key.role),
            TransactionKey::RFC2543(key) => Some(key.role),
            TransactionKey::Invalid => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::SipMessage;

    fn request(raw: &str) -> Request {
        match SipMessage::try_from(raw).expect("parse request") {
            SipMessage::Request(req) => req,
            _ => panic!("expected a request"),
        }
    }

    #[test]
    fn test_ack_and_cancel_keys() -> Result<()> {
        let invite = request(
            "INVITE sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP client.example.com:5061;branch=z9hG4bKnashd92\r\n\
From: Bob <sip:bob@example.com>;tag=ja743ks76zlflH\r\n\
To: <sip:alice@example.com>\r\n\
Call-ID: 1j9FpLxk3uxtm8tn@example.com\r\n\
CSeq: 2 INVITE\r\n\r\n",
        );
        let ack = request(
            "ACK sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP client.example.com:5061;branch=z9hG4bKnashd92\r\n\
From: Bob <sip:bob@example.com>;tag=ja743ks76zlflH\r\n\
To: <sip:alice@example.com>;tag=x\r\n\
Call-ID: 1j9FpLxk3uxtm8tn@example.com\r\n\
CSeq: 2 ACK\r\n\r\n",
        );
        let cancel = request(
            "CANCEL sip:bob@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP client.example.com:5061;branch=z9hG4bKnashd92\r\n\
From: Bob <sip:bob@example.com>;tag=ja743ks76zlflH\r\n\
To: <sip:alice@example.com>\r\n\
Call-ID: 1j9FpLxk3uxtm8tn@example.com\r\n\
CSeq: 2 CANCEL\r\n\r\n",
        );
        let invite_key = TransactionKey::from_request(&invite, TransactionRole::Server)?;
        let ack_key = TransactionKey::from_request(&ack, TransactionRole::Server)?;
        let cancel_key = TransactionKey::from_request(&cancel, TransactionRole::Server)?;
        assert_eq!(invite_key, ack_key);
        assert_ne!(invite_key, cancel_key);
        assert_eq!(cancel_key.with_method(Method::Invite), invite_key);

        let client_key = TransactionKey::from_request(&invite, TransactionRole::Client)?;
        assert_ne!(client_key, invite_key);
        Ok(())
    }

    #[test]
    fn test_response_matches_client_key() -> Result<()> {
        let raw = "REGISTER sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK776asdhds\r\n\
From: <sip:bob@example.com>;tag=456248\r\n\
To: <sip:bob@example.com>\r\n\
Call-ID: 843817637684230@998sdasdh09\r\n\
CSeq: 1826 REGISTER\r\n\r\n";
        let req = request(raw);
        let resp = crate::sip::make_response(&req, 200, None, Some("t1"));
        assert_eq!(
            TransactionKey::from_response(&resp)?,
            TransactionKey::from_request(&req, TransactionRole::Client)?
        );
        Ok(())
    }

    #[test]
    fn test_rfc2543_fallback() -> Result<()> {
        let req = request(
            "OPTIONS sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP old.example.com\r\n\
From: <sip:a@example.com>;tag=1\r\n\
To: <sip:b@example.com>\r\n\
Call-ID: abc\r\n\
CSeq: 7 OPTIONS\r\n\r\n",
        );
        match TransactionKey::from_request(&req, TransactionRole::Server)? {
            TransactionKey::RFC2543(key) => {
                assert_eq!(key.cseq, 7);
                assert_eq!(key.call_id, "abc");
                assert_eq!(key.from_tag, "1");
            }
            other => panic!("unexpected key {}", other),
        }
        Ok(())
    }
}
