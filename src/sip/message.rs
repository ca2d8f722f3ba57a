use super::{
    header::{CSeq, Header, Headers, NameAddr, TypedHeader, Via},
    method::{reason_phrase, Method},
    parser,
    uri::SipUri,
};
use crate::{Error, Result};
use std::fmt;

pub const SIP_VERSION: &str = "SIP/2.0";

/// Accessors shared by requests and responses. Typed values are parsed on
/// each call from the raw header text.
pub trait HasHeaders {
    fn headers(&self) -> &Headers;
    fn headers_mut(&mut self) -> &mut Headers;
    fn body(&self) -> &[u8];

    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers().value(name)
    }

    fn typed_header<T: TypedHeader>(&self, name: &str) -> Result<T> {
        self.headers()
            .get(name)
            .ok_or_else(|| Error::SipMessageError(format!("missing {} header", name)))?
            .typed()
    }

    /// Top-most Via.
    fn via(&self) -> Result<Via> {
        self.typed_header("Via")
    }

    fn call_id(&self) -> Result<&str> {
        self.header_value("Call-ID")
            .map(|v| v.trim())
            .ok_or_else(|| Error::SipMessageError("missing Call-ID header".to_string()))
    }

    fn from_header(&self) -> Result<NameAddr> {
        self.typed_header("From")
    }

    fn to_header(&self) -> Result<NameAddr> {
        self.typed_header("To")
    }

    fn cseq(&self) -> Result<CSeq> {
        self.typed_header("CSeq")
    }

    fn contact(&self) -> Option<NameAddr> {
        self.typed_header("Contact").ok()
    }

    fn record_routes(&self) -> Vec<NameAddr> {
        self.headers()
            .get_all("Record-Route")
            .filter_map(|h| h.typed().ok())
            .collect()
    }

    fn content_type(&self) -> Option<&str> {
        self.header_value("Content-Type").map(|v| v.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: SipUri,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Request {
            method,
            uri,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.header_value("Max-Forwards")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Checks the headers every request must carry.
    pub fn validate(&self) -> Result<()> {
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            if !self.headers.contains(name) {
                return Err(Error::SipMessageError(format!("missing {} header", name)));
            }
        }
        self.via()?;
        self.from_header()?;
        self.to_header()?;
        let cseq = self.cseq()?;
        if cseq.method != self.method {
            return Err(Error::SipMessageError(format!(
                "CSeq method {} does not match {}",
                cseq.method, self.method
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = format!("{} {} {}\r\n", self.method, self.uri, SIP_VERSION).into_bytes();
        write_headers_and_body(&mut buf, &self.headers, &self.body);
        buf
    }
}

impl Response {
    pub fn new(status: u16, reason: Option<&str>) -> Self {
        Response {
            status,
            reason: reason.unwrap_or(reason_phrase(status)).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_final(&self) -> bool {
        self.status >= 200
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = format!("{} {} {}\r\n", SIP_VERSION, self.status, self.reason).into_bytes();
        write_headers_and_body(&mut buf, &self.headers, &self.body);
        buf
    }
}

fn write_headers_and_body(buf: &mut Vec<u8>, headers: &Headers, body: &[u8]) {
    let mut wrote_length = false;
    for header in headers {
        if header.is("Content-Length") {
            if !wrote_length {
                buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
                wrote_length = true;
            }
            continue;
        }
        buf.extend_from_slice(format!("{}\r\n", header).as_bytes());
    }
    if !wrote_length {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
}

impl HasHeaders for Request {
    fn headers(&self) -> &Headers {
        &self.headers
    }
    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
    fn body(&self) -> &[u8] {
        &self.body
    }
}

impl HasHeaders for Response {
    fn headers(&self) -> &Headers {
        &self.headers
    }
    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
    fn body(&self) -> &[u8] {
        &self.body
    }
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        parser::parse_message(data)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }
}

impl HasHeaders for SipMessage {
    fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }
    fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMessage::Request(req) => &mut req.headers,
            SipMessage::Response(resp) => &mut resp.headers,
        }
    }
    fn body(&self) -> &[u8] {
        match self {
            SipMessage::Request(req) => &req.body,
            SipMessage::Response(resp) => &resp.body,
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        SipMessage::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(resp: Response) -> Self {
        SipMessage::Response(resp)
    }
}

impl TryFrom<&[u8]> for SipMessage {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Self> {
        parser::parse_message(data)
    }
}

impl TryFrom<&str> for SipMessage {
    type Error = Error;

    fn try_from(data: &str) -> Result<Self> {
        parser::parse_message(data.as_bytes())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMessage::Request(req) => req.fmt(f),
            SipMessage::Response(resp) => resp.fmt(f),
        }
    }
}

/// Builds a response to `req`: Via, From, To, Call-ID, CSeq and
/// Record-Route are copied, the To tag is added when given and missing.
pub fn make_response(req: &Request, status: u16, reason: Option<&str>, to_tag: Option<&str>) -> Response {
    let mut resp = Response::new(status, reason);
    for header in req.headers.iter() {
        let copy = header.is("Via")
            || header.is("From")
            || header.is("Call-ID")
            || header.is("CSeq")
            || (header.is("Record-Route") && (101..300).contains(&status));
        if copy {
            resp.headers.push(header.clone());
        } else if header.is("To") {
            let to = match to_tag {
                Some(tag) if status > 100 => match header.typed::<NameAddr>() {
                    Ok(to) if to.tag().is_none() => Header::new("To", to.with_tag(tag).to_string()),
                    _ => header.clone(),
                },
                _ => header.clone(),
            };
            resp.headers.push(to);
        }
    }
    resp
}
