use super::{
    method::Method,
    parser,
    uri::{find_param, param_value, remove_param, set_param, HostPort, Param, SipUri},
};
use crate::Result;
use std::fmt;

const COMPACT_FORMS: &[(&str, &str)] = &[
    ("b", "Referred-By"),
    ("c", "Content-Type"),
    ("e", "Content-Encoding"),
    ("f", "From"),
    ("i", "Call-ID"),
    ("k", "Supported"),
    ("l", "Content-Length"),
    ("m", "Contact"),
    ("o", "Event"),
    ("r", "Refer-To"),
    ("s", "Subject"),
    ("t", "To"),
    ("u", "Allow-Events"),
    ("v", "Via"),
    ("x", "Session-Expires"),
    ("y", "Identity"),
];

const KNOWN_NAMES: &[&str] = &[
    "Accept",
    "Allow",
    "Also",
    "Authorization",
    "CSeq",
    "Call-ID",
    "Contact",
    "Content-Length",
    "Content-Type",
    "Date",
    "Expires",
    "From",
    "Identity",
    "Max-Forwards",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Reason",
    "Record-Route",
    "Refer-To",
    "Referred-By",
    "Replaces",
    "Require",
    "Retry-After",
    "Route",
    "Server",
    "Supported",
    "To",
    "User-Agent",
    "Via",
    "WWW-Authenticate",
    "Warning",
];

/// Headers whose comma separated values are split into one entry per value.
pub const MULTI_VALUE_HEADERS: &[&str] = &["Via", "Route", "Record-Route", "Contact"];

/// Expands compact forms and fixes the case of well-known names.
pub fn canonical_name(name: &str) -> String {
    let name = name.trim();
    if name.len() == 1 {
        if let Some((_, full)) = COMPACT_FORMS
            .iter()
            .find(|(short, _)| short.eq_ignore_ascii_case(name))
        {
            return full.to_string();
        }
    }
    KNOWN_NAMES
        .iter()
        .find(|known| known.eq_ignore_ascii_case(name))
        .map(|known| known.to_string())
        .unwrap_or_else(|| name.to_string())
}

/// A raw header. The value is only parsed when a typed accessor asks for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    pub fn new(name: impl AsRef<str>, value: impl Into<String>) -> Self {
        Header {
            name: canonical_name(name.as_ref()),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn typed<T: TypedHeader>(&self) -> Result<T> {
        T::parse(&self.value)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Ordered header list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header)
    }

    pub fn push_front(&mut self, header: Header) {
        self.0.insert(0, header)
    }

    /// Inserts before the first header of the same name, or appends.
    pub fn push_top(&mut self, header: Header) {
        match self.0.iter().position(|h| h.is(header.name())) {
            Some(pos) => self.0.insert(pos, header),
            None => self.0.push(header),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Header> {
        let name = canonical_name(name);
        self.0.iter().find(|h| h.is(&name))
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Header> + 'a {
        let name = canonical_name(name);
        self.0.iter().filter(move |h| h.is(&name))
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(|h| h.value())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes every header with this name.
    pub fn remove(&mut self, name: &str) {
        let name = canonical_name(name);
        self.0.retain(|h| !h.is(&name))
    }

    pub fn remove_first(&mut self, name: &str) -> Option<Header> {
        let name = canonical_name(name);
        let pos = self.0.iter().position(|h| h.is(&name))?;
        Some(self.0.remove(pos))
    }

    /// Sets a single-valued header, keeping the position of the first
    /// existing one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let header = Header::new(name, value);
        match self.0.iter().position(|h| h.is(header.name())) {
            Some(pos) => {
                self.0[pos] = header;
                let mut index = 0;
                self.0.retain(|h| {
                    let keep = index <= pos || !h.is(&canonical_name(name));
                    index += 1;
                    keep
                });
            }
            None => self.0.push(header),
        }
    }

    pub fn retain(&mut self, f: impl FnMut(&Header) -> bool) {
        self.0.retain(f)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Header> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Header>> for Headers {
    fn from(headers: Vec<Header>) -> Self {
        Headers(headers)
    }
}

impl Extend<Header> for Headers {
    fn extend<I: IntoIterator<Item = Header>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

pub trait TypedHeader: Sized {
    fn parse(value: &str) -> Result<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: String,
    pub sent_by: HostPort,
    pub params: Vec<Param>,
}

impl Via {
    pub fn new(transport: &str, sent_by: HostPort, branch: &str) -> Self {
        Via {
            transport: transport.to_ascii_uppercase(),
            sent_by,
            params: vec![Param::new("branch", Some(branch.to_string()))],
        }
    }

    pub fn branch(&self) -> Option<&str> {
        param_value(&self.params, "branch")
    }

    pub fn received(&self) -> Option<&str> {
        param_value(&self.params, "received")
    }

    pub fn rport(&self) -> Option<u16> {
        param_value(&self.params, "rport").and_then(|p| p.parse().ok())
    }

    pub fn has_rport(&self) -> bool {
        find_param(&self.params, "rport").is_some()
    }

    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        set_param(&mut self.params, name, value)
    }

    pub fn remove_param(&mut self, name: &str) {
        remove_param(&mut self.params, name)
    }

    pub fn is_reliable(&self) -> bool {
        !self.transport.eq_ignore_ascii_case("UDP")
    }
}

impl TypedHeader for Via {
    fn parse(value: &str) -> Result<Self> {
        parser::parse_via(value)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by)?;
        for param in &self.params {
            write!(f, "{}", param)?;
        }
        Ok(())
    }
}

impl From<Via> for Header {
    fn from(via: Via) -> Self {
        Header::new("Via", via.to_string())
    }
}

/// `[display-name] <uri>;params`, the shape of From, To, Contact,
/// Route, Record-Route, Refer-To and Also.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: SipUri,
    pub params: Vec<Param>,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        NameAddr {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        param_value(&self.params, "tag")
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.set_tag(tag);
        self
    }

    pub fn set_tag(&mut self, tag: &str) {
        set_param(&mut self.params, "tag", Some(tag.to_string()))
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        param_value(&self.params, name)
    }

    pub fn to_header(&self, name: &str) -> Header {
        Header::new(name, self.to_string())
    }
}

impl TypedHeader for NameAddr {
    fn parse(value: &str) -> Result<Self> {
        parser::parse_name_addr(value)
    }
}

impl std::str::FromStr for NameAddr {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        parser::parse_name_addr(s)
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for param in &self.params {
            write!(f, "{}", param)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl TypedHeader for CSeq {
    fn parse(value: &str) -> Result<Self> {
        parser::parse_cseq(value)
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl From<CSeq> for Header {
    fn from(cseq: CSeq) -> Self {
        Header::new("CSeq", cseq.to_string())
    }
}
