//! HTTP digest authentication for SIP (RFC 2617, RFC 3261 §22, RFC 8760).
use crate::{
    sip::{parser::parse_auth_params, Method, SipUri},
    transaction::random_text,
    transport::RecvTime,
    Error, Result,
};
use md5::Md5;
use sha2::{Digest, Sha256, Sha512_256};
use std::{fmt, str::FromStr};

const CNONCE_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
    Sha512_256,
    Sha512_256Sess,
}

impl DigestAlgorithm {
    fn is_sess(&self) -> bool {
        matches!(
            self,
            DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess | DigestAlgorithm::Sha512_256Sess
        )
    }

    pub fn hash(&self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => hex::encode(Md5::digest(data)),
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                hex::encode(Sha256::digest(data))
            }
            DigestAlgorithm::Sha512_256 | DigestAlgorithm::Sha512_256Sess => {
                hex::encode(Sha512_256::digest(data))
            }
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "MD5-SESS" => Ok(DigestAlgorithm::Md5Sess),
            "SHA-256" => Ok(DigestAlgorithm::Sha256),
            "SHA-256-SESS" => Ok(DigestAlgorithm::Sha256Sess),
            "SHA-512-256" => Ok(DigestAlgorithm::Sha512_256),
            "SHA-512-256-SESS" => Ok(DigestAlgorithm::Sha512_256Sess),
            other => Err(Error::AuthError(format!("unsupported algorithm: {}", other))),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
            DigestAlgorithm::Sha512_256 => "SHA-512-256",
            DigestAlgorithm::Sha512_256Sess => "SHA-512-256-sess",
        };
        f.write_str(name)
    }
}

/// A `WWW-Authenticate` or `Proxy-Authenticate` challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: DigestAlgorithm,
    pub qop: Vec<String>,
    pub opaque: Option<String>,
}

impl FromStr for Challenge {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, params) = parse_auth_params(s)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return Err(Error::AuthError(format!("unsupported scheme: {}", scheme)));
        }
        let get = |name: &str| {
            params
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        Ok(Challenge {
            realm: get("realm").unwrap_or_default(),
            nonce: get("nonce")
                .ok_or_else(|| Error::AuthError("challenge without nonce".to_string()))?,
            algorithm: match get("algorithm") {
                Some(alg) => alg.parse()?,
                None => DigestAlgorithm::Md5,
            },
            qop: get("qop")
                .map(|q| q.split(',').map(|v| v.trim().to_string()).collect())
                .unwrap_or_default(),
            opaque: get("opaque"),
        })
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest realm=\"{}\", algorithm={}, nonce=\"{}\"",
            self.realm, self.algorithm, self.nonce
        )?;
        if !self.qop.is_empty() {
            write!(f, ", qop=\"{}\"", self.qop.join(","))?;
        }
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{}\"", opaque)?;
        }
        Ok(())
    }
}

/// Builds the challenge a server sends. The nonce is the receive time of
/// the challenged request, so a test can recompute it.
pub fn make_challenge(realm: &str, algorithm: DigestAlgorithm, rtime: &RecvTime) -> Challenge {
    Challenge {
        realm: realm.to_string(),
        nonce: format!("{:x}", rtime.wall_nanos()),
        algorithm,
        qop: Vec::new(),
        opaque: None,
    }
}

/// Credentials carried by `Authorization` or `Proxy-Authorization`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: DigestAlgorithm,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
}

impl FromStr for Credentials {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, params) = parse_auth_params(s)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return Err(Error::AuthError(format!("unsupported scheme: {}", scheme)));
        }
        let get = |name: &str| {
            params
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        let required = |name: &str| {
            get(name).ok_or_else(|| Error::AuthError(format!("credentials without {}", name)))
        };
        Ok(Credentials {
            username: required("username")?,
            realm: get("realm").unwrap_or_default(),
            nonce: required("nonce")?,
            uri: required("uri")?,
            response: required("response")?,
            algorithm: match get("algorithm") {
                Some(alg) => alg.parse()?,
                None => DigestAlgorithm::Md5,
            },
            qop: get("qop"),
            nc: get("nc"),
            cnonce: get("cnonce"),
            opaque: get("opaque"),
        })
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
            self.username, self.realm, self.nonce, self.uri, self.response, self.algorithm
        )?;
        if let (Some(qop), Some(nc), Some(cnonce)) = (&self.qop, &self.nc, &self.cnonce) {
            write!(f, ", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce)?;
        }
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{}\"", opaque)?;
        }
        Ok(())
    }
}

/// Inputs of one digest computation.
pub struct DigestInput<'a> {
    pub algorithm: DigestAlgorithm,
    pub username: &'a str,
    pub password: &'a str,
    pub realm: &'a str,
    pub nonce: &'a str,
    pub method: &'a Method,
    pub uri: &'a str,
    pub qop: Option<&'a str>,
    pub nc: Option<&'a str>,
    pub cnonce: Option<&'a str>,
    pub body: &'a [u8],
}

impl DigestInput<'_> {
    pub fn response(&self) -> String {
        let alg = self.algorithm;
        let mut ha1 = alg.hash(format!("{}:{}:{}", self.username, self.realm, self.password).as_bytes());
        if alg.is_sess() {
            ha1 = alg.hash(
                format!("{}:{}:{}", ha1, self.nonce, self.cnonce.unwrap_or_default()).as_bytes(),
            );
        }
        let ha2 = match self.qop {
            Some(qop) if qop.eq_ignore_ascii_case("auth-int") => alg.hash(
                format!("{}:{}:{}", self.method, self.uri, alg.hash(self.body)).as_bytes(),
            ),
            _ => alg.hash(format!("{}:{}", self.method, self.uri).as_bytes()),
        };
        match self.qop {
            Some(qop) => alg.hash(
                format!(
                    "{}:{}:{}:{}:{}:{}",
                    ha1,
                    self.nonce,
                    self.nc.unwrap_or_default(),
                    self.cnonce.unwrap_or_default(),
                    qop,
                    ha2
                )
                .as_bytes(),
            ),
            None => alg.hash(format!("{}:{}:{}", ha1, self.nonce, ha2).as_bytes()),
        }
    }
}

/// Answers `challenge` for a request. `auth` is preferred when the server
/// offers it, `auth-int` is used only when it is the sole option.
pub fn make_credentials(
    challenge: &Challenge,
    cred: &Credential,
    method: &Method,
    uri: &SipUri,
    body: &[u8],
) -> Credentials {
    let qop = if challenge.qop.iter().any(|q| q == "auth") {
        Some("auth".to_string())
    } else if challenge.qop.iter().any(|q| q == "auth-int") {
        Some("auth-int".to_string())
    } else {
        None
    };
    let cnonce = random_text(CNONCE_LEN);
    let nc = "00000001".to_string();
    let uri = uri.to_string();
    let response = DigestInput {
        algorithm: challenge.algorithm,
        username: &cred.username,
        password: &cred.password,
        realm: &challenge.realm,
        nonce: &challenge.nonce,
        method,
        uri: &uri,
        qop: qop.as_deref(),
        nc: Some(&nc),
        cnonce: Some(&cnonce),
        body,
    }
    .response();
    let with_qop = qop.is_some();
    Credentials {
        username: cred.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri,
        response,
        algorithm: challenge.algorithm,
        qop,
        nc: with_qop.then_some(nc),
        cnonce: with_qop.then_some(cnonce),
        opaque: challenge.opaque.clone(),
    }
}

impl Credentials {
    /// Recomputes the response with `password` and compares.
    pub fn verify(&self, password: &str, method: &Method, body: &[u8]) -> bool {
        let expected = DigestInput {
            algorithm: self.algorithm,
            username: &self.username,
            password,
            realm: &self.realm,
            nonce: &self.nonce,
            method,
            uri: &self.uri,
            qop: self.qop.as_deref(),
            nc: self.nc.as_deref(),
            cnonce: self.cnonce.as_deref(),
            body,
        }
        .response();
        expected.eq_ignore_ascii_case(&self.response)
    }
}
