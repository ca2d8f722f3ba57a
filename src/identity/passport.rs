//! PASSporT tokens (RFC 8225) with the SHAKEN extension (RFC 8588), and
//! the SIP Identity header that carries them (RFC 8224).
use crate::{Error, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, NaiveDateTime, Utc};
use jsonwebtoken::{crypto, Algorithm, DecodingKey, EncodingKey};
use serde::{Deserialize, Serialize};

pub const PPT_SHAKEN: &str = "shaken";
pub const ALG_ES256: &str = "ES256";

/// Format of the SIP `Date` header.
const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

// Fields are declared in lexicographic order, the canonical PASSporT form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassportHeader {
    pub alg: String,
    pub ppt: String,
    pub typ: String,
    pub x5u: String,
}

impl PassportHeader {
    pub fn shaken(x5u: &str) -> Self {
        PassportHeader {
            alg: ALG_ES256.to_string(),
            ppt: PPT_SHAKEN.to_string(),
            typ: "passport".to_string(),
            x5u: x5u.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Orig {
    pub tn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dest {
    pub tn: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassportClaims {
    pub attest: String,
    pub dest: Dest,
    pub iat: i64,
    pub orig: Orig,
    pub origid: String,
}

/// A decoded token. `signing_input` and `signature` are kept as received
/// so the signature is checked over the exact bytes that were signed.
#[derive(Debug, Clone)]
pub struct Passport {
    pub header: PassportHeader,
    pub claims: PassportClaims,
    pub signing_input: String,
    pub signature: String,
}

impl Passport {
    pub fn decode(token: &str) -> Result<Self> {
        let mut parts = token.trim().splitn(3, '.');
        let (Some(header), Some(claims), Some(signature)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::IdentityError("token is not a compact JWS".to_string()));
        };
        let decode_part = |part: &str| {
            URL_SAFE_NO_PAD
                .decode(part)
                .map_err(|e| Error::IdentityError(format!("bad base64url: {}", e)))
        };
        Ok(Passport {
            header: serde_json::from_slice(&decode_part(header)?)?,
            claims: serde_json::from_slice(&decode_part(claims)?)?,
            signing_input: format!("{}.{}", header, claims),
            signature: signature.to_string(),
        })
    }

    /// Checks the signature with the public key of the signer's
    /// certificate (the raw EC point of its SubjectPublicKeyInfo).
    pub fn verify_signature(&self, public_key: &[u8]) -> Result<()> {
        if self.header.alg != ALG_ES256 {
            return Err(Error::IdentityError(format!(
                "unsupported alg {}",
                self.header.alg
            )));
        }
        let key = DecodingKey::from_ec_der(public_key);
        match crypto::verify(&self.signature, self.signing_input.as_bytes(), &key, Algorithm::ES256)? {
            true => Ok(()),
            false => Err(Error::IdentityError("signature mismatch".to_string())),
        }
    }
}

/// Signs `claims` and returns the compact token.
pub fn sign(header: &PassportHeader, claims: &PassportClaims, key: &EncodingKey) -> Result<String> {
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?)
    );
    let signature = crypto::sign(signing_input.as_bytes(), key, Algorithm::ES256)?;
    Ok(format!("{}.{}", signing_input, signature))
}

/// Parsed `Identity` header value: `<token>;info=<x5u>;alg=ES256;ppt=shaken`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityHeader {
    pub token: String,
    pub info: Option<String>,
    pub alg: Option<String>,
    pub ppt: Option<String>,
}

impl IdentityHeader {
    pub fn new(token: String, x5u: &str) -> Self {
        IdentityHeader {
            token,
            info: Some(x5u.to_string()),
            alg: Some(ALG_ES256.to_string()),
            ppt: Some(PPT_SHAKEN.to_string()),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let mut params = value.split(';');
        let token = params
            .next()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::IdentityError("empty Identity header".to_string()))?
            .to_string();
        let mut header = IdentityHeader {
            token,
            info: None,
            alg: None,
            ppt: None,
        };
        for param in params {
            let Some((name, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match name.trim().to_ascii_lowercase().as_str() {
                "info" => {
                    header.info = Some(value.trim_start_matches('<').trim_end_matches('>').to_string())
                }
                "alg" => header.alg = Some(value.to_string()),
                "ppt" => header.ppt = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(header)
    }
}

impl std::fmt::Display for IdentityHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token)?;
        if let Some(info) = &self.info {
            write!(f, ";info=<{}>", info)?;
        }
        if let Some(alg) = &self.alg {
            write!(f, ";alg={}", alg)?;
        }
        if let Some(ppt) = &self.ppt {
            write!(f, ";ppt={}", ppt)?;
        }
        Ok(())
    }
}

/// Telephone number as carried in PASSporT claims: digits only, a
/// leading `+` dropped.
pub fn canonical_tn(number: &str) -> Result<String> {
    let digits = number.strip_prefix('+').unwrap_or(number);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::IdentityError(format!(
            "not a telephone number: {:?}",
            number
        )));
    }
    Ok(digits.to_string())
}

pub fn format_date(time: &DateTime<Utc>) -> String {
    time.format(DATE_FORMAT).to_string()
}

pub fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Ok(date.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::IdentityError(format!("bad Date {:?}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_identity_header() {
        let header = IdentityHeader::parse(
            "eyJh.eyJi.c2ln;info=<https://cert.example.org/passport.cer>;alg=ES256;ppt=\"shaken\"",
        )
        .unwrap();
        assert_eq!(header.token, "eyJh.eyJi.c2ln");
        assert_eq!(header.info.as_deref(), Some("https://cert.example.org/passport.cer"));
        assert_eq!(header.ppt.as_deref(), Some("shaken"));
        assert_eq!(
            header.to_string(),
            "eyJh.eyJi.c2ln;info=<https://cert.example.org/passport.cer>;alg=ES256;ppt=shaken"
        );
        assert!(IdentityHeader::parse(" ;info=<x>").is_err());
    }

    #[test]
    fn test_date_round_trip() {
        let time = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let formatted = format_date(&time);
        assert_eq!(formatted, "Tue, 05 Mar 2024 07:08:09 GMT");
        assert_eq!(parse_date(&formatted).unwrap(), time);
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn test_canonical_tn() {
        assert_eq!(canonical_tn("+12155551212").unwrap(), "12155551212");
        assert!(canonical_tn("alice").is_err());
        assert!(canonical_tn("+").is_err());
    }

    #[test]
    fn test_claims_are_canonical() {
        let claims = PassportClaims {
            attest: "A".to_string(),
            dest: Dest {
                tn: vec!["12155551213".to_string()],
            },
            iat: 1443208345,
            orig: Orig {
                tn: "12155551212".to_string(),
            },
            origid: "123e4567-e89b-12d3-a456-426655440000".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&claims).unwrap(),
            r#"{"attest":"A","dest":{"tn":["12155551213"]},"iat":1443208345,"orig":{"tn":"12155551212"},"origid":"123e4567-e89b-12d3-a456-426655440000"}"#
        );
        assert_eq!(
            serde_json::to_string(&PassportHeader::shaken("https://x")).unwrap(),
            r#"{"alg":"ES256","ppt":"shaken","typ":"passport","x5u":"https://x"}"#
        );
    }
}
