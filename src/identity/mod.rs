//! STIR/SHAKEN caller identity: signing outbound calls and verifying the
//! `Identity` header of inbound ones.
use crate::{config::StirShakenConfig, Error, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::EncodingKey;
use std::sync::Arc;
use tracing::debug;

pub mod passport;
pub mod store;

pub use passport::{IdentityHeader, Passport, PassportClaims, PassportHeader};
pub use store::{CertificateStore, FileCertificateStore};

/// Maximum distance between `Date`, `iat` and the local clock.
pub const MAX_CLOCK_SKEW: i64 = 60;

struct Signer {
    attest: String,
    origid: String,
    x5u: String,
    key: EncodingKey,
}

pub struct Identity {
    signer: Option<Signer>,
    store: Option<Arc<dyn CertificateStore>>,
}

impl Identity {
    pub fn new(
        attest: &str,
        origid: &str,
        x5u: &str,
        key_pem: &[u8],
        store: Option<Arc<dyn CertificateStore>>,
    ) -> Result<Self> {
        Ok(Identity {
            signer: Some(Signer {
                attest: attest.to_string(),
                origid: origid.to_string(),
                x5u: x5u.to_string(),
                key: EncodingKey::from_ec_pem(key_pem)?,
            }),
            store,
        })
    }

    /// Loads the signing key, and when verification is on, the root bundle
    /// plus our own certificate published at `x5u`.
    pub fn from_config(config: &StirShakenConfig) -> Result<Self> {
        let key_pem = std::fs::read(&config.pkey_file).map_err(|e| {
            Error::ConfigError(format!("{}: {}", config.pkey_file.display(), e))
        })?;
        let store: Option<Arc<dyn CertificateStore>> = if config.verify {
            let mut store = FileCertificateStore::with_roots(&config.root_certs)?;
            store.insert_file(&config.x5u, &config.cert_file)?;
            Some(Arc::new(store))
        } else {
            None
        };
        Self::new(&config.attest, &config.origid, &config.x5u, &key_pem, store)
    }

    pub fn verifies(&self) -> bool {
        self.store.is_some()
    }

    /// Returns the `Date` and `Identity` header values for a call from
    /// `orig` to `dest`.
    pub fn authenticate(&self, orig: &str, dest: &str, now: DateTime<Utc>) -> Result<(String, String)> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| Error::IdentityError("no signing key".to_string()))?;
        let claims = PassportClaims {
            attest: signer.attest.clone(),
            dest: passport::Dest {
                tn: vec![passport::canonical_tn(dest)?],
            },
            iat: now.timestamp(),
            orig: passport::Orig {
                tn: passport::canonical_tn(orig)?,
            },
            origid: signer.origid.clone(),
        };
        let token = passport::sign(&PassportHeader::shaken(&signer.x5u), &claims, &signer.key)?;
        Ok((
            passport::format_date(&now),
            IdentityHeader::new(token, &signer.x5u).to_string(),
        ))
    }

    pub fn verify(
        &self,
        identity: &str,
        orig: &str,
        dest: &str,
        date: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::IdentityError("verification is off".to_string()))?;
        let header = IdentityHeader::parse(identity)?;
        if let Some(ppt) = &header.ppt {
            if ppt != passport::PPT_SHAKEN {
                return Err(Error::IdentityError(format!("unsupported ppt {}", ppt)));
            }
        }
        let passport = Passport::decode(&header.token)?;
        if passport.header.ppt != passport::PPT_SHAKEN {
            return Err(Error::IdentityError(format!(
                "unsupported ppt {}",
                passport.header.ppt
            )));
        }

        let date = passport::parse_date(
            date.ok_or_else(|| Error::IdentityError("missing Date header".to_string()))?,
        )?;
        if (now - date).num_seconds().abs() > MAX_CLOCK_SKEW {
            return Err(Error::IdentityError(format!("stale Date {}", date)));
        }
        if (passport.claims.iat - date.timestamp()).abs() > MAX_CLOCK_SKEW {
            return Err(Error::IdentityError(format!(
                "iat {} does not match Date {}",
                passport.claims.iat, date
            )));
        }
        if passport.claims.orig.tn != passport::canonical_tn(orig)? {
            return Err(Error::IdentityError(format!(
                "orig {} does not match {}",
                passport.claims.orig.tn, orig
            )));
        }
        let dest = passport::canonical_tn(dest)?;
        if !passport.claims.dest.tn.iter().any(|tn| *tn == dest) {
            return Err(Error::IdentityError(format!("dest does not include {}", dest)));
        }

        let certificate = store.certificate(&passport.header.x5u)?;
        store.check_chain(&certificate)?;
        passport.verify_signature(&store::public_key(&certificate)?)?;
        debug!(orig = %orig, dest = %dest, attest = %passport.claims.attest, "identity verified");
        Ok(())
    }
}
