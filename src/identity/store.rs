use crate::{Error, Result};
use std::{collections::HashMap, path::Path};
use x509_parser::{parse_x509_certificate, pem::Pem};

/// Resolves the certificate an `x5u` URL points to.
pub trait CertificateStore: Send + Sync {
    /// DER encoding of the signer certificate published at `x5u`.
    fn certificate(&self, x5u: &str) -> Result<Vec<u8>>;

    /// Checks that `der` chains to a trusted root and is currently valid.
    fn check_chain(&self, der: &[u8]) -> Result<()>;
}

/// Certificates loaded from local PEM files, checked against a root bundle.
#[derive(Default)]
pub struct FileCertificateStore {
    certificates: HashMap<String, Vec<u8>>,
    roots: Vec<Vec<u8>>,
}

impl FileCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roots(path: impl AsRef<Path>) -> Result<Self> {
        let mut store = Self::new();
        store.roots = load_pem_certificates(path.as_ref())?;
        if store.roots.is_empty() {
            return Err(Error::IdentityError(format!(
                "no certificate in root bundle {}",
                path.as_ref().display()
            )));
        }
        Ok(store)
    }

    pub fn add_root(&mut self, der: Vec<u8>) {
        self.roots.push(der);
    }

    pub fn insert(&mut self, x5u: &str, der: Vec<u8>) {
        self.certificates.insert(x5u.to_string(), der);
    }

    /// Serves the first certificate in `path` for `x5u`.
    pub fn insert_file(&mut self, x5u: &str, path: impl AsRef<Path>) -> Result<()> {
        let der = load_pem_certificates(path.as_ref())?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::IdentityError(format!("no certificate in {}", path.as_ref().display()))
            })?;
        self.insert(x5u, der);
        Ok(())
    }
}

impl CertificateStore for FileCertificateStore {
    fn certificate(&self, x5u: &str) -> Result<Vec<u8>> {
        self.certificates
            .get(x5u)
            .cloned()
            .ok_or_else(|| Error::IdentityError(format!("unknown certificate {}", x5u)))
    }

    fn check_chain(&self, der: &[u8]) -> Result<()> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| Error::IdentityError(format!("bad certificate: {}", e)))?;
        if !cert.validity().is_valid() {
            return Err(Error::IdentityError(format!(
                "certificate {} is not valid now",
                cert.subject()
            )));
        }
        for root in &self.roots {
            let Ok((_, root)) = parse_x509_certificate(root) else {
                continue;
            };
            if root.subject().as_raw() != cert.issuer().as_raw() {
                continue;
            }
            if cert.verify_signature(Some(root.public_key())).is_ok() {
                return Ok(());
            }
        }
        Err(Error::IdentityError(format!(
            "certificate {} does not chain to a trusted root",
            cert.subject()
        )))
    }
}

/// Raw EC point of the certificate's subject public key.
pub fn public_key(der: &[u8]) -> Result<Vec<u8>> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| Error::IdentityError(format!("bad certificate: {}", e)))?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

pub fn load_pem_certificates(path: &Path) -> Result<Vec<Vec<u8>>> {
    let data = std::fs::read(path)?;
    let mut certificates = Vec::new();
    for pem in Pem::iter_from_buffer(&data) {
        let pem = pem.map_err(|e| {
            Error::IdentityError(format!("bad PEM in {}: {}", path.display(), e))
        })?;
        if pem.label == "CERTIFICATE" {
            certificates.push(pem.contents);
        }
    }
    Ok(certificates)
}
