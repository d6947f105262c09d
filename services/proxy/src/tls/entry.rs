//! Parsed, ready-to-serve certificate.

use std::fmt;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rcgen::{CertificateParams, SanType};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use x509_parser::x509::X509Name;

use crate::error::CertificateError;

/// One certificate and its key, as served to TLS clients.
///
/// Entries are immutable. Rotation publishes a new entry instead of
/// modifying the active one.
pub struct CertificateEntry {
    pub identity: String,
    /// PEM encoded chain, leaf first.
    pub cert_pem: String,
    /// PKCS#8 (or PKCS#1/SEC1 for custom files) PEM encoded private key.
    pub key_pem: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    /// Lowercase hex, without leading zero bytes.
    pub serial: String,
    pub subject: String,
    pub issuer: String,
    certified_key: Arc<CertifiedKey>,
}

/// Human-readable summary of the active certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl CertificateEntry {
    /// Parse a PEM chain and key into an entry.
    ///
    /// `source` names where the PEM came from, for error messages.
    pub fn from_pem(
        identity: &str,
        cert_pem: String,
        key_pem: String,
        source: &Path,
    ) -> Result<Self, CertificateError> {
        let load_failed = |reason: String| CertificateError::LoadFailed {
            path: source.to_path_buf(),
            reason,
        };

        let chain = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()
            .map_err(|e| load_failed(format!("invalid certificate PEM: {e}")))?;
        let leaf = chain
            .first()
            .ok_or_else(|| load_failed("no certificate found".to_string()))?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
            .map_err(|e| load_failed(format!("invalid private key PEM: {e}")))?
            .ok_or_else(|| load_failed("no private key found".to_string()))?;
        let signing_key = any_supported_type(&key)
            .map_err(|e| load_failed(format!("unsupported private key: {e}")))?;

        let params = CertificateParams::from_ca_cert_der(leaf)
            .map_err(|e| load_failed(format!("failed to parse certificate: {e}")))?;

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        for san in &params.subject_alt_names {
            match san {
                SanType::DnsName(name) => dns_names.push(name.as_str().to_string()),
                SanType::IpAddress(ip) => ip_addresses.push(*ip),
                _ => {}
            }
        }

        let serial = params
            .serial_number
            .as_ref()
            .map(|serial| serial_hex(&serial.to_bytes()))
            .unwrap_or_default();
        let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| load_failed(format!("failed to parse certificate: {e}")))?;
        let subject = name_string(parsed.subject());
        let issuer = name_string(parsed.issuer());

        Ok(Self {
            identity: identity.to_string(),
            not_before: params.not_before,
            not_after: params.not_after,
            dns_names,
            ip_addresses,
            serial,
            issuer,
            subject,
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
            cert_pem,
            key_pem,
        })
    }

    /// Key material in the form rustls serves.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    /// True if `not_after` is at most `threshold` away from `now`.
    pub fn expires_within(&self, threshold: Duration, now: OffsetDateTime) -> bool {
        self.not_after - now <= threshold
    }

    pub fn info(&self) -> CertificateInfo {
        CertificateInfo {
            subject: self.subject.clone(),
            issuer: self.issuer.clone(),
            serial: self.serial.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            dns_names: self.dns_names.clone(),
            ip_addresses: self.ip_addresses.clone(),
        }
    }
}

impl fmt::Debug for CertificateEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateEntry")
            .field("identity", &self.identity)
            .field("serial", &self.serial)
            .field("not_after", &self.not_after)
            .field("dns_names", &self.dns_names)
            .field("ip_addresses", &self.ip_addresses)
            .finish_non_exhaustive()
    }
}

/// Hex-encode a DER integer, dropping leading zero bytes.
pub(crate) fn serial_hex(bytes: &[u8]) -> String {
    let significant = bytes
        .iter()
        .position(|b| *b != 0)
        .map_or(&bytes[bytes.len()..], |start| &bytes[start..]);
    significant.iter().map(|b| format!("{b:02x}")).collect()
}

/// Common name if present, otherwise the full RFC 4514 form.
fn name_string(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map_or_else(|| name.to_string(), str::to_string)
}
