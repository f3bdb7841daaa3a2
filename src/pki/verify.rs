//! Certificate inspection for `debug-cert` and issuance checks

use std::net::IpAddr;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;
use crate::{Error, Result};

/// Summary of one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_after: String,
    pub ip_sans: Vec<IpAddr>,
    pub dns_sans: Vec<String>,
}

fn invalid(reason: impl ToString) -> Error {
    Error::Certificate {
        path: "<pem>".into(),
        reason: reason.to_string(),
    }
}

/// Decode the first PEM block and run `f` on the parsed certificate
fn with_cert<T>(pem: &[u8], f: impl FnOnce(&X509Certificate<'_>) -> Result<T>) -> Result<T> {
    let (_, pem) = parse_x509_pem(pem).map_err(|e| invalid(format!("bad PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| invalid(format!("bad certificate: {}", e)))?;
    f(&cert)
}

/// Whether `cert_pem` carries a valid signature from `ca_pem`'s key
pub fn signed_by(cert_pem: &[u8], ca_pem: &[u8]) -> Result<bool> {
    with_cert(ca_pem, |ca| {
        with_cert(cert_pem, |cert| {
            Ok(cert.verify_signature(Some(ca.public_key())).is_ok())
        })
    })
}

/// Subject alternative names of a certificate
fn sans(cert: &X509Certificate<'_>) -> Result<(Vec<IpAddr>, Vec<String>)> {
    let mut ips = Vec::new();
    let mut names = Vec::new();
    let ext = cert.subject_alternative_name().map_err(invalid)?;
    if let Some(ext) = ext {
        for name in &ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        ips.push(ip);
                    }
                }
                _ => {}
            }
        }
    }
    Ok((ips, names))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Whether `host` (an address or DNS name) is covered by the certificate's SANs
pub fn matches_host(cert_pem: &[u8], host: &str) -> Result<bool> {
    with_cert(cert_pem, |cert| {
        let (ips, names) = sans(cert)?;
        Ok(match host.parse::<IpAddr>() {
            Ok(ip) => ips.contains(&ip),
            Err(_) => names.iter().any(|n| n.eq_ignore_ascii_case(host)),
        })
    })
}

pub fn inspect(cert_pem: &[u8]) -> Result<CertificateInfo> {
    with_cert(cert_pem, |cert| {
        let (ip_sans, dns_sans) = sans(cert)?;
        Ok(CertificateInfo {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_after: cert.validity().not_after.to_string(),
            ip_sans,
            dns_sans,
        })
    })
}

/// Name of the first candidate authority that signed `cert_pem`
pub fn find_issuer<'a>(cert_pem: &[u8], candidates: &'a [(String, Vec<u8>)]) -> Result<Option<&'a str>> {
    for (name, ca_pem) in candidates {
        if signed_by(cert_pem, ca_pem)? {
            return Ok(Some(name.as_str()));
        }
    }
    Ok(None)
}
