//! Internal certificate authority for external agents.
//!
//! Leaf certificates carry the agent id as subject CN and the `clientAuth`
//! extended key usage. Verification checks the CA signature, the validity
//! window and extracts the agent id.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::{rngs::OsRng, RngCore};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use time::OffsetDateTime;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{parse_x509_certificate, X509Certificate};

use crate::error::{Error, Result};
use crate::hashing::compute_hash_bytes;

/// Issued leaf certificate. The private key leaves this module once.
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub certificate_der: Vec<u8>,
    pub private_key_pem: String,
    pub fingerprint: String,
    pub not_after: DateTime<Utc>,
}

/// Identity proven by a verified client certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateIdentity {
    pub agent_id: String,
    pub fingerprint: String,
    pub not_after: DateTime<Utc>,
}

pub struct CertificateAuthority {
    certificate: Certificate,
    key: KeyPair,
    certificate_der: Vec<u8>,
}

fn crypto(err: impl std::fmt::Display) -> Error {
    Error::Crypto(err.to_string())
}

fn to_offset(ts: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts.timestamp()).map_err(crypto)
}

fn from_unix(ts: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| Error::Unauthenticated(format!("certificate time {} out of range", ts)))
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Positive INTEGER encoding.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

impl CertificateAuthority {
    /// Self-signed ECDSA P-256 CA valid for ten years from `now`.
    pub fn generate(common_name: &str, now: DateTime<Utc>) -> Result<Self> {
        let key = KeyPair::generate().map_err(crypto)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(crypto)?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, common_name);
        name.push(DnType::OrganizationName, "Pandora");
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());
        params.not_before = to_offset(now - Duration::minutes(5))?;
        params.not_after = to_offset(now + Duration::days(3650))?;

        let certificate = params.self_signed(&key).map_err(crypto)?;
        let certificate_der = certificate.der().to_vec();
        Ok(Self {
            certificate,
            key,
            certificate_der,
        })
    }

    pub fn certificate_pem(&self) -> String {
        self.certificate.pem()
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// Sign a client certificate for `agent_id`.
    pub fn issue(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
        validity_days: i64,
    ) -> Result<IssuedCertificate> {
        let leaf_key = KeyPair::generate().map_err(crypto)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(crypto)?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, agent_id);
        name.push(DnType::OrganizationName, "Pandora Agents");
        params.distinguished_name = name;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.serial_number = Some(random_serial());

        let not_after = now + Duration::days(validity_days);
        params.not_before = to_offset(now - Duration::minutes(5))?;
        params.not_after = to_offset(not_after)?;

        let certificate = params
            .signed_by(&leaf_key, &self.certificate, &self.key)
            .map_err(crypto)?;
        let certificate_der = certificate.der().to_vec();
        Ok(IssuedCertificate {
            certificate_pem: certificate.pem(),
            fingerprint: compute_hash_bytes(&certificate_der),
            certificate_der,
            private_key_pem: leaf_key.serialize_pem(),
            // Second precision, as encoded in the certificate.
            not_after: from_unix(not_after.timestamp())?,
        })
    }

    /// Verify a client chain (leaf first) against this CA.
    ///
    /// Only the signature and validity window are checked here; revocation
    /// is the credential store's job.
    pub fn verify(&self, chain: &[Vec<u8>], now: DateTime<Utc>) -> Result<CertificateIdentity> {
        let leaf_der = chain
            .first()
            .ok_or_else(|| Error::Unauthenticated("empty certificate chain".into()))?;
        let (_, leaf) = parse_x509_certificate(leaf_der)
            .map_err(|err| Error::Unauthenticated(format!("unparseable certificate: {}", err)))?;
        let (_, ca) = parse_x509_certificate(&self.certificate_der).map_err(crypto)?;

        leaf.verify_signature(Some(ca.public_key()))
            .map_err(|_| Error::Unauthenticated("certificate not issued by agent CA".into()))?;

        let not_before = from_unix(leaf.validity().not_before.timestamp())?;
        let not_after = from_unix(leaf.validity().not_after.timestamp())?;
        if now < not_before {
            return Err(Error::Unauthenticated("certificate not yet valid".into()));
        }
        if now > not_after {
            return Err(Error::Expired(format!(
                "certificate expired at {}",
                not_after.to_rfc3339()
            )));
        }

        let agent_id = common_name(&leaf)
            .ok_or_else(|| Error::Unauthenticated("certificate has no common name".into()))?;
        Ok(CertificateIdentity {
            agent_id,
            fingerprint: compute_hash_bytes(leaf_der),
            not_after,
        })
    }
}

fn common_name(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

/// DER bytes of a PEM certificate.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let (_, parsed) = parse_x509_pem(pem.as_bytes())
        .map_err(|err| Error::InvalidArgument(format!("invalid PEM certificate: {}", err)))?;
    Ok(parsed.contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify_leaf() {
        let now = Utc::now();
        let ca = CertificateAuthority::generate("Test CA", now).unwrap();
        let leaf = ca.issue("agent-ext-0123456789ab", now, 365).unwrap();
        assert!(leaf.certificate_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(leaf.private_key_pem.contains("PRIVATE KEY"));

        let der = pem_to_der(&leaf.certificate_pem).unwrap();
        assert_eq!(der, leaf.certificate_der);

        let identity = ca.verify(&[der], now).unwrap();
        assert_eq!(identity.agent_id, "agent-ext-0123456789ab");
        assert_eq!(identity.fingerprint, leaf.fingerprint);
        assert_eq!(identity.not_after, leaf.not_after);
    }

    #[test]
    fn test_rejects_foreign_ca_and_expired() {
        let now = Utc::now();
        let ca = CertificateAuthority::generate("Test CA", now).unwrap();
        let other = CertificateAuthority::generate("Other CA", now).unwrap();
        let leaf = other.issue("agent-ext-0123456789ab", now, 30).unwrap();
        assert!(matches!(
            ca.verify(&[leaf.certificate_der], now),
            Err(Error::Unauthenticated(_))
        ));

        let leaf = ca.issue("agent-ext-0123456789ab", now, 30).unwrap();
        assert!(matches!(
            ca.verify(&[leaf.certificate_der], now + Duration::days(31)),
            Err(Error::Expired(_))
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        let ca = CertificateAuthority::generate("Test CA", Utc::now()).unwrap();
        assert!(matches!(
            ca.verify(&[], Utc::now()),
            Err(Error::Unauthenticated(_))
        ));
        assert!(matches!(
            ca.verify(&[vec![1, 2, 3]], Utc::now()),
            Err(Error::Unauthenticated(_))
        ));
    }
}
