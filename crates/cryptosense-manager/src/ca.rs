//! Self-issued certificate authority for sensor mTLS.
//!
//! ```text
//! <ca_dir>/
//!   ca.pem   # CA certificate, handed to sensors as server_ca_cert
//!   ca.key   # CA private key (0600)
//! ```

use std::fs;
use std::io::Write;
use std::path::Path;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};

use crate::error::Result;

pub const CA_CERT_FILE: &str = "ca.pem";
pub const CA_KEY_FILE: &str = "ca.key";

const CA_COMMON_NAME: &str = "CryptoSense Sensor CA";
const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Backdating absorbs clock skew between manager and sensors.
const BACKDATE_MINUTES: i64 = 5;

/// A certificate and its private key, PEM encoded.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

pub struct CertificateAuthority {
    cert: Certificate,
    key: KeyPair,
    /// PEM as distributed to sensors. For a loaded CA this is the file
    /// content, not a re-encoding.
    cert_pem: String,
}

impl CertificateAuthority {
    /// A fresh ECDSA P-256 CA valid for ten years.
    pub fn generate() -> Result<Self> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "CryptoSense");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(BACKDATE_MINUTES);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();
        tracing::info!(common_name = CA_COMMON_NAME, "Generated certificate authority");
        Ok(Self { cert, key, cert_pem })
    }

    /// Load the CA from `dir`, creating and persisting one if absent.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path)?;
            let key = KeyPair::from_pem(&fs::read_to_string(&key_path)?)?;
            // Re-signing the parsed params yields an issuer with the same
            // subject and key, so leaves chain to the stored ca.pem.
            let cert = CertificateParams::from_ca_cert_pem(&cert_pem)?.self_signed(&key)?;
            tracing::info!(path = %cert_path.display(), "Loaded certificate authority");
            return Ok(Self { cert, key, cert_pem });
        }

        let ca = Self::generate()?;
        fs::create_dir_all(dir)?;
        fs::write(&cert_path, &ca.cert_pem)?;
        write_private(&key_path, ca.key.serialize_pem().as_bytes())?;
        tracing::info!(path = %cert_path.display(), "Persisted certificate authority");
        Ok(ca)
    }

    /// Use `dir` when configured, otherwise an ephemeral CA.
    pub fn from_config(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Self::load_or_create(dir),
            None => {
                tracing::warn!("No ca_dir configured, issuing from an ephemeral CA");
                Self::generate()
            }
        }
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Client certificate for a sensor: CN and DNS SAN are the sensor name,
    /// extended key usage is client authentication.
    pub fn issue_client(&self, name: &str) -> Result<IssuedCert> {
        self.issue(
            name,
            vec![name.to_string()],
            ExtendedKeyUsagePurpose::ClientAuth,
        )
    }

    /// Server certificate for the control plane itself.
    pub fn issue_server(&self, names: &[String]) -> Result<IssuedCert> {
        let cn = names.first().map(String::as_str).unwrap_or("localhost");
        self.issue(cn, names.to_vec(), ExtendedKeyUsagePurpose::ServerAuth)
    }

    fn issue(
        &self,
        common_name: &str,
        sans: Vec<String>,
        usage: ExtendedKeyUsagePurpose,
    ) -> Result<IssuedCert> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(sans)?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![usage];
        params.use_authority_key_identifier_extension = true;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(BACKDATE_MINUTES);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        tracing::debug!(common_name, "Issued certificate");
        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::pem::parse_x509_pem;

    #[test]
    fn issues_client_certificates() {
        let ca = CertificateAuthority::generate().unwrap();
        assert!(ca.cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));

        let leaf = ca.issue_client("edge-1").unwrap();
        assert!(leaf.key_pem.contains("PRIVATE KEY"));

        let (_, pem) = parse_x509_pem(leaf.cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        assert!(!cert.is_ca());
        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.client_auth);
        assert!(!eku.value.server_auth);
        assert!(cert.subject().to_string().contains("edge-1"));

        let (_, ca_pem) = parse_x509_pem(ca.cert_pem().as_bytes()).unwrap();
        let ca_cert = ca_pem.parse_x509().unwrap();
        assert!(ca_cert.is_ca());
        assert_eq!(cert.issuer(), ca_cert.subject());
    }

    #[test]
    fn ca_is_persisted_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let first = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let second = CertificateAuthority::load_or_create(dir.path()).unwrap();
        assert_eq!(first.cert_pem(), second.cert_pem());
        assert!(second.issue_client("edge-2").is_ok());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join(CA_KEY_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn server_certificate_names() {
        let ca = CertificateAuthority::generate().unwrap();
        let names = vec!["localhost".to_string(), "cp.internal".to_string()];
        let server = ca.issue_server(&names).unwrap();

        let (_, pem) = parse_x509_pem(server.cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert_eq!(san.value.general_names.len(), 2);
        assert!(cert.extended_key_usage().unwrap().unwrap().value.server_auth);
    }
}
