/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Local certificate authorities used to sign test certificate requests.
//!
//! Every signer keeps its CA material in its own directory below the signer root:
//!
//! - `ca-key.pem`: the CA private key
//! - `ca-cert.pem`: the self-signed CA certificate
//! - `root-cert.pem`: the root certificate handed out to trust the issued chains
//!
//! Material that already exists on disk is reused, so signers survive restarts of the
//! test harness.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::consts::{
    CA_CERT_FILE, CA_KEY_FILE, CLOCK_SKEW_ALLOWANCE, ROOT_CERT_FILE, SIGNER_CA_VALIDITY,
};
use crate::{Error, Result};

const SIGNER_ORGANIZATION: &str = "csrctrl test signer";

/// Certificate authority for a single signer name.
///
/// The key is kept as PEM since `KeyPair` is not `Clone`; it is parsed again on every
/// signing operation.
#[derive(Clone)]
pub struct Signer {
    name: String,
    cert_ttl: Duration,
    root_cert_path: PathBuf,
    ca_cert_pem: String,
    ca_key_pem: String,
}

impl Signer {
    /// Load the signer `name` from `signer_root`, generating its CA when none exists yet.
    pub fn new<P: AsRef<Path>>(signer_root: P, name: &str, cert_ttl: Duration) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::SignerError(
                name.to_string(),
                "signer name is empty".to_string(),
            ));
        }

        let dir = signer_dir(signer_root.as_ref(), name);
        fs::create_dir_all(&dir).map_err(|e| signer_error(name, e))?;

        let key_path = dir.join(CA_KEY_FILE);
        let cert_path = dir.join(CA_CERT_FILE);
        let root_cert_path = dir.join(ROOT_CERT_FILE);

        let existing = key_path.try_exists().map_err(|e| signer_error(name, e))?
            && cert_path.try_exists().map_err(|e| signer_error(name, e))?;

        let (ca_cert_pem, ca_key_pem) = if existing {
            debug!("loading CA for signer {name} from {}", dir.display());
            let key = fs::read_to_string(&key_path).map_err(|e| signer_error(name, e))?;
            let cert = fs::read_to_string(&cert_path).map_err(|e| signer_error(name, e))?;
            (cert, key)
        } else {
            info!("generating CA for signer {name} in {}", dir.display());
            let (cert, key) = generate_ca(name)?;
            fs::write(&key_path, &key).map_err(|e| signer_error(name, e))?;
            fs::write(&cert_path, &cert).map_err(|e| signer_error(name, e))?;
            (cert, key)
        };

        // the root certificate must always be the CA that issues
        let root_cert = match fs::read_to_string(&root_cert_path) {
            Ok(root_cert) => Some(root_cert),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(signer_error(name, e)),
        };
        if root_cert.as_deref() != Some(ca_cert_pem.as_str()) {
            fs::write(&root_cert_path, &ca_cert_pem).map_err(|e| signer_error(name, e))?;
        }

        let signer = Self {
            name: name.to_string(),
            cert_ttl,
            root_cert_path,
            ca_cert_pem,
            ca_key_pem,
        };

        // the key and the certificate must form a usable issuer
        let ca_key = signer.load_key_pair()?;
        Issuer::from_ca_cert_pem(&signer.ca_cert_pem, &ca_key)
            .map_err(|e| Error::SignerError(name.to_string(), e.to_string()))?;

        Ok(signer)
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Default and maximum lifetime of the certificates issued by this signer.
    pub fn cert_ttl(&self) -> Duration {
        self.cert_ttl
    }

    /// Path of the root certificate file.
    pub fn root_cert_path(&self) -> &Path {
        self.root_cert_path.as_path()
    }

    /// Sign a PEM encoded certificate request.
    ///
    /// The subject and subject alternative names are taken from the request, the key
    /// usages from `usages` (Kubernetes `KeyUsage` strings). The returned PEM chain holds
    /// the issued certificate, followed by the root certificate if `append_root_cert` is
    /// set.
    pub fn sign(
        &self,
        csr_pem: &str,
        usages: &[String],
        requested_lifetime: Duration,
        append_root_cert: bool,
    ) -> Result<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| Error::InvalidRequestError(e.to_string()))?;

        let (key_usages, extended_key_usages) = parse_usages(usages)?;

        let now = OffsetDateTime::now_utc();
        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = key_usages;
        csr.params.extended_key_usages = extended_key_usages;
        csr.params.not_before = now - CLOCK_SKEW_ALLOWANCE;
        csr.params.not_after = now + requested_lifetime;
        csr.params.use_authority_key_identifier_extension = true;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| Error::SigningError(format!("failed to create issuer: {e}")))?;

        let cert = csr
            .signed_by(&issuer)
            .map_err(|e| Error::SigningError(e.to_string()))?;

        let mut chain = cert.pem();
        if append_root_cert {
            if !chain.ends_with('\n') {
                chain.push('\n');
            }
            chain.push_str(&self.ca_cert_pem);
        }
        Ok(chain)
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| Error::SignerError(self.name.clone(), format!("invalid CA key: {e}")))
    }
}

/// Directory of a signer below the signer root.
///
/// Signer names usually look like `example.com/foo`, the `/` is replaced to keep a
/// single directory level.
pub fn signer_dir(signer_root: &Path, name: &str) -> PathBuf {
    signer_root.join(name.replace('/', "_"))
}

fn signer_error(name: &str, e: std::io::Error) -> Error {
    Error::SignerError(name.to_string(), e.to_string())
}

fn generate_ca(name: &str) -> Result<(String, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(SIGNER_ORGANIZATION.to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - CLOCK_SKEW_ALLOWANCE;
    params.not_after = now + SIGNER_CA_VALIDITY;

    let key_pair = KeyPair::generate()
        .map_err(|e| Error::SignerError(name.to_string(), format!("key generation: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::SignerError(name.to_string(), format!("self signing: {e}")))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Map Kubernetes `KeyUsage` strings to key usages and extended key usages.
pub fn parse_usages(
    usages: &[String],
) -> Result<(Vec<KeyUsagePurpose>, Vec<ExtendedKeyUsagePurpose>)> {
    let mut key_usages = vec![];
    let mut extended_key_usages = vec![];

    for usage in usages {
        let key_usage = match usage.as_str() {
            "signing" | "digital signature" => Some(KeyUsagePurpose::DigitalSignature),
            "content commitment" => Some(KeyUsagePurpose::ContentCommitment),
            "key encipherment" => Some(KeyUsagePurpose::KeyEncipherment),
            "key agreement" => Some(KeyUsagePurpose::KeyAgreement),
            "data encipherment" => Some(KeyUsagePurpose::DataEncipherment),
            "cert sign" => Some(KeyUsagePurpose::KeyCertSign),
            "crl sign" => Some(KeyUsagePurpose::CrlSign),
            "encipher only" => Some(KeyUsagePurpose::EncipherOnly),
            "decipher only" => Some(KeyUsagePurpose::DecipherOnly),
            _ => None,
        };
        if let Some(key_usage) = key_usage {
            if !key_usages.contains(&key_usage) {
                key_usages.push(key_usage);
            }
            continue;
        }

        let extended_key_usage = match usage.as_str() {
            "any" => ExtendedKeyUsagePurpose::Any,
            "server auth" => ExtendedKeyUsagePurpose::ServerAuth,
            "client auth" => ExtendedKeyUsagePurpose::ClientAuth,
            "code signing" => ExtendedKeyUsagePurpose::CodeSigning,
            "email protection" | "s/mime" => ExtendedKeyUsagePurpose::EmailProtection,
            "timestamping" => ExtendedKeyUsagePurpose::TimeStamping,
            "ocsp signing" => ExtendedKeyUsagePurpose::OcspSigning,
            _ => return Err(Error::UnsupportedUsageError(usage.clone())),
        };
        if !extended_key_usages.contains(&extended_key_usage) {
            extended_key_usages.push(extended_key_usage);
        }
    }

    Ok((key_usages, extended_key_usages))
}
