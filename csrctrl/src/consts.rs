use std::time::Duration;

// Root directory for the CA and private key files of every signer.
pub const SIGNER_ROOT: &str = "/tmp/pki/signer/";

// Lifetime of the signed certificates.
pub const CERTIFICATE_DURATION: Duration = Duration::from_secs(60 * 60);

// Lifetime of a generated signer CA.
pub const SIGNER_CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

// Issued certificates are backdated by this amount to tolerate clock skew.
pub const CLOCK_SKEW_ALLOWANCE: Duration = Duration::from_secs(60);

// Time a stopped controller gets to finish in-flight reconciles before it is dropped.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

// Field manager for status patches written by the controller.
pub const CSRCTRL_FIELD_MANAGER: &str = "csrctrl-field-manager";

// File names inside a signer directory.
pub const CA_KEY_FILE: &str = "ca-key.pem";
pub const CA_CERT_FILE: &str = "ca-cert.pem";
pub const ROOT_CERT_FILE: &str = "root-cert.pem";

// CertificateSigningRequest condition types.
pub const CONDITION_APPROVED: &str = "Approved";
pub const CONDITION_DENIED: &str = "Denied";
pub const CONDITION_FAILED: &str = "Failed";
