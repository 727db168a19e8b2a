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

use std::time::Duration;

use crate::consts::{
    CONDITION_APPROVED, CONDITION_DENIED, CONDITION_FAILED, CSRCTRL_FIELD_MANAGER,
};
use crate::*;

use k8s_openapi::ByteString;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestStatus,
};
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;

/// What the reconciler does with an observed CertificateSigningRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Deleted,
    NoSignerName,
    UnknownSigner,
    AlreadySigned,
    NotApproved,
    Sign,
}

pub fn decide(csr: &CertificateSigningRequest, signer_names: &[String]) -> Decision {
    let signer_name = csr.spec.signer_name.as_str();
    let already_signed = csr
        .status
        .as_ref()
        .and_then(|s| s.certificate.as_ref())
        .is_some();

    if csr.metadata.deletion_timestamp.is_some() {
        Decision::Deleted
    } else if signer_name.is_empty() {
        Decision::NoSignerName
    } else if !signer_names.iter().any(|name| name == signer_name) {
        Decision::UnknownSigner
    } else if already_signed {
        Decision::AlreadySigned
    } else if !is_approved(csr) {
        Decision::NotApproved
    } else {
        Decision::Sign
    }
}

/// A request is approved when it carries an Approved condition and was neither denied
/// nor marked as failed.
pub fn is_approved(csr: &CertificateSigningRequest) -> bool {
    let mut approved = false;
    let mut rejected = false;
    if let Some(status) = &csr.status {
        if let Some(conditions) = &status.conditions {
            for condition in conditions {
                // an empty status defaults to True
                let is_true = condition.status.is_empty() || condition.status == "True";
                match condition.type_.as_str() {
                    CONDITION_APPROVED => approved |= is_true,
                    CONDITION_DENIED | CONDITION_FAILED => rejected |= is_true,
                    _ => {}
                }
            }
        }
    }
    approved && !rejected
}

/// Lifetime asked for by the request, capped at the signer TTL.
pub fn requested_lifetime(csr: &CertificateSigningRequest, cert_ttl: Duration) -> Duration {
    match csr.spec.expiration_seconds {
        Some(seconds) if seconds > 0 => Duration::from_secs(seconds as u64).min(cert_ttl),
        _ => cert_ttl,
    }
}

pub async fn patch_status(
    csr_api: &Api<CertificateSigningRequest>,
    name: &str,
    certificate: Vec<u8>,
) -> Result<()> {
    let status = CertificateSigningRequestStatus {
        certificate: Some(ByteString(certificate)),
        ..Default::default()
    };
    let patch = Patch::Apply(json!({
        "apiVersion": "certificates.k8s.io/v1",
        "kind": "CertificateSigningRequest",
        "status": status
    }));
    let params = PatchParams::apply(CSRCTRL_FIELD_MANAGER).force();
    csr_api
        .patch_status(name, &params, &patch)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}
