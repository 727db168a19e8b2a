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

use futures::StreamExt;
use std::{
    future::Future,
    ops::Sub,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::*;
use csr_utils::*;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::{
    api::Api,
    runtime::{Controller, controller::Action, watcher::Config},
};
use tracing::*;

pub async fn reconcile(csr: Arc<CertificateSigningRequest>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let name = csr
        .metadata
        .name
        .clone()
        .ok_or(Error::InvalidConfigError("invalid name".to_string()))?;

    match decide(&csr, &ctx.signer_names) {
        Decision::Deleted => {
            debug!("CSR {name} has been deleted, ignoring");
            return Ok(Action::await_change());
        }
        Decision::NoSignerName => {
            debug!("CSR {name} does not have a signer name, ignoring");
            return Ok(Action::await_change());
        }
        Decision::UnknownSigner => {
            debug!(
                "CSR {name} signer name does not match, ignoring. signer-name: {}, have {}",
                csr.spec.signer_name,
                ctx.signer_names.join(",")
            );
            return Ok(Action::await_change());
        }
        Decision::AlreadySigned => {
            debug!("CSR {name} has already been signed, ignoring");
            return Ok(Action::await_change());
        }
        Decision::NotApproved => {
            debug!("CSR {name} is not approved, ignoring");
            return Ok(Action::await_change());
        }
        Decision::Sign => {}
    }

    let signer_name = csr.spec.signer_name.as_str();
    let signer = ctx.signers.get(signer_name).ok_or_else(|| {
        Error::InvalidConfigError(format!("no signer registered for {signer_name}"))
    })?;

    info!("signing CSR {name} with signer {signer_name} on cluster {}", ctx.cluster);
    let Ok(request) = std::str::from_utf8(&csr.spec.request.0) else {
        // the request will not become valid by retrying
        warn!("unable to parse CSR {name}: request is not valid PEM");
        return Ok(Action::await_change());
    };

    let lifetime = requested_lifetime(&csr, ctx.cert_ttl.min(signer.cert_ttl()));
    let usages = csr.spec.usages.clone().unwrap_or_default();
    let certificate = match signer.sign(request, &usages, lifetime, ctx.append_root_cert) {
        Ok(certificate) => certificate,
        Err(Error::InvalidRequestError(error)) => {
            warn!("unable to parse CSR {name}: {error}");
            return Ok(Action::await_change());
        }
        Err(Error::UnsupportedUsageError(usage)) => {
            warn!("unable to sign CSR {name}: unsupported key usage `{usage}`");
            return Ok(Action::await_change());
        }
        Err(error) => return Err(error),
    };

    let csr_api = Api::<CertificateSigningRequest>::all(ctx.client.clone());
    patch_status(&csr_api, &name, certificate.into_bytes()).await?;

    let duration = Instant::now().sub(start);
    info!(
        "CSR {name} has been signed by {signer_name} in {:?} ms",
        duration.as_millis()
    );
    Ok(Action::await_change())
}

/// Run the CSR signing controller until `shutdown` resolves.
pub async fn controller<F>(ctx: Context, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + Sync + 'static,
{
    let csr_api = Api::<CertificateSigningRequest>::all(ctx.client.clone());
    let cluster = ctx.cluster.clone();

    info!(
        "starting CSR controller for cluster {cluster}, signers under {}",
        ctx.signer_root.display()
    );
    Controller::new(csr_api, Config::default().any_semantic())
        .graceful_shutdown_on(shutdown)
        .run(reconcile, error_policy, Arc::new(ctx))
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("reconciled {:?}", o),
                Err(e) => debug!("reconcile failed: {}", e),
            }
        })
        .await;
    info!("CSR controller for cluster {cluster} terminated");

    Ok(())
}

fn error_policy(_: Arc<CertificateSigningRequest>, error: &Error, _: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use http::{Method, Request, Response, header};
    use k8s_openapi::ByteString;
    use k8s_openapi::api::certificates::v1::{
        CertificateSigningRequestCondition, CertificateSigningRequestSpec,
        CertificateSigningRequestStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::Client;
    use kube::client::Body;
    use rcgen::{CertificateParams, KeyPair};
    use tempfile::{TempDir, tempdir};
    use tokio::time::timeout;
    use tower_test::mock::{self, Handle};
    use x509_parser::pem::Pem;

    use crate::consts::{CLOCK_SKEW_ALLOWANCE, CONDITION_APPROVED};

    const SIGNER: &str = "example.com/signer";

    type ApiServer = Handle<Request<Body>, Response<Body>>;

    fn context(append_root_cert: bool) -> (Arc<Context>, ApiServer, TempDir) {
        let (service, api_server) = mock::pair::<Request<Body>, Response<Body>>();
        let root = tempdir().unwrap();
        let signer = Signer::new(root.path(), SIGNER, Duration::from_secs(3600)).unwrap();
        let ctx = Context {
            client: Client::new(service, "default"),
            cluster: "test".to_string(),
            signer_root: root.path().to_path_buf(),
            cert_ttl: Duration::from_secs(3600),
            signer_names: Arc::new(vec![SIGNER.to_string()]),
            signers: Arc::new(SignerMap::from([(SIGNER.to_string(), signer)])),
            append_root_cert,
        };
        (Arc::new(ctx), api_server, root)
    }

    fn csr_pem() -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["echo.default.svc".to_string()]).unwrap();
        let pem = params.serialize_request(&key).unwrap().pem().unwrap();
        pem.into_bytes()
    }

    fn csr(
        request: Vec<u8>,
        usages: &[&str],
        expiration_seconds: Option<i32>,
        approved: bool,
    ) -> CertificateSigningRequest {
        let conditions = approved.then(|| {
            vec![CertificateSigningRequestCondition {
                type_: CONDITION_APPROVED.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]
        });
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some("csr-1".to_string()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request),
                signer_name: SIGNER.to_string(),
                usages: Some(usages.iter().map(|u| u.to_string()).collect()),
                expiration_seconds,
                ..Default::default()
            },
            status: Some(CertificateSigningRequestStatus {
                conditions,
                ..Default::default()
            }),
        }
    }

    /// Fails when the reconciler talked to the API server.
    async fn assert_no_request(api_server: &mut ApiServer) {
        let next = timeout(Duration::from_millis(200), api_server.next_request()).await;
        assert!(!matches!(next, Ok(Some(_))), "unexpected API request");
    }

    #[tokio::test]
    async fn approved_request_is_signed_and_status_patched() {
        let (ctx, mut api_server, _root) = context(true);
        let csr = csr(csr_pem(), &["digital signature", "server auth"], Some(900), true);
        let response = serde_json::to_vec(&csr).unwrap();

        let server = tokio::spawn(async move {
            let (request, send) = api_server.next_request().await.expect("no API request");
            assert_eq!(request.method(), Method::PATCH);
            assert_eq!(
                request.uri().path(),
                "/apis/certificates.k8s.io/v1/certificatesigningrequests/csr-1/status"
            );
            let query = request.uri().query().unwrap_or_default().to_string();
            assert!(query.contains("fieldManager=csrctrl-field-manager"));
            assert!(query.contains("force=true"));
            assert_eq!(
                request.headers()[header::CONTENT_TYPE],
                "application/apply-patch+yaml"
            );

            let body = request.into_body().collect_bytes().await.unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            serde_json::from_slice::<serde_json::Value>(&body).unwrap()
        });

        let action = reconcile(Arc::new(csr), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());

        let patch = server.await.unwrap();
        assert_eq!(patch["apiVersion"], "certificates.k8s.io/v1");
        assert_eq!(patch["kind"], "CertificateSigningRequest");

        let status: CertificateSigningRequestStatus =
            serde_json::from_value(patch["status"].clone()).unwrap();
        let chain = String::from_utf8(status.certificate.unwrap().0).unwrap();
        let blocks = Pem::iter_from_buffer(chain.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(blocks.len(), 2);

        // expirationSeconds below the TTL is honoured
        let leaf = blocks[0].parse_x509().unwrap();
        let validity = leaf.validity();
        let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert_eq!(lifetime, 900 + CLOCK_SKEW_ALLOWANCE.as_secs() as i64);

        let root_cert = fs::read_to_string(ctx.signers[SIGNER].root_cert_path()).unwrap();
        assert!(chain.ends_with(root_cert.as_str()));
    }

    #[tokio::test]
    async fn unparseable_request_is_not_retried() {
        let (ctx, mut api_server, _root) = context(false);
        let csr = csr(b"not a certificate request".to_vec(), &["server auth"], None, true);

        let action = reconcile(Arc::new(csr), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_no_request(&mut api_server).await;
    }

    #[tokio::test]
    async fn unsupported_usage_is_not_retried() {
        let (ctx, mut api_server, _root) = context(false);
        let csr = csr(csr_pem(), &["ipsec tunnel"], None, true);

        let action = reconcile(Arc::new(csr), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_no_request(&mut api_server).await;
    }

    #[tokio::test]
    async fn unapproved_request_is_left_alone() {
        let (ctx, mut api_server, _root) = context(false);
        let csr = csr(csr_pem(), &["server auth"], None, false);

        let action = reconcile(Arc::new(csr), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_no_request(&mut api_server).await;
    }
}
