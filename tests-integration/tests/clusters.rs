/*
Copyright 2025 The Kubernetes Authors.

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
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use csrctrl::{Options, Signer, run_csr_controller};
use k8s_openapi::ByteString;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestSpec};
use kube::Api;
use kube::api::{ObjectMeta, Patch, PatchParams, PostParams};
use rcgen::{CertificateParams, KeyPair};
use serde_json::json;
use tests_integration::Result;
use tests_integration::echo::{
    CERT_CHAIN_FILE, EXTERNAL_TLS_HOSTNAME, External, KEY_FILE, ROOT_CERT_FILE,
};
use tests_integration::infrastructure::KindCluster;
use tests_integration::namespace::{Namespace, NamespaceConfig, NamespaceSettings};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SIGNER_A: &str = "csrctrl.test/signer-a";
const SIGNER_B: &str = "csrctrl.test/signer-b";

async fn create_cluster() -> Result<KindCluster> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_file(true)
        .with_line_number(true)
        .init();

    let cluster = KindCluster::new("csrctrl-tests-integration")?;
    cluster.create().await?;
    Ok(cluster)
}

fn csr_pem(dns_name: &str) -> (String, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let params = CertificateParams::new(vec![dns_name.to_string()]).unwrap();
    let pem = params.serialize_request(&key).unwrap().pem().unwrap();
    (pem, key)
}

/// Server certificates for the external echo, issued by a throwaway signer.
fn write_echo_fixtures(signer_root: &Path, certs_dir: &Path) -> Result<()> {
    let signer = Signer::new(signer_root, "echo-fixtures", Duration::from_secs(3600))?;
    let (csr, key) = csr_pem(EXTERNAL_TLS_HOSTNAME);
    let usages = vec!["digital signature".to_string(), "server auth".to_string()];
    let chain = signer.sign(&csr, &usages, Duration::from_secs(3600), false)?;

    fs::copy(signer.root_cert_path(), certs_dir.join(ROOT_CERT_FILE))?;
    fs::write(certs_dir.join(CERT_CHAIN_FILE), chain)?;
    fs::write(certs_dir.join(KEY_FILE), key.serialize_pem())?;
    Ok(())
}

async fn wait_for_certificate(
    api: &Api<CertificateSigningRequest>,
    name: &str,
) -> Option<String> {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(60) {
        let csr = api.get(name).await.ok()?;
        if let Some(ByteString(cert)) = csr.status.and_then(|status| status.certificate) {
            return String::from_utf8(cert).ok();
        }
        info!("waiting for CSR {name} to be signed");
        sleep(Duration::from_secs(1)).await;
    }
    None
}

#[tokio::test]
#[ignore = "requires kind and a container runtime"]
async fn csr_controller_signs_approved_requests() -> Result<()> {
    let cluster = create_cluster().await?;
    let clusters = vec![cluster.clone()];

    let signer_root = tempfile::tempdir()?;
    let options = Options {
        signer_root: signer_root.path().to_path_buf(),
        ..Options::new(format!("{SIGNER_A},{SIGNER_B}"), true)
    };
    let stop = CancellationToken::new();
    let (root_certs, controllers) =
        run_csr_controller(&options, stop.clone(), &clusters).await?;

    assert_eq!(root_certs.len(), 2);
    assert_eq!(root_certs[0].signer, SIGNER_A);
    assert_eq!(root_certs[1].signer, SIGNER_B);
    assert_eq!(controllers.len(), 1);

    let ns = Namespace::new(
        &clusters,
        NamespaceConfig {
            inject: false,
            ..NamespaceConfig::new("csr")
        },
        &NamespaceSettings::default(),
    )
    .await?;

    // CSRs are cluster scoped, the name only has to be unique per run
    let csr_name = ns.name().to_string();
    let (request, _key) = csr_pem("workload.csr.svc");
    let csr = CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(csr_name.clone()),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(request.into_bytes()),
            signer_name: SIGNER_A.to_string(),
            usages: Some(vec!["digital signature".to_string(), "server auth".to_string()]),
            expiration_seconds: Some(600),
            ..Default::default()
        },
        ..Default::default()
    };

    let api = Api::<CertificateSigningRequest>::all(cluster.k8s_client().await?);
    api.create(&PostParams::default(), &csr).await?;

    let approval = json!({
        "status": {
            "conditions": [{
                "type": "Approved",
                "status": "True",
                "reason": "IntegrationTest",
                "message": "approved by the integration tests",
            }]
        }
    });
    api.patch_approval(&csr_name, &PatchParams::default(), &Patch::Merge(&approval))
        .await?;

    let chain = wait_for_certificate(&api, &csr_name).await;
    let chain = chain.expect("CSR was not signed in time");
    assert_eq!(chain.matches("BEGIN CERTIFICATE").count(), 2);
    assert!(chain.trim_end().ends_with(root_certs[0].root_cert.trim_end()));

    let certs_dir = tempfile::tempdir()?;
    write_echo_fixtures(signer_root.path(), certs_dir.path())?;
    let mut external = External::new(ns.name());
    let echo = external.build(certs_dir.path())?;
    let instance = echo.deploy(&cluster, Duration::from_secs(120)).await?;
    external.load_values(&[instance]);
    assert_eq!(external.all.len(), 1);

    let dump_dir = tempfile::tempdir()?;
    ns.dump(dump_dir.path()).await?;
    assert!(
        dump_dir
            .path()
            .join(cluster.name())
            .join(ns.name())
            .join("pods.yaml")
            .exists()
    );

    api.delete(&csr_name, &Default::default()).await?;
    ns.delete().await?;
    controllers.shutdown().await?;
    cluster.delete().await?;
    Ok(())
}
