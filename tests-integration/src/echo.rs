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

//! Echo test services and the "external" echo deployment.
//!
//! An [`EchoConfig`] describes an echo service and renders the k8s objects needed to run
//! it. [`External`] is the echo service that stands in for a destination outside of the
//! mesh: it never gets a sidecar and serves TLS with pinned test certificates.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use thiserror::Error as ThisError;
use tracing::info;

use crate::infrastructure::{KindCluster, KindClusterError, NamespacedName};

/// Service name of the external echo deployment.
pub const EXTERNAL_SVC: &str = "external";
/// Host header used when calling the external service.
pub const EXTERNAL_HOSTNAME: &str = "fake.external.com";
/// Hostname matching the SAN of the external service's test certificate.
pub const EXTERNAL_TLS_HOSTNAME: &str = "server.default.svc";

/// Pod annotation controlling sidecar injection.
pub const SIDECAR_INJECT_ANNOTATION: &str = "sidecar.istio.io/inject";

/// Image of the echo application.
pub const DEFAULT_ECHO_IMAGE: &str = "gcr.io/istio-testing/app:latest";

pub const ROOT_CERT_FILE: &str = "root-cert.pem";
pub const CERT_CHAIN_FILE: &str = "cert-chain.pem";
pub const KEY_FILE: &str = "key.pem";

const CERTS_MOUNT_PATH: &str = "/etc/certs/custom";
const CERTS_VOLUME: &str = "custom-certs";

/// Errors originating from building or deploying echo services.
#[allow(missing_docs)]
#[derive(ThisError, Debug)]
pub enum EchoError {
    #[error("failed to read TLS fixture {0:?}: {1}")]
    Fixture(PathBuf, #[source] io::Error),
    #[error(transparent)]
    Kind(#[from] KindClusterError),
}

pub type Result<T, E = EchoError> = std::result::Result<T, E>;

/// Application protocol served on an echo port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Http2,
    Grpc,
    Tcp,
    Https,
}

impl Protocol {
    /// Value used for the `appProtocol` of a service port.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Http2 => "http2",
            Protocol::Grpc => "grpc",
            Protocol::Tcp => "tcp",
            Protocol::Https => "https",
        }
    }
}

/// A port exposed by an echo service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EchoPort {
    pub name: &'static str,
    pub protocol: Protocol,
    pub service_port: i32,
    pub workload_port: i32,
    /// Server speaks first, only meaningful for TCP
    pub server_first: bool,
    /// Serve TLS using the configured certificates
    pub tls: bool,
}

impl EchoPort {
    fn new(name: &'static str, protocol: Protocol, service_port: i32, workload_port: i32) -> Self {
        Self {
            name,
            protocol,
            service_port,
            workload_port,
            server_first: false,
            tls: false,
        }
    }

    fn server_first(mut self) -> Self {
        self.server_first = true;
        self
    }

    fn tls(mut self) -> Self {
        self.tls = true;
        self
    }
}

/// The standard set of echo ports.
pub fn all_ports() -> Vec<EchoPort> {
    vec![
        EchoPort::new("http", Protocol::Http, 80, 18080),
        EchoPort::new("grpc", Protocol::Grpc, 7070, 17070),
        EchoPort::new("http2", Protocol::Http2, 85, 18085),
        EchoPort::new("tcp", Protocol::Tcp, 9090, 19090),
        EchoPort::new("https", Protocol::Https, 443, 18443).tls(),
        EchoPort::new("tcp-server", Protocol::Tcp, 9091, 16060).server_first(),
        EchoPort::new("auto-tcp", Protocol::Tcp, 9092, 19091),
        EchoPort::new("auto-tcp-server", Protocol::Tcp, 9093, 16061).server_first(),
        EchoPort::new("auto-http", Protocol::Http, 81, 18081),
        EchoPort::new("auto-grpc", Protocol::Grpc, 7071, 17071),
        EchoPort::new("auto-https", Protocol::Tcp, 9443, 19443).tls(),
    ]
}

/// Certificates the echo server listens with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSettings {
    pub root_cert: String,
    pub client_cert: String,
    pub key: String,
    /// Hostname override matching the SAN of `client_cert`
    pub hostname: String,
}

impl TlsSettings {
    /// Read `root-cert.pem`, `cert-chain.pem` and `key.pem` from `dir`.
    pub fn from_dir<P: AsRef<Path>>(dir: P, hostname: &str) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            root_cert: read_fixture(dir.join(ROOT_CERT_FILE))?,
            client_cert: read_fixture(dir.join(CERT_CHAIN_FILE))?,
            key: read_fixture(dir.join(KEY_FILE))?,
            hostname: hostname.to_string(),
        })
    }
}

fn read_fixture(path: PathBuf) -> Result<String> {
    fs::read_to_string(&path).map_err(|e| EchoError::Fixture(path, e))
}

/// A version of an echo service, deployed as its own `Deployment`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubsetConfig {
    pub version: String,
    /// Pod annotations of the subset
    pub annotations: BTreeMap<String, String>,
}

/// Description of an echo service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EchoConfig {
    pub service: String,
    pub namespace: String,
    pub default_host_header: String,
    pub ports: Vec<EchoPort>,
    pub tls: Option<TlsSettings>,
    pub subsets: Vec<SubsetConfig>,
    pub image: String,
}

impl EchoConfig {
    /// Namespace and name of the service.
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.as_str(), self.service.as_str())
    }

    /// Name of the `Deployment` of a subset.
    pub fn deployment_name(&self, subset: &SubsetConfig) -> String {
        format!("{}-{}", self.service, subset.version)
    }

    fn tls_secret_name(&self) -> String {
        format!("{}-certs", self.service)
    }

    fn metadata(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        }
    }

    fn app_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), self.service.clone())])
    }

    /// The `Service` selecting all subsets.
    pub fn service(&self) -> Service {
        let ports = self
            .ports
            .iter()
            .map(|port| ServicePort {
                name: Some(port.name.to_string()),
                port: port.service_port,
                target_port: Some(IntOrString::Int(port.workload_port)),
                app_protocol: Some(port.protocol.as_str().to_string()),
                ..Default::default()
            })
            .collect();

        Service {
            metadata: self.metadata(self.service.clone(), self.app_labels()),
            spec: Some(ServiceSpec {
                selector: Some(self.app_labels()),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// One `Deployment` per subset.
    pub fn deployments(&self) -> Vec<Deployment> {
        self.subsets.iter().map(|subset| self.deployment(subset)).collect()
    }

    fn deployment(&self, subset: &SubsetConfig) -> Deployment {
        let mut labels = self.app_labels();
        labels.insert("version".to_string(), subset.version.clone());

        let mut container = Container {
            name: "app".to_string(),
            image: Some(self.image.clone()),
            args: Some(self.container_args()),
            ports: Some(
                self.ports
                    .iter()
                    .map(|port| ContainerPort {
                        container_port: port.workload_port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        };
        let mut volumes = None;
        if self.tls.is_some() {
            container.volume_mounts = Some(vec![VolumeMount {
                name: CERTS_VOLUME.to_string(),
                mount_path: CERTS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]);
            volumes = Some(vec![Volume {
                name: CERTS_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.tls_secret_name()),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }

        Deployment {
            metadata: self.metadata(self.deployment_name(subset), labels.clone()),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(subset.annotations.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes,
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for port in &self.ports {
            let flag = match port.protocol {
                Protocol::Grpc => "--grpc",
                Protocol::Tcp => "--tcp",
                _ => "--port",
            };
            args.push(format!("{flag}={}", port.workload_port));
            if port.tls {
                args.push(format!("--tls={}", port.workload_port));
            }
            if port.server_first {
                args.push(format!("--server-first={}", port.workload_port));
            }
        }
        if self.tls.is_some() {
            args.push(format!("--crt={CERTS_MOUNT_PATH}/{CERT_CHAIN_FILE}"));
            args.push(format!("--key={CERTS_MOUNT_PATH}/{KEY_FILE}"));
        }
        args
    }

    /// The `Secret` holding the TLS settings, if any.
    pub fn tls_secret(&self) -> Option<Secret> {
        let tls = self.tls.as_ref()?;
        let data = BTreeMap::from([
            (ROOT_CERT_FILE.to_string(), tls.root_cert.clone()),
            (CERT_CHAIN_FILE.to_string(), tls.client_cert.clone()),
            (KEY_FILE.to_string(), tls.key.clone()),
        ]);
        Some(Secret {
            metadata: self.metadata(self.tls_secret_name(), self.app_labels()),
            string_data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        })
    }

    /// Apply all objects to `cluster` and wait for every subset to roll out.
    pub async fn deploy(&self, cluster: &KindCluster, timeout: Duration) -> Result<EchoInstance> {
        info!("deploying echo {} to {}", self.namespaced_name(), cluster.name());
        if let Some(secret) = self.tls_secret() {
            cluster.apply(&secret).await?;
        }
        cluster.apply(&self.service()).await?;
        for deployment in self.deployments() {
            cluster.apply(&deployment).await?;
        }
        for subset in &self.subsets {
            let name = NamespacedName::new(self.namespace.as_str(), self.deployment_name(subset));
            cluster.rollout_status(&name, timeout).await?;
        }
        Ok(EchoInstance {
            config: self.clone(),
            cluster: cluster.name().to_string(),
        })
    }
}

/// An echo service deployed to a cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EchoInstance {
    pub config: EchoConfig,
    pub cluster: String,
}

impl EchoInstance {
    pub fn namespaced_name(&self) -> NamespacedName {
        self.config.namespaced_name()
    }
}

/// The echo service standing in for a destination outside of the mesh.
#[derive(Clone, Debug, Default)]
pub struct External {
    /// Namespace the external echo is deployed to
    pub namespace: String,
    /// All external echo instances
    pub all: Vec<EchoInstance>,
}

impl External {
    pub fn new<S: Into<String>>(namespace: S) -> Self {
        Self {
            namespace: namespace.into(),
            all: Vec::new(),
        }
    }

    /// Configuration of the external echo, listening with the certificates in `certs_dir`.
    pub fn build<P: AsRef<Path>>(&self, certs_dir: P) -> Result<EchoConfig> {
        let subset = SubsetConfig {
            version: "v1".to_string(),
            annotations: BTreeMap::from([(
                SIDECAR_INJECT_ANNOTATION.to_string(),
                false.to_string(),
            )]),
        };

        Ok(EchoConfig {
            service: EXTERNAL_SVC.to_string(),
            namespace: self.namespace.clone(),
            default_host_header: EXTERNAL_HOSTNAME.to_string(),
            ports: all_ports(),
            tls: Some(TlsSettings::from_dir(certs_dir, EXTERNAL_TLS_HOSTNAME)?),
            subsets: vec![subset],
            image: DEFAULT_ECHO_IMAGE.to_string(),
        })
    }

    /// Keep the instances of the external service in this namespace.
    pub fn load_values(&mut self, instances: &[EchoInstance]) {
        let id = NamespacedName::new(self.namespace.as_str(), EXTERNAL_SVC);
        self.all = instances
            .iter()
            .filter(|instance| instance.namespaced_name() == id)
            .cloned()
            .collect();
    }
}
