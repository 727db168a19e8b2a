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

//! Test namespaces that exist in every cluster of a test run.
//!
//! A [`Namespace`] is either claimed (a fixed name that may already exist) or created
//! with a unique name derived from a prefix. Sidecar injection is controlled through
//! namespace labels.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, Namespace as K8sNamespace, Pod};
use kube::api::{DeleteParams, ListParams, LogParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use thiserror::Error as ThisError;
use tracing::{error, info, warn};

use crate::infrastructure::{KindCluster, KindClusterError};

/// Label enabling sidecar injection for the default injector.
pub const INJECTION_LABEL: &str = "istio-injection";
/// Label selecting the injector of a control plane revision.
pub const REVISION_LABEL: &str = "istio.io/rev";
/// Revision value that explicitly selects the default injector.
pub const DEFAULT_REVISION: &str = "default";

// DNS-1123 label limit for namespace names
const MAX_NAME_LENGTH: usize = 63;

static NAMESPACE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors originating from [`Namespace`].
#[allow(missing_docs)]
#[derive(ThisError, Debug)]
pub enum NamespaceError {
    #[error(transparent)]
    Kind(#[from] KindClusterError),
    #[error("kube client error: {0}")]
    Client(#[from] Box<kube::Error>),
    #[error("namespace {0} requires at least one cluster")]
    NoClusters(String),
    #[error("failed to dump namespace {0}: {1}")]
    Dump(String, String),
}

impl From<kube::Error> for NamespaceError {
    fn from(value: kube::Error) -> Self {
        Box::new(value).into()
    }
}

pub type Result<T, E = NamespaceError> = std::result::Result<T, E>;

/// Configuration of a test namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Prefix of the generated name, or the name itself when claiming
    pub prefix: String,
    /// Add the sidecar injection label
    pub inject: bool,
    /// Revision of the injector to use, empty for the default injector
    pub revision: String,
    /// Additional labels applied to the namespace
    pub labels: BTreeMap<String, String>,
    /// Do not dump the namespace, e.g. for system namespaces dumped elsewhere
    pub skip_dump: bool,
}

impl NamespaceConfig {
    /// Configuration of an injected namespace.
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
            inject: true,
            ..Default::default()
        }
    }

    /// Use `revision` unless a revision was set explicitly.
    ///
    /// An explicit `default` revision is cleared, which selects the
    /// `istio-injection=enabled` label instead of `istio.io/rev`.
    pub fn overwrite_revision_if_empty(&mut self, revision: &str) {
        if self.revision.is_empty() {
            self.revision = revision.to_string();
        }
        if self.revision == DEFAULT_REVISION {
            self.revision.clear();
        }
    }

    /// Labels to set on the namespace.
    pub fn namespace_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        if self.inject {
            if self.revision.is_empty() {
                labels.insert(INJECTION_LABEL.to_string(), "enabled".to_string());
            } else {
                labels.insert(REVISION_LABEL.to_string(), self.revision.clone());
            }
        }
        labels.extend(self.labels.clone());
        labels
    }
}

/// Settings shared by every namespace of a test run.
#[derive(Clone, Debug, Default)]
pub struct NamespaceSettings {
    /// Claim namespaces by prefix instead of creating uniquely named ones
    pub stable_namespaces: bool,
    /// Revision used when a namespace config does not name one
    pub default_revision: String,
}

/// A namespace that exists in every cluster of the test run.
#[derive(Clone, Debug)]
pub struct Namespace {
    name: String,
    prefix: String,
    skip_dump: bool,
    clusters: Vec<KindCluster>,
}

impl Namespace {
    /// Claim the namespace named `cfg.prefix` in all clusters, creating it where it
    /// does not exist yet.
    pub async fn claim(
        clusters: &[KindCluster],
        mut cfg: NamespaceConfig,
        settings: &NamespaceSettings,
    ) -> Result<Self> {
        cfg.overwrite_revision_if_empty(&settings.default_revision);
        let ns = Self::from_config(clusters, cfg.prefix.clone(), &cfg)?;
        let labels = cfg.namespace_labels();

        for cluster in &ns.clusters {
            let api = Api::<K8sNamespace>::all(cluster.k8s_client().await?);
            if api.get_opt(&ns.name).await?.is_some() {
                info!("claiming existing namespace {} in {}", ns.name, cluster.name());
                patch_labels(&api, &ns.name, json!(labels)).await?;
            } else {
                create(&api, &ns.name, &labels).await?;
            }
        }

        Ok(ns)
    }

    /// Create a uniquely named namespace in all clusters.
    ///
    /// With stable namespaces enabled the namespace is claimed instead.
    pub async fn new(
        clusters: &[KindCluster],
        mut cfg: NamespaceConfig,
        settings: &NamespaceSettings,
    ) -> Result<Self> {
        let start = Instant::now();
        let prefix = cfg.prefix.clone();
        info!("=== BEGIN: Create namespace {prefix} ===");

        let res = if settings.stable_namespaces {
            Self::claim(clusters, cfg, settings).await
        } else {
            cfg.overwrite_revision_if_empty(&settings.default_revision);
            Self::create_unique(clusters, cfg).await
        };

        match &res {
            Ok(ns) => info!(
                "=== SUCCEEDED: Create namespace {prefix} ({}) in {:?} ===",
                ns.name,
                start.elapsed()
            ),
            Err(e) => {
                error!("=== FAILED: Create namespace {prefix} ===");
                error!("{e}");
            }
        }
        res
    }

    async fn create_unique(clusters: &[KindCluster], cfg: NamespaceConfig) -> Result<Self> {
        let ns = Self::from_config(clusters, generate_name(&cfg.prefix), &cfg)?;
        let labels = cfg.namespace_labels();
        for cluster in &ns.clusters {
            let api = Api::<K8sNamespace>::all(cluster.k8s_client().await?);
            create(&api, &ns.name, &labels).await?;
        }
        Ok(ns)
    }

    fn from_config(clusters: &[KindCluster], name: String, cfg: &NamespaceConfig) -> Result<Self> {
        if clusters.is_empty() {
            return Err(NamespaceError::NoClusters(name));
        }
        Ok(Self {
            name,
            prefix: cfg.prefix.clone(),
            skip_dump: cfg.skip_dump,
            clusters: clusters.to_vec(),
        })
    }

    /// Name of the namespace.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Prefix the name was generated from.
    pub fn prefix(&self) -> &str {
        self.prefix.as_str()
    }

    /// Set a label on the namespace in all clusters.
    pub async fn set_label(&self, key: &str, value: &str) -> Result<()> {
        for cluster in &self.clusters {
            let api = Api::<K8sNamespace>::all(cluster.k8s_client().await?);
            patch_labels(&api, &self.name, json!({ key: value })).await?;
        }
        Ok(())
    }

    /// Remove a label from the namespace in all clusters.
    pub async fn remove_label(&self, key: &str) -> Result<()> {
        for cluster in &self.clusters {
            let api = Api::<K8sNamespace>::all(cluster.k8s_client().await?);
            patch_labels(&api, &self.name, json!({ key: null })).await?;
        }
        Ok(())
    }

    /// Labels of the namespace as seen in the first cluster.
    pub async fn labels(&self) -> Result<BTreeMap<String, String>> {
        let Some(cluster) = self.clusters.first() else {
            return Err(NamespaceError::NoClusters(self.name.clone()));
        };
        let api = Api::<K8sNamespace>::all(cluster.k8s_client().await?);
        let ns = api.get(&self.name).await?;
        Ok(ns.metadata.labels.unwrap_or_default())
    }

    /// Write pods, events and pod logs of the namespace below `dir`.
    pub async fn dump<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        if self.skip_dump {
            info!("skipping dump of namespace {}", self.name);
            return Ok(());
        }
        for cluster in &self.clusters {
            let client = cluster.k8s_client().await?;
            dump_namespace(client, &self.name, &dir.as_ref().join(cluster.name())).await?;
        }
        Ok(())
    }

    /// Dump a namespace that is not managed by the test run.
    pub async fn dump_by_name<P: AsRef<Path>>(
        clusters: &[KindCluster],
        name: &str,
        dir: P,
    ) -> Result<()> {
        let ns = Self {
            name: name.to_string(),
            prefix: name.to_string(),
            skip_dump: false,
            clusters: clusters.to_vec(),
        };
        ns.dump(dir).await
    }

    /// Delete the namespace from all clusters.
    pub async fn delete(&self) -> Result<()> {
        for cluster in &self.clusters {
            let api = Api::<K8sNamespace>::all(cluster.k8s_client().await?);
            info!("deleting namespace {} in {}", self.name, cluster.name());
            api.delete(&self.name, &DeleteParams::default()).await?;
        }
        Ok(())
    }
}

/// Unique namespace name for `prefix`.
///
/// The name is `<prefix>-<unix seconds>-<counter>`, the prefix is shortened to keep the
/// name a valid DNS label.
pub fn generate_name(prefix: &str) -> String {
    let suffix = format!(
        "-{}-{}",
        Utc::now().timestamp(),
        NAMESPACE_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let max_prefix = MAX_NAME_LENGTH.saturating_sub(suffix.len());
    let prefix: String = prefix.chars().take(max_prefix).collect();
    format!("{}{suffix}", prefix.trim_end_matches('-'))
}

async fn create(
    api: &Api<K8sNamespace>,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<()> {
    let ns = K8sNamespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(&PostParams::default(), &ns).await?;
    info!("created namespace {name}");
    Ok(())
}

async fn patch_labels(
    api: &Api<K8sNamespace>,
    name: &str,
    labels: serde_json::Value,
) -> Result<()> {
    let patch = Patch::Merge(json!({ "metadata": { "labels": labels } }));
    api.patch(name, &PatchParams::default(), &patch).await?;
    Ok(())
}

async fn dump_namespace(client: Client, namespace: &str, dir: &Path) -> Result<()> {
    let dir = dir.join(namespace);
    fs::create_dir_all(&dir).map_err(|e| dump_error(namespace, e))?;
    info!("dumping namespace {namespace} to {}", dir.display());

    let pod_api = Api::<Pod>::namespaced(client.clone(), namespace);
    let pods = pod_api.list(&ListParams::default()).await?.items;
    write_yaml(namespace, &dir.join("pods.yaml"), &pods)?;

    let event_api = Api::<Event>::namespaced(client, namespace);
    let events = event_api.list(&ListParams::default()).await?.items;
    write_yaml(namespace, &dir.join("events.yaml"), &events)?;

    for pod in pods {
        let Some(pod_name) = pod.metadata.name else {
            continue;
        };
        let containers = pod.spec.map(|spec| spec.containers).unwrap_or_default();
        for container in containers {
            let lp = LogParams {
                container: Some(container.name.clone()),
                tail_lines: Some(1024),
                ..Default::default()
            };
            match pod_api.logs(&pod_name, &lp).await {
                Ok(logs) => {
                    let file = dir.join(format!("{pod_name}_{}.log", container.name));
                    fs::write(file, logs).map_err(|e| dump_error(namespace, e))?;
                }
                // containers that never started have no logs
                Err(e) => warn!("no logs for {namespace}/{pod_name}/{}: {e}", container.name),
            }
        }
    }

    Ok(())
}

fn write_yaml<T: k8s_openapi::serde::Serialize>(
    namespace: &str,
    path: &Path,
    value: &T,
) -> Result<()> {
    let yaml = serde_yaml::to_string(value).map_err(|e| dump_error(namespace, e))?;
    fs::write(path, yaml).map_err(|e| dump_error(namespace, e))
}

fn dump_error<E: std::fmt::Display>(namespace: &str, e: E) -> NamespaceError {
    NamespaceError::Dump(namespace.to_string(), e.to_string())
}
