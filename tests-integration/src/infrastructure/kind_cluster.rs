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

use std::fmt::Debug;
use std::ops::Add;
use std::path::Path;
use std::time::{Duration, Instant};

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::serde::Serialize;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::api::{ListParams, LogParams, Patch, PatchParams};
use kube::config::KubeConfigOptions;
use kube::core::Selector;
use kube::{Api, Client, Config, Resource, ResourceExt};
use thiserror::Error as ThisError;
use tokio::time::sleep;
use tracing::{error, info};

use crate::infrastructure::{AsyncCommand, AsyncCommandError, NamespacedName};

const FIELD_MANAGER: &str = "csrctrl-integration-tests";

/// Single-node kind cluster.
#[derive(Clone, Debug)]
pub struct KindCluster {
    name: String,
}

/// Errors originating from [`KindCluster`].
#[allow(missing_docs)]
#[derive(ThisError, Debug)]
pub enum KindClusterError {
    #[error("{0}: {1}")]
    Execution(String, AsyncCommandError),
    #[error("{0}")]
    Rollout(String),
    #[error("kube client error: {0}")]
    Client(#[from] Box<kube::Error>),
    #[error("Failed to create client {1} for k8s context {0:?}")]
    Config(String, String),
    #[error("{0} has no namespace set")]
    MissingNamespace(String),
}

impl From<kube::Error> for KindClusterError {
    fn from(value: kube::Error) -> Self {
        Box::new(value).into()
    }
}

pub type Result<T, E = KindClusterError> = std::result::Result<T, E>;

impl KindCluster {
    /// create a new cluster
    pub fn new<T: AsRef<str>>(name: T) -> Result<Self> {
        Ok(KindCluster {
            name: name.as_ref().to_string(),
        })
    }

    /// get the clusters name
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// get the k8s context name
    pub fn k8s_context(&self) -> String {
        format!("kind-{}", self.name)
    }

    /// get a `kube::Client` for the cluster
    pub async fn k8s_client(&self) -> Result<Client> {
        let kube_config = KubeConfigOptions {
            context: Some(self.k8s_context()),
            cluster: None,
            user: None,
        };
        let cfg = Config::from_kubeconfig(&kube_config)
            .await
            .map_err(|e| KindClusterError::Config(self.k8s_context(), e.to_string()))?;

        let client = Client::try_from(cfg)
            .map_err(|e| KindClusterError::Config(self.k8s_context(), e.to_string()))?;

        Ok(client)
    }

    /// create the cluster and wait for the control plane to be ready
    pub async fn create(&self) -> Result<()> {
        AsyncCommand::new(
            "kind",
            &["create", "cluster", "--name", self.name.as_str(), "--wait", "120s"],
        )
        .run()
        .await
        .map_err(|e| {
            KindClusterError::Execution(format!("Failed to create kind cluster {}", self.name), e)
        })
    }

    /// delete the cluster
    pub async fn delete(&self) -> Result<()> {
        AsyncCommand::new("kind", &["delete", "cluster", "--name", self.name.as_str()])
            .run()
            .await
            .map_err(|e| {
                KindClusterError::Execution(
                    format!("Failed to delete kind cluster {}", self.name),
                    e,
                )
            })
    }

    /// export the node and pod logs of the cluster into `dir`
    pub async fn export_logs<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref().to_string_lossy().to_string();
        AsyncCommand::new(
            "kind",
            &["export", "logs", dir.as_str(), "--name", self.name.as_str()],
        )
        .run()
        .await
        .map_err(|e| {
            KindClusterError::Execution(
                format!("Failed to export logs of kind cluster {}", self.name),
                e,
            )
        })
    }

    /// server-side apply a namespaced object
    pub async fn apply<K>(&self, object: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
        K::DynamicType: Default,
    {
        let name = object.name_any();
        let Some(namespace) = object.namespace() else {
            return Err(KindClusterError::MissingNamespace(name));
        };

        let client = self.k8s_client().await?;
        let api = Api::<K>::namespaced(client, namespace.as_str());
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api.patch(name.as_str(), &pp, &Patch::Apply(object)).await?;
        Ok(applied)
    }

    /// wait for a Deployment rollout to be successful
    pub async fn rollout_status(
        &self,
        deployment: &NamespacedName,
        timeout_secs: Duration,
    ) -> Result<()> {
        let client = self.k8s_client().await?;

        let start_time = Instant::now();
        'watch: while start_time.elapsed() <= timeout_secs.add(Duration::from_secs(1)) {
            // wait first to avoid potentially getting old rollout details
            sleep(Duration::from_secs(1)).await;

            let rollout_success = Self::rollout_status_deployment(
                client.clone(),
                deployment,
                &start_time,
                &timeout_secs,
            )
            .await?;

            if rollout_success {
                info!("Rollout for Deployment {deployment} was successful.");
                break 'watch;
            } else {
                info!(
                    "Waiting for Deployment {deployment} rollout to complete (elapsed: {:?}s, timeout: {timeout_secs:?}).",
                    start_time.elapsed().as_secs()
                );
            }
        }

        Ok(())
    }

    async fn rollout_status_deployment(
        client: Client,
        deployment: &NamespacedName,
        start_time: &Instant,
        timeout: &Duration,
    ) -> Result<bool> {
        let NamespacedName { namespace, name } = deployment;
        let deployment_api = Api::<Deployment>::namespaced(client, namespace);
        let deployment = deployment_api.get(name).await?;
        let Some(status) = deployment.status.clone() else {
            return Ok(false);
        };

        let lp = match deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.match_labels.clone())
        {
            Some(labels) => ListParams::default().labels_from(&Selector::from_iter(labels)),
            None => ListParams::default(),
        };
        let pod_api = Api::<Pod>::namespaced(deployment_api.into_client(), namespace);
        let pods = pod_api.list(&lp).await?.items;

        if &start_time.elapsed() >= timeout {
            error!("Deployment {namespace}/{name} rollout timed out.");
            error!("{:?}", status);

            for pod in pods {
                Self::error_pod_details(&pod_api, pod).await?;
            }

            Err(KindClusterError::Rollout(format!(
                "Deployment {namespace}/{name} rollout timed out."
            )))
        } else if pods.is_empty() {
            Ok(false)
        } else {
            let pods_running = pods.iter().all(|p| {
                p.status
                    .clone()
                    .unwrap_or_default()
                    .phase
                    .unwrap_or_default()
                    == "Running"
            });
            let replicas = status.replicas.unwrap_or_default();
            let deployment_ready = replicas > 0
                && status.ready_replicas.unwrap_or_default() >= replicas
                && status.updated_replicas.unwrap_or_default() >= replicas;
            Ok(deployment_ready && pods_running)
        }
    }

    /// log pod status and pod logs
    async fn error_pod_details(pod_api: &Api<Pod>, pod: Pod) -> Result<()> {
        if let Some(status) = pod.status {
            error!("{:?}", status);
        }
        if let Some(name) = pod.metadata.name {
            let lp = LogParams {
                tail_lines: Some(1024),
                ..Default::default()
            };

            let pod_logs = pod_api.logs(name.as_str(), &lp).await?;
            error!("{pod_logs}")
        }
        Ok(())
    }
}

impl csrctrl::Cluster for KindCluster {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn client(&self) -> csrctrl::Result<Client> {
        self.k8s_client()
            .await
            .map_err(|e| csrctrl::Error::ClusterError(self.name.clone(), e.to_string()))
    }
}
