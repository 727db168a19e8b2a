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

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use thiserror::Error;

pub use bootstrap::{ControllerGroup, Options, SignerRootCert, run as run_csr_controller};
pub use csr_controller::controller as csr_controller;
pub use signer::Signer;
pub use traits::Cluster;

pub mod bootstrap;
pub mod consts;
mod csr_controller;
mod csr_utils;
pub mod signer;
mod traits;

/// Signers by signer name, shared read-only by every cluster's reconciler.
pub type SignerMap = HashMap<String, Signer>;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Name of the cluster the client talks to, used in logs
    pub cluster: String,
    /// Directory holding the CA material of every signer
    pub signer_root: PathBuf,
    /// Upper bound for the lifetime of issued certificates
    pub cert_ttl: Duration,
    /// Signer names this controller is responsible for
    pub signer_names: Arc<Vec<String>>,
    pub signers: Arc<SignerMap>,
    /// Append the signer root certificate to issued chains
    pub append_root_cert: bool,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[source] kube::Error),
    #[error("invalid configuration: `{0}`")]
    InvalidConfigError(String),
    #[error("unable to start signer `{0}`: {1}")]
    SignerError(String, String),
    #[error("unable to read root cert for signer `{0}`: {1}")]
    RootCertError(String, #[source] std::io::Error),
    #[error("invalid certificate signing request: {0}")]
    InvalidRequestError(String),
    #[error("unsupported key usage `{0}`")]
    UnsupportedUsageError(String),
    #[error("error signing certificate: {0}")]
    SigningError(String),
    #[error("unable to connect to cluster `{0}`: {1}")]
    ClusterError(String, String),
    #[error("controller for cluster `{0}` stopped before shutdown was requested")]
    ControllerStopped(String),
    #[error("controller task failed: {0}")]
    TaskError(#[source] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
