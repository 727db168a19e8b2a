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

//! [`tests_integration`](`crate`) provides the building blocks of the mesh end-to-end tests:
//! [kind](https://kind.sigs.k8s.io/) (k8s in docker) clusters, test namespaces and the
//! descriptors of the echo services deployed into them.
//!
//! This [`crate`] depends on the host to have the following tools installed and correctly configured:
//! - `docker` or `podman`
//! - `kind`
//!
//! It is mainly intended for automated k8s integration tests.

pub mod echo;
pub mod infrastructure;
pub mod namespace;

use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error as ThisError;
use tracing::error;

use crate::echo::EchoError;
use crate::infrastructure::KindClusterError;
use crate::namespace::NamespaceError;

/// Result typed used within the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors for the [`tests_integration`](`crate`) crate.
///
/// The error type is used in functions that return a `Result`.
///
/// It is structured to identify the sources and to allowing matching on the according error types.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Error originating from an action related to a `KindCluster`
    #[error(transparent)]
    Kind(#[from] KindClusterError),
    /// Error originating from an action related to a test `Namespace`
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
    /// Error originating from building or deploying an echo service
    #[error(transparent)]
    Echo(#[from] EchoError),
    /// Error originating from a k8s API call
    #[error("kube client error: {0}")]
    Client(#[from] Box<kube::Error>),
    /// Error originating from the CSR controller
    #[error(transparent)]
    Csr(#[from] csrctrl::Error),
    /// Error signaling an issue with the cargo workspace directory.
    #[error("Could not load CARGO_MANIFEST_DIR from environment")]
    MissingCargoManifestDir,
    /// Error signaling a missing path.
    #[error("Path {0} does not existing.")]
    PathDoesNotExist(PathBuf),
    /// Error originating from an IO operation.
    #[error("IO issue {0:?}")]
    IO(#[from] std::io::Error),
}

impl From<kube::Error> for Error {
    fn from(value: kube::Error) -> Self {
        Box::new(value).into()
    }
}

/// Verify if a `Path` exists and is accessible.
pub fn verify_path<T: AsRef<Path>>(path: T) -> Result<PathBuf> {
    match path.as_ref().try_exists()? {
        true => Ok(path.as_ref().to_owned()),
        false => Err(Error::PathDoesNotExist(path.as_ref().to_owned())),
    }
}

/// Get the top level cargo workspace directory from the `CARGO_MANIFEST_DIR`
/// and a `subdir` suffix that is stripped from the `CARGO_MANIFEST_DIR`.
///
/// Used to locate fixtures (e.g. test certificates) relative to the workspace.
pub fn cargo_workspace_dir(subdir: &str) -> Result<String> {
    let Some(workspace_dir) = env::var("CARGO_MANIFEST_DIR").ok() else {
        return Err(Error::MissingCargoManifestDir);
    };

    let Some(workspace_dir) = workspace_dir.strip_suffix(subdir) else {
        error!("Could not remove subdirectory {subdir} from CARGO_MANIFEST_DIR {workspace_dir}");
        return Err(Error::MissingCargoManifestDir);
    };

    verify_path(workspace_dir)?;
    Ok(workspace_dir.to_string())
}
