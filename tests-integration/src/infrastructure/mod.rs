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

//! Contains structs to create clusters and to deploy k8s resources into them.
//!
//! For example to create a set of [`KindCluster`]s, start the CSR controller on them and
//! wait for the rollout of an echo [`Deployment`](k8s_openapi::api::apps::v1::Deployment).

mod kind_cluster;

pub use kind_cluster::KindCluster;
pub use kind_cluster::KindClusterError;

use std::ffi::OsStr;
use std::fmt::{Debug, Display, Formatter};
use std::io;

use thiserror::Error;
use tokio::process::Command;
use tracing::info;

/// Wraps a `tokio::process::Command` for easier handling.
///
/// The crate uses this struct for all executions, which allows to use helpers
/// like `tokio::try_join` to e.g. create several clusters in parallel.
struct AsyncCommand {
    cmd: Command,
}

/// Errors originating from [`AsyncCommand`].
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum AsyncCommandError {
    #[error("Failed spawning the command: {0:?}")]
    Spawn(io::Error),
    #[error("Failed to wait for the command: {0:?}")]
    Wait(io::Error),
    #[error("Command exited with {0:?}")]
    ExitStatus(Option<i32>),
}

impl AsyncCommand {
    /// create a new AsyncCommand by providing the command binary and the arguments
    pub fn new<C: AsRef<OsStr>, A: AsRef<OsStr>>(cmd: C, args: &[A]) -> Self {
        let mut cmd = Command::new(cmd);
        cmd.args(args);
        Self { cmd }
    }

    async fn run(&mut self) -> Result<(), AsyncCommandError> {
        info!("run: {:?}", self.cmd);
        let exit_status = self
            .cmd
            .spawn()
            .map_err(AsyncCommandError::Spawn)?
            .wait()
            .await
            .map_err(AsyncCommandError::Wait)?;

        if !exit_status.success() {
            return Err(AsyncCommandError::ExitStatus(exit_status.code()));
        }

        Ok(())
    }
}

/// K8s identifier consisting of a namespace and a name.
#[allow(missing_docs)]
#[derive(Clone, PartialEq, Eq)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    /// create a new identifier
    pub fn new<N: Into<String>, M: Into<String>>(namespace: N, name: M) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for NamespacedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.namespace.as_str())?;
        f.write_str("/")?;
        f.write_str(self.name.as_str())
    }
}

impl Debug for NamespacedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
