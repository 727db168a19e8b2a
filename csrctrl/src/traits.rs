use std::future::Future;

use kube::Client;

use crate::Result;

/// A cluster the CSR controller can be started against.
pub trait Cluster {
    /// Name of the cluster, used in logs and errors.
    fn name(&self) -> &str;

    /// Build a client for the cluster's API server.
    fn client(&self) -> impl Future<Output = Result<Client>> + Send;
}
