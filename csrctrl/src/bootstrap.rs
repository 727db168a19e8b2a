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

//! Starts the CSR signing controller on a set of clusters.
//!
//! The signers are created once and shared by every cluster. Each cluster gets its own
//! controller task; all of them stop when the shared [`CancellationToken`] is cancelled.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::consts::{CERTIFICATE_DURATION, SHUTDOWN_GRACE_PERIOD, SIGNER_ROOT};
use crate::*;

/// Root certificate of a configured signer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignerRootCert {
    pub signer: String,
    /// PEM encoded root certificate
    pub root_cert: String,
}

/// Configuration of the CSR controller.
#[derive(Clone, Debug)]
pub struct Options {
    /// Comma separated list of signer names
    pub signer_names: String,
    /// Append the root certificate to the issued chains
    pub append_root_cert: bool,
    /// Directory holding the CA material of the signers
    pub signer_root: PathBuf,
    /// Lifetime of the issued certificates
    pub cert_ttl: Duration,
}

impl Options {
    pub fn new<S: Into<String>>(signer_names: S, append_root_cert: bool) -> Self {
        Self {
            signer_names: signer_names.into(),
            append_root_cert,
            signer_root: PathBuf::from(SIGNER_ROOT),
            cert_ttl: CERTIFICATE_DURATION,
        }
    }
}

/// Split a comma separated signer name list.
pub fn parse_signer_names(signer_names: &str) -> Result<Vec<String>> {
    signer_names
        .split(',')
        .map(|name| {
            let name = name.trim();
            if name.is_empty() {
                Err(Error::InvalidConfigError(format!(
                    "empty signer name in `{signer_names}`"
                )))
            } else {
                Ok(name.to_string())
            }
        })
        .collect()
}

/// Create the signers and read their root certificates.
///
/// The root certificates are returned in the order of `signer_names`. The first failing
/// signer aborts the whole operation.
pub fn load_signers<P: AsRef<Path>>(
    signer_names: &[String],
    signer_root: P,
    cert_ttl: Duration,
) -> Result<(SignerMap, Vec<SignerRootCert>)> {
    let mut signers = SignerMap::with_capacity(signer_names.len());
    let mut root_certs = Vec::with_capacity(signer_names.len());

    for name in signer_names {
        let signer = Signer::new(signer_root.as_ref(), name, cert_ttl)?;
        let root_cert = fs::read_to_string(signer.root_cert_path())
            .map_err(|e| Error::RootCertError(name.clone(), e))?;

        root_certs.push(SignerRootCert {
            signer: name.clone(),
            root_cert,
        });
        signers.insert(name.clone(), signer);
    }

    Ok((signers, root_certs))
}

/// Start a CSR controller on every cluster.
///
/// Returns the root certificates of the configured signers once all controllers have
/// been spawned. The controllers keep running on the returned [`ControllerGroup`] until
/// `stop` is cancelled.
pub async fn run<C: Cluster>(
    options: &Options,
    stop: CancellationToken,
    clusters: &[C],
) -> Result<(Vec<SignerRootCert>, ControllerGroup)> {
    let signer_names = parse_signer_names(&options.signer_names)?;
    let (signers, root_certs) =
        load_signers(&signer_names, &options.signer_root, options.cert_ttl)?;

    let signer_names = Arc::new(signer_names);
    let signers = Arc::new(signers);

    // every cluster must be reachable before any controller starts
    let mut contexts = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let client = cluster.client().await?;
        contexts.push(Context {
            client,
            cluster: cluster.name().to_string(),
            signer_root: options.signer_root.clone(),
            cert_ttl: options.cert_ttl,
            signer_names: signer_names.clone(),
            signers: signers.clone(),
            append_root_cert: options.append_root_cert,
        });
    }

    let mut group = ControllerGroup {
        tasks: JoinSet::new(),
        stop: stop.clone(),
    };
    for ctx in contexts {
        info!("starting manager for cluster {}", ctx.cluster);
        group.tasks.spawn(run_manager(ctx, stop.clone()));
    }

    Ok((root_certs, group))
}

async fn run_manager(ctx: Context, stop: CancellationToken) -> Result<()> {
    let cluster = ctx.cluster.clone();

    let (mut shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let stop_signal = stop.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = stop_signal.cancelled() => {}
            // the controller is gone already
            _ = shutdown_tx.closed() => return,
        }
        let _ = shutdown_tx.send(());
    });

    let controller = csr_controller(ctx, shutdown_rx.map(|_| ()));
    tokio::pin!(controller);
    tokio::select! {
        res = &mut controller => res?,
        _ = stop.cancelled() => {
            // a controller whose initial list never completed ignores the graceful signal
            match timeout(SHUTDOWN_GRACE_PERIOD, &mut controller).await {
                Ok(res) => res?,
                Err(_) => warn!(
                    "manager for cluster {cluster} did not drain within {:?}, aborting it",
                    SHUTDOWN_GRACE_PERIOD
                ),
            }
        }
    }

    if !stop.is_cancelled() {
        error!("manager for cluster {cluster} stopped unexpectedly");
        return Err(Error::ControllerStopped(cluster));
    }
    info!("manager for cluster {cluster} stopped");
    Ok(())
}

/// Supervised set of per-cluster controller tasks.
pub struct ControllerGroup {
    tasks: JoinSet<Result<()>>,
    stop: CancellationToken,
}

impl ControllerGroup {
    /// Number of controller tasks that have not been joined yet.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the next controller task to finish.
    ///
    /// Returns `None` once every task has been joined. A controller that exits before the
    /// stop signal fired yields [`Error::ControllerStopped`].
    pub async fn join_next(&mut self) -> Option<Result<()>> {
        let res = self.tasks.join_next().await?;
        Some(res.map_err(Error::TaskError).and_then(|res| res))
    }

    /// Wait for all controller tasks and return the first error, if any.
    pub async fn join(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(res) = self.join_next().await {
            if let Err(error) = res {
                error!("controller failed: {error}");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Fire the stop signal and wait for every controller to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.stop.cancel();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use kube::Client;
    use tempfile::{NamedTempFile, tempdir};

    struct FakeCluster {
        name: String,
        reachable: bool,
    }

    impl FakeCluster {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                reachable: true,
            }
        }
    }

    impl Cluster for FakeCluster {
        fn name(&self) -> &str {
            self.name.as_str()
        }

        async fn client(&self) -> Result<Client> {
            if !self.reachable {
                return Err(Error::ClusterError(
                    self.name.clone(),
                    "no route to host".to_string(),
                ));
            }
            // nothing listens on the discard port, watches fail and get retried
            let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
            Client::try_from(config)
                .map_err(|e| Error::ClusterError(self.name.clone(), e.to_string()))
        }
    }

    fn options(signer_names: &str, signer_root: &Path) -> Options {
        let mut options = Options::new(signer_names, false);
        options.signer_root = signer_root.to_path_buf();
        options
    }

    #[test]
    fn parse_signer_names_splits_csv() {
        assert_eq!(
            parse_signer_names("signerA, signerB").unwrap(),
            vec!["signerA".to_string(), "signerB".to_string()]
        );
        assert_eq!(
            parse_signer_names("example.com/foo").unwrap(),
            vec!["example.com/foo".to_string()]
        );
    }

    #[test]
    fn parse_signer_names_rejects_empty_entries() {
        assert!(parse_signer_names("").is_err());
        assert!(parse_signer_names("signerA,,signerB").is_err());
    }

    #[test]
    fn load_signers_keeps_input_order() {
        let root = tempdir().unwrap();
        let names = vec![
            "signerB".to_string(),
            "signerA".to_string(),
            "example.com/foo".to_string(),
        ];

        let (signers, root_certs) =
            load_signers(&names, root.path(), CERTIFICATE_DURATION).unwrap();

        assert_eq!(signers.len(), 3);
        let order: Vec<&str> = root_certs.iter().map(|r| r.signer.as_str()).collect();
        assert_eq!(order, vec!["signerB", "signerA", "example.com/foo"]);

        for root_cert in &root_certs {
            let signer = &signers[&root_cert.signer];
            let on_disk = fs::read_to_string(signer.root_cert_path()).unwrap();
            assert_eq!(root_cert.root_cert, on_disk);
        }
        assert_ne!(root_certs[0].root_cert, root_certs[1].root_cert);
    }

    #[test]
    fn load_signers_fails_without_partial_result() {
        // a file where the signer root directory should be
        let root = NamedTempFile::new().unwrap();
        let names = vec!["signerA".to_string()];

        let res = load_signers(&names, root.path(), CERTIFICATE_DURATION);
        assert!(matches!(res, Err(Error::SignerError(_, _))));
    }

    #[tokio::test]
    async fn run_without_clusters_returns_root_certs() {
        let root = tempdir().unwrap();
        let stop = CancellationToken::new();
        let clusters: Vec<FakeCluster> = vec![];

        let (root_certs, group) =
            run(&options("signerA,signerB", root.path()), stop, &clusters)
                .await
                .unwrap();

        assert_eq!(root_certs.len(), 2);
        assert_eq!(root_certs[0].signer, "signerA");
        assert_eq!(root_certs[1].signer, "signerB");
        assert!(group.is_empty());
        group.join().await.unwrap();
    }

    #[tokio::test]
    async fn run_fails_when_a_cluster_is_unreachable() {
        let root = tempdir().unwrap();
        let mut broken = FakeCluster::new("cluster-2");
        broken.reachable = false;
        let clusters = vec![FakeCluster::new("cluster-1"), broken];

        let res = run(
            &options("signerA", root.path()),
            CancellationToken::new(),
            &clusters,
        )
        .await;
        assert!(matches!(res, Err(Error::ClusterError(name, _)) if name == "cluster-2"));
    }

    #[tokio::test]
    async fn run_fails_for_invalid_signer_names() {
        let root = tempdir().unwrap();
        let clusters = vec![FakeCluster::new("cluster-1")];

        let res = run(
            &options("signerA,", root.path()),
            CancellationToken::new(),
            &clusters,
        )
        .await;
        assert!(matches!(res, Err(Error::InvalidConfigError(_))));
    }

    #[tokio::test]
    async fn stop_signal_stops_every_cluster() {
        let root = tempdir().unwrap();
        let stop = CancellationToken::new();
        let clusters = vec![FakeCluster::new("cluster-1"), FakeCluster::new("cluster-2")];

        let options = options("signerA,signerB", root.path());
        let (root_certs, group) = run(&options, stop.clone(), &clusters).await.unwrap();
        assert_eq!(root_certs.len(), 2);
        assert_eq!(group.len(), 2);

        stop.cancel();
        let res = timeout(Duration::from_secs(30), group.join())
            .await
            .expect("controllers did not stop");
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn shutdown_cancels_the_stop_signal() {
        let root = tempdir().unwrap();
        let stop = CancellationToken::new();
        let clusters = vec![FakeCluster::new("cluster-1")];

        let (_, group) = run(&options("signerA", root.path()), stop.clone(), &clusters)
            .await
            .unwrap();

        let res = timeout(Duration::from_secs(30), group.shutdown())
            .await
            .expect("controllers did not stop");
        assert!(res.is_ok());
        assert!(stop.is_cancelled());
    }

    #[tokio::test]
    async fn stop_signal_stops_a_cluster_that_never_listed() {
        let root = tempdir().unwrap();
        let stop = CancellationToken::new();
        // the initial list against this cluster never completes
        let clusters = vec![FakeCluster::new("cluster-1")];

        let (_, mut group) = run(&options("signerA", root.path()), stop.clone(), &clusters)
            .await
            .unwrap();

        // still waiting for the first list, nothing may have exited yet
        assert!(
            timeout(Duration::from_millis(500), group.join_next())
                .await
                .is_err()
        );

        stop.cancel();
        let res = timeout(SHUTDOWN_GRACE_PERIOD + Duration::from_secs(5), group.join_next())
            .await
            .expect("controller did not stop after the grace period");
        assert!(matches!(res, Some(Ok(()))));
        assert!(group.is_empty());
    }
}
