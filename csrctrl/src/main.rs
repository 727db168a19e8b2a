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

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use csrctrl::consts::SIGNER_ROOT;
use csrctrl::*;
use kube::Client;
use kube::config::KubeConfigOptions;
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::EnvFilter;

/// Signs approved CertificateSigningRequests with local test signers.
#[derive(Debug, Parser)]
#[command(name = "csr-controller")]
struct Args {
    /// Comma separated list of signer names to serve
    #[clap(long)]
    signer_names: String,
    /// Append the signer root certificate to issued chains
    #[clap(long, default_value_t = false)]
    append_root_cert: bool,
    /// Kubeconfig context to run a controller for, may be repeated.
    /// The current context is used when none is given.
    #[clap(long = "context")]
    contexts: Vec<String>,
    /// Directory for the signer CA material
    #[clap(long, default_value = SIGNER_ROOT)]
    signer_root: PathBuf,
    /// Lifetime of the issued certificates in seconds
    #[clap(long, default_value_t = 3600)]
    cert_ttl_secs: u64,
}

/// A cluster reachable through a kubeconfig context.
struct KubeContext {
    name: String,
    context: Option<String>,
}

impl Cluster for KubeContext {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn client(&self) -> Result<Client> {
        let Some(context) = &self.context else {
            return Client::try_default()
                .await
                .map_err(|e| Error::ClusterError(self.name.clone(), e.to_string()));
        };

        let options = KubeConfigOptions {
            context: Some(context.clone()),
            cluster: None,
            user: None,
        };
        let config = kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::ClusterError(self.name.clone(), e.to_string()))?;
        Client::try_from(config)
            .map_err(|e| Error::ClusterError(self.name.clone(), e.to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = run(args).await {
        error!("csr controller failed: {error:?}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let clusters: Vec<KubeContext> = if args.contexts.is_empty() {
        vec![KubeContext {
            name: "default".to_string(),
            context: None,
        }]
    } else {
        args.contexts
            .iter()
            .map(|context| KubeContext {
                name: context.clone(),
                context: Some(context.clone()),
            })
            .collect()
    };

    let mut options = Options::new(args.signer_names, args.append_root_cert);
    options.signer_root = args.signer_root;
    options.cert_ttl = Duration::from_secs(args.cert_ttl_secs);

    let stop = CancellationToken::new();
    let (root_certs, controllers) = run_csr_controller(&options, stop.clone(), &clusters)
        .await
        .context("failed to start controllers")?;

    let mut stdout = std::io::stdout().lock();
    for root_cert in &root_certs {
        writeln!(stdout, "# signer: {}", root_cert.signer)?;
        write!(stdout, "{}", root_cert.root_cert)?;
    }
    stdout.flush()?;
    drop(stdout);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(error) => {
                error!("unable to listen for shutdown signal: {error}");
                return;
            }
        }
        stop.cancel();
    });

    controllers.join().await.context("controller failed")?;
    Ok(())
}
