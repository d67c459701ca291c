//! Stratus Operator - control-plane orchestration for Kubernetes

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{reflector::ObjectRef, Controller};
use kube::{Api, Client, CustomResourceExt};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratus::config::OperatorConfig;
use stratus::controller::{
    error_policy, reconcile, version_error_policy, version_reconcile, Context, VersionContext,
};
use stratus::crd::{StratusControlPlane, StratusVersion};
use stratus::store::KubeStore;

/// Stratus - CRD-driven Kubernetes operator for control-plane orchestration
#[derive(Parser, Debug)]
#[command(name = "stratus", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let control_plane = serde_yaml::to_string(&StratusControlPlane::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {e}"))?;
        let version = serde_yaml::to_string(&StratusVersion::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {e}"))?;
        println!("{control_plane}---\n{version}");
        return Ok(());
    }

    run_controllers().await
}

/// Run both controllers until shutdown
async fn run_controllers() -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let config = OperatorConfig::from_process_env()?;
    info!(
        available_version = %config.available_version,
        images = config.image_defaults.len(),
        "starting stratus operator"
    );

    let store = Arc::new(KubeStore::new(client.clone()));
    let ctx = Arc::new(Context::new(store.clone(), config.clone())?);
    let version_ctx = Arc::new(VersionContext { store, config });

    let control_planes: Api<StratusControlPlane> = Api::all(client.clone());
    let versions: Api<StratusVersion> = Api::all(client);

    // The control plane owns its version resource; version progress
    // (image resolution, update phases) retriggers the sequencer.
    let control_plane_controller = Controller::new(control_planes.clone(), WatcherConfig::default())
        .owns(versions.clone(), WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(object = %obj.name, "reconciled control plane"),
                Err(e) => warn!(error = %e, "control plane reconcile failed"),
            }
        });

    // The version controller tracks deployed images reported on the
    // control plane, so control plane changes map back to its version.
    let version_controller = Controller::new(versions, WatcherConfig::default())
        .watches(control_planes, WatcherConfig::default(), |cp| {
            let name = cp.metadata.name?;
            let namespace = cp.metadata.namespace?;
            Some(ObjectRef::new(&name).within(&namespace))
        })
        .shutdown_on_signal()
        .run(version_reconcile, version_error_policy, version_ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(object = %obj.name, "reconciled version"),
                Err(e) => warn!(error = %e, "version reconcile failed"),
            }
        });

    tokio::join!(control_plane_controller, version_controller);
    Ok(())
}
