//! Runs the three operation controllers against the current kube context.
//!
//! Function endpoints come from `XOPS_FUNCTIONS`, a comma separated list of
//! `name=grpc-target` pairs. Set `XOPS_INSPECTOR_SOCKET` to a Unix socket
//! path to ship redacted pipeline payloads to an inspector sidecar.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;

use xops_function::{
    CacheMetrics, FileBackedRunner, GrpcFunctionRunner, InspectorEmitter, StaticFunctionLocator,
};
use xops_runtime::watch::breaker::BreakerConfig;
use xops_runtime::{cron, operation, watch, ControllerMetrics, KubeResources};

fn parse_endpoints(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, target)| (name.trim().to_string(), target.trim().to_string()))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let client = Client::try_default().await?;
    let registry = Registry::new();

    let endpoints = std::env::var("XOPS_FUNCTIONS")
        .map(|raw| parse_endpoints(&raw))
        .unwrap_or_default();
    info!(functions = endpoints.len(), "configured function endpoints");
    let locator = StaticFunctionLocator::new(endpoints);

    let cache_dir = std::env::var("XOPS_CACHE_DIR").unwrap_or_else(|_| "/tmp/xops-cache".into());
    let runner = Arc::new(
        FileBackedRunner::new(
            GrpcFunctionRunner::new(locator),
            cache_dir,
            CacheMetrics::register(&registry)?,
        )
        .with_max_ttl(Duration::from_secs(24 * 60 * 60)),
    );
    let gc_cancel = CancellationToken::new();
    let gc = {
        let runner = runner.clone();
        let cancel = gc_cancel.clone();
        tokio::spawn(async move {
            runner
                .run_garbage_collector(Duration::from_secs(60), cancel)
                .await;
        })
    };

    let inspector = match std::env::var("XOPS_INSPECTOR_SOCKET") {
        Ok(socket) => Some(InspectorEmitter::unix(socket)?),
        Err(_) => None,
    };

    let metrics = ControllerMetrics::register(&registry)?;
    let resources = Arc::new(KubeResources::new(client.clone()));

    let operations = Arc::new(operation::OperationContext {
        client: client.clone(),
        functions: runner.clone(),
        reader: resources.clone(),
        applier: resources.clone(),
        inspector,
        metrics: metrics.clone(),
    });
    let crons = Arc::new(cron::CronContext {
        client: client.clone(),
        ops: resources.clone(),
        metrics: metrics.clone(),
    });
    let watches = Arc::new(watch::WatchContext::new(
        client,
        resources,
        metrics,
        BreakerConfig::default(),
    ));

    info!("starting operation controllers");
    tokio::select! {
        () = operation::run(operations) => {}
        () = cron::run(crons) => {}
        () = watch::run(watches) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted; shutting down"),
    }
    gc_cancel.cancel();
    let _ = gc.await;
    Ok(())
}
