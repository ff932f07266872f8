//! Sandbox pool operator: watches SandboxSets and keeps each one's pool of
//! pre-warmed sandboxes at its declared size.
//!
//! The controller self-disables when its feature gate is off or the CRDs
//! are not installed; it never installs them itself.

use clap::{App, Arg, ArgMatches};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_operators::sandboxset::crd::{Sandbox, SandboxSet};
use k8s_operators::sandboxset::kube_store::{KubeStore, SandboxCache};
use k8s_operators::sandboxset::queue::WorkQueue;
use k8s_operators::sandboxset::reconciler::{worker_loop, OperatorContext, PoolConfig};
use k8s_operators::sandboxset::router::EventRouter;
use k8s_operators::sandboxset::store::ObjectKey;
use k8s_operators::sandboxset::events::KubeEventPublisher;
use kube::api::{Api, ListParams};
use kube::{Client, CustomResourceExt, ResourceExt};
use kube_runtime::watcher;
use opentelemetry::global;
use shutdown::Shutdown;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let version = utils::version_info_str!();
    let matches = App::new(utils::package_description!())
        .version(version.as_str())
        .settings(&[
            clap::AppSettings::ColoredHelp,
            clap::AppSettings::ColorAlways,
        ])
        .arg(
            Arg::with_name("workers")
                .long("sandboxset-workers")
                .env("SANDBOXSET_WORKERS")
                .default_value(utils::DEFAULT_WORKERS)
                .help("maximum number of concurrent set reconciles"),
        )
        .arg(
            Arg::with_name("initial-batch-size")
                .long("sandboxset-initial-batch-size")
                .env("SANDBOXSET_INITIAL_BATCH_SIZE")
                .default_value(utils::DEFAULT_INITIAL_BATCH_SIZE)
                .help("first wave size for bulk sandbox operations"),
        )
        .arg(
            Arg::with_name("resync-period")
                .long("resync-period")
                .env("RESYNC_PERIOD")
                .default_value("5m")
                .help("how often every set is relisted and requeued as a safety net"),
        )
        .arg(
            Arg::with_name("namespace")
                .long("namespace")
                .short("n")
                .env("NAMESPACE")
                .default_value("default")
                .help("the namespace we are supposed to operate in"),
        )
        .arg(
            Arg::with_name("jaeger")
                .long("jaeger")
                .short("j")
                .env("JAEGER_ENDPOINT")
                .takes_value(true)
                .help("enable open telemetry and forward to jaeger"),
        )
        .arg(
            Arg::with_name("dump-crds")
                .long("dump-crds")
                .takes_value(false)
                .help("print the CRD manifests as yaml and exit"),
        )
        .get_matches();

    if matches.is_present("dump-crds") {
        print!("{}", serde_yaml::to_string(&SandboxSet::crd())?);
        print!("{}", serde_yaml::to_string(&Sandbox::crd())?);
        return Ok(());
    }

    utils::print_package_info!();

    let tags = utils::tracing_telemetry::default_tracing_tags(
        utils::raw_version_str(),
        env!("CARGO_PKG_VERSION"),
    );
    utils::tracing_telemetry::init_tracing(
        "sandboxset-operator",
        tags,
        matches.value_of("jaeger").map(|s| s.to_string()),
    );

    sandboxset_controller(matches).await?;
    global::shutdown_tracer_provider();
    Ok(())
}

async fn sandboxset_controller(args: ArgMatches<'_>) -> anyhow::Result<()> {
    if !utils::pool_guard_enabled() {
        warn!(gate = utils::POOL_GUARD_GATE, "feature gate is disabled, standing down");
        return Ok(());
    }

    let client = Client::try_default().await?;
    if !crds_present(client.clone()).await {
        warn!("sandbox CRDs are not installed, standing down (--dump-crds prints the manifests)");
        return Ok(());
    }

    let namespace = args.value_of("namespace").unwrap().to_string();
    let workers = args
        .value_of("workers")
        .unwrap()
        .parse::<usize>()?
        .max(1);
    let initial_batch_size = args
        .value_of("initial-batch-size")
        .unwrap()
        .parse::<usize>()?
        .max(1);
    let resync_period: std::time::Duration = args
        .value_of("resync-period")
        .unwrap()
        .parse::<humantime::Duration>()?
        .into();

    let cache = Arc::new(SandboxCache::default());
    let store = Arc::new(KubeStore::new(client.clone(), cache.clone()));
    let events = Arc::new(KubeEventPublisher::new(client.clone()));
    let ctx = OperatorContext::new(store, events, PoolConfig { initial_batch_size });
    let queue = WorkQueue::new();
    let router = Arc::new(EventRouter::new(
        cache,
        ctx.scale_up.clone(),
        ctx.scale_down.clone(),
        queue.clone(),
    ));

    let shutdown = Shutdown::install();

    // sandbox events feed the router: ledger acknowledgements, cache
    // maintenance and owner wakeups
    {
        let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), &namespace);
        let router = router.clone();
        let mut signal = shutdown.clone();
        tokio::spawn(async move {
            let stream = watcher(sandboxes, ListParams::default());
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    _ = signal.triggered() => return,
                    event = stream.next() => match event {
                        Some(Ok(event)) => router.handle(event),
                        Some(Err(watch_error)) => {
                            error!(error = %watch_error, "sandbox watch interrupted")
                        }
                        None => return,
                    },
                }
            }
        });
    }

    // set events only wake their own key
    {
        let sets: Api<SandboxSet> = Api::namespaced(client.clone(), &namespace);
        let queue = queue.clone();
        let mut signal = shutdown.clone();
        tokio::spawn(async move {
            let stream = watcher(sets, ListParams::default());
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    _ = signal.triggered() => return,
                    event = stream.next() => match event {
                        Some(Ok(watcher::Event::Applied(set)))
                        | Some(Ok(watcher::Event::Deleted(set))) => {
                            queue.add(ObjectKey::from_resource(&set));
                        }
                        Some(Ok(watcher::Event::Restarted(sets))) => {
                            for set in sets {
                                queue.add(ObjectKey::from_resource(&set));
                            }
                        }
                        Some(Err(watch_error)) => {
                            error!(error = %watch_error, "set watch interrupted")
                        }
                        None => return,
                    },
                }
            }
        });
    }

    // watches can go quiet on us; a periodic relist wakes every set anyway
    {
        let sets: Api<SandboxSet> = Api::namespaced(client.clone(), &namespace);
        let queue = queue.clone();
        let mut signal = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = signal.triggered() => return,
                    _ = tokio::time::sleep(resync_period) => {}
                }
                match sets.list(&ListParams::default()).await {
                    Ok(list) => {
                        for set in list.items {
                            queue.add(ObjectKey::from_resource(&set));
                        }
                    }
                    Err(list_error) => error!(error = %list_error, "resync list failed"),
                }
            }
        });
    }

    info!(namespace = %namespace, workers, "starting sandboxset controller");

    let mut tasks = Vec::with_capacity(workers);
    for _ in 0..workers {
        tasks.push(tokio::spawn(worker_loop(
            ctx.clone(),
            queue.clone(),
            shutdown.clone(),
        )));
    }
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

/// Presence check against the server; looking for the CRDs by name mirrors
/// how they would be fetched, without ever creating them.
async fn crds_present(client: Client) -> bool {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let wanted = [SandboxSet::crd(), Sandbox::crd()];
    for crd in &wanted {
        let name = crd.name();
        let lp = ListParams::default().fields(&format!("metadata.name={}", name));
        match crds.list(&lp).await {
            Ok(found) if found.iter().count() > 0 => {}
            Ok(_) => {
                warn!(crd = %name, "custom resource definition not found");
                return false;
            }
            Err(list_error) => {
                error!(error = %list_error, "failed to list CRDs");
                return false;
            }
        }
    }
    true
}
