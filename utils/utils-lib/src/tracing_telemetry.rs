use opentelemetry::{global, sdk::propagation::TraceContextPropagator, KeyValue};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Tags attached to every exported span.
pub fn default_tracing_tags(git_commit: &str, crate_version: &str) -> Vec<KeyValue> {
    vec![
        KeyValue::new("git.commit", git_commit.to_string()),
        KeyValue::new("crate.version", crate_version.to_string()),
    ]
}

/// Initialise the tracing subscriber: an env-filtered fmt layer, plus a
/// jaeger exporter when an agent endpoint is given.
///
/// Must run on a tokio current-thread runtime when jaeger is enabled.
pub fn init_tracing(service_name: &str, tracing_tags: Vec<KeyValue>, jaeger: Option<String>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    let exporting = jaeger.is_some();
    match jaeger {
        Some(jaeger) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let tracer = opentelemetry_jaeger::new_pipeline()
                .with_agent_endpoint(jaeger)
                .with_service_name(service_name.to_string())
                .with_tags(tracing_tags)
                .install_batch(opentelemetry::runtime::TokioCurrentThread)
                .expect("jaeger pipeline install");
            subscriber
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
        }
        None => subscriber.init(),
    }
    tracing::info!(service = service_name, jaeger = exporting, "tracing initialised");
}
