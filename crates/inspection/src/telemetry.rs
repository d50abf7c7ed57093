//! Telemetry helpers for tracing spans and Prometheus metrics.

use std::{io, net::SocketAddr, path::Path, sync::OnceLock, thread, time::Duration};

use anyhow::{Context, Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::config::TelemetryOptions;

/// `None` once the HTTP exporter owns the recorder.
static PROM_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Guard returned when a telemetry subscriber has been installed for the current thread.
pub struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Install tracing subscribers for the current thread based on telemetry options.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());

    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(fmt::time::uptime())
                    .with_filter(env_filter),
            )
            .with(tracing_error::ErrorLayer::default()),
    );

    TelemetryGuard {
        _default_guard: default_guard,
        _chrome_guard: chrome_guard,
    }
}

/// Install the global metrics recorder once.
///
/// With a listen address the Prometheus exporter serves `/metrics` over HTTP;
/// otherwise metrics are only kept in-process and can be dumped with
/// [`render_metrics`].
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<()> {
    if PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = match listen {
        Some(addr) => {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .with_context(|| format!("failed to start Prometheus exporter on {addr}"))?;
            info!("Prometheus metrics available at http://{addr}/metrics");
            None
        }
        None => {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|_| anyhow!("a global metrics recorder is already installed"))?;

            let upkeep_handle = handle.clone();
            if PROM_UPKEEP_THREAD.get().is_none() {
                let thread = spawn_thread("prometheus-upkeep", move || {
                    loop {
                        thread::sleep(Duration::from_secs(5));
                        upkeep_handle.run_upkeep();
                    }
                })
                .context("failed to spawn prometheus upkeep thread")?;
                let _ = PROM_UPKEEP_THREAD.set(thread);
            }
            Some(handle)
        }
    };

    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

/// Prometheus text rendering of the in-process metrics, when kept locally.
pub fn render_metrics() -> Option<String> {
    PROM_HANDLE
        .get()
        .and_then(|handle| handle.as_ref())
        .map(PrometheusHandle::render)
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> Result<
    (
        tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
        tracing_chrome::FlushGuard,
    ),
    std::io::Error,
> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}
