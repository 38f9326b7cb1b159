//! Prometheus exposition worker and the microservice factory that wraps it.

use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use radian_core::{Bind, ConfigStore, Schema};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::base::WorkerBase;
use super::Worker;
use crate::lifecycle::Microservice;

/// Worker name used by [`create_microservice`].
pub const MONITORING_WORKER_NAME: &str = "monitoring_service";

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Process-wide recorder handle. The recorder can only be installed once.
static RECORDER: Mutex<Option<PrometheusHandle>> = parking_lot::const_mutex(None);

/// Installs the Prometheus recorder on first call and returns its handle.
///
/// # Errors
///
/// Fails if another global `metrics` recorder is already installed.
pub fn prometheus_handle() -> anyhow::Result<PrometheusHandle> {
    let mut slot = RECORDER.lock();
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing Prometheus recorder")?;
    *slot = Some(handle.clone());
    Ok(handle)
}

// ---------------------------------------------------------------------------
// MonitoringConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringConfig {
    pub listen: String,
    pub port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0".to_string(),
            port: 0,
        }
    }
}

impl Bind for MonitoringConfig {
    fn schema() -> Schema<Self> {
        Schema::new()
            .field("Listen,required", |c: &mut Self| &mut c.listen)
            .field("Port,required", |c: &mut Self| &mut c.port)
    }
}

// ---------------------------------------------------------------------------
// MonitoringWorker
// ---------------------------------------------------------------------------

/// Serves `GET /metrics` (Prometheus text format) and `GET /health/live`.
pub struct MonitoringWorker {
    base: WorkerBase,
    config: MonitoringConfig,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    handle: Mutex<Option<PrometheusHandle>>,
}

impl MonitoringWorker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: MonitoringConfig) -> Self {
        Self {
            base: WorkerBase::new(name),
            config,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

/// Builds the exposition router for `handle`.
pub fn build_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move {
                    handle.run_upkeep();
                    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], handle.render())
                }
            }),
        )
        .route("/health/live", get(liveness_handler))
        .layer(TraceLayer::new_for_http())
}

/// Liveness probe: 200 while the process is serving.
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

#[async_trait]
impl Worker for MonitoringWorker {
    fn base(&self) -> &WorkerBase {
        &self.base
    }

    async fn setup(&self) -> anyhow::Result<()> {
        info!("setting up monitoring service");
        let handle = prometheus_handle()?;
        let listener = TcpListener::bind(format!("{}:{}", self.config.listen, self.config.port))
            .await
            .with_context(|| format!("binding {}:{}", self.config.listen, self.config.port))?;
        let addr = listener.local_addr()?;
        info!(%addr, "monitoring listener bound");

        *self.handle.lock() = Some(handle);
        *self.local_addr.lock() = Some(addr);
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    async fn run(&self) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("monitoring listener is not bound; setup must run first"))?;
        let handle = self
            .handle
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Prometheus recorder is not installed"))?;
        let stop = self.base.stop_listener();

        info!("running monitoring service");
        axum::serve(listener, build_router(handle))
            .with_graceful_shutdown(async move { stop.wait().await })
            .await?;
        info!("monitoring service stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Microservice factory producing a single [`MonitoringWorker`] named
/// [`MONITORING_WORKER_NAME`], configured from the `Listen` and `Port` keys
/// of `config`.
///
/// # Errors
///
/// Fails if `config` is absent, a required key is missing or malformed.
pub fn create_microservice(name: &str, config: Option<ConfigStore>) -> anyhow::Result<Microservice> {
    let config = config
        .ok_or_else(|| anyhow::anyhow!("configuration is not provided for microservice {name}"))?;

    let mut monitoring = MonitoringConfig::default();
    config
        .bind(&mut monitoring, false)
        .with_context(|| format!("loading configuration for microservice {name}"))?;

    let mut microservice = Microservice::new(name);
    microservice
        .add_worker(MonitoringWorker::new(MONITORING_WORKER_NAME, monitoring))
        .with_context(|| format!("adding monitoring worker to microservice {name}"))?;
    Ok(microservice)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use radian_core::ConfigValue;
    use tower::ServiceExt;

    use super::*;

    fn monitoring_store(listen: &str, port: &str) -> ConfigStore {
        let mut store = ConfigStore::new();
        store.set_value(&["Listen"], listen).unwrap();
        store.set_value(&["Port"], port).unwrap();
        store
    }

    #[test]
    fn factory_requires_config() {
        let err = create_microservice("monitoring", None).unwrap_err();
        assert!(err.to_string().contains("not provided"));
    }

    #[test]
    fn factory_requires_port() {
        let mut store = ConfigStore::new();
        store.set_value(&["Listen"], "127.0.0.1").unwrap();
        let err = create_microservice("monitoring", Some(store)).unwrap_err();
        assert!(format!("{err:#}").contains("'Port' is required"));
    }

    #[test]
    fn factory_builds_single_worker() {
        let store = monitoring_store("127.0.0.1", "9100");
        let microservice = create_microservice("monitoring", Some(store)).unwrap();
        assert_eq!(microservice.name(), "monitoring");
        assert_eq!(microservice.worker_names(), [MONITORING_WORKER_NAME]);
    }

    #[test]
    fn config_accepts_native_port() {
        let mut store = ConfigStore::new();
        store.set_value(&["Listen"], "0.0.0.0").unwrap();
        store.set_value(&["Port"], ConfigValue::Int(9100)).unwrap();
        let mut config = MonitoringConfig::default();
        store.bind(&mut config, false).unwrap();
        assert_eq!(config.port, 9100);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_recorded_values() {
        let handle = prometheus_handle().unwrap();
        metrics::counter!("radian_monitoring_test_total").increment(3);

        let response = build_router(handle)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("radian_monitoring_test_total 3"), "{text}");
    }

    #[tokio::test]
    async fn liveness_probe_is_ok() {
        let handle = prometheus_handle().unwrap();
        let response = build_router(handle)
            .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn worker_serves_until_stopped() {
        let worker = std::sync::Arc::new(MonitoringWorker::new(
            MONITORING_WORKER_NAME,
            MonitoringConfig {
                listen: "127.0.0.1".to_string(),
                port: 0,
            },
        ));
        worker.setup().await.unwrap();
        assert!(worker.local_addr().is_some());

        let running = {
            let worker = std::sync::Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };
        worker.stop();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("run should return after stop")
            .unwrap()
            .unwrap();
    }
}
