//! HTTP worker serving caller-supplied `axum` routes.
//!
//! The listener is bound during `setup` and served during `run` until the
//! worker is stopped. Every request passes through the transport stack
//! below, outermost first:
//!
//! 1. `SetRequestId` assigns an `X-Request-Id` to each request
//! 2. `Tracing` logs request/response with structured spans
//! 3. `CatchPanic` turns a panicking handler into a 500 response
//! 4. `Timeout` bounds request processing time
//! 5. `PropagateRequestId` copies `X-Request-Id` onto the response
//!
//! When monitoring is enabled, matched routes additionally record request
//! counts and latencies through `metrics`.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{MatchedPath, Request, State};
use axum::http::header::HeaderName;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use axum::{Json, Router};
use parking_lot::Mutex;
use radian_core::{Bind, Schema};
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::base::WorkerBase;
use super::Worker;
use crate::resource::{Resource, ResourceError, ResourceRegistry};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// RestConfig
// ---------------------------------------------------------------------------

/// Listener settings, bound from a configuration subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestConfig {
    pub listen: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl RestConfig {
    #[must_use]
    pub fn new(listen: impl Into<String>, port: u16) -> Self {
        Self {
            listen: listen.into(),
            port,
            ..Self::default()
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0".to_string(),
            port: 0,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Bind for RestConfig {
    fn schema() -> Schema<Self> {
        Schema::new()
            .field("listen,required", |c: &mut Self| &mut c.listen)
            .field("port,required", |c: &mut Self| &mut c.port)
            .field("request_timeout", |c: &mut Self| &mut c.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Handler-facing types
// ---------------------------------------------------------------------------

/// Router state: the worker's name and its resources.
#[derive(Debug, Clone)]
pub struct RestState {
    worker: Arc<str>,
    resources: Arc<ResourceRegistry>,
}

impl RestState {
    #[must_use]
    pub fn worker_name(&self) -> &str {
        &self.worker
    }

    /// # Errors
    ///
    /// [`ResourceError::NotFound`] if the worker has no resource named `name`.
    pub fn resource(&self, name: &str) -> Result<Arc<dyn Resource>, ResourceError> {
        self.resources.get(name)
    }

    /// # Errors
    ///
    /// See [`ResourceRegistry::get_as`].
    pub fn resource_as<T: Resource>(&self, name: &str) -> Result<Arc<T>, ResourceError> {
        self.resources.get_as(name)
    }
}

/// Error returned from a route handler. Logged and answered with a generic
/// JSON 500; the worker keeps serving.
#[derive(Debug)]
pub struct HandlerError(pub anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for HandlerError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "request handler failed");
        internal_error()
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal server error" })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// RestWorker
// ---------------------------------------------------------------------------

/// Worker that serves an `axum` router on `listen:port` until stopped.
pub struct RestWorker {
    base: WorkerBase,
    config: RestConfig,
    router: Router<RestState>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RestWorker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: RestConfig) -> Self {
        Self {
            base: WorkerBase::new(name),
            config,
            router: Router::new(),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Adds a route. Handlers extract [`RestState`] to reach resources.
    pub fn route(&mut self, path: &str, method_router: MethodRouter<RestState>) -> &mut Self {
        self.router = std::mem::take(&mut self.router).route(path, method_router);
        self
    }

    #[must_use]
    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    /// Address the listener is bound to, once `setup` has run.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Assembles the routes with the transport middleware stack.
    #[must_use]
    pub fn build_router(&self) -> Router {
        let state = RestState {
            worker: self.base.name().into(),
            resources: Arc::clone(self.base.resources()),
        };

        let mut router = self.router.clone();
        if self.base.monitoring_enabled() {
            router = router.route_layer(axum::middleware::from_fn_with_state(
                Arc::<str>::from(self.base.name()),
                record_request_metrics,
            ));
        }

        apply_http_layers(
            router,
            Duration::from_secs(self.config.request_timeout_secs),
        )
        .with_state(state)
    }
}

#[async_trait]
impl Worker for RestWorker {
    fn base(&self) -> &WorkerBase {
        &self.base
    }

    async fn setup(&self) -> anyhow::Result<()> {
        info!("setting up REST service");
        let listener = TcpListener::bind(self.config.address()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "REST listener bound");

        *self.local_addr.lock() = Some(addr);
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    async fn run(&self) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("REST listener is not bound; setup must run first"))?;
        let router = self.build_router();
        let stop = self.base.stop_listener();

        info!("running REST service");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.wait().await })
            .await?;
        info!("REST service stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

fn apply_http_layers<S>(router: Router<S>, request_timeout: Duration) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let x_request_id = HeaderName::from_static("x-request-id");

    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::custom(handle_panic))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                request_timeout,
            ))
            .layer(PropagateRequestIdLayer::new(x_request_id)),
    )
}

fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    error!(panic = %message, "request handler panicked");
    internal_error()
}

async fn record_request_metrics(
    State(worker): State<Arc<str>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.extensions().get::<MatchedPath>().map_or_else(
        || request.uri().path().to_owned(),
        |matched| matched.as_str().to_owned(),
    );
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        "radian_rest_requests_total",
        "worker" => worker.to_string(),
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "radian_rest_request_duration_seconds",
        "worker" => worker.to_string(),
        "method" => method,
        "path" => path
    )
    .record(started.elapsed().as_secs_f64());

    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
