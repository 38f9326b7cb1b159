//! Single-use, close-once stop signals.
//!
//! A [`ShutdownController`] is a broadcast latch built on a `watch` channel:
//! once triggered it stays triggered, and every [`ShutdownListener`]
//! (present or future) observes it. The same primitive backs the
//! per-worker stop signal, the per-microservice shutdown, and the
//! manager-wide fan-out.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::watch;

/// Owner side of a stop signal.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
}

impl ShutdownController {
    /// Creates an untriggered controller.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { signal: tx }
    }

    /// Returns a listener that resolves once [`trigger`](Self::trigger) is
    /// called.
    #[must_use]
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.signal.subscribe(),
        }
    }

    /// Fires the signal. Subsequent calls are no-ops.
    pub fn trigger(&self) {
        self.signal.send_replace(true);
    }

    /// Returns true once the signal has fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.signal.borrow()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a stop signal. Cheap to clone.
///
/// Dropping the controller releases every listener, so a task never waits on
/// a signal nobody can fire.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Waits until the signal fires (or its controller is dropped).
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Returns true if the signal has already fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Future wrapper that fires a controller if polling the inner future
/// panics, so a panicking task still releases its siblings.
pub(crate) struct TriggerOnPanic<F> {
    inner: Pin<Box<F>>,
    controller: Arc<ShutdownController>,
}

impl<F: Future> TriggerOnPanic<F> {
    pub(crate) fn new(inner: F, controller: Arc<ShutdownController>) -> Self {
        Self {
            inner: Box::pin(inner),
            controller,
        }
    }
}

struct PanicGuard<'a>(&'a ShutdownController);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.trigger();
        }
    }
}

impl<F: Future> Future for TriggerOnPanic<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let _guard = PanicGuard(&this.controller);
        this.inner.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn initial_state_is_untriggered() {
        let controller = ShutdownController::new();
        assert!(!controller.is_triggered());
        assert!(!controller.listener().is_triggered());
    }

    #[tokio::test]
    async fn listener_notified_on_trigger() {
        let controller = ShutdownController::new();
        let listener = controller.listener();

        let waiter = tokio::spawn(async move { listener.wait().await });
        controller.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("listener should be released")
            .unwrap();
        assert!(controller.is_triggered());
    }

    #[tokio::test]
    async fn listener_created_after_trigger_resolves_immediately() {
        let controller = ShutdownController::new();
        controller.trigger();
        controller.trigger();

        let listener = controller.listener();
        assert!(listener.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("already-triggered listener must not block");
    }

    #[tokio::test]
    async fn dropping_controller_releases_listeners() {
        let controller = ShutdownController::new();
        let listener = controller.listener();
        drop(controller);

        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("orphaned listener must not block");
    }

    #[tokio::test]
    async fn trigger_on_panic_fires_controller() {
        let controller = Arc::new(ShutdownController::new());

        let result = tokio::spawn(TriggerOnPanic::new(
            async {
                tokio::task::yield_now().await;
                panic!("boom");
            },
            Arc::clone(&controller),
        ))
        .await;

        assert!(result.unwrap_err().is_panic());
        assert!(controller.is_triggered());
    }

    #[tokio::test]
    async fn trigger_on_panic_is_silent_on_completion() {
        let controller = Arc::new(ShutdownController::new());
        let value = TriggerOnPanic::new(async { 7 }, Arc::clone(&controller)).await;
        assert_eq!(value, 7);
        assert!(!controller.is_triggered());
    }
}
