//! The narrow seam to the routing engine: submit a unit of work, get a
//! completion back.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::error::RouteError;
use crate::exchange::Exchange;

/// Something that accepts units of work.
///
/// `submit` must not block beyond enqueueing the exchange. Units are
/// considered submitted in the order `submit` is called.
pub trait RouteEngine: Send + Sync + 'static {
    fn submit(&self, exchange: Exchange) -> Result<Completion, RouteError>;
}

/// Resolves with the processed exchange once a unit of work finishes.
///
/// If the engine drops the unit without answering, this resolves to
/// [`RouteError::Cancelled`] rather than staying pending.
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion {
    rx: oneshot::Receiver<Result<Exchange, RouteError>>,
}

impl Completion {
    /// A completion and the sender that resolves it, for custom engines.
    pub fn channel() -> (CompletionSender, Completion) {
        let (tx, rx) = oneshot::channel();
        (CompletionSender { tx }, Completion { rx })
    }

    /// A completion that is already resolved.
    pub fn ready(result: Result<Exchange, RouteError>) -> Completion {
        let (tx, completion) = Self::channel();
        tx.complete(result);
        completion
    }
}

impl Future for Completion {
    type Output = Result<Exchange, RouteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RouteError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The resolving half of a [`Completion`].
pub struct CompletionSender {
    tx: oneshot::Sender<Result<Exchange, RouteError>>,
}

impl CompletionSender {
    pub fn complete(self, result: Result<Exchange, RouteError>) {
        // The submitter may have stopped waiting; that is not an error here.
        let _ = self.tx.send(result);
    }
}

/// An async processor run by a [`Route`] for each unit of work.
pub type ProcessorFn =
    Arc<dyn Fn(Exchange) -> BoxFuture<'static, Result<Exchange, RouteError>> + Send + Sync>;

/// Helper to create a boxed processor from an async closure.
pub fn processor_fn<F, Fut>(f: F) -> ProcessorFn
where
    F: Fn(Exchange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Exchange, RouteError>> + Send + 'static,
{
    Arc::new(move |exchange| Box::pin(f(exchange)))
}

/// A route that runs each unit of work as its own tokio task.
pub struct Route {
    name: String,
    processor: ProcessorFn,
    stopped: AtomicBool,
}

impl Route {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Exchange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Exchange, RouteError>> + Send + 'static,
    {
        Self::from_processor(name, processor_fn(f))
    }

    pub fn from_processor(name: impl Into<String>, processor: ProcessorFn) -> Self {
        Self {
            name: name.into(),
            processor,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting new units of work. Units already running finish normally.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        info!(route = %self.name, "Route stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl RouteEngine for Route {
    fn submit(&self, exchange: Exchange) -> Result<Completion, RouteError> {
        if self.is_stopped() {
            return Err(RouteError::Stopped(self.name.clone()));
        }

        let (tx, completion) = Completion::channel();
        let unit = (self.processor)(exchange);
        let name = self.name.clone();

        tokio::spawn(async move {
            let result = match AssertUnwindSafe(unit).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    error!(route = %name, "Route processor panicked");
                    Err(RouteError::Panicked)
                }
            };
            tx.complete(result);
        });

        Ok(completion)
    }
}

/// Registry of routes addressable by destination name (e.g. `direct:replies`).
pub struct RouteContext {
    routes: DashMap<String, Arc<dyn RouteEngine>, ahash::RandomState>,
}

impl RouteContext {
    pub fn new() -> Self {
        Self {
            routes: DashMap::default(),
        }
    }

    /// Register an engine under `destination`, replacing any previous one.
    pub fn add_route(&self, destination: impl Into<String>, engine: Arc<dyn RouteEngine>) {
        let destination = destination.into();
        info!(destination = %destination, "Registered route");
        self.routes.insert(destination, engine);
    }

    /// Register an async closure as a [`Route`] under `destination`.
    pub fn route<F, Fut>(&self, destination: impl Into<String>, f: F) -> Arc<Route>
    where
        F: Fn(Exchange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Exchange, RouteError>> + Send + 'static,
    {
        let destination = destination.into();
        let route = Arc::new(Route::new(destination.clone(), f));
        self.add_route(destination, route.clone());
        route
    }

    pub fn resolve(&self, destination: &str) -> Option<Arc<dyn RouteEngine>> {
        self.routes
            .get(destination)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove_route(&self, destination: &str) -> Option<Arc<dyn RouteEngine>> {
        self.routes.remove(destination).map(|(_, engine)| engine)
    }

    /// Submit directly to the route registered under `destination`.
    pub fn submit(&self, destination: &str, exchange: Exchange) -> Result<Completion, RouteError> {
        let engine = self
            .resolve(destination)
            .ok_or_else(|| RouteError::NoRoute(destination.to_owned()))?;
        engine.submit(exchange)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for RouteContext {
    fn default() -> Self {
        Self::new()
    }
}
