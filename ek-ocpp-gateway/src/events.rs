//! Dispatch event fan-out
//!
//! Observers subscribe per (action, phase). Each notification runs every
//! matching observer as its own task and waits for all of them; an observer
//! that fails or panics is reported to the [`ErrorSink`] and otherwise
//! ignored. Notification never influences a dispatch result.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatch::ResultKind;
use crate::identity::{Destination, NodeId};
use crate::ocpp::{Action, CorrelationId};

/// When in a dispatch an event is raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Before the request is signed and sent
    RequestSending,
    /// After the dispatch reached its result
    ResponseReceived,
}

/// What observers are told about a dispatch
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    pub sender: NodeId,
    pub action: Action,
    pub correlation_id: CorrelationId,
    pub destination: Destination,
    /// Request payload before sending, response payload (or null) afterwards
    pub payload: Value,
    pub result: Option<ResultKind>,
    pub runtime: Option<Duration>,
}

/// Observer failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ObserverError {
    #[error("{0}")]
    Failed(String),

    #[error("Observer panicked: {0}")]
    Panicked(String),
}

/// Interested party in dispatch events
#[async_trait]
pub trait Observer: Send + Sync {
    /// Name used when attributing failures
    fn name(&self) -> &str;

    async fn notify(&self, event: &DispatchEvent) -> Result<(), ObserverError>;
}

/// Synchronous closure wrapped as an [`Observer`]
pub struct FnObserver<F> {
    name: String,
    f: F,
}

impl<F> FnObserver<F>
where
    F: Fn(&DispatchEvent) -> Result<(), ObserverError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Observer for FnObserver<F>
where
    F: Fn(&DispatchEvent) -> Result<(), ObserverError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, event: &DispatchEvent) -> Result<(), ObserverError> {
        (self.f)(event)
    }
}

/// A failed observer invocation, attributed
#[derive(Debug, Clone)]
pub struct ObserverFailure {
    pub component: String,
    pub action: Action,
    pub phase: Phase,
    pub observer: String,
    pub error: ObserverError,
}

/// Receives observer failures
pub trait ErrorSink: Send + Sync {
    fn observer_failed(&self, failure: &ObserverFailure);
}

/// Logs observer failures as warnings
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn observer_failed(&self, failure: &ObserverFailure) {
        warn!(
            component = %failure.component,
            operation = %failure.action,
            observer = %failure.observer,
            "Observer failed during {:?}: {}",
            failure.phase,
            failure.error
        );
    }
}

/// Registration handle, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

type Subscribers = Vec<(ObserverHandle, Arc<dyn Observer>)>;

/// Observer registry and fan-out
pub struct EventHub {
    component: String,
    next_handle: AtomicU64,
    observers: RwLock<HashMap<(Action, Phase), Subscribers>>,
    sink: Arc<dyn ErrorSink>,
}

impl EventHub {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            next_handle: AtomicU64::new(1),
            observers: RwLock::new(HashMap::new()),
            sink: Arc::new(TracingErrorSink),
        }
    }

    /// Route observer failures somewhere other than the log
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn subscribe(&self, action: Action, phase: Phase, observer: Arc<dyn Observer>) -> ObserverHandle {
        let handle = ObserverHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!("Observer {} subscribed to {} {:?}", observer.name(), action, phase);
        self.observers
            .write()
            .entry((action, phase))
            .or_default()
            .push((handle, observer));
        handle
    }

    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        let mut observers = self.observers.write();
        for subscribers in observers.values_mut() {
            if let Some(pos) = subscribers.iter().position(|(h, _)| *h == handle) {
                subscribers.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn observer_count(&self, action: Action, phase: Phase) -> usize {
        self.observers
            .read()
            .get(&(action, phase))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Run every observer subscribed to the event's action and phase
    ///
    /// Returns the number of observers that failed.
    pub async fn notify(&self, event: DispatchEvent) -> usize {
        let subscribers: Vec<Arc<dyn Observer>> = match self.observers.read().get(&(event.action, event.phase)) {
            Some(subscribers) => subscribers.iter().map(|(_, o)| o.clone()).collect(),
            None => return 0,
        };

        let event = Arc::new(event);
        let tasks = subscribers.iter().map(|observer| {
            let observer = observer.clone();
            let event = event.clone();
            tokio::spawn(async move { observer.notify(&event).await })
        });
        let outcomes = join_all(tasks).await;

        let mut failed = 0;
        for (observer, outcome) in subscribers.iter().zip(outcomes) {
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(join_error) => match join_error.try_into_panic() {
                    Ok(panic) => ObserverError::Panicked(panic_message(panic.as_ref())),
                    Err(e) => ObserverError::Failed(e.to_string()),
                },
            };

            failed += 1;
            self.sink.observer_failed(&ObserverFailure {
                component: self.component.clone(),
                action: event.action,
                phase: event.phase,
                observer: observer.name().to_string(),
                error,
            });
        }
        failed
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
