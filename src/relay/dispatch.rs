//! Listener fan-out.
//!
//! Each inbound payload is handed to every listener registered for its
//! destination, one after another in registration order. A listener that
//! returns an error or panics is logged and skipped; the remaining listeners
//! still run and other destinations are unaffected.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tracing::{debug, error, Instrument};

use super::events::{EventPublisher, RelayEvent};
use crate::address::Destination;
use crate::error::RelayError;
use crate::model::Payload;

/// Error returned by a listener.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl From<String> for ListenerError {
    fn from(message: String) -> Self {
        ListenerError(message)
    }
}

impl From<&str> for ListenerError {
    fn from(message: &str) -> Self {
        ListenerError(message.to_string())
    }
}

/// Receives payloads delivered to a destination.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, payload: Arc<Payload>)
        -> BoxFuture<'static, Result<(), ListenerError>>;
}

/// Cloneable listener handle stored in a destination's listener list.
///
/// Identity is the identity of the underlying allocation: clones of the same
/// `Listener` are the same listener, two `Listener`s built from equal
/// closures are not.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<dyn MessageListener>,
}

impl Listener {
    pub fn new(listener: impl MessageListener + 'static) -> Self {
        Self {
            inner: Arc::new(listener),
        }
    }

    pub fn from_arc(listener: Arc<dyn MessageListener>) -> Self {
        Self { inner: listener }
    }

    /// True when both handles refer to the same listener.
    pub fn same_as(&self, other: &Listener) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.inner) as *const (),
            Arc::as_ptr(&other.inner) as *const (),
        )
    }

    fn invoke(&self, payload: Arc<Payload>) -> BoxFuture<'static, Result<(), ListenerError>> {
        self.inner.on_message(payload)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("ptr", &(Arc::as_ptr(&self.inner) as *const ()))
            .finish()
    }
}

struct FnListener<F>(F);

impl<F> MessageListener for FnListener<F>
where
    F: Fn(&Payload) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_message(
        &self,
        payload: Arc<Payload>,
    ) -> BoxFuture<'static, Result<(), ListenerError>> {
        future::ready((self.0)(&payload)).boxed()
    }
}

struct AsyncFnListener<F>(F);

impl<F, Fut> MessageListener for AsyncFnListener<F>
where
    F: Fn(Arc<Payload>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    fn on_message(
        &self,
        payload: Arc<Payload>,
    ) -> BoxFuture<'static, Result<(), ListenerError>> {
        (self.0)(payload).boxed()
    }
}

/// Build a listener from a synchronous closure.
pub fn listener_fn<F>(f: F) -> Listener
where
    F: Fn(&Payload) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    Listener::new(FnListener(f))
}

/// Build a listener from a closure returning a future.
pub fn listener_async<F, Fut>(f: F) -> Listener
where
    F: Fn(Arc<Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    Listener::new(AsyncFnListener(f))
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that completed successfully.
    pub delivered: usize,
    /// Listeners that failed or panicked.
    pub failed: usize,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Execution-context hook wrapped around every fan-out.
///
/// Embedding applications that need listeners to run in a particular
/// context (a UI-owned runtime, a `LocalSet`, a span with request context)
/// implement this instead of the relay assuming one.
pub trait DispatchContext: Send + Sync {
    fn run<'a>(&'a self, fanout: BoxFuture<'a, DispatchReport>) -> BoxFuture<'a, DispatchReport>;
}

/// Runs the fan-out directly on the destination's delivery task.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl DispatchContext for Inline {
    fn run<'a>(&'a self, fanout: BoxFuture<'a, DispatchReport>) -> BoxFuture<'a, DispatchReport> {
        fanout
    }
}

/// Fans inbound payloads out to listeners.
pub struct Dispatcher {
    context: Arc<dyn DispatchContext>,
    events: EventPublisher,
}

impl Dispatcher {
    pub fn new(context: Arc<dyn DispatchContext>, events: EventPublisher) -> Self {
        Self { context, events }
    }

    /// Invoke every listener with `payload`, in order, isolating failures.
    pub async fn dispatch(
        &self,
        destination: &Destination,
        listeners: &[Listener],
        payload: Arc<Payload>,
    ) -> DispatchReport {
        let span = tracing::info_span!(
            "relay.dispatch",
            destination = %destination,
            listeners = listeners.len()
        );

        let fanout = self.fan_out(destination, listeners, Arc::clone(&payload)).boxed();
        let report = self.context.run(fanout).instrument(span).await;

        debug!(
            destination = %destination,
            subject = %payload.subject(),
            delivered = report.delivered,
            failed = report.failed,
            "Payload dispatched"
        );

        self.events.publish(RelayEvent::Delivered {
            destination: destination.clone(),
            payload,
            report,
        });
        report
    }

    async fn fan_out(
        &self,
        destination: &Destination,
        listeners: &[Listener],
        payload: Arc<Payload>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        for listener in listeners {
            match Self::invoke_isolated(listener, Arc::clone(&payload)).await {
                Ok(()) => report.delivered += 1,
                Err(message) => {
                    let failure = RelayError::ListenerFailure {
                        destination: destination.name().to_string(),
                        message: message.clone(),
                    };
                    error!(destination = %destination, error = %failure, "Listener failed");
                    self.events.publish(RelayEvent::ListenerFailed {
                        destination: destination.clone(),
                        message,
                    });
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Run one listener, converting errors and panics into a message.
    async fn invoke_isolated(listener: &Listener, payload: Arc<Payload>) -> Result<(), String> {
        // Synchronous listeners do their work before returning the future
        let future = std::panic::catch_unwind(AssertUnwindSafe(|| listener.invoke(payload)))
            .map_err(|panic| panic_message(panic.as_ref()))?;

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(panic_message(panic.as_ref())),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("listener panicked: {}", s)
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Envelope, MessageType, ReceiverType, SenderType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn payload() -> Arc<Payload> {
        Arc::new(Payload::Message(Envelope::new(
            (SenderType::Teacher, 1),
            (ReceiverType::Student, 2),
            "Homework",
            "Chapter 3",
            MessageType::Message,
        )))
    }

    fn dispatcher() -> (Dispatcher, EventPublisher) {
        let events = EventPublisher::new(16);
        (Dispatcher::new(Arc::new(Inline), events.clone()), events)
    }

    fn counting(count: &Arc<AtomicUsize>) -> Listener {
        let count = count.clone();
        listener_fn(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    async fn panicking(_: Arc<Payload>) -> Result<(), ListenerError> {
        panic!("async panic")
    }

    fn dest() -> Destination {
        Destination::point_to_point("user.student.2")
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let (dispatcher, _) = dispatcher();
        let count = Arc::new(AtomicUsize::new(0));
        let listeners = vec![counting(&count), counting(&count)];

        let report = dispatcher.dispatch(&dest(), &listeners, payload()).await;

        assert_eq!(report, DispatchReport { delivered: 2, failed: 0 });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dispatch_failure_does_not_stop_fanout() {
        let (dispatcher, events) = dispatcher();
        let mut rx = events.subscribe();
        let count = Arc::new(AtomicUsize::new(0));
        let listeners = vec![
            listener_fn(|_| Err("boom".into())),
            counting(&count), // Should still be called
        ];

        let report = dispatcher.dispatch(&dest(), &listeners, payload()).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert!(!report.is_success());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(
            rx.recv().await.unwrap(),
            RelayEvent::ListenerFailed { ref message, .. } if message == "boom"
        ));
    }

    #[tokio::test]
    async fn test_panicking_listeners_are_isolated() {
        let (dispatcher, _) = dispatcher();
        let count = Arc::new(AtomicUsize::new(0));
        let listeners = vec![
            listener_fn(|_| panic!("sync panic")),
            listener_async(panicking),
            counting(&count),
        ];

        let report = dispatcher.dispatch(&dest(), &listeners, payload()).await;

        assert_eq!(report, DispatchReport { delivered: 1, failed: 2 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_runs_in_registration_order() {
        let (dispatcher, _) = dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));
        let listeners: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                listener_async(move |_| {
                    let order = order.clone();
                    async move {
                        tokio::task::yield_now().await;
                        order.lock().unwrap().push(i);
                        Ok(())
                    }
                })
            })
            .collect();

        dispatcher.dispatch(&dest(), &listeners, payload()).await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    struct CountingContext(AtomicUsize);

    impl DispatchContext for CountingContext {
        fn run<'a>(
            &'a self,
            fanout: BoxFuture<'a, DispatchReport>,
        ) -> BoxFuture<'a, DispatchReport> {
            self.0.fetch_add(1, Ordering::SeqCst);
            fanout
        }
    }

    #[tokio::test]
    async fn test_dispatch_context_wraps_each_fanout() {
        let context = Arc::new(CountingContext(AtomicUsize::new(0)));
        let dispatcher = Dispatcher::new(context.clone(), EventPublisher::new(4));
        let count = Arc::new(AtomicUsize::new(0));

        dispatcher.dispatch(&dest(), &[counting(&count)], payload()).await;
        dispatcher.dispatch(&dest(), &[counting(&count)], payload()).await;

        assert_eq!(context.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_identity() {
        let a = listener_fn(|_| Ok(()));
        let b = listener_fn(|_| Ok(()));
        assert!(a.same_as(&a.clone()));
        assert!(!a.same_as(&b));
    }
}
