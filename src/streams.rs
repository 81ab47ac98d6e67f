// Bridges between engine call objects and futures/streams.
//
// Engine -> reactive: `CallStream` turns the events of a readable call into a
// `Stream`, `unary_callback` turns a completion callback into a `Future`.
// Reactive -> engine: `forward_to` drives a `TryStream` into a writable call.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::channel::{mpsc, oneshot};
use futures::future::{AbortHandle, Abortable};
use futures::{FutureExt, Stream, StreamExt, TryStream, TryStreamExt};
use log::trace;

use crate::engine::{CallEvent, ClientCall, Listener, Readable, UnaryCallback, Writable};
use crate::normalize::{panic_error, to_engine_error, to_rpc_error};
use crate::status::RpcError;
use crate::utils::BoxError;

type Canceller = Box<dyn Fn() + Send + Sync>;

enum State<T> {
    Idle,
    Active {
        listener: Listener<T>,
        events: mpsc::UnboundedReceiver<Result<T, RpcError>>,
        terminated: Arc<AtomicBool>,
    },
    Done,
}

/// Lazy stream over the events of one readable call object.
///
/// The listener is attached on first poll and detached when the stream ends or
/// is dropped. Dropping it before the call terminates, polled or not, cancels
/// the call if the stream was built with [`CallStream::cancel_on_unsubscribe`].
pub struct CallStream<T: Send + 'static, C: ?Sized + Readable<T> + 'static> {
    call: Arc<C>,
    state: State<T>,
    canceller: Option<Canceller>,
}

impl<T: Send + 'static, C: ?Sized + Readable<T> + 'static> CallStream<T, C> {
    pub fn new(call: Arc<C>) -> Self {
        Self {
            call,
            state: State::Idle,
            canceller: None,
        }
    }

    fn subscribe(&mut self) {
        trace!("subscribing to call events");
        let (tx, events) = mpsc::unbounded();
        let terminated = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&terminated);
        let listener: Listener<T> = Arc::new(move |event: CallEvent<T>| match event {
            CallEvent::Data(value) => {
                if tx.unbounded_send(Ok(value)).is_err() {
                    trace!("dropping value emitted after termination");
                }
            }
            CallEvent::Error(error) => {
                if done.swap(true, Ordering::SeqCst) {
                    trace!("dropping error emitted after termination: {}", error);
                    return;
                }
                let _ = tx.unbounded_send(Err(to_rpc_error(&error)));
                tx.close_channel();
            }
            CallEvent::End => {
                done.store(true, Ordering::SeqCst);
                tx.close_channel();
            }
        });
        self.state = State::Active {
            listener: Arc::clone(&listener),
            events,
            terminated,
        };
        self.call.add_listener(listener);
    }

    fn release(&mut self) {
        if let State::Active { listener, .. } = std::mem::replace(&mut self.state, State::Done) {
            trace!("call terminated, detaching listener");
            self.call.remove_listener(&listener);
        }
    }

    // Keeps the engine from reporting the error its own cancellation raises.
    fn swallow_next_error(&self) {
        let slot: Arc<Mutex<Option<Weak<dyn Fn(CallEvent<T>) + Send + Sync>>>> =
            Default::default();
        let target = Arc::downgrade(&self.call);
        let me = Arc::clone(&slot);
        let swallower: Listener<T> = Arc::new(move |event: CallEvent<T>| {
            let error = match event {
                CallEvent::Data(_) => return,
                CallEvent::Error(error) => Some(error),
                CallEvent::End => None,
            };
            let this = me
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .and_then(|weak| weak.upgrade());
            let Some(this) = this else { return };
            if let Some(error) = error {
                trace!("swallowed error caused by cancellation: {}", error);
            }
            if let Some(call) = target.upgrade() {
                call.remove_listener(&this);
            }
        });
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(&swallower));
        self.call.add_listener(swallower);
    }
}

impl<T, C> CallStream<T, C>
where
    T: Send + 'static,
    C: ?Sized + Readable<T> + ClientCall + 'static,
{
    pub fn cancel_on_unsubscribe(call: Arc<C>) -> Self {
        let target = Arc::clone(&call);
        Self {
            call,
            state: State::Idle,
            canceller: Some(Box::new(move || target.cancel())),
        }
    }
}

impl<T: Send + 'static, C: ?Sized + Readable<T> + 'static> Stream for CallStream<T, C> {
    type Item = Result<T, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let State::Idle = this.state {
            this.subscribe();
        }
        let State::Active { events, .. } = &mut this.state else {
            return Poll::Ready(None);
        };
        match events.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Err(error))) => {
                this.release();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.release();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Send + 'static, C: ?Sized + Readable<T> + 'static> Drop for CallStream<T, C> {
    fn drop(&mut self) {
        // A never polled stream has not seen the call terminate either.
        let (listener, live) = match std::mem::replace(&mut self.state, State::Done) {
            State::Idle => (None, true),
            State::Active {
                listener,
                terminated,
                ..
            } => (Some(listener), !terminated.load(Ordering::SeqCst)),
            State::Done => return,
        };
        let cancel = self.canceller.take().filter(|_| live);
        if cancel.is_some() {
            trace!("unsubscribed before termination, cancelling call");
            self.swallow_next_error();
        }
        if let Some(listener) = listener {
            self.call.remove_listener(&listener);
        }
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

/// Settles once with the value or error handed to the engine callback.
#[must_use = "futures do nothing unless polled"]
pub struct UnaryResult<T> {
    rx: oneshot::Receiver<Result<T, RpcError>>,
}

/// Builds an engine completion callback and the future it settles.
pub fn unary_callback<T: Send + 'static>() -> (UnaryCallback<T>, UnaryResult<T>) {
    let (tx, rx) = oneshot::channel();
    let callback: UnaryCallback<T> = Box::new(move |result| {
        let _ = tx.send(result.map_err(|error| to_rpc_error(&error)));
    });
    (callback, UnaryResult { rx })
}

impl<T> Future for UnaryResult<T> {
    type Output = Result<T, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(RpcError::cancelled(
                "Call was dropped before it completed.",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Unsubscribe capability of a running [`forward_to`].
#[derive(Debug, Clone)]
pub struct Subscription {
    abort: AbortHandle,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.abort.abort();
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.abort.is_aborted()
    }
}

/// Writes every value of `input` to `sink`, then ends it, or destroys it with
/// the normalized error. Must be called within a tokio runtime.
pub fn forward_to<S, W>(input: S, sink: Arc<W>) -> Subscription
where
    S: TryStream + Send + 'static,
    S::Ok: Send + 'static,
    S::Error: Into<BoxError>,
    W: ?Sized + Writable<S::Ok> + 'static,
{
    let (abort, registration) = AbortHandle::new_pair();
    let pump = async move {
        let mut input = pin!(input.into_stream());
        loop {
            match AssertUnwindSafe(input.next()).catch_unwind().await {
                Ok(Some(Ok(value))) => sink.write(value),
                Ok(Some(Err(error))) => {
                    let error: BoxError = error.into();
                    trace!("input sequence failed: {}", error);
                    sink.destroy(to_engine_error(&*error));
                    break;
                }
                Ok(None) => {
                    trace!("input sequence completed");
                    sink.end();
                    break;
                }
                Err(payload) => {
                    sink.destroy(to_engine_error(&*panic_error(payload)));
                    break;
                }
            }
        }
    };
    tokio::spawn(Abortable::new(pump, registration));
    Subscription { abort }
}
