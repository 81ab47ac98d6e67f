// In-process engine. Serves a `ServiceImplementation` on the same runtime as
// the client, with the event semantics of a real transport: emitters stay
// paused until their first listener, cancellation reaches both ends, and the
// server's completion is reported at most once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use log::{debug, trace, warn};
use tokio::sync::Notify;

use crate::engine::{
    same_listener, CallArgs, CallEvent, Channel, ClientCall, ClientDuplexCall,
    ClientReadableCall, ClientWritableCall, Listener, NativeError, NativeMetadata, Readable,
    SendUnaryData, ServerCall, ServerHandler, UnaryCallback, Writable,
};
use crate::server::ServiceImplementation;
use crate::shape::MethodShape;
use crate::status::Code;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct EmitterState<T> {
    listeners: Vec<Listener<T>>,
    queue: VecDeque<CallEvent<T>>,
    flowing: bool,
    draining: bool,
    finished: bool,
}

/// Listener registry of one direction of a call.
///
/// Events are queued until the first listener is added, then delivered in
/// order to a snapshot of the listeners present at dispatch time. Nothing is
/// delivered after the first terminal event.
pub struct EventEmitter<T> {
    state: Mutex<EmitterState<T>>,
    unhandled: AtomicUsize,
}

impl<T: Clone> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EmitterState {
                listeners: Vec::new(),
                queue: VecDeque::new(),
                flowing: false,
                draining: false,
                finished: false,
            }),
            unhandled: AtomicUsize::new(0),
        }
    }

    pub fn emit(&self, event: CallEvent<T>) {
        {
            let mut state = lock(&self.state);
            if state.finished {
                trace!("emitter finished, dropping event");
                return;
            }
            state.finished = event.is_terminal();
            state.queue.push_back(event);
        }
        self.drain();
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }

    /// Errors emitted while flowing with nobody listening.
    pub fn unhandled_errors(&self) -> usize {
        self.unhandled.load(Ordering::SeqCst)
    }

    // Re-entrant emits only enqueue; the outermost caller delivers.
    fn drain(&self) {
        {
            let mut state = lock(&self.state);
            if !state.flowing || state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let (event, listeners) = {
                let mut state = lock(&self.state);
                match state.queue.pop_front() {
                    Some(event) => (event, state.listeners.clone()),
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            if listeners.is_empty() {
                if let CallEvent::Error(error) = &event {
                    self.unhandled.fetch_add(1, Ordering::SeqCst);
                    warn!("unhandled call error: {}", error);
                }
                continue;
            }
            for listener in &listeners {
                listener(event.clone());
            }
        }
    }
}

impl<T: Clone> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> Readable<T> for EventEmitter<T> {
    fn add_listener(&self, listener: Listener<T>) {
        {
            let mut state = lock(&self.state);
            state.listeners.push(listener);
            state.flowing = true;
        }
        self.drain();
    }

    fn remove_listener(&self, listener: &Listener<T>) {
        lock(&self.state)
            .listeners
            .retain(|known| !same_listener(known, listener));
    }
}

type CancelCallbacks = Option<Vec<Box<dyn FnOnce() + Send>>>;

struct CallState<Req, Resp> {
    path: String,
    metadata: NativeMetadata,
    requests: EventEmitter<Req>,
    responses: EventEmitter<Resp>,
    callback: Mutex<Option<UnaryCallback<Resp>>>,
    finished: AtomicBool,
    completed: Arc<Notify>,
    // `None` once cancelled.
    on_cancelled: Mutex<CancelCallbacks>,
}

impl<Req: Clone + Send, Resp: Clone + Send> CallState<Req, Resp> {
    fn new(path: &str, metadata: NativeMetadata, callback: Option<UnaryCallback<Resp>>) -> Self {
        Self {
            path: path.to_owned(),
            metadata,
            requests: EventEmitter::new(),
            responses: EventEmitter::new(),
            callback: Mutex::new(callback),
            finished: AtomicBool::new(false),
            completed: Arc::new(Notify::new()),
            on_cancelled: Mutex::new(Some(Vec::new())),
        }
    }

    /// True for the first caller only.
    fn finish(&self) -> bool {
        let first = !self.finished.swap(true, Ordering::SeqCst);
        if first {
            self.completed.notify_one();
        }
        first
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    // Unary responses go to the completion callback, streamed ones to the
    // response emitter.
    fn deliver(&self, result: Result<Resp, NativeError>) {
        let callback = lock(&self.callback).take();
        match (callback, result) {
            (Some(callback), result) => callback(result),
            (None, Ok(value)) => self.responses.emit(CallEvent::Data(value)),
            (None, Err(error)) => self.responses.emit(CallEvent::Error(error)),
        }
    }

    fn reject(&self, error: NativeError) {
        if self.finish() {
            debug!("rejecting call to {}: {}", self.path, error);
            self.deliver(Err(error));
        }
    }

    fn is_cancelled(&self) -> bool {
        lock(&self.on_cancelled).is_none()
    }

    fn abort(&self, error: NativeError) {
        if !self.finish() {
            trace!("call to {} already finished", self.path);
            return;
        }
        debug!("aborting call to {}: {}", self.path, error);
        let callbacks = lock(&self.on_cancelled).take().unwrap_or_default();
        for callback in callbacks {
            callback();
        }
        self.requests.emit(CallEvent::Error(error.clone()));
        self.deliver(Err(error));
    }
}

struct ServerEnd<Req, Resp>(Arc<CallState<Req, Resp>>);

impl<Req: Clone + Send, Resp: Clone + Send> ServerCall for ServerEnd<Req, Resp> {
    fn metadata(&self) -> NativeMetadata {
        self.0.metadata.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    fn on_cancelled(&self, callback: Box<dyn FnOnce() + Send>) {
        let mut callbacks = lock(&self.0.on_cancelled);
        match callbacks.as_mut() {
            Some(pending) => pending.push(callback),
            None => {
                drop(callbacks);
                callback();
            }
        }
    }
}

impl<Req: Clone + Send, Resp: Clone + Send> Readable<Req> for ServerEnd<Req, Resp> {
    fn add_listener(&self, listener: Listener<Req>) {
        self.0.requests.add_listener(listener);
    }

    fn remove_listener(&self, listener: &Listener<Req>) {
        self.0.requests.remove_listener(listener);
    }
}

impl<Req: Clone + Send, Resp: Clone + Send> Writable<Resp> for ServerEnd<Req, Resp> {
    fn write(&self, value: Resp) {
        if self.0.is_finished() {
            trace!("ignoring write to finished call {}", self.0.path);
            return;
        }
        self.0.responses.emit(CallEvent::Data(value));
    }

    fn destroy(&self, error: NativeError) {
        if self.0.finish() {
            self.0.responses.emit(CallEvent::Error(error));
        }
    }

    fn end(&self) {
        if self.0.finish() {
            self.0.responses.emit(CallEvent::End);
        }
    }
}

struct ClientEnd<Req, Resp>(Arc<CallState<Req, Resp>>);

impl<Req: Clone + Send, Resp: Clone + Send> ClientCall for ClientEnd<Req, Resp> {
    fn cancel(&self) {
        self.0
            .abort(NativeError::new(Code::Cancelled.as_i32(), "Cancelled on client"));
    }

    fn peer(&self) -> String {
        "loopback".to_owned()
    }
}

impl<Req: Clone + Send, Resp: Clone + Send> Writable<Req> for ClientEnd<Req, Resp> {
    fn write(&self, value: Req) {
        if self.0.is_finished() {
            trace!("ignoring request written to finished call {}", self.0.path);
            return;
        }
        self.0.requests.emit(CallEvent::Data(value));
    }

    fn destroy(&self, error: NativeError) {
        self.0.requests.emit(CallEvent::Error(error));
        self.cancel();
    }

    fn end(&self) {
        self.0.requests.emit(CallEvent::End);
    }
}

impl<Req: Clone + Send, Resp: Clone + Send> Readable<Resp> for ClientEnd<Req, Resp> {
    fn add_listener(&self, listener: Listener<Resp>) {
        self.0.responses.add_listener(listener);
    }

    fn remove_listener(&self, listener: &Listener<Resp>) {
        self.0.responses.remove_listener(listener);
    }
}

fn send_unary_data<Req, Resp>(state: &Arc<CallState<Req, Resp>>) -> SendUnaryData<Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    let state = Arc::clone(state);
    Box::new(move |result, trailer, flags| {
        if !state.finish() {
            trace!("ignoring completion of finished call {}", state.path);
            return;
        }
        trace!(
            "call {} completed with {} trailer entries, flags {:?}",
            state.path,
            trailer.map_or(0, |trailer| trailer.len()),
            flags
        );
        state.deliver(result);
    })
}

/// `Channel` that dispatches straight into a local service implementation.
/// Must be used within a tokio runtime.
pub struct LoopbackChannel<Req, Resp> {
    service: Arc<ServiceImplementation<Req, Resp>>,
}

impl<Req, Resp> LoopbackChannel<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    pub fn new(service: Arc<ServiceImplementation<Req, Resp>>) -> Self {
        Self { service }
    }

    fn open(
        &self,
        path: &str,
        args: CallArgs,
        callback: Option<UnaryCallback<Resp>>,
        expected: MethodShape,
    ) -> (Arc<CallState<Req, Resp>>, Option<&ServerHandler<Req, Resp>>) {
        let state = Arc::new(CallState::new(path, args.metadata().clone(), callback));
        let handler = match self.service.handler(path) {
            Some(handler) if handler.shape() == expected => handler,
            Some(handler) => {
                state.reject(NativeError::new(
                    Code::Unimplemented.as_i32(),
                    format!("{} is served as {:?}", path, handler.shape()),
                ));
                return (state, None);
            }
            None => {
                state.reject(NativeError::new(
                    Code::Unimplemented.as_i32(),
                    format!("{} is not served by {}", path, self.service.name()),
                ));
                return (state, None);
            }
        };
        if let Some(deadline) = args.options().and_then(|options| options.deadline) {
            if deadline <= Instant::now() {
                state.reject(NativeError::new(
                    Code::DeadlineExceeded.as_i32(),
                    "Deadline exceeded",
                ));
                return (state, None);
            }
            watch_deadline(&state, deadline);
        }
        debug!("loopback call to {}", path);
        (state, Some(handler))
    }
}

// The watcher exits as soon as the call finishes, whichever way it does.
fn watch_deadline<Req, Resp>(state: &Arc<CallState<Req, Resp>>, deadline: Instant)
where
    Req: Clone + Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    let completed = Arc::clone(&state.completed);
    let state: Weak<CallState<Req, Resp>> = Arc::downgrade(state);
    tokio::spawn(async move {
        tokio::select! {
            _ = completed.notified() => trace!("call finished before its deadline"),
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                if let Some(state) = state.upgrade() {
                    state.abort(NativeError::new(
                        Code::DeadlineExceeded.as_i32(),
                        "Deadline exceeded",
                    ));
                }
            }
        }
    });
}

impl<Req, Resp> Channel<Req, Resp> for LoopbackChannel<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Clone + Send + Sync + 'static,
{
    fn make_unary_request(
        &self,
        method: &str,
        request: Req,
        args: CallArgs,
        callback: UnaryCallback<Resp>,
    ) -> Arc<dyn ClientCall> {
        let (state, handler) = self.open(method, args, Some(callback), MethodShape::Unary);
        if let Some(ServerHandler::Unary(handler)) = handler {
            handler(
                request,
                Arc::new(ServerEnd(Arc::clone(&state))),
                send_unary_data(&state),
            );
        }
        Arc::new(ClientEnd(state))
    }

    fn make_client_stream_request(
        &self,
        method: &str,
        args: CallArgs,
        callback: UnaryCallback<Resp>,
    ) -> Arc<dyn ClientWritableCall<Req>> {
        let (state, handler) =
            self.open(method, args, Some(callback), MethodShape::StreamingRequest);
        if let Some(ServerHandler::ClientStreaming(handler)) = handler {
            handler(
                Arc::new(ServerEnd(Arc::clone(&state))),
                send_unary_data(&state),
            );
        }
        Arc::new(ClientEnd(state))
    }

    fn make_server_stream_request(
        &self,
        method: &str,
        request: Req,
        args: CallArgs,
    ) -> Arc<dyn ClientReadableCall<Resp>> {
        let (state, handler) = self.open(method, args, None, MethodShape::StreamingResponse);
        if let Some(ServerHandler::ServerStreaming(handler)) = handler {
            handler(request, Arc::new(ServerEnd(Arc::clone(&state))));
        }
        Arc::new(ClientEnd(state))
    }

    fn make_bidi_stream_request(
        &self,
        method: &str,
        args: CallArgs,
    ) -> Arc<dyn ClientDuplexCall<Req, Resp>> {
        let (state, handler) = self.open(method, args, None, MethodShape::Bidirectional);
        if let Some(ServerHandler::BidiStreaming(handler)) = handler {
            handler(Arc::new(ServerEnd(Arc::clone(&state))));
        }
        Arc::new(ClientEnd(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn recorder() -> (Listener<u32>, Arc<Mutex<Vec<CallEvent<u32>>>>) {
        let seen: Arc<Mutex<Vec<CallEvent<u32>>>> = Default::default();
        let sink = Arc::clone(&seen);
        let listener: Listener<u32> = Arc::new(move |event| lock(&sink).push(event));
        (listener, seen)
    }

    #[test]
    fn paused_until_first_listener() {
        let emitter = EventEmitter::new();
        emitter.emit(CallEvent::Data(1));
        emitter.emit(CallEvent::Error(NativeError::new(2, "early")));
        emitter.emit(CallEvent::Data(3));

        let (listener, seen) = recorder();
        emitter.add_listener(listener);
        assert_eq!(
            *lock(&seen),
            vec![
                CallEvent::Data(1),
                CallEvent::Error(NativeError::new(2, "early"))
            ]
        );
        assert_eq!(emitter.unhandled_errors(), 0);
    }

    #[test]
    fn error_without_listener_is_unhandled() {
        let emitter = EventEmitter::new();
        let (listener, _) = recorder();
        emitter.add_listener(Arc::clone(&listener));
        emitter.remove_listener(&listener);
        assert_eq!(emitter.listener_count(), 0);

        emitter.emit(CallEvent::Error(NativeError::new(1, "nobody")));
        assert_eq!(emitter.unhandled_errors(), 1);
    }

    #[test]
    fn listener_may_remove_itself() {
        let emitter: Arc<EventEmitter<u32>> = Arc::default();
        let calls = Arc::new(AtomicU32::new(0));
        let slot: Arc<Mutex<Option<Listener<u32>>>> = Default::default();
        let listener: Listener<u32> = {
            let emitter = Arc::downgrade(&emitter);
            let calls = Arc::clone(&calls);
            let slot = Arc::clone(&slot);
            Arc::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let (Some(emitter), Some(me)) = (emitter.upgrade(), lock(&slot).take()) {
                    emitter.remove_listener(&me);
                }
            })
        };
        *lock(&slot) = Some(Arc::clone(&listener));
        emitter.add_listener(listener);

        emitter.emit(CallEvent::Data(1));
        emitter.emit(CallEvent::Data(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn cancel_runs_server_callbacks_once() {
        let state: Arc<CallState<u32, u32>> =
            Arc::new(CallState::new("/svc/m", NativeMetadata::new(), None));
        let server = ServerEnd(Arc::clone(&state));
        let client = ClientEnd(Arc::clone(&state));
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        server.on_cancelled(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        client.cancel();
        client.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(server.is_cancelled());

        let late = Arc::clone(&fired);
        server.on_cancelled(Box::new(move || {
            late.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        server.write(7);
        let (listener, seen) = recorder();
        client.add_listener(listener);
        assert_eq!(
            *lock(&seen),
            vec![CallEvent::Error(NativeError::new(
                Code::Cancelled.as_i32(),
                "Cancelled on client"
            ))]
        );
    }

    #[tokio::test]
    async fn deadline_watch_ends_with_the_call() {
        let state: Arc<CallState<u32, u32>> =
            Arc::new(CallState::new("/svc/m", NativeMetadata::new(), None));
        watch_deadline(&state, Instant::now() + Duration::from_secs(3600));
        assert_eq!(Arc::strong_count(&state.completed), 2);

        assert!(state.finish());
        for _ in 0..100 {
            if Arc::strong_count(&state.completed) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(Arc::strong_count(&state.completed), 1);
    }
}
