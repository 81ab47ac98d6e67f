// Server side binding: wraps reactive handlers into the callback contract the
// engine serves methods with.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt, TryStream, TryStreamExt};
use log::{debug, trace};
use tokio::sync::Notify;

use crate::engine::{
    SendUnaryData, ServerCall, ServerDuplexCall, ServerHandler, ServerReadableCall,
    ServerWritableCall, Writable,
};
use crate::metadata::Metadata;
use crate::normalize::{panic_error, to_engine_error};
use crate::shape::{MethodShape, ServiceDescriptor};
use crate::status::RpcError;
use crate::streams::{forward_to, CallStream};
use crate::utils::BoxError;

/// Incoming request sequence handed to streaming-request handlers.
pub type RequestStream<T> = BoxStream<'static, Result<T, RpcError>>;

/// Response sequence produced by streaming-response handlers.
pub type ResponseStream<T> = BoxStream<'static, Result<T, BoxError>>;

type UnaryOutcome<T> = BoxFuture<'static, Result<UnaryResponse<T>, BoxError>>;

/// Result of a unary-response handler, optionally carrying trailing metadata
/// and write flags.
#[derive(Debug, Clone, PartialEq)]
pub struct UnaryResponse<T> {
    pub value: T,
    pub trailer: Option<Metadata>,
    pub flags: Option<u32>,
}

impl<T> UnaryResponse<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            trailer: None,
            flags: None,
        }
    }

    pub fn with_trailer(mut self, trailer: Metadata) -> Self {
        self.trailer = Some(trailer);
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = Some(flags);
        self
    }
}

impl<T> From<T> for UnaryResponse<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Default)]
struct Cancellation {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Per-call view handed to reactive handlers.
#[derive(Debug, Clone)]
pub struct CallContext {
    metadata: Metadata,
    cancellation: Arc<Cancellation>,
}

impl CallContext {
    pub(crate) fn attach<C: ?Sized + ServerCall>(call: &C) -> Self {
        let cancellation = Arc::new(Cancellation::default());
        let signal = Arc::clone(&cancellation);
        call.on_cancelled(Box::new(move || {
            signal.cancelled.store(true, Ordering::SeqCst);
            signal.notify.notify_waiters();
        }));
        Self {
            metadata: Metadata::from_native(&call.metadata()),
            cancellation,
        }
    }

    /// Context that is never cancelled, for invoking handlers directly.
    pub fn detached(metadata: Metadata) -> Self {
        Self {
            metadata,
            cancellation: Arc::default(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the peer cancels the call.
    pub async fn cancelled(&self) {
        let notified = self.cancellation.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

// A panic while starting the handler counts the same as a rejected future.
fn invoke_unary<T, R, E, Fut>(start: impl FnOnce() -> Fut) -> UnaryOutcome<T>
where
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Into<UnaryResponse<T>> + 'static,
    E: Into<BoxError> + 'static,
    T: Send + 'static,
{
    match catch_unwind(AssertUnwindSafe(start)) {
        Ok(pending) => async move {
            match AssertUnwindSafe(pending).catch_unwind().await {
                Ok(Ok(value)) => Ok(value.into()),
                Ok(Err(error)) => Err(error.into()),
                Err(payload) => Err(panic_error(payload)),
            }
        }
        .boxed(),
        Err(payload) => future::ready(Err(panic_error(payload))).boxed(),
    }
}

fn invoke_stream<S>(start: impl FnOnce() -> S) -> ResponseStream<S::Ok>
where
    S: TryStream + Send + 'static,
    S::Ok: Send + 'static,
    S::Error: Into<BoxError>,
{
    match catch_unwind(AssertUnwindSafe(start)) {
        Ok(output) => output.map_err(Into::into).boxed(),
        Err(payload) => stream::once(future::ready(Err(panic_error(payload)))).boxed(),
    }
}

// Exactly one completion: the callback is consumed by whichever branch runs.
fn settle_unary<T: Send + 'static>(outcome: UnaryOutcome<T>, callback: SendUnaryData<T>) {
    tokio::spawn(async move {
        match outcome.await {
            Ok(response) => {
                trace!("unary handler resolved");
                let trailer = response.trailer.as_ref().map(Metadata::to_native);
                callback(Ok(response.value), trailer, response.flags);
            }
            Err(error) => {
                debug!("unary handler rejected: {}", error);
                callback(Err(to_engine_error(&*error)), None, None);
            }
        }
    });
}

fn serve_stream<T, C>(output: ResponseStream<T>, call: Arc<C>)
where
    T: Send + 'static,
    C: ?Sized + ServerCall + Writable<T> + 'static,
{
    let subscription = forward_to(output, Arc::clone(&call));
    call.on_cancelled(Box::new(move || {
        trace!("peer cancelled, tearing down response stream");
        subscription.unsubscribe();
    }));
}

pub fn define_unary_method<Req, Resp, F, Fut, R, E>(handler: F) -> ServerHandler<Req, Resp>
where
    F: Fn(Req, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Into<UnaryResponse<Resp>> + 'static,
    E: Into<BoxError> + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    ServerHandler::Unary(Box::new(
        move |request: Req, call: Arc<dyn ServerCall>, callback: SendUnaryData<Resp>| {
            debug!("serving unary call");
            let context = CallContext::attach(&*call);
            settle_unary(invoke_unary(|| handler(request, context)), callback);
        },
    ))
}

pub fn define_request_stream_method<Req, Resp, F, Fut, R, E>(
    handler: F,
) -> ServerHandler<Req, Resp>
where
    F: Fn(RequestStream<Req>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Into<UnaryResponse<Resp>> + 'static,
    E: Into<BoxError> + 'static,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    ServerHandler::ClientStreaming(Box::new(
        move |call: Arc<dyn ServerReadableCall<Req>>, callback: SendUnaryData<Resp>| {
            debug!("serving request stream call");
            let context = CallContext::attach(&*call);
            let requests = CallStream::new(call).boxed();
            settle_unary(invoke_unary(|| handler(requests, context)), callback);
        },
    ))
}

pub fn define_response_stream_method<Req, Resp, F, S>(handler: F) -> ServerHandler<Req, Resp>
where
    F: Fn(Req, CallContext) -> S + Send + Sync + 'static,
    S: TryStream<Ok = Resp> + Send + 'static,
    S::Error: Into<BoxError>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    ServerHandler::ServerStreaming(Box::new(
        move |request: Req, call: Arc<dyn ServerWritableCall<Resp>>| {
            debug!("serving response stream call");
            let context = CallContext::attach(&*call);
            serve_stream(invoke_stream(|| handler(request, context)), call);
        },
    ))
}

pub fn define_bidirectional_stream_method<Req, Resp, F, S>(
    handler: F,
) -> ServerHandler<Req, Resp>
where
    F: Fn(RequestStream<Req>, CallContext) -> S + Send + Sync + 'static,
    S: TryStream<Ok = Resp> + Send + 'static,
    S::Error: Into<BoxError>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    ServerHandler::BidiStreaming(Box::new(
        move |call: Arc<dyn ServerDuplexCall<Req, Resp>>| {
            debug!("serving bidirectional call");
            let context = CallContext::attach(&*call);
            let requests = CallStream::new(Arc::clone(&call)).boxed();
            serve_stream(invoke_stream(|| handler(requests, context)), call);
        },
    ))
}

fn not_implemented(method: &str) -> BoxError {
    Box::new(RpcError::unimplemented(format!(
        "Method {} is not implemented.",
        method
    )))
}

/// Reactive implementation of a whole service. Each descriptor method is
/// routed to the entry point matching its shape.
#[async_trait]
pub trait ReactiveService<Req: Send + 'static, Resp: Send + 'static>:
    Send + Sync + 'static
{
    async fn unary(
        &self,
        method: &str,
        _request: Req,
        _context: CallContext,
    ) -> Result<UnaryResponse<Resp>, BoxError> {
        Err(not_implemented(method))
    }

    async fn request_stream(
        &self,
        method: &str,
        _requests: RequestStream<Req>,
        _context: CallContext,
    ) -> Result<UnaryResponse<Resp>, BoxError> {
        Err(not_implemented(method))
    }

    fn response_stream(
        &self,
        method: &str,
        _request: Req,
        _context: CallContext,
    ) -> ResponseStream<Resp> {
        stream::once(future::ready(Err(not_implemented(method)))).boxed()
    }

    fn bidirectional(
        &self,
        method: &str,
        _requests: RequestStream<Req>,
        _context: CallContext,
    ) -> ResponseStream<Resp> {
        stream::once(future::ready(Err(not_implemented(method)))).boxed()
    }
}

/// Engine handlers of one service, keyed by method path.
pub struct ServiceImplementation<Req, Resp> {
    name: String,
    handlers: HashMap<String, ServerHandler<Req, Resp>>,
}

impl<Req, Resp> ServiceImplementation<Req, Resp> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
        }
    }

    pub fn add(&mut self, path: impl Into<String>, handler: ServerHandler<Req, Resp>) -> &mut Self {
        self.handlers.insert(path.into(), handler);
        self
    }

    pub fn handler(&self, path: &str) -> Option<&ServerHandler<Req, Resp>> {
        self.handlers.get(path)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Binds every method of `descriptor` to `service`.
pub fn define_service<S, Req, Resp>(
    descriptor: &ServiceDescriptor,
    service: S,
) -> ServiceImplementation<Req, Resp>
where
    S: ReactiveService<Req, Resp>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let service = Arc::new(service);
    let mut implementation = ServiceImplementation::new(descriptor.name());
    for (name, method) in descriptor.methods() {
        let service = Arc::clone(&service);
        let name: Arc<str> = Arc::from(name);
        debug!("binding {} as {:?}", method.path(), method.shape());
        let handler = match method.shape() {
            MethodShape::Unary => define_unary_method(move |request: Req, context| {
                let service = Arc::clone(&service);
                let name = Arc::clone(&name);
                async move { service.unary(&name, request, context).await }
            }),
            MethodShape::StreamingRequest => {
                define_request_stream_method(move |requests: RequestStream<Req>, context| {
                    let service = Arc::clone(&service);
                    let name = Arc::clone(&name);
                    async move { service.request_stream(&name, requests, context).await }
                })
            }
            MethodShape::StreamingResponse => {
                define_response_stream_method(move |request: Req, context| {
                    service.response_stream(&name, request, context)
                })
            }
            MethodShape::Bidirectional => {
                define_bidirectional_stream_method(move |requests: RequestStream<Req>, context| {
                    service.bidirectional(&name, requests, context)
                })
            }
        };
        implementation.add(method.path(), handler);
    }
    implementation
}
