// Client side binding: wraps engine call primitives into functions returning
// futures and streams.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt, TryStream};
use log::debug;

use crate::config::ClientConfig;
use crate::engine::{CallArgs, CallOptions, Channel};
use crate::metadata::Metadata;
use crate::shape::{MethodShape, ServiceDescriptor};
use crate::status::RpcError;
use crate::streams::{forward_to, unary_callback, CallStream, Subscription, UnaryResult};
use crate::utils::{BoxError, CallId, Result, Sequencer};

/// Correlation token of one in-flight call; cancels it on request.
#[derive(Clone)]
pub struct CallHandle {
    id: CallId,
    method: Arc<str>,
    canceller: Arc<dyn Fn() + Send + Sync>,
    input: Option<Subscription>,
}

impl CallHandle {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Stops forwarding the request sequence, if any, and cancels the call.
    pub fn cancel(&self) {
        debug!("cancelling call #{} to {}", self.id, self.method);
        self.stop_input();
        (self.canceller)();
    }

    fn stop_input(&self) {
        if let Some(input) = &self.input {
            input.unsubscribe();
        }
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish()
    }
}

/// Pending single response of a unary-response call.
#[must_use = "futures do nothing unless polled"]
pub struct UnaryCall<T> {
    response: UnaryResult<T>,
    handle: CallHandle,
}

impl<T> UnaryCall<T> {
    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }
}

impl<T> Drop for UnaryCall<T> {
    fn drop(&mut self) {
        self.handle.stop_input();
    }
}

impl<T> Future for UnaryCall<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.response.poll_unpin(cx)
    }
}

/// Response sequence of a streaming-response call.
#[must_use = "streams do nothing unless polled"]
pub struct StreamingCall<T> {
    responses: BoxStream<'static, Result<T>>,
    handle: CallHandle,
}

impl<T> StreamingCall<T> {
    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }
}

impl<T> Drop for StreamingCall<T> {
    fn drop(&mut self) {
        self.handle.stop_input();
    }
}

impl<T> Stream for StreamingCall<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.responses.poll_next_unpin(cx)
    }
}

struct Binding<Req, Resp> {
    channel: Arc<dyn Channel<Req, Resp>>,
    path: Arc<str>,
    config: Arc<ClientConfig>,
    ids: Arc<Sequencer>,
}

impl<Req, Resp> Clone for Binding<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            path: Arc::clone(&self.path),
            config: Arc::clone(&self.config),
            ids: Arc::clone(&self.ids),
        }
    }
}

impl<Req, Resp> Binding<Req, Resp> {
    fn new(channel: Arc<dyn Channel<Req, Resp>>, path: &str, config: ClientConfig) -> Self {
        Self {
            channel,
            path: Arc::from(path),
            config: Arc::new(config),
            ids: Arc::default(),
        }
    }

    fn start(
        &self,
        shape: MethodShape,
        metadata: Option<Metadata>,
        options: Option<CallOptions>,
    ) -> (CallId, CallArgs) {
        let id = self.ids.next();
        debug!("call #{} to {} ({:?})", id, self.path, shape);
        (id, self.config.call_args(metadata, options))
    }

    fn handle(
        &self,
        id: CallId,
        canceller: impl Fn() + Send + Sync + 'static,
        input: Option<Subscription>,
    ) -> CallHandle {
        CallHandle {
            id,
            method: Arc::clone(&self.path),
            canceller: Arc::new(canceller),
            input,
        }
    }
}

macro_rules! client_method {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name<Req, Resp> {
            binding: Binding<Req, Resp>,
        }

        impl<Req, Resp> Clone for $name<Req, Resp> {
            fn clone(&self) -> Self {
                Self {
                    binding: self.binding.clone(),
                }
            }
        }

        impl<Req, Resp> $name<Req, Resp> {
            pub fn new(
                channel: Arc<dyn Channel<Req, Resp>>,
                path: &str,
                config: ClientConfig,
            ) -> Self {
                Self {
                    binding: Binding::new(channel, path, config),
                }
            }

            pub fn path(&self) -> &str {
                &self.binding.path
            }
        }
    };
}

client_method!(
    /// `(request, metadata?, options?) -> future`
    UnaryMethod
);
client_method!(
    /// `(request sequence, metadata?, options?) -> future`
    RequestStreamMethod
);
client_method!(
    /// `(request, metadata?, options?) -> stream`
    ResponseStreamMethod
);
client_method!(
    /// `(request sequence, metadata?, options?) -> stream`
    BidirectionalStreamMethod
);

impl<Req: Send + 'static, Resp: Send + 'static> UnaryMethod<Req, Resp> {
    pub fn call(
        &self,
        request: Req,
        metadata: Option<Metadata>,
        options: Option<CallOptions>,
    ) -> UnaryCall<Resp> {
        let binding = &self.binding;
        let (id, args) = binding.start(MethodShape::Unary, metadata, options);
        let (callback, response) = unary_callback();
        let call = binding
            .channel
            .make_unary_request(&binding.path, request, args, callback);
        UnaryCall {
            response,
            handle: binding.handle(id, move || call.cancel(), None),
        }
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> RequestStreamMethod<Req, Resp> {
    pub fn call<S>(
        &self,
        requests: S,
        metadata: Option<Metadata>,
        options: Option<CallOptions>,
    ) -> UnaryCall<Resp>
    where
        S: TryStream<Ok = Req> + Send + 'static,
        S::Error: Into<BoxError>,
    {
        let binding = &self.binding;
        let (id, args) = binding.start(MethodShape::StreamingRequest, metadata, options);
        let (callback, response) = unary_callback();
        let call = binding
            .channel
            .make_client_stream_request(&binding.path, args, callback);
        let input = forward_to(requests, Arc::clone(&call));
        UnaryCall {
            response,
            handle: binding.handle(id, move || call.cancel(), Some(input)),
        }
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> ResponseStreamMethod<Req, Resp> {
    pub fn call(
        &self,
        request: Req,
        metadata: Option<Metadata>,
        options: Option<CallOptions>,
    ) -> StreamingCall<Resp> {
        let binding = &self.binding;
        let (id, args) = binding.start(MethodShape::StreamingResponse, metadata, options);
        let call = binding
            .channel
            .make_server_stream_request(&binding.path, request, args);
        let responses = if binding.config.cancels_on_unsubscribe() {
            CallStream::cancel_on_unsubscribe(Arc::clone(&call)).boxed()
        } else {
            CallStream::new(Arc::clone(&call)).boxed()
        };
        StreamingCall {
            responses,
            handle: binding.handle(id, move || call.cancel(), None),
        }
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> BidirectionalStreamMethod<Req, Resp> {
    pub fn call<S>(
        &self,
        requests: S,
        metadata: Option<Metadata>,
        options: Option<CallOptions>,
    ) -> StreamingCall<Resp>
    where
        S: TryStream<Ok = Req> + Send + 'static,
        S::Error: Into<BoxError>,
    {
        let binding = &self.binding;
        let (id, args) = binding.start(MethodShape::Bidirectional, metadata, options);
        let call = binding.channel.make_bidi_stream_request(&binding.path, args);
        let input = forward_to(requests, Arc::clone(&call));
        let responses = if binding.config.cancels_on_unsubscribe() {
            CallStream::cancel_on_unsubscribe(Arc::clone(&call)).boxed()
        } else {
            CallStream::new(Arc::clone(&call)).boxed()
        };
        StreamingCall {
            responses,
            handle: binding.handle(id, move || call.cancel(), Some(input)),
        }
    }
}

/// Reactive binding of one descriptor method, tagged by shape.
pub enum ClientMethod<Req, Resp> {
    Unary(UnaryMethod<Req, Resp>),
    RequestStream(RequestStreamMethod<Req, Resp>),
    ResponseStream(ResponseStreamMethod<Req, Resp>),
    Bidirectional(BidirectionalStreamMethod<Req, Resp>),
}

impl<Req, Resp> ClientMethod<Req, Resp> {
    pub fn shape(&self) -> MethodShape {
        match self {
            ClientMethod::Unary(_) => MethodShape::Unary,
            ClientMethod::RequestStream(_) => MethodShape::StreamingRequest,
            ClientMethod::ResponseStream(_) => MethodShape::StreamingResponse,
            ClientMethod::Bidirectional(_) => MethodShape::Bidirectional,
        }
    }
}

/// Every method of a service, bound against one channel.
pub struct ReactiveClient<Req, Resp> {
    service: String,
    methods: HashMap<String, ClientMethod<Req, Resp>>,
}

impl<Req, Resp> ReactiveClient<Req, Resp> {
    pub fn new(
        descriptor: &ServiceDescriptor,
        channel: Arc<dyn Channel<Req, Resp>>,
        config: ClientConfig,
    ) -> Self {
        let config = Arc::new(config);
        let ids: Arc<Sequencer> = Arc::default();
        let methods = descriptor
            .methods()
            .map(|(name, method)| {
                let binding = Binding {
                    channel: Arc::clone(&channel),
                    path: Arc::from(method.path()),
                    config: Arc::clone(&config),
                    ids: Arc::clone(&ids),
                };
                let bound = match method.shape() {
                    MethodShape::Unary => ClientMethod::Unary(UnaryMethod { binding }),
                    MethodShape::StreamingRequest => {
                        ClientMethod::RequestStream(RequestStreamMethod { binding })
                    }
                    MethodShape::StreamingResponse => {
                        ClientMethod::ResponseStream(ResponseStreamMethod { binding })
                    }
                    MethodShape::Bidirectional => {
                        ClientMethod::Bidirectional(BidirectionalStreamMethod { binding })
                    }
                };
                (name.to_owned(), bound)
            })
            .collect();
        Self {
            service: descriptor.name().to_owned(),
            methods,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self, name: &str) -> Option<&ClientMethod<Req, Resp>> {
        self.methods.get(name)
    }

    fn lookup(&self, name: &str) -> Result<&ClientMethod<Req, Resp>> {
        self.methods.get(name).ok_or_else(|| {
            RpcError::unimplemented(format!("Method {} is not part of {}.", name, self.service))
        })
    }

    pub fn unary(&self, name: &str) -> Result<&UnaryMethod<Req, Resp>> {
        match self.lookup(name)? {
            ClientMethod::Unary(method) => Ok(method),
            other => Err(wrong_shape(name, other.shape(), MethodShape::Unary)),
        }
    }

    pub fn request_stream(&self, name: &str) -> Result<&RequestStreamMethod<Req, Resp>> {
        match self.lookup(name)? {
            ClientMethod::RequestStream(method) => Ok(method),
            other => Err(wrong_shape(name, other.shape(), MethodShape::StreamingRequest)),
        }
    }

    pub fn response_stream(&self, name: &str) -> Result<&ResponseStreamMethod<Req, Resp>> {
        match self.lookup(name)? {
            ClientMethod::ResponseStream(method) => Ok(method),
            other => Err(wrong_shape(name, other.shape(), MethodShape::StreamingResponse)),
        }
    }

    pub fn bidirectional(&self, name: &str) -> Result<&BidirectionalStreamMethod<Req, Resp>> {
        match self.lookup(name)? {
            ClientMethod::Bidirectional(method) => Ok(method),
            other => Err(wrong_shape(name, other.shape(), MethodShape::Bidirectional)),
        }
    }
}

fn wrong_shape(name: &str, actual: MethodShape, requested: MethodShape) -> RpcError {
    RpcError::unimplemented(format!(
        "Method {} is {:?}, not {:?}.",
        name, actual, requested
    ))
}
