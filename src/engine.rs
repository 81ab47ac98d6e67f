// Contract of the callback/event driven RPC engine the adapters are written
// against. Nothing in here knows about futures or streams.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::shape::MethodShape;

/// Value of one native metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeValue {
    Ascii(String),
    Binary(Vec<u8>),
}

impl NativeValue {
    /// Text form of the value, binary payloads are decoded lossily.
    pub fn to_text(&self) -> String {
        match self {
            NativeValue::Ascii(text) => text.clone(),
            NativeValue::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

impl From<&str> for NativeValue {
    fn from(value: &str) -> Self {
        NativeValue::Ascii(value.to_owned())
    }
}

impl From<String> for NativeValue {
    fn from(value: String) -> Self {
        NativeValue::Ascii(value)
    }
}

impl From<Vec<u8>> for NativeValue {
    fn from(value: Vec<u8>) -> Self {
        NativeValue::Binary(value)
    }
}

/// Engine metadata: multi-valued, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeMetadata {
    entries: Vec<(String, NativeValue)>,
}

impl NativeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every value stored under `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<NativeValue>) {
        let key = key.into();
        self.remove(&key);
        self.entries.push((key, value.into()));
    }

    /// Appends another value under `key`.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<NativeValue>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Vec<&NativeValue> {
        self.entries
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    /// First value of every key, in order of first appearance.
    pub fn get_map(&self) -> Vec<(&str, &NativeValue)> {
        let mut map: Vec<(&str, &NativeValue)> = Vec::new();
        for (key, value) in &self.entries {
            if !map.iter().any(|(k, _)| k == key) {
                map.push((key, value));
            }
        }
        map
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Error representation the engine reports and accepts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} {details}")]
pub struct NativeError {
    pub code: i32,
    pub details: String,
    pub metadata: NativeMetadata,
}

impl NativeError {
    pub fn new(code: i32, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
            metadata: NativeMetadata::new(),
        }
    }
}

/// Notification emitted by a readable call object.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent<T> {
    Data(T),
    Error(NativeError),
    End,
}

impl<T> CallEvent<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallEvent::Data(_))
    }
}

pub type Listener<T> = Arc<dyn Fn(CallEvent<T>) + Send + Sync>;

/// Identity comparison for listeners, ignoring vtables.
pub fn same_listener<T>(a: &Listener<T>, b: &Listener<T>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

pub trait Readable<T>: Send + Sync {
    fn add_listener(&self, listener: Listener<T>);
    /// Detaches exactly the listener previously added, matched by identity.
    fn remove_listener(&self, listener: &Listener<T>);
}

pub trait Writable<T>: Send + Sync {
    fn write(&self, value: T);
    fn destroy(&self, error: NativeError);
    fn end(&self);
}

pub trait ServerCall: Send + Sync {
    fn metadata(&self) -> NativeMetadata;
    fn is_cancelled(&self) -> bool;
    /// Runs `callback` once the peer cancels; immediately if it already has.
    fn on_cancelled(&self, callback: Box<dyn FnOnce() + Send>);
}

pub trait ClientCall: Send + Sync {
    fn cancel(&self);
    fn peer(&self) -> String;
}

pub trait ServerReadableCall<Req>: ServerCall + Readable<Req> {}
pub trait ServerWritableCall<Resp>: ServerCall + Writable<Resp> {}
pub trait ServerDuplexCall<Req, Resp>: ServerCall + Readable<Req> + Writable<Resp> {}

impl<Req, C: ServerCall + Readable<Req> + ?Sized> ServerReadableCall<Req> for C {}
impl<Resp, C: ServerCall + Writable<Resp> + ?Sized> ServerWritableCall<Resp> for C {}
impl<Req, Resp, C> ServerDuplexCall<Req, Resp> for C where
    C: ServerCall + Readable<Req> + Writable<Resp> + ?Sized
{
}

pub trait ClientWritableCall<Req>: ClientCall + Writable<Req> {}
pub trait ClientReadableCall<Resp>: ClientCall + Readable<Resp> {}
pub trait ClientDuplexCall<Req, Resp>: ClientCall + Writable<Req> + Readable<Resp> {}

impl<Req, C: ClientCall + Writable<Req> + ?Sized> ClientWritableCall<Req> for C {}
impl<Resp, C: ClientCall + Readable<Resp> + ?Sized> ClientReadableCall<Resp> for C {}
impl<Req, Resp, C> ClientDuplexCall<Req, Resp> for C where
    C: ClientCall + Writable<Req> + Readable<Resp> + ?Sized
{
}

/// Server completion callback: `(error-or-value, trailer, flags)`.
pub type SendUnaryData<T> =
    Box<dyn FnOnce(Result<T, NativeError>, Option<NativeMetadata>, Option<u32>) + Send>;

/// Client completion callback.
pub type UnaryCallback<T> = Box<dyn FnOnce(Result<T, NativeError>) + Send>;

/// Per-call options, forwarded to the engine untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub deadline: Option<Instant>,
    pub host: Option<String>,
    pub propagate_flags: Option<u32>,
}

/// Trailing positional arguments of a stub call. Each variant is one arity the
/// engine accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArgs {
    /// `(request?, metadata, callback?)`
    Metadata(NativeMetadata),
    /// `(request?, metadata, options, callback?)`
    MetadataOptions(NativeMetadata, CallOptions),
}

impl CallArgs {
    pub fn metadata(&self) -> &NativeMetadata {
        match self {
            CallArgs::Metadata(metadata) | CallArgs::MetadataOptions(metadata, _) => metadata,
        }
    }

    pub fn options(&self) -> Option<&CallOptions> {
        match self {
            CallArgs::Metadata(_) => None,
            CallArgs::MetadataOptions(_, options) => Some(options),
        }
    }
}

/// Client side of the engine: the four call primitives.
pub trait Channel<Req, Resp>: Send + Sync {
    fn make_unary_request(
        &self,
        method: &str,
        request: Req,
        args: CallArgs,
        callback: UnaryCallback<Resp>,
    ) -> Arc<dyn ClientCall>;

    fn make_client_stream_request(
        &self,
        method: &str,
        args: CallArgs,
        callback: UnaryCallback<Resp>,
    ) -> Arc<dyn ClientWritableCall<Req>>;

    fn make_server_stream_request(
        &self,
        method: &str,
        request: Req,
        args: CallArgs,
    ) -> Arc<dyn ClientReadableCall<Resp>>;

    fn make_bidi_stream_request(
        &self,
        method: &str,
        args: CallArgs,
    ) -> Arc<dyn ClientDuplexCall<Req, Resp>>;
}

pub type UnaryHandler<Req, Resp> =
    Box<dyn Fn(Req, Arc<dyn ServerCall>, SendUnaryData<Resp>) + Send + Sync>;
pub type ClientStreamingHandler<Req, Resp> =
    Box<dyn Fn(Arc<dyn ServerReadableCall<Req>>, SendUnaryData<Resp>) + Send + Sync>;
pub type ServerStreamingHandler<Req, Resp> =
    Box<dyn Fn(Req, Arc<dyn ServerWritableCall<Resp>>) + Send + Sync>;
pub type BidiStreamingHandler<Req, Resp> =
    Box<dyn Fn(Arc<dyn ServerDuplexCall<Req, Resp>>) + Send + Sync>;

/// Handler signatures the engine accepts for serving a method.
pub enum ServerHandler<Req, Resp> {
    Unary(UnaryHandler<Req, Resp>),
    ClientStreaming(ClientStreamingHandler<Req, Resp>),
    ServerStreaming(ServerStreamingHandler<Req, Resp>),
    BidiStreaming(BidiStreamingHandler<Req, Resp>),
}

impl<Req, Resp> ServerHandler<Req, Resp> {
    pub fn shape(&self) -> MethodShape {
        match self {
            ServerHandler::Unary(_) => MethodShape::Unary,
            ServerHandler::ClientStreaming(_) => MethodShape::StreamingRequest,
            ServerHandler::ServerStreaming(_) => MethodShape::StreamingResponse,
            ServerHandler::BidiStreaming(_) => MethodShape::Bidirectional,
        }
    }
}

impl<Req, Resp> fmt::Debug for ServerHandler<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServerHandler").field(&self.shape()).finish()
    }
}
