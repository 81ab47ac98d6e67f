// Reactive adapter over a callback and event driven RPC engine: services are
// written with futures and streams, the engine keeps its own call contract.

pub mod client;
pub mod config;
pub mod engine;
pub mod loopback;
pub mod metadata;
pub mod normalize;
pub mod server;
pub mod shape;
pub mod status;
pub mod streams;
pub mod utils;

pub use client::{
    BidirectionalStreamMethod, CallHandle, ClientMethod, ReactiveClient, RequestStreamMethod,
    ResponseStreamMethod, StreamingCall, UnaryCall, UnaryMethod,
};
pub use config::ClientConfig;
pub use metadata::Metadata;
pub use server::{
    define_bidirectional_stream_method, define_request_stream_method,
    define_response_stream_method, define_service, define_unary_method, CallContext,
    ReactiveService, RequestStream, ResponseStream, ServiceImplementation, UnaryResponse,
};
pub use shape::{MethodDescriptor, MethodShape, ServiceDescriptor};
pub use status::{Code, RpcError};
pub use utils::{BoxError, Result};
