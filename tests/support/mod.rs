#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};

use reactive_rpc::loopback::LoopbackChannel;
use reactive_rpc::*;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Pair { a: f64, b: f64 },
    Value(f64),
    Text(String),
    Empty,
}

pub fn values(items: &[f64]) -> Vec<Msg> {
    items.iter().copied().map(Msg::Value).collect()
}

pub fn example_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(
        "example.Example",
        [
            MethodDescriptor::new("add").path("/example.Example/Add"),
            MethodDescriptor::new("whoami").path("/example.Example/WhoAmI"),
            MethodDescriptor::new("sum")
                .path("/example.Example/Sum")
                .request_stream(true),
            MethodDescriptor::new("fibonacci")
                .path("/example.Example/Fibonacci")
                .response_stream(true),
            MethodDescriptor::new("average")
                .path("/example.Example/Average")
                .request_stream(true)
                .response_stream(true),
        ],
    )
}

// Counts running Fibonacci generators.
struct Generator(Arc<AtomicUsize>);

impl Generator {
    fn start(running: &Arc<AtomicUsize>) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(running))
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct ExampleService {
    pub generators: Arc<AtomicUsize>,
}

fn unknown_method(method: &str) -> BoxError {
    RpcError::unimplemented(format!("{} is not served here", method)).into()
}

#[async_trait]
impl ReactiveService<Msg, Msg> for ExampleService {
    async fn unary(
        &self,
        method: &str,
        request: Msg,
        context: CallContext,
    ) -> Result<UnaryResponse<Msg>, BoxError> {
        match (method, request) {
            ("add", Msg::Pair { a, b }) => Ok(Msg::Value(a + b).into()),
            ("add", other) => {
                Err(RpcError::invalid_argument(format!("cannot add {:?}", other)).into())
            }
            ("whoami", _) => {
                let tenant = context.metadata().get("tenant").unwrap_or("anonymous");
                Ok(UnaryResponse::new(Msg::Text(tenant.to_owned()))
                    .with_trailer([("served-by", "loopback")].into_iter().collect())
                    .with_flags(1))
            }
            _ => Err(unknown_method(method)),
        }
    }

    async fn request_stream(
        &self,
        method: &str,
        requests: RequestStream<Msg>,
        _context: CallContext,
    ) -> Result<UnaryResponse<Msg>, BoxError> {
        if method != "sum" {
            return Err(unknown_method(method));
        }
        let total = requests
            .try_fold(0.0, |total, msg| async move {
                match msg {
                    Msg::Value(value) => Ok(total + value),
                    other => Err(RpcError::invalid_argument(format!("cannot sum {:?}", other))),
                }
            })
            .await?;
        Ok(Msg::Value(total).into())
    }

    fn response_stream(
        &self,
        method: &str,
        _request: Msg,
        _context: CallContext,
    ) -> ResponseStream<Msg> {
        if method != "fibonacci" {
            return stream::once(future::ready(Err(unknown_method(method)))).boxed();
        }
        let guard = Generator::start(&self.generators);
        let ticks = tokio::time::interval(Duration::from_millis(10));
        stream::unfold(
            (ticks, 1.0, 1.0, guard),
            |(mut ticks, a, b, guard)| async move {
                ticks.tick().await;
                Some((Ok(Msg::Value(a)), (ticks, b, a + b, guard)))
            },
        )
        .boxed()
    }

    fn bidirectional(
        &self,
        method: &str,
        requests: RequestStream<Msg>,
        _context: CallContext,
    ) -> ResponseStream<Msg> {
        if method != "average" {
            return stream::once(future::ready(Err(unknown_method(method)))).boxed();
        }
        let mut count = 0.0;
        let mut total = 0.0;
        requests
            .map(move |msg| -> Result<Msg, BoxError> {
                match msg? {
                    Msg::Value(value) => {
                        count += 1.0;
                        total += value;
                        Ok(Msg::Value(total / count))
                    }
                    other => {
                        Err(RpcError::invalid_argument(format!("cannot average {:?}", other))
                            .into())
                    }
                }
            })
            .boxed()
    }
}

pub fn error_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(
        "example.Errors",
        [
            MethodDescriptor::new("failPrecondition"),
            MethodDescriptor::new("leak"),
            MethodDescriptor::new("panic"),
            MethodDescriptor::new("outOfRange").request_stream(true),
            MethodDescriptor::new("unauthenticated").response_stream(true),
            MethodDescriptor::new("panicEarly").response_stream(true),
            MethodDescriptor::new("notFound")
                .request_stream(true)
                .response_stream(true),
        ],
    )
}

/// Fails every call, each method in its own way.
pub struct ErrorService;

#[async_trait]
impl ReactiveService<Msg, Msg> for ErrorService {
    async fn unary(
        &self,
        method: &str,
        _request: Msg,
        _context: CallContext,
    ) -> Result<UnaryResponse<Msg>, BoxError> {
        match method {
            "failPrecondition" => {
                Err(RpcError::failed_precondition("The precondition failed.").into())
            }
            "leak" => Err("connection refused by db-primary:5432".into()),
            "panic" => panic!("handler bug"),
            _ => Err(unknown_method(method)),
        }
    }

    async fn request_stream(
        &self,
        _method: &str,
        _requests: RequestStream<Msg>,
        _context: CallContext,
    ) -> Result<UnaryResponse<Msg>, BoxError> {
        Err(RpcError::new(Code::OutOfRange, "Out of range!").into())
    }

    fn response_stream(
        &self,
        method: &str,
        _request: Msg,
        _context: CallContext,
    ) -> ResponseStream<Msg> {
        if method == "panicEarly" {
            panic!("could not start producing");
        }
        stream::iter([
            Ok(Msg::Value(1.0)),
            Err(RpcError::new(Code::Unauthenticated, "Not authenticated.").into()),
        ])
        .boxed()
    }

    fn bidirectional(
        &self,
        _method: &str,
        _requests: RequestStream<Msg>,
        _context: CallContext,
    ) -> ResponseStream<Msg> {
        stream::once(future::ready(Err(
            RpcError::new(Code::NotFound, "Resource not found.").into()
        )))
        .boxed()
    }
}

/// Answers every method with the trait defaults.
pub struct Unimplemented;

impl ReactiveService<Msg, Msg> for Unimplemented {}

pub fn serve<S>(
    descriptor: &ServiceDescriptor,
    service: S,
    config: ClientConfig,
) -> ReactiveClient<Msg, Msg>
where
    S: ReactiveService<Msg, Msg>,
{
    let implementation = Arc::new(define_service(descriptor, service));
    let channel = Arc::new(LoopbackChannel::new(implementation));
    ReactiveClient::new(descriptor, channel, config)
}

pub fn example_client(config: ClientConfig) -> (ReactiveClient<Msg, Msg>, Arc<AtomicUsize>) {
    let service = ExampleService::default();
    let generators = Arc::clone(&service.generators);
    (serve(&example_descriptor(), service, config), generators)
}

/// Waits until every generator has been dropped.
pub async fn generators_stopped(generators: &AtomicUsize) -> bool {
    tokio::time::timeout(Duration::from_secs(2), async {
        while generators.load(Ordering::SeqCst) != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
