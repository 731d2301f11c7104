use axum::{body::Body, response::IntoResponse};
use futures_core::future::BoxFuture;
use http::{header, request::Parts, HeaderMap, HeaderValue, Request, Response, Uri};
use std::{
    convert::Infallible,
    fmt::{self, Debug, Formatter},
    future::{poll_fn, ready, Future},
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tonic::Status;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{info, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const GRPC_STATUS_HEADER: &str = "grpc-status";

/// Middleware around every gRPC call.
///
/// An interceptor receives the request and [`Next`], the rest of the chain ending in the
/// service. It may change the request, answer the call itself without running `next`
/// (see [`rejection`]), or look at the response `next` produced.
///
/// Closures of `&mut Parts` returning `Result<(), Status>` are interceptors too. They only see
/// the request head and an error rejects the call with that status, so later interceptors and
/// the service are not run.
pub trait Interceptor: Send + Sync + 'static {
    fn intercept(&self, request: Request<Body>, next: Next) -> BoxFuture<'static, Response<Body>>;
}

impl<F> Interceptor for F
where
    F: Fn(&mut Parts) -> Result<(), Status> + Send + Sync + 'static,
{
    fn intercept(&self, request: Request<Body>, next: Next) -> BoxFuture<'static, Response<Body>> {
        let (mut parts, body) = request.into_parts();

        match self(&mut parts) {
            Ok(()) => next.run(Request::from_parts(parts, body)),
            Err(status) => {
                let (service, method) = rpc_path(parts.uri.path());
                warn!(service, method, code = ?status.code(), reason = status.message(), "gRPC call rejected");
                metrics::counter!("rpc_rejected_total", "service" => service.to_owned(), "method" => method.to_owned()).increment(1);

                Box::pin(ready(rejection(&status)))
            }
        }
    }
}

/// Interceptor made of an async function of the request and [`Next`], see [`from_fn`]
#[derive(Clone, Copy)]
pub struct FromFn<F> {
    f: F,
}

/// Wraps an async function of the request and [`Next`] into an [`Interceptor`]
#[inline]
#[must_use]
pub fn from_fn<F, Fut>(f: F) -> FromFn<F>
where
    F: Fn(Request<Body>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    FromFn { f }
}

impl<F, Fut> Interceptor for FromFn<F>
where
    F: Fn(Request<Body>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    #[inline]
    fn intercept(&self, request: Request<Body>, next: Next) -> BoxFuture<'static, Response<Body>> {
        Box::pin((self.f)(request, next))
    }
}

impl<F> Debug for FromFn<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FromFn").finish_non_exhaustive()
    }
}

type Endpoint = Box<dyn FnOnce(Request<Body>) -> BoxFuture<'static, Response<Body>> + Send>;

/// Rest of the interceptor chain, ending in the intercepted service
pub struct Next {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
    endpoint: Endpoint,
}

impl Next {
    /// Runs the remaining interceptors, then the service
    pub fn run(mut self, request: Request<Body>) -> BoxFuture<'static, Response<Body>> {
        match self.interceptors.get(self.index).cloned() {
            Some(interceptor) => {
                self.index += 1;
                interceptor.intercept(request, self)
            }
            None => (self.endpoint)(request),
        }
    }
}

impl Debug for Next {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &(self.interceptors.len() - self.index))
            .finish_non_exhaustive()
    }
}

/// Call identity, inserted into request extensions by [`TagsInterceptor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tags {
    pub service: String,
    pub method: String,
    pub request_id: String,
}

impl Tags {
    /// Reads service and method from a `/package.Service/Method` path and the request id
    /// from the `x-request-id` header, generating one when the header is absent.
    #[inline]
    #[must_use]
    pub fn from_parts(parts: &Parts) -> Self {
        Self::new(&parts.uri, &parts.headers)
    }

    fn new(uri: &Uri, headers: &HeaderMap) -> Self {
        let (service, method) = rpc_path(uri.path());
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map_or_else(|| Uuid::new_v4().to_string(), ToOwned::to_owned);

        Self {
            service: service.to_owned(),
            method: method.to_owned(),
            request_id,
        }
    }
}

#[must_use]
fn rpc_path(path: &str) -> (&str, &str) {
    path.trim_start_matches('/').split_once('/').unwrap_or(("unknown", "unknown"))
}

/// Inserts [`Tags`] into request extensions
#[derive(Debug, Clone, Copy, Default)]
pub struct TagsInterceptor;

impl Interceptor for TagsInterceptor {
    fn intercept(&self, mut request: Request<Body>, next: Next) -> BoxFuture<'static, Response<Body>> {
        let tags = Tags::new(request.uri(), request.headers());
        if let Ok(request_id) = HeaderValue::from_str(&tags.request_id) {
            request.headers_mut().insert(REQUEST_ID_HEADER, request_id);
        }
        request.extensions_mut().insert(tags);

        next.run(request)
    }
}

/// Logs every call with its outcome and duration.
///
/// Calls are counted in `rpc_requests_total` and timed in `rpc_duration_seconds`.
/// The gRPC status is logged when the response carries it in its headers; for calls answered
/// with a body it arrives in the trailers instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept(&self, request: Request<Body>, next: Next) -> BoxFuture<'static, Response<Body>> {
        let tags = match request.extensions().get::<Tags>() {
            Some(tags) => tags.clone(),
            None => Tags::new(request.uri(), request.headers()),
        };

        info!(service = %tags.service, method = %tags.method, request_id = %tags.request_id, "gRPC call");
        metrics::counter!("rpc_requests_total", "service" => tags.service.clone(), "method" => tags.method.clone()).increment(1);

        let start = Instant::now();
        let response = next.run(request);
        Box::pin(async move {
            let response = response.await;
            let elapsed = start.elapsed();
            let grpc_status = response
                .headers()
                .get(GRPC_STATUS_HEADER)
                .and_then(|value| value.to_str().ok());

            info!(
                service = %tags.service,
                method = %tags.method,
                request_id = %tags.request_id,
                http_status = response.status().as_u16(),
                grpc_status,
                ?elapsed,
                "gRPC call finished"
            );
            metrics::histogram!("rpc_duration_seconds", "service" => tags.service, "method" => tags.method)
                .record(elapsed.as_secs_f64());

            response
        })
    }
}

/// Ordered interceptors, each wrapping the ones after it
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl InterceptorChain {
    #[inline]
    #[must_use]
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    /// Runs `request` through every interceptor and then `service`
    pub fn call<S>(&self, request: Request<Body>, mut service: S) -> BoxFuture<'static, Response<Body>>
    where
        S: Service<Request<Body>, Error = Infallible> + Send + 'static,
        S::Response: IntoResponse,
        S::Future: Send + 'static,
    {
        let endpoint: Endpoint = Box::new(move |request: Request<Body>| -> BoxFuture<'static, Response<Body>> {
            Box::pin(async move {
                if let Err(err) = poll_fn(|cx| service.poll_ready(cx)).await {
                    match err {}
                }
                match service.call(request).await {
                    Ok(response) => response.into_response(),
                    Err(err) => match err {},
                }
            })
        });

        Next {
            interceptors: self.interceptors.clone(),
            index: 0,
            endpoint,
        }
        .run(request)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl Default for InterceptorChain {
    #[inline]
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Debug for InterceptorChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain").field("len", &self.len()).finish()
    }
}

/// Wraps a gRPC service in an [`InterceptorChain`]
#[derive(Clone, Debug)]
pub struct InterceptLayer {
    chain: InterceptorChain,
}

impl InterceptLayer {
    #[inline]
    #[must_use]
    pub fn new(chain: InterceptorChain) -> Self {
        Self { chain }
    }
}

impl<S> Layer<S> for InterceptLayer {
    type Service = InterceptService<S>;

    fn layer(&self, service: S) -> Self::Service {
        InterceptService {
            service,
            chain: self.chain.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InterceptService<S> {
    service: S,
    chain: InterceptorChain,
}

impl<S> Service<Request<Body>> for InterceptService<S>
where
    S: Service<Request<Body>, Error = Infallible> + Clone + Send + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    // The wrapped service is polled for readiness at the end of the chain
    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let response = self.chain.call(request, self.service.clone());
        Box::pin(async move { Ok(response.await) })
    }
}

/// Trailers-only gRPC response carrying `status`.
///
/// Interceptors return it to answer a call without running the service.
#[must_use]
pub fn rejection(status: &Status) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, tonic::metadata::GRPC_CONTENT_TYPE);

    if status.add_header(response.headers_mut()).is_err() {
        // The message could not be encoded, the code alone is still meaningful
        response
            .headers_mut()
            .insert(GRPC_STATUS_HEADER, HeaderValue::from(status.code() as i32));
    }
    response
}
