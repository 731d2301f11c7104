use axum::{
    body::Body,
    routing::{get, MethodRouter},
    Router,
};
use futures_core::future::BoxFuture;
use http::{Request, Response};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use parking_lot::Mutex;
use std::{
    convert::Infallible,
    fmt::{self, Debug, Display, Formatter},
    io,
    mem,
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::JoinError,
};
use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tonic::body::BoxBody;
use tonic_web::GrpcWebLayer;
use tower_http::cors::CorsLayer;
use tower_layer::Layer as _;
use tower_service::Service;
use tracing::{debug, error, info, warn};

use crate::{errors::ServeErrorKind, ssl::SslProvider, telemetry, Container};

pub const HEALTH_PATH: &str = "/health";
pub const METRICS_PATH: &str = "/metrics";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Grpc,
    Http,
}

impl Display for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grpc => f.write_str("gRPC"),
            Self::Http => f.write_str("HTTP"),
        }
    }
}

/// The HTTP transport while it is being assembled.
///
/// Handed to [`SslProvider::configure`] so a provider can install TLS or add routes,
/// e.g. for ACME challenges.
#[derive(Default)]
pub struct HttpServer {
    router: Router,
    tls_config: Option<Arc<ServerConfig>>,
}

impl HttpServer {
    #[inline]
    #[must_use]
    pub(crate) fn new(router: Router) -> Self {
        Self { router, tls_config: None }
    }

    /// Adds a route.
    ///
    /// # Panics
    /// If the route overlaps with an existing one
    pub fn route(&mut self, path: &str, method_router: MethodRouter) -> &mut Self {
        self.router = mem::take(&mut self.router).route(path, method_router);
        self
    }

    #[inline]
    pub fn set_tls_config(&mut self, config: Arc<ServerConfig>) -> &mut Self {
        self.tls_config = Some(config);
        self
    }

    #[inline]
    #[must_use]
    pub fn tls_config(&self) -> Option<&Arc<ServerConfig>> {
        self.tls_config.as_ref()
    }

    #[must_use]
    pub(crate) fn finish(self, cors: CorsLayer) -> (Router, Option<TlsAcceptor>) {
        (self.router.layer(cors), self.tls_config.map(TlsAcceptor::from))
    }
}

impl Debug for HttpServer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer").field("tls", &self.tls_config.is_some()).finish_non_exhaustive()
    }
}

/// HTTP routes in front of the gRPC router: health, metrics, and grpc-web translation of
/// everything else
#[must_use]
pub(crate) fn http_router(grpc_router: Router) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(|| async { "ok" }))
        .route(METRICS_PATH, get(|| async { telemetry::render() }))
        .fallback_service(HttpBody::new(GrpcWebLayer::new().layer(GrpcBody::new(grpc_router))))
}

/// Adapts an axum router to the body type grpc-web translation works with
#[derive(Clone, Debug)]
pub(crate) struct GrpcBody<S> {
    service: S,
}

impl<S> GrpcBody<S> {
    #[inline]
    #[must_use]
    pub(crate) fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S> Service<Request<BoxBody>> for GrpcBody<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>,
    S::Future: Send + 'static,
{
    type Response = Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<BoxBody>) -> Self::Future {
        let future = self.service.call(request.map(Body::new));
        Box::pin(async move {
            let response = future.await?;
            Ok(response.map(tonic::body::boxed))
        })
    }
}

/// Adapts the grpc-web service back to the body type axum routes with
#[derive(Clone, Debug)]
pub(crate) struct HttpBody<S> {
    service: S,
}

impl<S> HttpBody<S> {
    #[inline]
    #[must_use]
    pub(crate) fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S> Service<Request<Body>> for HttpBody<S>
where
    S: Service<Request<BoxBody>, Response = Response<BoxBody>, Error = Infallible>,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let future = self.service.call(request.map(tonic::body::boxed));
        Box::pin(async move {
            let response = future.await?;
            Ok(response.map(Body::new))
        })
    }
}

struct Transports {
    grpc_listener: TcpListener,
    grpc_router: Router,
    http_listener: TcpListener,
    http_router: Router,
    tls: Option<TlsAcceptor>,
    ssl_provider: Option<Arc<dyn SslProvider>>,
}

/// Built server, returned by [`crate::Builder::build`].
///
/// Both listeners are already bound, connections are accepted once [`Server::serve`] is called.
pub struct Server {
    grpc_addr: SocketAddr,
    http_addr: SocketAddr,
    container: Container,
    shutdown_timeout: Duration,
    transports: Mutex<Option<Transports>>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    /// Takes both listeners with the local addresses they are bound to
    pub(crate) fn new(
        grpc: (TcpListener, SocketAddr, Router),
        http: (TcpListener, SocketAddr, Router),
        tls: Option<TlsAcceptor>,
        ssl_provider: Option<Arc<dyn SslProvider>>,
        container: Container,
        shutdown_timeout: Duration,
    ) -> Self {
        let (grpc_listener, grpc_addr, grpc_router) = grpc;
        let (http_listener, http_addr, http_router) = http;

        Self {
            grpc_addr,
            http_addr,
            container,
            shutdown_timeout,
            transports: Mutex::new(Some(Transports {
                grpc_listener,
                grpc_router,
                http_listener,
                http_router,
                tls,
                ssl_provider,
            })),
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn grpc_addr(&self) -> SocketAddr {
        self.grpc_addr
    }

    #[inline]
    #[must_use]
    pub const fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Container the services were resolved from
    #[inline]
    #[must_use]
    pub const fn container(&self) -> &Container {
        &self.container
    }

    /// Serves both transports until `token` is cancelled or [`Server::shutdown`] is called,
    /// then shuts them down gracefully.
    ///
    /// # Errors
    /// - [`ServeErrorKind::AlreadyServing`] if called more than once or after shutdown
    /// - [`ServeErrorKind::Transport`] if a listener failed
    /// - [`ServeErrorKind::ShutdownTimeout`] if connections did not drain in time
    pub async fn serve(&self, token: CancellationToken) -> Result<(), ServeErrorKind> {
        let Some(transports) = self.transports.lock().take() else {
            let err = ServeErrorKind::AlreadyServing;
            error!("{}", err);
            return Err(err);
        };
        let Transports {
            grpc_listener,
            grpc_router,
            http_listener,
            http_router,
            tls,
            ssl_provider,
        } = transports;

        let grpc = self.tracker.spawn(accept(
            Transport::Grpc,
            grpc_listener,
            grpc_router,
            None,
            self.token.clone(),
            self.tracker.clone(),
        ));
        let http = self.tracker.spawn(accept(
            Transport::Http,
            http_listener,
            http_router,
            tls.clone(),
            self.token.clone(),
            self.tracker.clone(),
        ));
        if let Some(ssl_provider) = ssl_provider {
            let ssl = ssl_provider.run(self.token.child_token());
            self.tracker.spawn(async move {
                if let Err(err) = ssl.await {
                    error!(%err, "SSL provider stopped");
                }
            });
        }

        info!(grpc = %self.grpc_addr, http = %self.http_addr, tls = tls.is_some(), "Serving");

        let failure = tokio::select! {
            () = token.cancelled() => None,
            () = self.token.cancelled() => None,
            result = grpc => transport_failure(Transport::Grpc, result),
            result = http => transport_failure(Transport::Http, result),
        };
        if let Some(err) = &failure {
            error!("{}", err);
        }

        self.shutdown(self.shutdown_timeout).await?;
        failure.map_or(Ok(()), Err)
    }

    /// Stops accepting on both listeners and waits up to `timeout` for in-flight
    /// connections and background tasks to finish.
    ///
    /// # Errors
    /// [`ServeErrorKind::ShutdownTimeout`] if they did not finish in time
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ServeErrorKind> {
        info!(?timeout, "Shutting down");

        self.token.cancel();
        self.tracker.close();
        // Listeners of a server that never served are closed here
        drop(self.transports.lock().take());

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            let err = ServeErrorKind::ShutdownTimeout { timeout };
            warn!(connections = self.tracker.len(), "{}", err);
            return Err(err);
        }

        info!("Shut down");
        Ok(())
    }
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("grpc_addr", &self.grpc_addr)
            .field("http_addr", &self.http_addr)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

fn transport_failure(transport: Transport, result: Result<io::Result<()>, JoinError>) -> Option<ServeErrorKind> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(source)) => Some(ServeErrorKind::Transport { transport, source }),
        Err(err) => Some(ServeErrorKind::Transport {
            transport,
            source: io::Error::other(err),
        }),
    }
}

async fn accept(
    transport: Transport,
    listener: TcpListener,
    router: Router,
    tls: Option<TlsAcceptor>,
    token: CancellationToken,
    tracker: TaskTracker,
) -> io::Result<()> {
    loop {
        let (stream, remote_addr) = tokio::select! {
            () = token.cancelled() => {
                debug!(%transport, "Stopped accepting");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) if is_connection_error(&err) => {
                    debug!(%transport, %err, "Accept failed");
                    continue;
                }
                Err(err) => return Err(err),
            }
        };

        tracker.spawn(connection(transport, stream, remote_addr, router.clone(), tls.clone(), token.clone()));
    }
}

async fn connection(
    transport: Transport,
    stream: TcpStream,
    remote_addr: SocketAddr,
    router: Router,
    tls: Option<TlsAcceptor>,
    token: CancellationToken,
) {
    debug!(%transport, %remote_addr, "Connection accepted");

    let Some(acceptor) = tls else {
        return drive(transport, TokioIo::new(stream), remote_addr, router, token).await;
    };

    let handshake = tokio::select! {
        handshake = acceptor.accept(stream) => handshake,
        () = token.cancelled() => {
            debug!(%transport, %remote_addr, "TLS handshake abandoned on shutdown");
            return;
        }
    };
    match handshake {
        Ok(stream) => drive(transport, TokioIo::new(stream), remote_addr, router, token).await,
        Err(err) => debug!(%transport, %remote_addr, %err, "TLS handshake failed"),
    }
}

async fn drive<I>(transport: Transport, io: TokioIo<I>, remote_addr: SocketAddr, router: Router, token: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(io, TowerToHyperService::new(router));
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        () = token.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };

    if let Err(err) = result {
        debug!(%transport, %remote_addr, %err, "Connection closed with error");
    }
}

#[must_use]
fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}
