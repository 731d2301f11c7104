use axum::routing::MethodRouter;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::net::TcpListener;
use tonic::service::RoutesBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::{
    any::TypeInfo,
    dependency_resolver::DependencyResolver,
    errors::{BuildErrorKind, InstantiateErrorKind, ResolveErrorKind},
    instantiator::Instantiator,
    interceptor::{InterceptLayer, Interceptor, InterceptorChain, LoggingInterceptor, TagsInterceptor},
    server::{http_router, HttpServer, Server, Transport},
    settings::{ServerSettings, DEFAULT_SHUTDOWN_TIMEOUT},
    ssl::SslProvider,
    telemetry, Config, Container, Registry,
};

type Registration = Box<dyn FnOnce(usize, &Container, &mut RoutesBuilder) -> Result<(), BuildErrorKind> + Send>;

/// Fluent configuration of a [`Server`].
///
/// Setters only record configuration, nothing is resolved or bound until [`Builder::build`].
///
/// ```rust,no_run
/// use gantry::{Builder, Inject};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// struct Settings {
///     greeting: String,
/// }
///
/// struct GreeterImpl {
///     settings: Arc<Settings>,
/// }
///
/// # async fn run() -> anyhow::Result<()> {
/// let server = Builder::new()
///     .grpc_port(50051)
///     .http_port(8080)
///     .provide(Settings { greeting: "hello".to_owned() })
///     .register(
///         |routes, service: Arc<GreeterImpl>| {
///             // routes.add_service(GreeterServer::from_arc(service));
///             let _ = (routes, service);
///         },
///         |Inject(settings): Inject<Settings>| Ok::<_, anyhow::Error>(GreeterImpl { settings }),
///     )
///     .build()
///     .await?;
///
/// server.serve(CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct Builder {
    host: IpAddr,
    grpc_port: Option<u16>,
    http_port: Option<u16>,
    shutdown_timeout: Duration,
    ssl_provider: Option<Arc<dyn SslProvider>>,
    auth: Option<Arc<dyn Interceptor>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    cors: CorsLayer,
    handlers: Vec<(String, MethodRouter)>,
    registry: Registry,
    registrations: Vec<Registration>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        let settings = ServerSettings::default();
        Self {
            host: settings.host,
            grpc_port: None,
            http_port: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            ssl_provider: None,
            auth: None,
            interceptors: Vec::new(),
            cors: CorsLayer::permissive(),
            handlers: Vec::new(),
            registry: Registry::new(),
            registrations: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn grpc_port(mut self, port: u16) -> Self {
        self.grpc_port = Some(port);
        self
    }

    #[inline]
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = Some(port);
        self
    }

    #[inline]
    #[must_use]
    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    #[inline]
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Applies host, ports and shutdown timeout. Ports missing from `settings` are left as they were.
    #[must_use]
    pub fn with_settings(mut self, settings: ServerSettings) -> Self {
        self.host = settings.host;
        self.grpc_port = settings.grpc_port.or(self.grpc_port);
        self.http_port = settings.http_port.or(self.http_port);
        self.shutdown_timeout = settings.shutdown_timeout();
        self
    }

    #[inline]
    #[must_use]
    pub fn ssl_provider(mut self, provider: impl SslProvider) -> Self {
        self.ssl_provider = Some(Arc::new(provider));
        self
    }

    /// Sets the authentication interceptor, run right after the built-in tags and logging ones
    #[inline]
    #[must_use]
    pub fn auth(mut self, interceptor: impl Interceptor) -> Self {
        self.auth = Some(Arc::new(interceptor));
        self
    }

    /// Appends an interceptor, run after the built-in ones and those added before it
    #[inline]
    #[must_use]
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Replaces the CORS policy of the HTTP transport, which allows everything by default
    #[inline]
    #[must_use]
    pub fn cors(mut self, cors: CorsLayer) -> Self {
        self.cors = cors;
        self
    }

    /// Adds an HTTP handler.
    /// Building panics if `path` overlaps `/health`, `/metrics` or another handler.
    #[inline]
    #[must_use]
    pub fn handle(mut self, path: impl Into<String>, method_router: MethodRouter) -> Self {
        self.handlers.push((path.into(), method_router));
        self
    }

    /// Registers a pre-built singleton
    #[inline]
    #[must_use]
    pub fn provide<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.registry = self.registry.provide_instance(value);
        self
    }

    /// Registers a provider whose parameters are resolved from the container
    #[inline]
    #[must_use]
    pub fn provide_func<Inst, Deps>(self, instantiator: Inst) -> Self
    where
        Inst: Instantiator<Deps, Error = InstantiateErrorKind> + Send + Sync,
        Inst::Provides: Send + Sync,
        Deps: DependencyResolver<Error = ResolveErrorKind>,
    {
        self.provide_func_with_config(instantiator, Config::default())
    }

    #[inline]
    #[must_use]
    pub fn provide_func_with_config<Inst, Deps>(mut self, instantiator: Inst, config: Config) -> Self
    where
        Inst: Instantiator<Deps, Error = InstantiateErrorKind> + Send + Sync,
        Inst::Provides: Send + Sync,
        Deps: DependencyResolver<Error = ResolveErrorKind>,
    {
        self.registry = self.registry.provide_with_config(instantiator, config);
        self
    }

    /// Binds a pre-built value to the interface `Dep`, usually `dyn Trait`
    #[inline]
    #[must_use]
    pub fn provide_as<Dep: ?Sized + Send + Sync + 'static>(mut self, value: Arc<Dep>) -> Self {
        self.registry = self.registry.bind(value);
        self
    }

    /// Binds a provider returning `Arc<Dep>` to the interface `Dep`
    #[inline]
    #[must_use]
    pub fn provide_func_as<Dep, Inst, Deps>(mut self, instantiator: Inst) -> Self
    where
        Dep: ?Sized + Send + Sync + 'static,
        Inst: Instantiator<Deps, Provides = Arc<Dep>, Error = InstantiateErrorKind> + Send + Sync,
        Deps: DependencyResolver<Error = ResolveErrorKind>,
    {
        self.registry = self.registry.provide_bound(instantiator);
        self
    }

    /// Registers a gRPC service.
    ///
    /// During [`Builder::build`] the `factory` is called with its parameters resolved from the
    /// container, then `registrar` adds the service it returned to the gRPC routes.
    /// Registrations are processed in the order they were added.
    #[must_use]
    pub fn register<Svc, Deps, Factory, Registrar>(mut self, registrar: Registrar, factory: Factory) -> Self
    where
        Svc: 'static,
        Registrar: FnOnce(&mut RoutesBuilder, Arc<Svc>) + Send + 'static,
        Factory: Instantiator<Deps, Provides = Svc> + Send,
        Deps: DependencyResolver + 'static,
    {
        self.registrations.push(Box::new(move |index, container, routes| {
            let service = TypeInfo::of::<Svc>();
            let mut factory = factory;

            let dependencies = Deps::resolve(container).map_err(|err| BuildErrorKind::Resolve {
                index,
                service,
                source: err.into(),
            })?;
            let instance = factory.instantiate(dependencies).map_err(|err| BuildErrorKind::Resolve {
                index,
                service,
                source: ResolveErrorKind::Instantiate {
                    type_info: service,
                    source: err.into(),
                },
            })?;

            registrar(routes, Arc::new(instance));
            debug!(index, %service, "Service registered");
            Ok(())
        }));
        self
    }

    /// Resolves every registered service and binds both listeners.
    ///
    /// # Errors
    /// - [`BuildErrorKind::MissingPort`] if the gRPC or HTTP port is not set
    /// - [`BuildErrorKind::Bind`] if a listener could not be bound
    /// - [`BuildErrorKind::Resolve`] if a service or one of its dependencies could not be resolved
    /// - [`BuildErrorKind::Ssl`] if the SSL provider failed to configure the HTTP transport
    ///
    /// # Panics
    /// If an HTTP handler overlaps with another route
    pub async fn build(self) -> Result<Server, BuildErrorKind> {
        let grpc_addr = SocketAddr::new(self.host, port(Transport::Grpc, self.grpc_port)?);
        let http_addr = SocketAddr::new(self.host, port(Transport::Http, self.http_port)?);

        let (grpc_listener, grpc_addr) = bind(Transport::Grpc, grpc_addr).await?;
        let (http_listener, http_addr) = bind(Transport::Http, http_addr).await?;

        // Installed before the first call is counted
        let _ = telemetry::prometheus_handle();

        let mut interceptors: Vec<Arc<dyn Interceptor>> = vec![Arc::new(TagsInterceptor), Arc::new(LoggingInterceptor)];
        interceptors.extend(self.auth);
        interceptors.extend(self.interceptors);
        let chain = InterceptorChain::new(interceptors);

        let container = Container::new(self.registry);

        let mut routes = RoutesBuilder::default();
        for (index, registration) in self.registrations.into_iter().enumerate() {
            if let Err(err) = registration(index, &container, &mut routes) {
                error!("{}", err);
                return Err(err);
            }
        }
        let grpc_router = routes.routes().into_axum_router().layer(InterceptLayer::new(chain));

        let mut http = HttpServer::new(http_router(grpc_router.clone()));
        for (path, method_router) in self.handlers {
            http.route(&path, method_router);
        }
        if let Some(ssl_provider) = &self.ssl_provider {
            if let Err(err) = ssl_provider.configure(&mut http) {
                let err = BuildErrorKind::Ssl(err);
                error!("{}", err);
                return Err(err);
            }
        }
        let (http_router, tls) = http.finish(self.cors);

        let server = Server::new(
            (grpc_listener, grpc_addr, grpc_router),
            (http_listener, http_addr, http_router),
            tls,
            self.ssl_provider,
            container,
            self.shutdown_timeout,
        );

        info!(grpc = %server.grpc_addr(), http = %server.http_addr(), "Server built");
        Ok(server)
    }
}

fn port(transport: Transport, port: Option<u16>) -> Result<u16, BuildErrorKind> {
    port.ok_or_else(|| {
        let err = BuildErrorKind::MissingPort { transport };
        error!("{}", err);
        err
    })
}

/// Binds `addr` and returns the listener with the address it is bound to, which differs from
/// `addr` when port `0` was requested
async fn bind(transport: Transport, addr: SocketAddr) -> Result<(TcpListener, SocketAddr), BuildErrorKind> {
    let bound = TcpListener::bind(addr)
        .await
        .and_then(|listener| Ok((listener.local_addr()?, listener)));

    match bound {
        Ok((local_addr, listener)) => {
            debug!(%transport, %local_addr, "Listener bound");
            Ok((listener, local_addr))
        }
        Err(source) => {
            let err = BuildErrorKind::Bind { transport, addr, source };
            error!("{}", err);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{bind, Builder};
    use crate::{errors::BuildErrorKind, server::Transport, ServerSettings};

    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        time::Duration,
    };
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_missing_grpc_port() {
        let err = Builder::new().http_port(0).build().await.unwrap_err();
        assert!(matches!(err, BuildErrorKind::MissingPort { transport: Transport::Grpc }));
        assert!(logs_contain("gRPC port is not set"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_http_port() {
        let err = Builder::new().grpc_port(0).build().await.unwrap_err();
        assert!(matches!(err, BuildErrorKind::MissingPort { transport: Transport::Http }));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_bind_conflict() {
        let taken = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = Builder::new()
            .host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .grpc_port(0)
            .http_port(port)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, BuildErrorKind::Bind { transport: Transport::Http, .. }));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_bind_conflict_names_grpc_transport() {
        let taken = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken_addr = taken.local_addr().unwrap();

        let err = Builder::new()
            .host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .grpc_port(taken_addr.port())
            .http_port(0)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, BuildErrorKind::Bind { transport: Transport::Grpc, addr, .. } if addr == taken_addr));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_bind_returns_bound_address() {
        let (listener, addr) = bind(Transport::Http, SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();

        assert_ne!(addr.port(), 0);
        assert_eq!(listener.local_addr().unwrap(), addr);
        assert!(logs_contain("Listener bound"));
    }

    #[test]
    fn test_with_settings_keeps_unset_ports() {
        let builder = Builder::new().grpc_port(50051).with_settings(ServerSettings {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            grpc_port: None,
            http_port: Some(8080),
            shutdown_timeout: 1,
        });

        assert_eq!(builder.grpc_port, Some(50051));
        assert_eq!(builder.http_port, Some(8080));
        assert_eq!(builder.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(builder.shutdown_timeout, Duration::from_secs(1));
    }
}
