//! Dependency-injected bootstrapping of a gRPC server with an HTTP companion.
//!
//! Dependencies are registered on a [`Registry`] (or directly on a [`Builder`]) as pre-built
//! singletons or as providers, plain closures whose parameters are resolved from the
//! [`Container`]:
//!
//! ```rust
//! use gantry::{Container, Inject, Registry};
//!
//! struct Settings {
//!     dsn: &'static str,
//! }
//!
//! struct Database {
//!     dsn: &'static str,
//! }
//!
//! let container = Container::new(
//!     Registry::new()
//!         .provide_instance(Settings { dsn: "postgres://localhost" })
//!         .provide(|Inject(settings): Inject<Settings>| Ok(Database { dsn: settings.dsn })),
//! );
//!
//! let database = container.get::<Database>().unwrap();
//! assert_eq!(database.dsn, "postgres://localhost");
//! ```
//!
//! [`Builder`] resolves registered gRPC services through the container on [`Builder::build`]
//! and assembles a [`Server`] serving them over gRPC, plus an HTTP transport with grpc-web
//! translation, `/health`, `/metrics` and caller routes.

#[macro_use]
pub(crate) mod macros;

pub(crate) mod any;
pub(crate) mod builder;
pub(crate) mod cache;
pub(crate) mod config;
pub(crate) mod container;
pub(crate) mod dependency_resolver;
pub(crate) mod errors;
pub(crate) mod inject;
pub(crate) mod instantiator;
pub(crate) mod registry;
pub(crate) mod settings;

pub mod interceptor;
pub mod server;
pub mod ssl;
pub mod telemetry;

pub use any::TypeInfo;
pub use builder::Builder;
pub use config::Config;
pub use container::Container;
pub use dependency_resolver::DependencyResolver;
pub use errors::{BuildErrorKind, DependencyChain, InstantiateErrorKind, InstantiatorErrorKind, ResolveErrorKind, ServeErrorKind};
pub use inject::Inject;
pub use instantiator::{instance, Instantiator};
pub use interceptor::{from_fn, Interceptor, Next, Tags};
pub use registry::Registry;
pub use server::{HttpServer, Server, Transport};
pub use settings::ServerSettings;
pub use ssl::{PemFiles, SslProvider};
