mod builder;
mod dependency_resolver;
mod instantiate;
mod instantiator;
mod server;

pub use builder::BuildErrorKind;
pub use dependency_resolver::{DependencyChain, ResolveErrorKind};
pub use instantiate::InstantiateErrorKind;
pub use instantiator::InstantiatorErrorKind;
pub use server::ServeErrorKind;
