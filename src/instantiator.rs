use std::{any::Any, sync::Arc};
use tracing::debug;

use super::{
    dependency_resolver::DependencyResolver,
    errors::{InstantiateErrorKind, InstantiatorErrorKind, ResolveErrorKind},
};
use crate::Container;

/// A constructor whose parameters are resolved from the [`Container`].
///
/// Implemented for every `FnMut(D1, .., Dn) -> Result<T, E>` closure or function
/// where each `Di` is a [`DependencyResolver`] (up to 16 parameters).
pub trait Instantiator<Deps>: Clone + 'static
where
    Deps: DependencyResolver,
{
    type Provides: 'static;
    type Error: Into<InstantiateErrorKind>;

    fn instantiate(&mut self, dependencies: Deps) -> Result<Self::Provides, Self::Error>;
}

/// Type-erased instantiator.
/// The boxed value it returns is always an `Arc<Dep>` of the type it was registered for.
pub(crate) type BoxedInstantiator = Arc<
    dyn Fn(&Container) -> Result<Box<dyn Any + Send + Sync>, InstantiatorErrorKind<ResolveErrorKind, InstantiateErrorKind>>
        + Send
        + Sync,
>;

#[must_use]
pub(crate) fn boxed_instantiator<Inst, Deps>(instantiator: Inst) -> BoxedInstantiator
where
    Inst: Instantiator<Deps> + Send + Sync,
    Inst::Provides: Send + Sync,
    Deps: DependencyResolver,
{
    boxed_instantiator_with(instantiator, Arc::new)
}

#[must_use]
pub(crate) fn boxed_instantiator_with<Inst, Deps, Dep, F>(instantiator: Inst, into_rc: F) -> BoxedInstantiator
where
    Inst: Instantiator<Deps> + Send + Sync,
    Deps: DependencyResolver,
    Dep: ?Sized + Send + Sync + 'static,
    F: Fn(Inst::Provides) -> Arc<Dep> + Send + Sync + 'static,
{
    Arc::new(move |container: &Container| {
        let dependencies = match Deps::resolve(container) {
            Ok(dependencies) => dependencies,
            Err(err) => return Err(InstantiatorErrorKind::Deps(err.into())),
        };
        let dependency = match instantiator.clone().instantiate(dependencies) {
            Ok(dependency) => dependency,
            Err(err) => return Err(InstantiatorErrorKind::Factory(err.into())),
        };

        debug!("Instantiated");

        Ok(Box::new(into_rc(dependency)) as _)
    })
}

macro_rules! impl_instantiator {
    (
        [$($ty:ident),*]
    ) => {
        #[allow(non_snake_case)]
        impl<F, Response, Err, $($ty,)*> Instantiator<($($ty,)*)> for F
        where
            F: FnMut($($ty,)*) -> Result<Response, Err> + Clone + 'static,
            Response: 'static,
            Err: Into<InstantiateErrorKind>,
            $( $ty: DependencyResolver, )*
        {
            type Provides = Response;
            type Error = Err;

            fn instantiate(&mut self, ($($ty,)*): ($($ty,)*)) -> Result<Self::Provides, Self::Error> {
                self($($ty,)*)
            }
        }
    };
}

all_the_tuples!(impl_instantiator);

/// Wrapper to create an instantiator that just returns passed value.
/// It can be used when the value was created outside the container but should still be
/// constructed lazily, or with [`crate::Config::transient`] to hand out a fresh clone each time.
#[inline]
#[must_use]
pub fn instance<T: Clone + Send + Sync + 'static>(val: T) -> impl Instantiator<(), Provides = T, Error = InstantiateErrorKind> + Send + Sync {
    move || Ok(val.clone())
}
