use std::{ops::Deref, sync::Arc};

use crate::{dependency_resolver::DependencyResolver, Container, ResolveErrorKind};

/// Resolves `Dep` from the container.
///
/// `Dep` may be unsized, so an interface bound with [`crate::Registry::bind`] is injected as
/// `Inject<dyn Trait>`.
pub struct Inject<Dep: ?Sized>(pub Arc<Dep>);

impl<Dep: ?Sized + Send + Sync + 'static> DependencyResolver for Inject<Dep> {
    type Error = ResolveErrorKind;

    fn resolve(container: &Container) -> Result<Self, Self::Error> {
        container.get().map(Self)
    }
}

impl<Dep: ?Sized> Deref for Inject<Dep> {
    type Target = Dep;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Dep: ?Sized> Clone for Inject<Dep> {
    #[inline]
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
