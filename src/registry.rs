use std::{any::Any, collections::BTreeMap, sync::Arc};

use super::{
    errors::{InstantiateErrorKind, ResolveErrorKind},
    instantiator::{BoxedInstantiator, Instantiator},
};
use crate::{
    any::{self, TypeInfo},
    dependency_resolver::DependencyResolver,
    instantiator::{boxed_instantiator, boxed_instantiator_with},
    Config,
};

#[derive(Clone)]
pub(crate) struct InstantiatorData {
    pub(crate) instantiator: BoxedInstantiator,
    pub(crate) config: Config,
}

/// Bindings a [`crate::Container`] is created from.
///
/// Every type has at most one binding, either a pre-built instance or an instantiator.
/// Registering a type again replaces its previous binding of either kind.
#[derive(Default)]
pub struct Registry {
    instantiators: BTreeMap<TypeInfo, InstantiatorData>,
    instances: any::Map,
}

impl Registry {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instantiator for the type it returns
    #[inline]
    #[must_use]
    pub fn provide<Inst, Deps>(self, instantiator: Inst) -> Self
    where
        Inst: Instantiator<Deps, Error = InstantiateErrorKind> + Send + Sync,
        Inst::Provides: Send + Sync,
        Deps: DependencyResolver<Error = ResolveErrorKind>,
    {
        self.provide_with_config(instantiator, Config::default())
    }

    #[inline]
    #[must_use]
    pub fn provide_with_config<Inst, Deps>(mut self, instantiator: Inst, config: Config) -> Self
    where
        Inst: Instantiator<Deps, Error = InstantiateErrorKind> + Send + Sync,
        Inst::Provides: Send + Sync,
        Deps: DependencyResolver<Error = ResolveErrorKind>,
    {
        self.add_instantiator(TypeInfo::of::<Inst::Provides>(), boxed_instantiator(instantiator), config);
        self
    }

    /// Registers an instantiator returning `Arc<Dep>` for `Dep`, which is usually a trait object.
    ///
    /// ```rust
    /// use gantry::{Registry, Container};
    /// use std::sync::Arc;
    ///
    /// trait UserRepo: Send + Sync {}
    ///
    /// struct PostgresUserRepo;
    ///
    /// impl UserRepo for PostgresUserRepo {}
    ///
    /// let container = Container::new(
    ///     Registry::new().provide_bound::<dyn UserRepo, _, _>(|| Ok(Arc::new(PostgresUserRepo) as Arc<dyn UserRepo>)),
    /// );
    /// let _repo: Arc<dyn UserRepo> = container.get::<dyn UserRepo>().unwrap();
    /// ```
    #[inline]
    #[must_use]
    pub fn provide_bound<Dep, Inst, Deps>(mut self, instantiator: Inst) -> Self
    where
        Dep: ?Sized + Send + Sync + 'static,
        Inst: Instantiator<Deps, Provides = Arc<Dep>, Error = InstantiateErrorKind> + Send + Sync,
        Deps: DependencyResolver<Error = ResolveErrorKind>,
    {
        self.add_instantiator(
            TypeInfo::of::<Dep>(),
            boxed_instantiator_with(instantiator, |dependency: Arc<Dep>| dependency),
            Config::default(),
        );
        self
    }

    /// Registers a pre-built value for its own type
    #[inline]
    #[must_use]
    pub fn provide_instance<T: Send + Sync + 'static>(self, value: T) -> Self {
        self.bind(Arc::new(value))
    }

    /// Registers a pre-built value for `Dep`, which may be a trait object the value implements
    #[inline]
    #[must_use]
    pub fn bind<Dep: ?Sized + Send + Sync + 'static>(mut self, value: Arc<Dep>) -> Self {
        self.add_instance(TypeInfo::of::<Dep>(), Box::new(value));
        self
    }

    /// Checks whether `Dep` has a binding of any kind
    #[inline]
    #[must_use]
    pub fn is_bound<Dep: ?Sized + 'static>(&self) -> bool {
        let type_info = TypeInfo::of::<Dep>();
        self.instantiators.contains_key(&type_info) || self.instances.contains_key(&type_info)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.instantiators.len() + self.instances.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Registry {
    pub(crate) fn add_instantiator(
        &mut self,
        type_info: TypeInfo,
        instantiator: BoxedInstantiator,
        config: Config,
    ) -> Option<InstantiatorData> {
        self.instances.remove(&type_info);
        self.instantiators.insert(type_info, InstantiatorData { instantiator, config })
    }

    pub(crate) fn add_instance(&mut self, type_info: TypeInfo, value: Box<dyn Any + Send + Sync>) -> Option<Box<dyn Any + Send + Sync>> {
        self.instantiators.remove(&type_info);
        self.instances.insert(type_info, value)
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn get(&self, type_info: &TypeInfo) -> Option<&InstantiatorData> {
        self.instantiators.get(type_info)
    }

    /// Splits the registry into its instantiators and the instances that seed the cache
    #[must_use]
    pub(crate) fn into_parts(self) -> (BTreeMap<TypeInfo, InstantiatorData>, any::Map) {
        (self.instantiators, self.instances)
    }
}
