use parking_lot::{Mutex, ReentrantMutex};
use std::{
    any::{type_name, Any},
    collections::BTreeMap,
    sync::Arc,
};
use tracing::{debug, error, info_span};

use crate::{
    any::TypeInfo,
    cache::{Cache, ResolvingStack},
    errors::{InstantiatorErrorKind, ResolveErrorKind},
    registry::{InstantiatorData, Registry},
};

struct ContainerInner {
    instantiators: BTreeMap<TypeInfo, InstantiatorData>,
    cache: Mutex<Cache>,
    resolving: Mutex<ResolvingStack>,
    /// Serializes resolution between threads, so a provider runs at most once per container
    /// when cached. Reentrant because instantiators resolve their own dependencies.
    resolution: ReentrantMutex<()>,
}

/// Resolves and memoizes dependencies registered in a [`Registry`].
///
/// Cloning is cheap, all clones share the same cache.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    #[inline]
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        let (instantiators, instances) = registry.into_parts();
        Self {
            inner: Arc::new(ContainerInner {
                instantiators,
                cache: Mutex::new(Cache::new(instances)),
                resolving: Mutex::new(ResolvingStack::default()),
                resolution: ReentrantMutex::new(()),
            }),
        }
    }

    /// Gets a dependency from the container.
    ///
    /// Cached values and registered instances are returned as is.
    /// Otherwise the provider of `Dep` is called with its own dependencies resolved first,
    /// and the result is cached unless the provider was registered with [`crate::Config::transient`].
    ///
    /// # Errors
    /// - [`ResolveErrorKind::NoProvider`] if `Dep` or any of its transitive dependencies has no binding
    /// - [`ResolveErrorKind::CyclicDependency`] if `Dep` depends on itself
    /// - [`ResolveErrorKind::Instantiate`] if a provider returned an error
    pub fn get<Dep: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<Dep>, ResolveErrorKind> {
        let span = info_span!("get", dependency = type_name::<Dep>());
        let _guard = span.enter();

        let _resolution = self.inner.resolution.lock();

        let type_info = TypeInfo::of::<Dep>();

        if let Some(dependency) = self.inner.cache.lock().get::<Dep>(&type_info) {
            debug!("Found in cache");
            return Ok(dependency);
        }
        debug!("Not found in cache");

        let Some(InstantiatorData { instantiator, config }) = self.inner.instantiators.get(&type_info) else {
            let err = ResolveErrorKind::NoProvider { type_info };
            error!("{}", err);
            return Err(err);
        };

        if let Err(chain) = self.inner.resolving.lock().push(type_info) {
            let err = ResolveErrorKind::CyclicDependency { chain };
            error!("{}", err);
            return Err(err);
        }
        let result = {
            let _resolving = ResolvingGuard(&self.inner.resolving);
            instantiator(self)
        };

        match result {
            Ok(dependency) => match dependency.downcast::<Arc<Dep>>() {
                Ok(dependency) => {
                    let dependency = *dependency;
                    if config.cache_provides {
                        self.inner.cache.lock().insert_rc(dependency.clone());
                        debug!("Cached");
                    }
                    Ok(dependency)
                }
                Err(incorrect_type) => {
                    let err = ResolveErrorKind::IncorrectType {
                        expected: type_info,
                        actual: Any::type_id(&*incorrect_type),
                    };
                    error!("{}", err);
                    Err(err)
                }
            },
            // Already logged where it happened
            Err(InstantiatorErrorKind::Deps(err)) => Err(err),
            Err(InstantiatorErrorKind::Factory(source)) => {
                let err = ResolveErrorKind::Instantiate { type_info, source };
                error!("{}", err);
                Err(err)
            }
        }
    }

    /// Number of values currently held by the cache, registered instances included
    #[inline]
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.inner.cache.lock().len()
    }
}

struct ResolvingGuard<'a>(&'a Mutex<ResolvingStack>);

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().pop();
    }
}

#[cfg(test)]
mod tests {
    use super::Container;
    use crate::{inject::Inject, instance, Config, InstantiateErrorKind, Registry, ResolveErrorKind};

    use std::{
        sync::{
            atomic::{AtomicU8, Ordering},
            Arc,
        },
        thread,
    };
    use tracing::debug;
    use tracing_test::traced_test;

    struct Config1;
    struct Repo(Arc<Config1>);
    struct Service(Arc<Repo>);

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English(&'static str);

    impl Greeter for English {
        fn greet(&self) -> String {
            format!("hello, {}", self.0)
        }
    }

    struct CycleA;
    struct CycleB;

    #[test]
    #[traced_test]
    fn test_memoization() {
        let call_count = Arc::new(AtomicU8::new(0));

        let container = Container::new(Registry::new().provide({
            let call_count = call_count.clone();
            move || {
                call_count.fetch_add(1, Ordering::SeqCst);
                Ok(Config1)
            }
        }));

        let first = container.get::<Config1>().unwrap();
        let second = container.get::<Config1>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert!(logs_contain("Found in cache"));
        assert!(logs_contain("Cached"));
    }

    #[test]
    #[traced_test]
    fn test_chain_resolves_each_once() {
        let config_call_count = Arc::new(AtomicU8::new(0));
        let repo_call_count = Arc::new(AtomicU8::new(0));

        let container = Container::new(
            Registry::new()
                .provide(|Inject(repo): Inject<Repo>| Ok(Service(repo)))
                .provide({
                    let repo_call_count = repo_call_count.clone();
                    move |Inject(config): Inject<Config1>| {
                        repo_call_count.fetch_add(1, Ordering::SeqCst);
                        Ok(Repo(config))
                    }
                })
                .provide({
                    let config_call_count = config_call_count.clone();
                    move || {
                        config_call_count.fetch_add(1, Ordering::SeqCst);
                        debug!("Call instantiator config");
                        Ok(Config1)
                    }
                }),
        );

        let service = container.get::<Service>().unwrap();
        let repo = container.get::<Repo>().unwrap();
        let config = container.get::<Config1>().unwrap();

        assert!(Arc::ptr_eq(&service.0, &repo));
        assert!(Arc::ptr_eq(&repo.0, &config));
        assert_eq!(config_call_count.load(Ordering::SeqCst), 1);
        assert_eq!(repo_call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[traced_test]
    fn test_missing_type_is_named() {
        let container = Container::new(Registry::new().provide(|Inject(config): Inject<Config1>| Ok(Repo(config))));

        let err = container.get::<Repo>().err().unwrap();
        assert!(matches!(err, ResolveErrorKind::NoProvider { .. }));
        assert!(err.to_string().contains("Config1"));
        assert!(logs_contain("No provider registered for type"));
    }

    #[test]
    #[traced_test]
    fn test_cycle_detected() {
        let container = Container::new(
            Registry::new()
                .provide(|Inject(_): Inject<CycleB>| Ok(CycleA))
                .provide(|Inject(_): Inject<CycleA>| Ok(CycleB)),
        );

        let err = container.get::<CycleA>().err().unwrap();
        let ResolveErrorKind::CyclicDependency { chain } = err else {
            panic!("expected a cycle, got {err}");
        };
        assert_eq!(chain.to_string(), "CycleA -> CycleB -> CycleA");

        // The resolving stack is unwound, so a second attempt reports the same cycle
        assert!(matches!(
            container.get::<CycleB>(),
            Err(ResolveErrorKind::CyclicDependency { .. })
        ));
    }

    #[test]
    #[traced_test]
    fn test_transient() {
        let call_count = Arc::new(AtomicU8::new(0));

        let container = Container::new(Registry::new().provide_with_config(
            {
                let call_count = call_count.clone();
                move || {
                    call_count.fetch_add(1, Ordering::SeqCst);
                    Ok(Config1)
                }
            },
            Config::transient(),
        ));

        let first = container.get::<Config1>().unwrap();
        let second = container.get::<Config1>().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[traced_test]
    fn test_interface_binding() {
        let container = Container::new(
            Registry::new()
                .provide_instance("world")
                .provide_bound::<dyn Greeter, _, _>(|Inject(name): Inject<&'static str>| {
                    Ok(Arc::new(English(*name)) as Arc<dyn Greeter>)
                }),
        );

        let greeter = container.get::<dyn Greeter>().unwrap();
        assert_eq!(greeter.greet(), "hello, world");
        assert!(Arc::ptr_eq(&greeter, &container.get::<dyn Greeter>().unwrap()));
        assert!(matches!(container.get::<English>(), Err(ResolveErrorKind::NoProvider { .. })));
    }

    #[test]
    #[traced_test]
    fn test_bound_instance() {
        let greeter: Arc<dyn Greeter> = Arc::new(English("instance"));
        let container = Container::new(Registry::new().bind(greeter.clone()));

        assert!(Arc::ptr_eq(&greeter, &container.get::<dyn Greeter>().unwrap()));
    }

    #[test]
    #[traced_test]
    fn test_last_registration_wins() {
        let container = Container::new(Registry::new().provide_instance(1u32).provide(instance(2u32)).provide(|| Ok(3u32)));
        assert_eq!(*container.get::<u32>().unwrap(), 3);

        let container = Container::new(Registry::new().provide(|| Ok(3u32)).provide_instance(4u32));
        assert_eq!(*container.get::<u32>().unwrap(), 4);
    }

    #[test]
    #[traced_test]
    fn test_factory_error() {
        let container = Container::new(
            Registry::new()
                .provide(|| Err::<Config1, _>(InstantiateErrorKind::from(anyhow::anyhow!("database unreachable"))))
                .provide(|Inject(config): Inject<Config1>| Ok(Repo(config))),
        );

        let err = container.get::<Repo>().err().unwrap();
        let ResolveErrorKind::Instantiate { type_info, .. } = &err else {
            panic!("expected an instantiate error, got {err}");
        };
        assert_eq!(type_info.short_name(), "Config1");
        assert!(err.to_string().contains("database unreachable"));
    }

    #[test]
    #[traced_test]
    fn test_concurrent_get_calls_provider_once() {
        let call_count = Arc::new(AtomicU8::new(0));

        let container = Container::new(Registry::new().provide({
            let call_count = call_count.clone();
            move || {
                call_count.fetch_add(1, Ordering::SeqCst);
                Ok(Config1)
            }
        }));

        let handles = (0..8)
            .map(|_| {
                let container = container.clone();
                thread::spawn(move || container.get::<Config1>().unwrap())
            })
            .collect::<Vec<_>>();
        let values = handles.into_iter().map(|handle| handle.join().unwrap()).collect::<Vec<_>>();

        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert!(values.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }
}
