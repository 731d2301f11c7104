use std::{any::Any, sync::Arc};

use crate::{any, any::TypeInfo, errors::DependencyChain};

/// Memoized singletons of a container
#[derive(Default)]
pub(crate) struct Cache {
    map: any::Map,
}

impl Cache {
    #[inline]
    #[must_use]
    pub(crate) fn new(map: any::Map) -> Self {
        Self { map }
    }

    #[inline]
    pub(crate) fn insert_rc<T: ?Sized + Send + Sync + 'static>(&mut self, value: Arc<T>) -> Option<Box<dyn Any + Send + Sync>> {
        self.map.insert(TypeInfo::of::<T>(), Box::new(value))
    }

    #[must_use]
    pub(crate) fn get<T: ?Sized + Send + Sync + 'static>(&self, type_info: &TypeInfo) -> Option<Arc<T>> {
        self.map
            .get(type_info)
            .and_then(|boxed| boxed.downcast_ref::<Arc<T>>())
            .cloned()
    }

    #[inline]
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

/// Types currently being resolved, outermost first
#[derive(Default)]
pub(crate) struct ResolvingStack(Vec<TypeInfo>);

impl ResolvingStack {
    /// Pushes `type_info` unless it is already being resolved, in which case the chain
    /// leading back to it is returned.
    pub(crate) fn push(&mut self, type_info: TypeInfo) -> Result<(), DependencyChain> {
        if let Some(position) = self.0.iter().position(|resolving| *resolving == type_info) {
            let mut chain = self.0[position..].to_vec();
            chain.push(type_info);
            return Err(DependencyChain(chain.into_boxed_slice()));
        }
        self.0.push(type_info);
        Ok(())
    }

    pub(crate) fn pop(&mut self) {
        self.0.pop();
    }

    #[inline]
    #[must_use]
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
