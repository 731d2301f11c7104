use std::{
    any::TypeId,
    fmt::{self, Display, Formatter},
};

use super::instantiate::InstantiateErrorKind;
use crate::any::TypeInfo;

#[derive(thiserror::Error, Debug)]
pub enum ResolveErrorKind {
    #[error("No provider registered for type {type_info}")]
    NoProvider { type_info: TypeInfo },
    #[error("Cyclic dependency detected: {chain}")]
    CyclicDependency { chain: DependencyChain },
    #[error("Incorrect instantiator provides type. Actual: {actual:?}, expected: {expected}")]
    IncorrectType { expected: TypeInfo, actual: TypeId },
    #[error("Instantiator of {type_info} failed: {source}")]
    Instantiate {
        type_info: TypeInfo,
        #[source]
        source: InstantiateErrorKind,
    },
}

impl ResolveErrorKind {
    /// Type the failed resolution was about, if the error names one
    #[must_use]
    pub fn type_info(&self) -> Option<TypeInfo> {
        match self {
            Self::NoProvider { type_info } | Self::Instantiate { type_info, .. } => Some(*type_info),
            Self::IncorrectType { expected, .. } => Some(*expected),
            Self::CyclicDependency { chain } => chain.0.first().copied(),
        }
    }
}

/// Types on the resolution stack, from the outermost request to the type requested again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyChain(pub Box<[TypeInfo]>);

impl Display for DependencyChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (index, type_info) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{}", type_info.short_name())?;
        }
        Ok(())
    }
}
