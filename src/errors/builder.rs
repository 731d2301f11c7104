use std::{io, net::SocketAddr};

use super::dependency_resolver::ResolveErrorKind;
use crate::{any::TypeInfo, server::Transport};

#[derive(thiserror::Error, Debug)]
pub enum BuildErrorKind {
    #[error("{transport} port is not set")]
    MissingPort { transport: Transport },
    #[error("Failed to bind {transport} listener on {addr}: {source}")]
    Bind {
        transport: Transport,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to build service {service} (registration #{index}): {source}")]
    Resolve {
        index: usize,
        service: TypeInfo,
        #[source]
        source: ResolveErrorKind,
    },
    #[error("SSL provider failed to configure the HTTP server: {0}")]
    Ssl(#[source] anyhow::Error),
}
