use std::{io, time::Duration};

use crate::server::Transport;

#[derive(thiserror::Error, Debug)]
pub enum ServeErrorKind {
    #[error("Server is already serving or was shut down")]
    AlreadyServing,
    #[error("{transport} transport failed: {source}")]
    Transport {
        transport: Transport,
        #[source]
        source: io::Error,
    },
    #[error("Transports did not drain within {timeout:?}")]
    ShutdownTimeout { timeout: Duration },
}
