use anyhow::{anyhow, bail, Context as _};
use futures_core::future::BoxFuture;
use parking_lot::RwLock;
use std::{
    fmt::{self, Debug, Formatter},
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio_rustls::rustls::{
    crypto::ring,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::HttpServer;

pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Configures TLS for the HTTP transport and keeps certificates fresh in the background.
///
/// `configure` is called once during [`crate::Builder::build`], `run` is spawned when the
/// server starts serving and should return once `token` is cancelled.
pub trait SslProvider: Send + Sync + 'static {
    #[allow(clippy::missing_errors_doc)]
    fn configure(&self, server: &mut HttpServer) -> anyhow::Result<()>;

    fn run(&self, token: CancellationToken) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Serves a certificate chain and private key read from PEM files,
/// re-reading them periodically so renewed certificates are picked up without a restart.
pub struct PemFiles {
    cert_path: PathBuf,
    key_path: PathBuf,
    reload_interval: Duration,
    resolver: Arc<ReloadingResolver>,
}

impl PemFiles {
    pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(60 * 60);

    #[inline]
    #[must_use]
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            reload_interval: Self::DEFAULT_RELOAD_INTERVAL,
            resolver: Arc::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn reload_interval(mut self, reload_interval: Duration) -> Self {
        self.reload_interval = reload_interval;
        self
    }
}

impl SslProvider for PemFiles {
    fn configure(&self, server: &mut HttpServer) -> anyhow::Result<()> {
        let key = load_certified_key(&self.cert_path, &self.key_path)?;
        self.resolver.store(key);

        let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(self.resolver.clone());
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|protocol| protocol.to_vec()).collect();

        server.set_tls_config(Arc::new(config));
        info!(cert = %self.cert_path.display(), "TLS configured");
        Ok(())
    }

    fn run(&self, token: CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> {
        let cert_path = self.cert_path.clone();
        let key_path = self.key_path.clone();
        let resolver = self.resolver.clone();
        let reload_interval = self.reload_interval;

        Box::pin(async move {
            let mut interval = tokio::time::interval(reload_interval);
            // The first tick completes immediately and the files were just loaded by `configure`
            interval.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("Certificate reloading stopped");
                        return Ok(());
                    }
                    _ = interval.tick() => {}
                }

                match load_certified_key(&cert_path, &key_path) {
                    Ok(key) => {
                        if resolver.store(key) {
                            info!(cert = %cert_path.display(), "Certificate reloaded");
                        }
                    }
                    Err(err) => warn!(%err, "Failed to reload certificate, keeping the previous one"),
                }
            }
        })
    }
}

impl Debug for PemFiles {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PemFiles")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("reload_interval", &self.reload_interval)
            .finish_non_exhaustive()
    }
}

/// Hands out the most recently loaded certificate on every handshake
#[derive(Debug, Default)]
struct ReloadingResolver {
    key: RwLock<Option<Arc<CertifiedKey>>>,
}

impl ReloadingResolver {
    /// Replaces the current key, returns whether its certificate chain changed
    fn store(&self, key: CertifiedKey) -> bool {
        let mut current = self.key.write();
        let changed = current.as_ref().map_or(true, |current| current.cert != key.cert);
        if changed {
            *current = Some(Arc::new(key));
        }
        changed
    }
}

impl ResolvesServerCert for ReloadingResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.key.read().clone()
    }
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> anyhow::Result<CertifiedKey> {
    let cert_file = File::open(cert_path).with_context(|| format!("Failed to open certificate {}", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate {}", cert_path.display()))?;
    if certs.is_empty() {
        bail!("No certificates found in {}", cert_path.display());
    }

    let key_file = File::open(key_path).with_context(|| format!("Failed to open private key {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("Failed to parse private key {}", key_path.display()))?
        .ok_or_else(|| anyhow!("No private key found in {}", key_path.display()))?;

    let signing_key = ring::sign::any_supported_type(&key)?;
    Ok(CertifiedKey::new(certs, signing_key))
}
