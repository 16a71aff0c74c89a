//! TCP front proxy.
//!
//! Accepts player connections, runs each through the admission pipeline and
//! forwards admitted ones to the backend. Rejected connections are closed
//! without a byte reaching the backend.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bastion_admission::{Admission, AdmissionPipeline, ConnectionLease};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};

const PUMP_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by one forwarded session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Client to backend, excluding the buffered handshake.
    pub upstream: u64,
    /// Backend to client.
    pub downstream: u64,
}

/// The proxy server.
pub struct ShieldProxy {
    config: Arc<ProxyConfig>,
    pipeline: Arc<AdmissionPipeline>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl ShieldProxy {
    /// Create a proxy with a pipeline built from `config.shield`.
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        config.validate()?;
        let pipeline = AdmissionPipeline::new(config.shield.clone())?;
        Ok(Self::with_pipeline(config, Arc::new(pipeline)))
    }

    /// Create a proxy around an existing pipeline.
    #[must_use]
    pub fn with_pipeline(config: ProxyConfig, pipeline: Arc<AdmissionPipeline>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_connections));
        Self {
            config: Arc::new(config),
            pipeline,
            slots,
            shutdown: CancellationToken::new(),
        }
    }

    /// The admission pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &Arc<AdmissionPipeline> {
        &self.pipeline
    }

    /// The proxy configuration.
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Token that stops the proxy when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> ProxyResult<TcpListener> {
        let addr = self.config.listen;
        TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::BindFailed(addr, e))
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> ProxyResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> ProxyResult<()> {
        let local = listener.local_addr()?;
        info!(
            listen = %local,
            backend = %self.config.backend,
            detector = self.pipeline.detector_name(),
            "Proxy listening"
        );

        let tracker = TaskTracker::new();
        tracker.spawn(sweep_loop(
            Arc::clone(&self.pipeline),
            self.config.sweep_interval(),
            self.shutdown.clone(),
        ));

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping listener");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.dispatch(&tracker, stream, peer),
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }

        drop(listener);
        tracker.close();
        tracker.wait().await;

        info!(stats = ?self.pipeline.stats(), "Proxy stopped");
        Ok(())
    }

    fn dispatch(&self, tracker: &TaskTracker, stream: TcpStream, peer: SocketAddr) {
        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            warn!(
                peer = %peer,
                max = self.config.max_connections,
                "Connection limit reached, dropping connection"
            );
            return;
        };

        let pipeline = Arc::clone(&self.pipeline);
        let config = Arc::clone(&self.config);
        let cancel = self.shutdown.child_token();

        tracker.spawn(async move {
            handle_connection(pipeline, config, stream, peer, cancel).await;
            drop(permit);
        });
    }
}

impl std::fmt::Debug for ShieldProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShieldProxy")
            .field("listen", &self.config.listen)
            .field("backend", &self.config.backend)
            .field("available_slots", &self.slots.available_permits())
            .finish_non_exhaustive()
    }
}

async fn sweep_loop(pipeline: Arc<AdmissionPipeline>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                pipeline.sweep();
                debug!(stats = ?pipeline.stats(), "Pipeline stats");
            }
        }
    }
}

async fn handle_connection(
    pipeline: Arc<AdmissionPipeline>,
    config: Arc<ProxyConfig>,
    mut client: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    if let Err(e) = client.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let admitted = match pipeline.admit(peer.ip(), &mut client, &cancel).await {
        Admission::Admitted(conn) => conn,
        Admission::Rejected(rejection) => {
            debug!(peer = %peer, reason = %rejection.reason, "Closing rejected connection");
            return;
        }
        Admission::Cancelled => return,
    };

    let (lease, handshake, buffered) = admitted.into_parts();

    let mut backend = match connect_backend(&config).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %peer, connection = %lease.key(), error = %e, "Backend unavailable");
            return;
        }
    };

    if let Err(e) = backend.write_all(&buffered).await {
        warn!(peer = %peer, error = %e, "Failed to forward handshake");
        return;
    }

    debug!(
        connection = %lease.key(),
        host = handshake.host(),
        next_state = ?handshake.next_state,
        "Forwarding session"
    );

    match pump(&mut client, &mut backend, &lease, config.idle_timeout(), &cancel).await {
        Ok(stats) => info!(
            connection = %lease.key(),
            upstream = stats.upstream,
            downstream = stats.downstream,
            "Session closed"
        ),
        Err(e) => debug!(connection = %lease.key(), error = %e, "Session ended with error"),
    }
}

async fn connect_backend(config: &ProxyConfig) -> ProxyResult<TcpStream> {
    let connect = TcpStream::connect(config.backend.as_str());
    let stream = tokio::time::timeout(config.backend_connect_timeout(), connect)
        .await
        .map_err(|_| ProxyError::BackendConnect {
            backend: config.backend.clone(),
            reason: "timed out".to_string(),
        })?
        .map_err(|e| ProxyError::BackendConnect {
            backend: config.backend.clone(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Copy bytes both ways until both sides have closed, the session idles out,
/// or `cancel` fires. EOF from one side is passed on as a write shutdown to
/// the other, which may keep sending. Upstream bytes are credited to the lease.
async fn pump(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    lease: &ConnectionLease,
    idle: Duration,
    cancel: &CancellationToken,
) -> io::Result<SessionStats> {
    let (mut client_rx, mut client_tx) = client.split();
    let (mut backend_rx, mut backend_tx) = backend.split();
    let mut up = vec![0u8; PUMP_BUFFER_SIZE];
    let mut down = vec![0u8; PUMP_BUFFER_SIZE];
    let mut stats = SessionStats::default();
    let mut upstream_open = true;
    let mut downstream_open = true;

    let idle_timer = tokio::time::sleep(idle);
    tokio::pin!(idle_timer);

    while upstream_open || downstream_open {
        tokio::select! {
            () = cancel.cancelled() => break,

            () = &mut idle_timer => {
                debug!(connection = %lease.key(), "Session idle, closing");
                break;
            }

            read = client_rx.read(&mut up), if upstream_open => {
                let n = read?;
                if n == 0 {
                    upstream_open = false;
                    backend_tx.shutdown().await?;
                    continue;
                }
                backend_tx.write_all(&up[..n]).await?;
                lease.update(n as u64);
                stats.upstream += n as u64;
                idle_timer.as_mut().reset(Instant::now() + idle);
            }

            read = backend_rx.read(&mut down), if downstream_open => {
                let n = read?;
                if n == 0 {
                    downstream_open = false;
                    client_tx.shutdown().await?;
                    continue;
                }
                client_tx.write_all(&down[..n]).await?;
                stats.downstream += n as u64;
                idle_timer.as_mut().reset(Instant::now() + idle);
            }
        }
    }

    if upstream_open {
        let _ = backend_tx.shutdown().await;
    }
    if downstream_open {
        let _ = client_tx.shutdown().await;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config(backend: SocketAddr) -> ProxyConfig {
        ProxyConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            backend: backend.to_string(),
            backend_connect_timeout_ms: 500,
            ..ProxyConfig::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ProxyConfig {
            max_connections: 0,
            ..ProxyConfig::default()
        };
        assert!(matches!(ShieldProxy::new(config), Err(ProxyError::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_reports_address_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let proxy = ShieldProxy::new(ProxyConfig {
            listen: addr,
            ..ProxyConfig::default()
        })
        .unwrap();

        let err = proxy.bind().await.unwrap_err();
        assert!(matches!(err, ProxyError::BindFailed(a, _) if a == addr));
    }

    #[tokio::test]
    async fn test_connect_backend_refused() {
        // Bind then drop to get a port with nothing listening.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let err = connect_backend(&local_config(addr)).await.unwrap_err();
        assert!(matches!(err, ProxyError::BackendConnect { .. }));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let proxy = ShieldProxy::new(local_config("127.0.0.1:9".parse().unwrap())).unwrap();
        let listener = proxy.bind().await.unwrap();
        proxy.shutdown();

        tokio::time::timeout(Duration::from_secs(2), proxy.serve(listener))
            .await
            .expect("serve should return after shutdown")
            .unwrap();
    }
}
