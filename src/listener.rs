//! Accept loop with per-connection tasks and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{Config, ShadowConfig};
use crate::conn::Conn;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::handler::Handler;
use crate::shadow::ShadowSession;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

pub struct Listener<G> {
    listener: TcpListener,
    handler: Handler<G>,
    config: Config,
    shadow: Option<Arc<ShadowConfig>>,
    live: Arc<AtomicUsize>,
    next_conn_id: AtomicU64,
}

/// Decrements the live-connection count when a task ends, however it ends.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<G: Gateway> Listener<G> {
    pub async fn bind(config: Config, gateway: Arc<G>) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let shadow = config
            .mode
            .uses_shadow()
            .then(|| Arc::new(config.shadow.clone()));
        tracing::info!(
            listen_addr = %listener.local_addr()?,
            mode = %config.mode,
            "listening"
        );
        Ok(Self {
            listener,
            handler: Handler::new(gateway),
            config,
            shadow,
            live: Arc::new(AtomicUsize::new(0)),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared count of connection tasks still running.
    pub fn live_connections(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live)
    }

    /// Accepts until shutdown is signalled, then waits for every connection task.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut tasks = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => self.spawn_conn(&mut tasks, stream, peer, shutdown.clone()),
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed; backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                },
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = done
                        && e.is_panic()
                    {
                        tracing::error!(error = %e, "connection task panicked");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        // stop accepting before draining
        let Listener {
            listener, config, live, ..
        } = self;
        drop(listener);
        tracing::info!(live = live.load(Ordering::SeqCst), "shutting down; draining connections");

        match config.shutdown_timeout_secs {
            Some(secs) => {
                let drained = tokio::time::timeout(Duration::from_secs(secs), drain(&mut tasks)).await;
                if drained.is_err() {
                    tracing::warn!(
                        remaining = tasks.len(),
                        "shutdown timeout elapsed; aborting connections"
                    );
                    tasks.shutdown().await;
                }
            }
            None => drain(&mut tasks).await,
        }
        tracing::info!("listener stopped");
        Ok(())
    }

    fn spawn_conn(
        &self,
        tasks: &mut JoinSet<()>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(conn = id, error = %e, "set_nodelay failed");
        }
        let shadow = self.shadow.clone().map(ShadowSession::new);
        let conn = Conn::new(id, peer, stream, self.handler.clone(), self.config.mode, shadow);
        let guard = LiveGuard::new(&self.live);
        tasks.spawn(async move {
            let _guard = guard;
            // errors are logged by the connection itself
            let _ = conn.run(shutdown).await;
        });
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done
            && e.is_panic()
        {
            tracing::error!(error = %e, "connection task panicked");
        }
    }
}

/// Binds, spawns the accept loop and returns its address with the shutdown trigger.
pub async fn spawn_with_shutdown<G: Gateway>(
    config: Config,
    gateway: Arc<G>,
) -> Result<(
    SocketAddr,
    Arc<AtomicUsize>,
    watch::Sender<bool>,
    JoinHandle<Result<()>>,
)> {
    let listener = Listener::bind(config, gateway).await?;
    let addr = listener.local_addr()?;
    let live = listener.live_connections();
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(listener.run(rx));
    Ok((addr, live, tx, handle))
}
