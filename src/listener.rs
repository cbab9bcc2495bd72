/* Listening sockets for one port and the accept loops feeding the handshake.

    Binding first tries a single IPv6 socket that also accepts IPv4 clients.
    If that fails it binds an IPv6-only socket and an IPv4 socket separately,
    keeping whichever succeed. Every accepted connection runs as its own task
    on the current runtime; shutdown cancels them all and waits until their
    sockets are gone.
 */

use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ProxyConfig;
use crate::error::BindError;
use crate::handshake::handle_connection;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Counters shared by the accept loops and connection tasks of one listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    pub routed_ssh: AtomicU64,
    pub routed_alt: AtomicU64,
    pub upstream_failures: AtomicU64,
    pub bytes_to_upstream: AtomicU64,
    pub bytes_to_client: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub routed_ssh: u64,
    pub routed_alt: u64,
    pub upstream_failures: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            routed_ssh: self.routed_ssh.load(Ordering::Relaxed),
            routed_alt: self.routed_alt.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

pub struct Listener {
    config: Arc<ProxyConfig>,
    local_addrs: Vec<SocketAddr>,
    stats: Arc<ListenerStats>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Listener {
    /// Binds the configured port and starts accepting.
    ///
    /// Must be called from inside a tokio runtime; accept loops and
    /// connection tasks are spawned onto it. Fails without leaving any socket
    /// open if nothing could be bound.
    pub fn start(config: Arc<ProxyConfig>) -> Result<Self, BindError> {
        config.validate()?;
        let listeners = bind(&config)?;

        let stats = Arc::new(ListenerStats::default());
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let mut local_addrs = Vec::with_capacity(listeners.len());

        for (local_addr, listener) in listeners {
            info!("Listening on {}", local_addr);
            local_addrs.push(local_addr);
            tasks.spawn(accept_loop(
                listener,
                local_addr,
                Arc::clone(&config),
                Arc::clone(&stats),
                tasks.clone(),
                shutdown.clone(),
            ));
        }

        Ok(Self {
            config,
            local_addrs,
            stats,
            tasks,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Closes every bound socket and cancels every connection, returning once
    /// all of them are released. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Listener on port {} stopped", self.config.port);
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    stats: Arc<ListenerStats>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((client, peer)) => {
                info!("New connection from {} on {}", peer, local_addr);
                if let Err(e) = client.set_nodelay(true) {
                    debug!("Could not set nodelay for {}: {}", peer, e);
                }
                stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                stats.connections_active.fetch_add(1, Ordering::Relaxed);

                let config = Arc::clone(&config);
                let stats = Arc::clone(&stats);
                let shutdown = shutdown.clone();
                tasks.spawn(async move {
                    tokio::select! {
                        // Dropping the handshake future closes both sockets.
                        _ = shutdown.cancelled() => debug!("Connection from {} cancelled", peer),
                        result = handle_connection(client, peer.to_string(), &config, &stats) => {
                            if let Err(e) = result {
                                error!("Connection error for {}: {}", peer, e);
                            }
                        }
                    }
                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                });
            }
            Err(e) => {
                error!("Accept error on {}: {}", local_addr, e);
                // Avoid spinning on persistent errors such as fd exhaustion.
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!("Stopped accepting on {}", local_addr);
}

fn bind(config: &ProxyConfig) -> Result<Vec<(SocketAddr, TcpListener)>, BindError> {
    let mut causes = Vec::new();
    let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, config.port));
    let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));

    if config.dual_stack {
        match bind_socket(v6, false, config.backlog) {
            Ok(listener) => return Ok(vec![listener]),
            Err(e) => {
                warn!("Dual-stack bind on {} failed, binding separately: {}", v6, e);
                causes.push((v6, e));
            }
        }
    }

    let mut listeners = Vec::new();
    for addr in [v6, v4] {
        match bind_socket(addr, true, config.backlog) {
            Ok(listener) => listeners.push(listener),
            Err(e) => {
                debug!("Bind on {} failed: {}", addr, e);
                causes.push((addr, e));
            }
        }
    }

    if listeners.is_empty() {
        error!("Failed to bind port {}", config.port);
        return Err(BindError::Unavailable {
            port: config.port,
            causes,
        });
    }
    Ok(listeners)
}

// `only_v6` is ignored for IPv4 addresses.
fn bind_socket(
    addr: SocketAddr,
    only_v6: bool,
    backlog: u32,
) -> io::Result<(SocketAddr, TcpListener)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(only_v6)?;
    }
    // Lets a closed port be reopened straight away. On Windows it would allow
    // hijacking a port that is still in use, so it is left unset there.
    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;

    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    let listener = TcpListener::from_std(socket.into())?;
    Ok((listener.local_addr()?, listener))
}
