/* Per-connection state machine: fake upgrade responses, payload sniffing,
    routing and the hand-off to the tunnel pump.

    Wire behavior, in order:
    1. `HTTP/1.1 101 <status>\r\n\r\n` is written straight away.
    2. Up to `preconsume` bytes are read and thrown away (usually the request).
    3. `HTTP/1.1 200 <status>\r\n\r\n` is written.
    4. Up to `buffer_size` bytes are sniffed within `sniff_timeout`.
    5. Empty sniff or anything containing `SSH` goes to the SSH upstream,
       everything else to the alternate one.
    6. Sniffed bytes reach the upstream first, then bytes flow both ways.
 */

use log::{debug, info, warn};
use std::io;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::config::ProxyConfig;
use crate::error::ConnectionError;
use crate::listener::ListenerStats;
use crate::stream::{ByteStream, LookAhead};
use crate::tunnel::{self, Transfer};
use crate::upstream::Upstream;

const SSH_MARKER: &[u8] = b"SSH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Accepted,
    Sent101,
    Preconsumed,
    Sent200,
    Sniffed,
    Routed,
    UpstreamConnected,
    Tunneling,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Ssh,
    Alternate,
}

impl Route {
    pub fn upstream<'a>(&self, config: &'a ProxyConfig) -> &'a Upstream {
        match self {
            Route::Ssh => &config.ssh_upstream,
            Route::Alternate => &config.alt_upstream,
        }
    }
}

/// Result of the bounded look-ahead.
#[derive(Debug)]
pub enum Sniff {
    Data(LookAhead),
    TimedOut,
    Failed(io::Error),
}

/// Routing heuristic: silence or an `SSH` marker anywhere means SSH.
pub fn select_route(sniffed: &[u8]) -> Route {
    if sniffed.is_empty() || sniffed.windows(SSH_MARKER.len()).any(|w| w == SSH_MARKER) {
        Route::Ssh
    } else {
        Route::Alternate
    }
}

pub fn response_line(code: u16, status: &str) -> Vec<u8> {
    format!("HTTP/1.1 {code} {status}\r\n\r\n").into_bytes()
}

/// One accepted client, exclusively owned by its task.
pub struct Connection<S> {
    client: S,
    peer: String,
    state: ConnectionState,
    sniffed: Vec<u8>,
    // Prefix of `sniffed` that was taken off the client and must be replayed.
    replay_len: usize,
    trail: Vec<ConnectionState>,
}

impl<S: ByteStream> Connection<S> {
    pub fn new(client: S, peer: impl Into<String>) -> Self {
        Self {
            client,
            peer: peer.into(),
            state: ConnectionState::Accepted,
            sniffed: Vec::new(),
            replay_len: 0,
            trail: vec![ConnectionState::Accepted],
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        debug!("{}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
        self.trail.push(next);
    }

    /// Drives the connection to `Closed`. Errors end this connection only.
    pub async fn run(
        mut self,
        config: &ProxyConfig,
        stats: &ListenerStats,
    ) -> Result<Transfer, ConnectionError> {
        let result = self.drive(config, stats).await;
        if let Err(e) = &result {
            if matches!(e, ConnectionError::UpstreamConnect { .. }) {
                stats.upstream_failures.fetch_add(1, Ordering::Relaxed);
            }
            // Best effort; the socket closes on drop regardless.
            let _ = self.client.shutdown().await;
        }
        self.advance(ConnectionState::Closed);
        debug!("{}: closed after {:?}", self.peer, self.trail);
        result
    }

    async fn drive(
        &mut self,
        config: &ProxyConfig,
        stats: &ListenerStats,
    ) -> Result<Transfer, ConnectionError> {
        self.client
            .write_all(&response_line(101, &config.status))
            .await
            .map_err(ConnectionError::HandshakeWrite)?;
        self.advance(ConnectionState::Sent101);

        self.preconsume(config.preconsume).await;
        self.advance(ConnectionState::Preconsumed);

        self.client
            .write_all(&response_line(200, &config.status))
            .await
            .map_err(ConnectionError::HandshakeWrite)?;
        self.advance(ConnectionState::Sent200);

        let sniff = self.sniff(config).await;
        self.advance(ConnectionState::Sniffed);

        let route = match sniff {
            Sniff::Data(_) => select_route(&self.sniffed),
            Sniff::TimedOut | Sniff::Failed(_) => Route::Ssh,
        };
        match route {
            Route::Ssh => stats.routed_ssh.fetch_add(1, Ordering::Relaxed),
            Route::Alternate => stats.routed_alt.fetch_add(1, Ordering::Relaxed),
        };
        let upstream = route.upstream(config);
        info!("{}: routing to {:?} upstream {}", self.peer, route, upstream);
        self.advance(ConnectionState::Routed);

        // No retry and no fallback to the other upstream.
        let upstream_stream = upstream.connect().await.inspect_err(|e| {
            warn!("{}: {}", self.peer, e);
        })?;
        self.advance(ConnectionState::UpstreamConnected);

        self.advance(ConnectionState::Tunneling);
        let replay = std::mem::take(&mut self.sniffed);
        let transfer = tunnel::pump(
            &mut self.client,
            upstream_stream,
            &replay[..self.replay_len],
            config.buffer_size,
        )
        .await;
        stats
            .bytes_to_upstream
            .fetch_add(transfer.to_upstream, Ordering::Relaxed);
        stats
            .bytes_to_client
            .fetch_add(transfer.to_client, Ordering::Relaxed);
        Ok(transfer)
    }

    // A failed or short read just means there was less to discard.
    async fn preconsume(&mut self, len: usize) {
        if len == 0 {
            return;
        }
        let mut buf = vec![0u8; len];
        match self.client.read(&mut buf).await {
            Ok(n) => debug!("{}: discarded {} bytes", self.peer, n),
            Err(e) => debug!("{}: nothing to discard: {}", self.peer, e),
        }
    }

    async fn sniff(&mut self, config: &ProxyConfig) -> Sniff {
        let mut buf = vec![0u8; config.buffer_size];
        let sniff = match timeout(config.sniff_timeout, self.client.look_ahead(&mut buf)).await {
            Ok(Ok(look_ahead)) => Sniff::Data(look_ahead),
            Ok(Err(e)) => Sniff::Failed(e),
            Err(_) => Sniff::TimedOut,
        };
        if let Sniff::Data(look_ahead) = &sniff {
            buf.truncate(look_ahead.len());
            self.sniffed = buf;
            self.replay_len = look_ahead.replay_len();
        }
        debug!("{}: sniffed {} bytes ({:?})", self.peer, self.sniffed.len(), sniff);
        sniff
    }
}

/// Handles one accepted client from handshake to close.
pub async fn handle_connection<S: ByteStream>(
    client: S,
    peer: impl Into<String>,
    config: &ProxyConfig,
    stats: &ListenerStats,
) -> Result<Transfer, ConnectionError> {
    Connection::new(client, peer).run(config, stats).await
}
