// src/tunnel.rs
/* Forwards data bidirectionally between a client and the upstream it was routed to. */

use log::debug;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes moved in each direction by one pump.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub to_upstream: u64,
    pub to_client: u64,
}

/// Relays until both directions have stopped, then drops (closes) both streams.
///
/// `replay` holds payload already taken off the client while sniffing; it goes
/// upstream ahead of anything else. A direction stops on EOF or error and
/// half-closes its destination; the other direction keeps draining.
pub async fn pump<C, U>(client: C, upstream: U, replay: &[u8], buffer_size: usize) -> Transfer
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_reader, mut client_writer) = io::split(client);
    let (mut upstream_reader, mut upstream_writer) = io::split(upstream);

    let client_to_upstream = async {
        let mut sent = 0;
        let result = match upstream_writer.write_all(replay).await {
            Ok(()) => {
                sent += replay.len() as u64;
                relay(&mut client_reader, &mut upstream_writer, buffer_size, &mut sent).await
            }
            Err(e) => Err(e),
        };
        debug!("Client to upstream done after {} bytes: {:?}", sent, result);
        let _ = upstream_writer.shutdown().await;
        sent
    };

    let upstream_to_client = async {
        let mut sent = 0;
        let result = relay(&mut upstream_reader, &mut client_writer, buffer_size, &mut sent).await;
        debug!("Upstream to client done after {} bytes: {:?}", sent, result);
        let _ = client_writer.shutdown().await;
        sent
    };

    // Neither direction can cut the other short.
    let (to_upstream, to_client) = tokio::join!(client_to_upstream, upstream_to_client);
    Transfer {
        to_upstream,
        to_client,
    }
}

// One chunk in flight at a time; write_all retries short writes.
async fn relay<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    sent: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *sent += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn replays_sniffed_bytes_before_client_data() {
        let (client, mut client_peer) = duplex(64);
        let (upstream, mut upstream_peer) = duplex(64);

        let pump = tokio::spawn(async move { pump(client, upstream, b"SSH-2.0-", 16).await });

        client_peer.write_all(b"OpenSSH_9.6\r\n").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        upstream_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"SSH-2.0-OpenSSH_9.6\r\n");

        upstream_peer.write_all(b"banner").await.unwrap();
        upstream_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        client_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"banner");

        let transfer = pump.await.unwrap();
        assert_eq!(transfer.to_upstream, 21);
        assert_eq!(transfer.to_client, 6);
    }

    #[tokio::test]
    async fn one_direction_ending_does_not_stop_the_other() {
        let (client, mut client_peer) = duplex(64);
        let (upstream, mut upstream_peer) = duplex(64);

        let pump = tokio::spawn(async move { pump(client, upstream, &[], 4).await });

        // Client is done sending, but still expects a response.
        client_peer.shutdown().await.unwrap();
        let mut eof = Vec::new();
        upstream_peer.read_to_end(&mut eof).await.unwrap();
        assert!(eof.is_empty());

        upstream_peer.write_all(b"late response").await.unwrap();
        drop(upstream_peer);

        let mut received = Vec::new();
        client_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"late response");
        assert_eq!(pump.await.unwrap().to_client, 13);
    }
}
