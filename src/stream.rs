/* Connected bidirectional streams the tunnel can work with.

    On top of tokio's read/write/shutdown, a stream offers one bounded
    look-ahead used to pick an upstream. Transports with a real peek keep the
    bytes in place; everything else reads them out and the caller replays them.
 */

use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// How the bytes returned by [`ByteStream::look_ahead`] relate to the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookAhead {
    /// Bytes are still queued on the stream and will be read again.
    Peeked(usize),
    /// Bytes were removed from the stream and must be replayed upstream.
    Consumed(usize),
}

impl LookAhead {
    pub fn len(&self) -> usize {
        match *self {
            LookAhead::Peeked(n) | LookAhead::Consumed(n) => n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes that have to be sent upstream before relaying starts.
    pub fn replay_len(&self) -> usize {
        match *self {
            LookAhead::Peeked(_) => 0,
            LookAhead::Consumed(n) => n,
        }
    }
}

pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Waits for the next payload bytes and copies up to `buf.len()` of them.
    ///
    /// The default is a plain read, reported as [`LookAhead::Consumed`].
    fn look_ahead<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<LookAhead>> + Send + 'a {
        async move { self.read(buf).await.map(LookAhead::Consumed) }
    }
}

impl ByteStream for TcpStream {
    fn look_ahead<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<LookAhead>> + Send + 'a {
        async move { self.peek(buf).await.map(LookAhead::Peeked) }
    }
}

impl ByteStream for DuplexStream {}
