//! One TCP connection to one cluster member.
//!
//! Connect is bounded by a timeout and an external cancellation token;
//! both abort the in-progress attempt cleanly. Send and receive treat a
//! zero-byte completion on an open socket as a connectivity failure (the
//! peer half-closed), never as quiet success.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// An established connection, ready to be split for the node's two
/// loops.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    /// Connect to `addr`, bounded by `deadline` and `cancel`.
    ///
    /// Timing out or being cancelled drops the pending connect future,
    /// which aborts the underlying attempt before this returns.
    pub async fn connect(
        addr: SocketAddr,
        deadline: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        debug!(%addr, ?deadline, "connecting");

        let attempt = TcpStream::connect(addr);
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%addr, "connect cancelled");
                Err(Error::Cancelled)
            }
            result = timeout(deadline, attempt) => match result {
                Err(_) => {
                    debug!(%addr, "connect timed out");
                    Err(Error::Timeout)
                }
                Ok(Err(e)) => {
                    debug!(%addr, error = %e, "connect failed");
                    Err(Error::connectivity(e))
                }
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).map_err(Error::connectivity)?;
                    debug!(%addr, "connected");
                    Ok(Self { stream, peer: addr })
                }
            }
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Split into independently owned halves for the write and read
    /// loops. Reconnection builds a whole new `Connection` rather than
    /// mutating this one.
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        let (read, write) = self.stream.into_split();
        (
            ConnectionReader { half: read },
            ConnectionWriter { half: write },
        )
    }
}

/// Write half of a connection.
#[derive(Debug)]
pub struct ConnectionWriter {
    half: OwnedWriteHalf,
}

impl ConnectionWriter {
    /// Send as much of `buf` as the socket accepts right now.
    pub async fn send(&mut self, buf: &[u8]) -> Result<usize> {
        debug_assert!(!buf.is_empty());
        let n = self.half.write(buf).await.map_err(Error::connectivity)?;
        if n == 0 {
            return Err(Error::Connectivity("zero-byte send, peer closed".into()));
        }
        trace!(bytes = n, "sent");
        Ok(n)
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.half.flush().await.map_err(Error::connectivity)
    }
}

/// Read half of a connection.
#[derive(Debug)]
pub struct ConnectionReader {
    half: OwnedReadHalf,
}

impl ConnectionReader {
    /// Receive into `buf`, waiting indefinitely.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.half.read(buf).await.map_err(Error::connectivity)?;
        if n == 0 {
            return Err(Error::Connectivity("zero-byte read, peer closed".into()));
        }
        trace!(bytes = n, "received");
        Ok(n)
    }

    /// Receive with an idle deadline. Used while responses are owed.
    pub async fn receive_timeout(
        &mut self,
        buf: &mut [u8],
        deadline: std::time::Duration,
    ) -> Result<usize> {
        match timeout(deadline, self.receive(buf)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_and_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let cancel = CancellationToken::new();
        let conn = Connection::connect(addr, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(conn.peer(), addr);

        let (mut reader, mut writer) = conn.split();
        let mut sent = 0;
        while sent < 5 {
            sent += writer.send(&b"hello"[sent..]).await.unwrap();
        }

        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < 5 {
            got += reader.receive(&mut buf[got..]).await.unwrap();
        }
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // Non-routable address; the connect attempt hangs until the
        // timeout fires.
        let addr: SocketAddr = "10.255.255.1:11211".parse().unwrap();
        let cancel = CancellationToken::new();
        let err = Connection::connect(addr, Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout | Error::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let addr: SocketAddr = "10.255.255.1:11211".parse().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Connection::connect(addr, Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let err = Connection::connect(addr, Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_peer_close_is_connectivity_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let cancel = CancellationToken::new();
        let conn = Connection::connect(addr, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        let (mut reader, _writer) = conn.split();

        let mut buf = [0u8; 16];
        let err = reader.receive(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)));
    }

    #[tokio::test]
    async fn test_receive_idle_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            // Hold the socket open without writing.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let cancel = CancellationToken::new();
        let conn = Connection::connect(addr, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        let (mut reader, _writer) = conn.split();

        let mut buf = [0u8; 16];
        let err = reader
            .receive_timeout(&mut buf, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
