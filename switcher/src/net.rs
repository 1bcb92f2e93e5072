//! Socket plumbing for sessions.
//!
//! [`Conn`] performs all I/O through `&self` (readiness probe + `try_read` /
//! `try_write`) so the driver task, the relay tasks of the current epoch and
//! a stale task from a previous epoch can all hold references to the same
//! socket. A duplicated blocking handle provides `shutdown` through a shared
//! reference: shutting the socket down wakes every task blocked on it, which
//! is the termination signal the whole engine is built on.

use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{Result, SwitcherError};

/// Buffer size for the line readers and the relay copy loops. Kept small so
/// the amount of buffered data to drain on a currency switch or an upgrade
/// stays low.
pub const READER_BUF_SIZE: usize = 128;

#[derive(Debug)]
pub struct Conn {
    stream: TcpStream,
    /// Duplicate of the same socket, kept only for `shutdown`.
    ctrl: std::net::TcpStream,
}

impl Conn {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let std_stream = stream.into_std()?;
        let ctrl = std_stream.try_clone()?;
        std_stream.set_nonblocking(true)?;
        Ok(Self {
            stream: TcpStream::from_std(std_stream)?,
            ctrl,
        })
    }

    /// Rebuilds a connection from a file descriptor inherited across an
    /// upgrade exec. The caller owns the descriptor from here on.
    ///
    /// # Safety
    /// `fd` must be an open TCP socket descriptor not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> std::io::Result<Self> {
        let std_stream = std::net::TcpStream::from_raw_fd(fd);
        std_stream.set_nonblocking(true)?;
        let ctrl = std_stream.try_clone()?;
        Ok(Self {
            stream: TcpStream::from_std(std_stream)?,
            ctrl,
        })
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Reads at least one byte. `Ok(0)` means the peer closed the stream.
    pub async fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write_all(&self, mut data: &[u8]) -> std::io::Result<()> {
        while !data.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(data) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "wrote zero bytes",
                    ))
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Tears the socket down for every holder. Blocked reads return EOF,
    /// blocked writes fail; the descriptor itself closes when the last
    /// reference drops.
    pub fn shutdown(&self) {
        let _ = self.ctrl.shutdown(Shutdown::Both);
    }
}

/// A small buffered line reader in front of a [`Conn`].
///
/// The buffer deliberately mirrors the relay copy size: whatever frames the
/// handshake left behind are handed over verbatim when the session enters
/// pure-proxy mode.
#[derive(Debug)]
pub struct LineReader {
    conn: Arc<Conn>,
    buf: Vec<u8>,
}

impl LineReader {
    pub fn new(conn: Arc<Conn>) -> Self {
        Self {
            conn,
            buf: Vec::with_capacity(READER_BUF_SIZE),
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READER_BUF_SIZE];
        let n = self.conn.read_some(&mut chunk).await?;
        if n == 0 {
            return Err(SwitcherError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Peeks the first byte without consuming it, bounded by `timeout`.
    pub async fn peek_byte(&mut self, timeout: Duration) -> Result<u8> {
        let deadline = tokio::time::timeout(timeout, async {
            while self.buf.is_empty() {
                self.fill().await?;
            }
            Ok::<u8, SwitcherError>(self.buf[0])
        });
        match deadline.await {
            Ok(result) => result,
            Err(_) => Err(SwitcherError::ReadTimeout),
        }
    }

    /// Reads one newline-terminated frame, delimiter included.
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let rest = self.buf.split_off(pos + 1);
                let line = std::mem::replace(&mut self.buf, rest);
                return Ok(line);
            }
            self.fill().await?;
        }
    }

    /// Hands over whatever is buffered but not yet consumed. Used when the
    /// session switches from framed handshake I/O to the raw byte relay.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Conn::new(server).unwrap(), client)
    }

    #[tokio::test]
    async fn reads_lines_and_keeps_the_remainder() {
        let (conn, mut peer) = pair().await;
        peer.write_all(b"{\"id\":1}\n{\"id\":2}\npartial").await.unwrap();
        peer.flush().await.unwrap();

        let mut reader = LineReader::new(Arc::new(conn));
        assert_eq!(reader.read_line().await.unwrap(), b"{\"id\":1}\n");
        assert_eq!(reader.read_line().await.unwrap(), b"{\"id\":2}\n");
        // Wait until the trailing bytes are buffered, then drain them.
        assert_eq!(reader.peek_byte(Duration::from_secs(1)).await.unwrap(), b'p');
        assert_eq!(reader.take_buffered(), b"partial");
    }

    #[tokio::test]
    async fn peek_times_out_on_silence() {
        let (conn, _peer) = pair().await;
        let mut reader = LineReader::new(Arc::new(conn));
        let result = reader.peek_byte(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(SwitcherError::ReadTimeout)));
    }

    #[tokio::test]
    async fn shutdown_wakes_a_blocked_reader() {
        let (conn, _peer) = pair().await;
        let conn = Arc::new(conn);
        let reader_conn = Arc::clone(&conn);
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader_conn.read_some(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.shutdown();
        let read = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reader did not wake")
            .unwrap();
        assert_eq!(read.unwrap(), 0);
    }
}
