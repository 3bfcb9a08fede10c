use std::cell::Cell;
use std::io::{Error, ErrorKind, Result};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::task::{Context, Poll};
use tokio::io::Interest;
use tokio::net::{TcpStream, UnixStream};

use super::fdpass;

/// Non-blocking byte transport that may carry descriptors. `WouldBlock` means
/// wait for the next readiness notification.
pub trait Transport {
    fn recv(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>, max_fds: usize) -> Result<usize>;
    fn send(&self, buf: &[u8], fds: &[OwnedFd]) -> Result<usize>;
}

#[derive(Debug)]
pub enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Conn {
    pub fn carries_fds(&self) -> bool {
        matches!(self, Conn::Unix(_))
    }

    pub fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match self {
            Conn::Tcp(stream) => stream.poll_read_ready(cx),
            Conn::Unix(stream) => stream.poll_read_ready(cx),
        }
    }

    pub fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match self {
            Conn::Tcp(stream) => stream.poll_write_ready(cx),
            Conn::Unix(stream) => stream.poll_write_ready(cx),
        }
    }

    // SO_ERROR
    pub fn take_error(&self) -> Result<Option<Error>> {
        match self {
            Conn::Tcp(stream) => stream.take_error(),
            Conn::Unix(stream) => stream.take_error(),
        }
    }

    // Queued data stays in the socket; only the cached readiness goes.
    pub fn clear_read_ready(&self) {
        let would_block = || Err::<(), _>(Error::from(ErrorKind::WouldBlock));
        let _ = match self {
            Conn::Tcp(stream) => stream.try_io(Interest::READABLE, would_block),
            Conn::Unix(stream) => stream.try_io(Interest::READABLE, would_block),
        };
    }
}

/// Reads a `Conn` without consulting cached readiness, for sockets whose
/// readiness was cleared while data may still be queued. Remembers whether a
/// read came back empty-handed.
#[derive(Debug)]
pub struct Direct<'a> {
    conn: &'a Conn,
    drained: Cell<bool>,
}

impl<'a> Direct<'a> {
    pub fn new(conn: &'a Conn) -> Self {
        Direct {
            conn,
            drained: Cell::new(false),
        }
    }

    pub fn drained(&self) -> bool {
        self.drained.get()
    }
}

impl Transport for Direct<'_> {
    fn recv(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>, max_fds: usize) -> Result<usize> {
        let result = match self.conn {
            Conn::Tcp(stream) => fdpass::recv(stream.as_raw_fd(), buf),
            Conn::Unix(stream) => fdpass::recv_with_fds(stream.as_raw_fd(), buf, fds, max_fds),
        };
        if matches!(&result, Err(err) if err.kind() == ErrorKind::WouldBlock) {
            self.drained.set(true);
        }
        result
    }

    fn send(&self, buf: &[u8], fds: &[OwnedFd]) -> Result<usize> {
        self.conn.send(buf, fds)
    }
}

impl AsRawFd for Conn {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Conn::Tcp(stream) => stream.as_raw_fd(),
            Conn::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

impl From<TcpStream> for Conn {
    fn from(stream: TcpStream) -> Self {
        Conn::Tcp(stream)
    }
}

impl From<UnixStream> for Conn {
    fn from(stream: UnixStream) -> Self {
        Conn::Unix(stream)
    }
}

// `try_io` clears the cached readiness when the closure reports `WouldBlock`,
// so the next readiness poll waits for the kernel again.
impl Transport for Conn {
    fn recv(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>, max_fds: usize) -> Result<usize> {
        match self {
            Conn::Tcp(stream) => {
                stream.try_io(Interest::READABLE, || fdpass::recv(stream.as_raw_fd(), buf))
            }
            Conn::Unix(stream) => stream.try_io(Interest::READABLE, || {
                fdpass::recv_with_fds(stream.as_raw_fd(), buf, fds, max_fds)
            }),
        }
    }

    fn send(&self, buf: &[u8], fds: &[OwnedFd]) -> Result<usize> {
        match self {
            Conn::Tcp(_) if !fds.is_empty() => Err(Error::new(
                ErrorKind::Unsupported,
                "cannot pass file descriptors over a TCP connection",
            )),
            Conn::Tcp(stream) => {
                stream.try_io(Interest::WRITABLE, || fdpass::send(stream.as_raw_fd(), buf))
            }
            Conn::Unix(stream) => stream.try_io(Interest::WRITABLE, || {
                fdpass::send_with_fds(stream.as_raw_fd(), buf, fds)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    fn pipe_fd() -> OwnedFd {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(ret, 0, "pipe2 failed");
        unsafe {
            libc::close(fds[0]);
            OwnedFd::from_raw_fd(fds[1])
        }
    }

    #[tokio::test]
    async fn tcp_refuses_descriptors() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let conn = Conn::from(client.unwrap());

        assert!(!conn.carries_fds());
        let err = conn.send(b"x", &[pipe_fd()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn empty_socket_would_block() {
        let (a, _b) = UnixStream::pair().unwrap();
        let conn = Conn::from(a);
        let mut buf = [0u8; 8];
        let err = conn.recv(&mut buf, &mut Vec::new(), 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[tokio::test]
    async fn unix_round_trip_with_descriptor() {
        let (a, b) = UnixStream::pair().unwrap();
        let (a, b) = (Conn::from(a), Conn::from(b));
        assert!(a.carries_fds());

        std::future::poll_fn(|cx| a.poll_write_ready(cx)).await.unwrap();
        assert_eq!(a.send(b"abc", &[pipe_fd()]).unwrap(), 3);
        std::future::poll_fn(|cx| b.poll_read_ready(cx)).await.unwrap();

        let mut buf = [0u8; 8];
        let mut fds = Vec::new();
        let n = b.recv(&mut buf, &mut fds, 4).unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(fds.len(), 1);
    }

    #[tokio::test]
    async fn direct_reads_after_readiness_is_cleared() {
        let (a, b) = UnixStream::pair().unwrap();
        let (a, b) = (Conn::from(a), Conn::from(b));

        std::future::poll_fn(|cx| a.poll_write_ready(cx)).await.unwrap();
        a.send(b"queued", &[]).unwrap();
        std::future::poll_fn(|cx| b.poll_read_ready(cx)).await.unwrap();
        b.clear_read_ready();

        let mut buf = [0u8; 16];
        let err = b.recv(&mut buf, &mut Vec::new(), 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        let direct = Direct::new(&b);
        let n = direct.recv(&mut buf, &mut Vec::new(), 4).unwrap();
        assert_eq!(&buf[..n], b"queued");
        assert!(!direct.drained());
        direct.recv(&mut buf, &mut Vec::new(), 4).unwrap_err();
        assert!(direct.drained());
    }

    #[tokio::test]
    async fn reset_shows_up_as_socket_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let conn = Conn::from(server.unwrap().0);
        assert!(conn.take_error().unwrap().is_none());

        #[allow(deprecated)]
        client.set_linger(Some(std::time::Duration::ZERO)).unwrap();
        drop(client);

        std::future::poll_fn(|cx| conn.poll_read_ready(cx)).await.unwrap();
        let err = conn.take_error().unwrap().expect("reset pending");
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
    }
}
