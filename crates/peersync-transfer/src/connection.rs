/// One TCP connection carrying both the handshake and the file stream.
///
/// The initiator dials with `connect`, retrying refused attempts until the
/// establishment window runs out. The responder binds a fresh listener per
/// attempt with `accept`, bounded by the same window.
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::error::{Result, TransferError};

/// Pause between refused connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(25);

const SOCKET_BUF_SIZE: usize = 256 * 1024;

pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let sock_ref = SockRef::from(&stream);
        sock_ref.set_nodelay(true)?;
        sock_ref.set_send_buffer_size(SOCKET_BUF_SIZE)?;
        sock_ref.set_recv_buffer_size(SOCKET_BUF_SIZE)?;

        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        Ok(Self { reader: BufReader::new(stream), writer, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Handle that can tear the socket down from another thread.
    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle(self.writer.try_clone()?))
    }

    /// Borrow both directions at once. The reader keeps whatever it has
    /// already buffered, so the file stream can follow the handshake.
    pub fn split(&mut self) -> (&mut BufReader<TcpStream>, &mut TcpStream) {
        (&mut self.reader, &mut self.writer)
    }

    pub fn into_parts(self) -> (BufReader<TcpStream>, TcpStream) {
        (self.reader, self.writer)
    }
}

/// Clone of the socket used only to force it closed.
pub struct ShutdownHandle(TcpStream);

impl ShutdownHandle {
    /// Unblocks every pending read and write on the connection.
    pub fn shutdown(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

/// Dial `addr`, repeating refused attempts until `timeout` elapses.
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Connection> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransferError::ConnectTimeout(addr.to_string()));
        }

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        match socket.connect_timeout(&addr.into(), remaining) {
            Ok(()) => return Ok(Connection::from_stream(socket.into())?),
            Err(e) if is_transient_connect_error(&e) => {
                tracing::trace!(%addr, error = %e, "connect attempt failed, retrying");
                std::thread::sleep(CONNECT_RETRY_DELAY.min(remaining));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Listen on `addr` and accept exactly one peer within `timeout`.
pub fn accept(addr: SocketAddr, timeout: Duration) -> Result<Connection> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;

    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;

    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(Connection::from_stream(stream)?);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(TransferError::ConnectTimeout(addr.to_string()));
                }
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn is_transient_connect_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
    )
}
