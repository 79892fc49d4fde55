//! Serial TCP echo server.
//!
//! Accepts one connection at a time and echoes it until the peer closes.
//! While a session is running, further connection attempts wait in the
//! kernel backlog.

use crate::session::{Session, SessionState};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, TcpListener};
use tracing::{info, warn};

/// Pending-connection backlog passed to `listen(2)`.
pub const BACKLOG: i32 = 1;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Zero-length read: the peer shut down its write side.
    PeerClosed,
    /// A read or write failed.
    Failed(io::ErrorKind),
}

/// Outcome of one accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub peer: SocketAddr,
    pub bytes_echoed: u64,
    pub chunks_echoed: u64,
    pub end: SessionEnd,
}

/// Listening endpoint plus the accept loop.
pub struct EchoServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl EchoServer {
    /// Bind and listen on `addr` with a backlog of [`BACKLOG`].
    pub fn bind(addr: SocketAddrV4) -> Result<Self, ServerError> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(ServerError::Socket)?;
        socket
            .bind(&SocketAddr::V4(addr).into())
            .map_err(|e| ServerError::Bind(addr, e))?;
        socket.listen(BACKLOG).map_err(ServerError::Listen)?;

        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr().map_err(ServerError::Listen)?;

        info!(address = %local_addr, backlog = BACKLOG, "Starting up");

        Ok(EchoServer {
            listener,
            local_addr,
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one connection and echo it until it ends.
    ///
    /// Only a failed accept is returned as an error; session I/O errors are
    /// reported in the summary.
    pub fn serve_one(&self) -> io::Result<SessionSummary> {
        info!("Waiting for a connection...");
        let (stream, peer) = self.listener.accept()?;
        info!(peer = %peer, "Connection accepted");

        let mut session = Session::new(stream);
        let result = session.run();
        let summary = SessionSummary {
            peer,
            bytes_echoed: session.bytes_echoed(),
            chunks_echoed: session.chunks_echoed(),
            end: match &result {
                Ok(_) => SessionEnd::PeerClosed,
                Err(e) => SessionEnd::Failed(e.kind()),
            },
        };
        debug_assert_eq!(session.state(), SessionState::Closed);
        drop(session);

        match result {
            Ok(_) => info!(
                peer = %summary.peer,
                bytes = summary.bytes_echoed,
                chunks = summary.chunks_echoed,
                "No more data from peer"
            ),
            Err(e) => warn!(
                peer = %summary.peer,
                bytes = summary.bytes_echoed,
                chunks = summary.chunks_echoed,
                end = ?summary.end,
                error = %e,
                "Session ended with error"
            ),
        }

        Ok(summary)
    }

    /// Serve connections forever, one at a time.
    pub fn run(&self) -> ! {
        loop {
            if let Err(e) = self.serve_one() {
                warn!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// Listener setup errors. All of them are fatal.
#[derive(Debug)]
pub enum ServerError {
    Socket(io::Error),
    Bind(SocketAddrV4, io::Error),
    Listen(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Socket(e) => write!(f, "Failed to create socket: {}", e),
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            ServerError::Listen(e) => write!(f, "Failed to listen: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Socket(e) | ServerError::Bind(_, e) | ServerError::Listen(e) => Some(e),
        }
    }
}
