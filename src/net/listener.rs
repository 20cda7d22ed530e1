//! Listening socket creation.
//!
//! # Responsibilities
//! - Bind TCP and Unix-domain listening sockets with the fleet's options
//! - Retry transient bind failures with bounded backoff
//! - Convert registry-owned sockets into per-worker listeners
//!
//! # Design Decisions
//! - Every socket is nonblocking and bound with SO_REUSEADDR and
//!   SO_REUSEPORT, so a replacement bind can coexist with a draining one
//! - Stale Unix socket files are removed before binding

use std::io;
use std::net::SocketAddr;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config::ListenerConfig;
use crate::handlers::ListenAddress;
use crate::resilience::{retry_with_backoff, RetryPolicy};

/// A listener ready to be registered with a tokio runtime.
#[derive(Debug)]
pub enum StdListener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

impl StdListener {
    /// Wrap a duplicated socket according to the address family it serves.
    pub fn from_socket(address: &ListenAddress, socket: Socket) -> Self {
        match address {
            ListenAddress::Tcp(_) => StdListener::Tcp(socket.into()),
            ListenAddress::Unix(_) => StdListener::Unix(socket.into()),
        }
    }
}

/// Bind and listen once.
pub fn open_listener(address: &ListenAddress, backlog: i32) -> io::Result<Socket> {
    let socket = match address {
        ListenAddress::Tcp(addr) => {
            let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
            socket.set_reuse_address(true)?;
            socket.set_reuse_port(true)?;
            if addr.is_ipv6() {
                socket.set_only_v6(true)?;
            }
            socket.bind(&SockAddr::from(*addr))?;
            socket
        }
        ListenAddress::Unix(path) => {
            remove_stale_socket(path)?;
            let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
            socket.bind(&SockAddr::unix(path)?)?;
            socket
        }
    };
    socket.set_nonblocking(true)?;
    socket.listen(backlog)?;
    Ok(socket)
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Errors that may clear up on their own.
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::AddrInUse
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

pub fn retry_policy(config: &ListenerConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.bind_attempts,
        base_delay_ms: config.bind_base_delay_ms,
        max_delay_ms: config.bind_max_delay_ms,
    }
}

/// Bind with retries per the listener configuration.
pub async fn bind_with_retry(address: &ListenAddress, config: &ListenerConfig) -> io::Result<Socket> {
    let socket = retry_with_backoff(
        &retry_policy(config),
        || open_listener(address, config.backlog),
        is_transient,
    )
    .await?;

    tracing::info!(address = %address, backlog = config.backlog, "Listener bound");
    Ok(socket)
}

/// The concrete TCP address a socket is bound to, if it is a TCP socket.
pub fn tcp_local_addr(socket: &Socket) -> Option<SocketAddr> {
    socket.local_addr().ok().and_then(|addr| addr.as_socket())
}
