//! Listener (server role).
//!
//! Binds and listens on the configured endpoint, accepts connections and
//! answers one message per connection with the configured reply policy.
//!
//! Lifecycle: `Unbound -> Bound -> Listening -> Closed`. Each accepted
//! connection runs its own `Open -> Exchanging -> Closed` lifecycle (see
//! [`crate::connection::ConnState`]). Any failed bind or listen releases
//! the socket and moves straight to `Closed`.

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{ExchangeError, Operation, Result};
use crate::framing::MAX_INTERRUPTED_RETRIES;
use crate::reply::Reply;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unbound,
    Bound,
    Listening,
    Closed,
}

impl ListenerState {
    fn describe(self) -> &'static str {
        match self {
            ListenerState::Unbound => "unbound",
            ListenerState::Bound => "bound",
            ListenerState::Listening => "listening",
            ListenerState::Closed => "closed",
        }
    }
}

/// One completed request/reply pair.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub peer: SocketAddr,
    pub request: Bytes,
    pub reply: Bytes,
}

/// Server side of the exchange.
pub struct Listener {
    config: Config,
    state: ListenerState,
    /// Bound socket, until the first accept registers it with the runtime.
    socket: Option<Socket>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl Listener {
    /// Create an unbound listener.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: ListenerState::Unbound,
            socket: None,
            listener: None,
            local_addr: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a listener and take it through bind and listen using the
    /// configured backlog.
    pub fn open(config: Config) -> Result<Self> {
        let backlog = config.listener.backlog;
        let mut listener = Self::new(config);
        listener.bind()?;
        listener.listen(backlog)?;
        Ok(listener)
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Address actually bound, once bound. Reports the real port when the
    /// configured port was 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Token that stops the listener from any task: pending accepts fail
    /// with `Cancelled`, and so does I/O on connections it handed out.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Reserve the configured local address.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        self.expect_state(Operation::Bind, ListenerState::Unbound)?;

        let addr = match resolve_bind_addr(&self.config.endpoint.host, self.config.endpoint.port) {
            Ok(addr) => addr,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };

        let bound = create_socket(addr).and_then(|socket| {
            let local = socket
                .local_addr()?
                .as_socket()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "bound to a non-IP address"))?;
            Ok((socket, local))
        });

        match bound {
            Ok((socket, local)) => {
                self.socket = Some(socket);
                self.local_addr = Some(local);
                self.state = ListenerState::Bound;
                info!(address = %local, "Listener bound");
                Ok(local)
            }
            Err(e) => {
                self.close();
                Err(ExchangeError::classify(Operation::Bind, addr, e))
            }
        }
    }

    /// Start accepting; `backlog` bounds queued-but-unaccepted connections.
    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        self.expect_state(Operation::Listen, ListenerState::Bound)?;

        let result = match (self.socket.as_ref(), self.local_addr) {
            (Some(socket), Some(addr)) => socket.listen(backlog).map(|()| addr).map_err(|e| (addr, e)),
            _ => {
                self.close();
                return Err(ExchangeError::InvalidState {
                    op: Operation::Listen,
                    state: "bound without a socket",
                });
            }
        };

        let addr = match result {
            Ok(addr) => addr,
            Err((addr, e)) => {
                self.close();
                return Err(ExchangeError::classify(Operation::Listen, addr, e));
            }
        };

        self.state = ListenerState::Listening;
        info!(address = %addr, backlog, "Listening");
        Ok(())
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&mut self) -> Result<(Connection, SocketAddr)> {
        self.expect_state(Operation::Accept, ListenerState::Listening)?;
        self.register()?;

        let (Some(listener), Some(addr)) = (self.listener.as_ref(), self.local_addr) else {
            return Err(ExchangeError::InvalidState {
                op: Operation::Accept,
                state: self.state.describe(),
            });
        };

        let mut attempts = 0;
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    return Err(ExchangeError::Cancelled { op: Operation::Accept });
                }
                result = listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    let conn = Connection::new(
                        stream,
                        peer,
                        &self.config.exchange,
                        self.shutdown.child_token(),
                    );
                    return Ok((conn, peer));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    attempts += 1;
                    if attempts > MAX_INTERRUPTED_RETRIES {
                        return Err(ExchangeError::Interrupted {
                            op: Operation::Accept,
                            attempts,
                        });
                    }
                    trace!(attempts, "Accept interrupted, retrying");
                }
                Err(e) => return Err(ExchangeError::classify(Operation::Accept, addr, e)),
            }
        }
    }

    /// Accept one connection and run one exchange on it.
    ///
    /// The listener stays listening afterwards.
    pub async fn serve_once(&mut self, reply: &Reply) -> Result<Exchange> {
        let (conn, _) = self.accept().await?;
        handle_connection(conn, reply).await
    }

    /// Accept connections until shut down, one task per connection.
    ///
    /// Returns `Ok` after the shutdown handle fires, or the first accept
    /// failure that is not specific to a single peer. The listener is
    /// closed either way.
    pub async fn serve(&mut self, reply: Reply) -> Result<()> {
        let reply = Arc::new(reply);
        let connection_limit = Arc::new(Semaphore::new(self.config.listener.max_connections));

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.accept().await {
                Ok((conn, peer)) => {
                    let reply = Arc::clone(&reply);

                    tokio::spawn(async move {
                        match handle_connection(conn, &reply).await {
                            Ok(exchange) => debug!(
                                peer = %peer,
                                request_bytes = exchange.request.len(),
                                reply_bytes = exchange.reply.len(),
                                "Exchange complete"
                            ),
                            Err(e) => debug!(peer = %peer, error = %e, "Connection error"),
                        }
                        drop(permit);
                    });
                }
                Err(ExchangeError::Cancelled { .. }) => break,
                Err(e) if is_peer_specific(&e) => {
                    warn!(error = %e, "Dropped connection before accept completed");
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    self.close();
                    return Err(e);
                }
            }
        }

        info!("Listener shutting down");
        self.close();
        Ok(())
    }

    /// Release the socket and cancel anything pending. Idempotent.
    pub fn close(&mut self) {
        self.shutdown.cancel();
        let socket = self.socket.take();
        let listener = self.listener.take();
        if socket.is_some() || listener.is_some() {
            debug!(address = ?self.local_addr, "Listener closed");
        }
        self.state = ListenerState::Closed;
    }

    fn expect_state(&self, op: Operation, expected: ListenerState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ExchangeError::InvalidState {
                op,
                state: self.state.describe(),
            })
        }
    }

    /// Hand the listening socket to the tokio reactor on first use.
    fn register(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let Some(socket) = self.socket.take() else {
            return Ok(());
        };

        let std_listener: std::net::TcpListener = socket.into();
        match TcpListener::from_std(std_listener) {
            Ok(listener) => {
                self.listener = Some(listener);
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(ExchangeError::Io {
                    op: Operation::Listen,
                    source: e,
                })
            }
        }
    }
}

/// Run one exchange on an accepted connection: receive, reply, close.
pub async fn handle_connection(mut conn: Connection, reply: &Reply) -> Result<Exchange> {
    let peer = conn.peer_addr();
    let request = conn.receive_frame().await?;
    let response = reply.respond(&request);
    conn.send_frame(&response).await?;
    conn.close();

    Ok(Exchange {
        peer,
        request,
        reply: response,
    })
}

/// Accept failures caused by one peer rather than the listener itself.
fn is_peer_specific(err: &ExchangeError) -> bool {
    match err {
        ExchangeError::Io { source, .. } => matches!(
            source.kind(),
            io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
        ),
        _ => false,
    }
}

fn resolve_bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ExchangeError::InvalidAddress(format!("{host}: {e}")))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| ExchangeError::InvalidAddress(format!("{host} has no IPv4 address")))
}

fn create_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket)
}
