//! Connector (client role).
//!
//! Opens one outbound connection, sends one message, waits for one reply
//! and closes. A connector is single-use: once `Closed` it stays closed.
//!
//! Lifecycle: `Idle -> Connecting -> Connected -> Sent -> AwaitingReply ->
//! Done -> Closed`, with any failure going straight to `Closed`.

use crate::config::{Config, EndpointConfig, ExchangeConfig};
use crate::connection::{guarded, Connection};
use crate::error::{ExchangeError, Operation, Result};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connector lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Connected,
    Sent,
    AwaitingReply,
    Done,
    Closed,
}

impl ConnectorState {
    fn describe(self) -> &'static str {
        match self {
            ConnectorState::Idle => "idle",
            ConnectorState::Connecting => "connecting",
            ConnectorState::Connected => "connected",
            ConnectorState::Sent => "sent",
            ConnectorState::AwaitingReply => "awaiting reply",
            ConnectorState::Done => "done",
            ConnectorState::Closed => "closed",
        }
    }
}

/// Client side of the exchange.
#[derive(Debug)]
pub struct Connector {
    endpoint: EndpointConfig,
    exchange: ExchangeConfig,
    state: ConnectorState,
    conn: Option<Connection>,
    cancel: CancellationToken,
}

impl Connector {
    pub fn new(endpoint: EndpointConfig, exchange: ExchangeConfig) -> Self {
        Self {
            endpoint,
            exchange,
            state: ConnectorState::Idle,
            conn: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.endpoint.clone(), config.exchange.clone())
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    /// Token that aborts a pending connect, send or receive from any task.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Open the connection, waiting at most the configured connect timeout.
    ///
    /// The deadline covers name resolution too; running out of time in
    /// either step is `ConnectTimeout`.
    pub async fn connect(&mut self) -> Result<SocketAddr> {
        self.expect_state(Operation::Connect, ConnectorState::Idle)?;
        self.state = ConnectorState::Connecting;

        let timeout = self.endpoint.connect_timeout();
        let deadline = Instant::now() + timeout;
        let host = self.endpoint.host.as_str();
        let port = self.endpoint.port;

        let result = guarded(Operation::Connect, None, &self.cancel, async {
            let addr = match tokio::time::timeout_at(deadline, resolve_connect_addr(host, port)).await {
                Ok(resolved) => resolved?,
                Err(_) => {
                    return Err(ExchangeError::ConnectTimeout {
                        target: format!("{host}:{port}"),
                        timeout,
                    })
                }
            };

            debug!(address = %addr, ?timeout, "Connecting");
            match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => Ok((stream, addr)),
                Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Err(ExchangeError::ConnectTimeout {
                    target: addr.to_string(),
                    timeout,
                }),
                Ok(Err(e)) => Err(ExchangeError::classify(Operation::Connect, addr, e)),
                Err(_) => Err(ExchangeError::ConnectTimeout {
                    target: addr.to_string(),
                    timeout,
                }),
            }
        })
        .await;

        match result {
            Ok((stream, addr)) => {
                let conn = Connection::new(stream, addr, &self.exchange, self.cancel.child_token());
                self.conn = Some(conn);
                self.state = ConnectorState::Connected;
                info!(address = %addr, "Connected");
                Ok(addr)
            }
            Err(e) => {
                debug!(host = %self.endpoint.host, port = self.endpoint.port, error = %e, "Connect failed");
                self.close();
                Err(e)
            }
        }
    }

    /// Send the request frame.
    pub async fn send(&mut self, message: &[u8]) -> Result<()> {
        self.expect_state(Operation::Write, ConnectorState::Connected)?;
        let Some(conn) = self.conn.as_mut() else {
            return Err(ExchangeError::InvalidState {
                op: Operation::Write,
                state: self.state.describe(),
            });
        };

        let result = conn.send_frame(message).await;
        match result {
            Ok(()) => {
                self.state = ConnectorState::Sent;
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Wait for the reply frame.
    pub async fn receive(&mut self) -> Result<Bytes> {
        self.expect_state(Operation::Read, ConnectorState::Sent)?;
        let Some(conn) = self.conn.as_mut() else {
            return Err(ExchangeError::InvalidState {
                op: Operation::Read,
                state: self.state.describe(),
            });
        };
        self.state = ConnectorState::AwaitingReply;

        let result = conn.receive_frame().await;
        match result {
            Ok(reply) => {
                self.state = ConnectorState::Done;
                Ok(reply)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Connect if needed, send `message`, return the reply and close.
    pub async fn exchange(&mut self, message: &[u8]) -> Result<Bytes> {
        if self.state == ConnectorState::Idle {
            self.connect().await?;
        }
        self.send(message).await?;
        let reply = self.receive().await?;
        self.close();
        Ok(reply)
    }

    /// Release the connection. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.state = ConnectorState::Closed;
    }

    fn expect_state(&self, op: Operation, expected: ConnectorState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ExchangeError::InvalidState {
                op,
                state: self.state.describe(),
            })
        }
    }
}

async fn resolve_connect_addr(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ExchangeError::InvalidAddress(format!("{host}: {e}")))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| ExchangeError::InvalidAddress(format!("{host} has no IPv4 address")))
}
