//! An owned connection between two peers.
//!
//! Whoever accepted or connected the stream owns it and is the only party
//! allowed to read, write or close it. Other tasks can still interrupt a
//! pending read or write through the close handle.

use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Operation, Result};
use crate::framing::{read_frame, write_frame, Framing};
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Established, nothing exchanged yet.
    Open,
    /// At least one frame sent or received.
    Exchanging,
    /// Released. Terminal.
    Closed,
}

impl ConnState {
    fn describe(self) -> &'static str {
        match self {
            ConnState::Open => "open",
            ConnState::Exchanging => "exchanging",
            ConnState::Closed => "closed",
        }
    }
}

/// A framed TCP connection.
#[derive(Debug)]
pub struct Connection {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    state: ConnState,
    framing: Framing,
    max_frame_size: usize,
    io_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Connection {
    /// Wrap an established stream.
    ///
    /// `cancel` unblocks pending I/O when triggered; pass a child of the
    /// owner's shutdown token so that shutting the owner down reaches every
    /// connection it handed out.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        settings: &ExchangeConfig,
        cancel: CancellationToken,
    ) -> Self {
        // Header and payload go out as separate writes
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        Self {
            stream: Some(stream),
            peer,
            state: ConnState::Open,
            framing: settings.framing,
            max_frame_size: settings.max_frame_size,
            io_timeout: settings.io_timeout(),
            cancel,
        }
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Token that, when cancelled from any task, makes pending I/O on this
    /// connection fail with `Cancelled`.
    pub fn close_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send one message as a single frame.
    ///
    /// Any failure releases the connection.
    pub async fn send_frame(&mut self, message: &[u8]) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ExchangeError::InvalidState {
                op: Operation::Write,
                state: self.state.describe(),
            });
        };
        self.state = ConnState::Exchanging;

        let result = guarded(
            Operation::Write,
            self.io_timeout,
            &self.cancel,
            write_frame(stream, self.framing, self.max_frame_size, message),
        )
        .await;

        match result {
            Ok(()) => {
                trace!(peer = %self.peer, bytes = message.len(), "Sent frame");
                Ok(())
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Send failed, closing connection");
                self.close();
                Err(e)
            }
        }
    }

    /// Receive one complete frame.
    ///
    /// The I/O timeout covers the whole frame, not each read. Any failure
    /// releases the connection.
    pub async fn receive_frame(&mut self) -> Result<Bytes> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ExchangeError::InvalidState {
                op: Operation::Read,
                state: self.state.describe(),
            });
        };
        self.state = ConnState::Exchanging;

        let result = guarded(
            Operation::Read,
            self.io_timeout,
            &self.cancel,
            read_frame(stream, self.framing, self.max_frame_size),
        )
        .await;

        match result {
            Ok(message) => {
                trace!(peer = %self.peer, bytes = message.len(), "Received frame");
                Ok(message)
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Receive failed, closing connection");
                self.close();
                Err(e)
            }
        }
    }

    /// Release the connection. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            self.cancel.cancel();
            debug!(peer = %self.peer, "Connection closed");
        }
        self.state = ConnState::Closed;
    }
}

/// Run `fut` under an optional deadline, abandoning it if `cancel` fires.
pub(crate) async fn guarded<F, T>(
    op: Operation,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let bounded = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(ExchangeError::TimedOut { op, timeout: limit }),
            },
            None => fut.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExchangeError::Cancelled { op }),
        result = bounded => result,
    }
}
