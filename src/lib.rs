//! wire-pair: a minimal point-to-point message exchange over TCP.
//!
//! A [`Connector`] opens a connection, sends one framed message and waits
//! for one framed reply. A [`Listener`] accepts connections and answers each
//! message according to a [`Reply`] policy. Frames are length-prefixed by
//! default (see [`framing`]), so a message survives being split across any
//! number of reads.

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod framing;
pub mod greeting;
pub mod listener;
pub mod provider;
pub mod reply;

pub use config::Config;
pub use connection::{ConnState, Connection};
pub use connector::{Connector, ConnectorState};
pub use error::{ExchangeError, Operation, Result};
pub use framing::Framing;
pub use listener::{Exchange, Listener, ListenerState};
pub use reply::Reply;
