// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

#![warn(missing_docs)]
#![deny(trivial_casts,
        unstable_features,
        unused_import_braces)]

//! The connection layer of an SSH tunnel, based on tokio.
//!
//! This crate does not do key exchange nor authentication: it starts
//! where the transport hands over decrypted payloads, and produces
//! payloads for the transport to encrypt. What it does is:
//!
//! - multiplex *channels*, flow-controlled byte streams identified by
//!   integers, over one [`Connection`](connection::Connection);
//!
//! - accept channel open requests from the remote side (in the
//!   [`Connector`](connector::Connector)), connect them to local TCP
//!   sockets, and refuse the ones the remote side has no business
//!   opening (sessions, agent channels, forwards nobody asked for);
//!
//! - forward local ports to the remote side and the other way around,
//!   optionally through a [`StreamFilter`](filter::StreamFilter) that
//!   understands the protocol being forwarded. The FTP filter rewrites
//!   `PORT` commands and `227` replies so that FTP data connections go
//!   through the tunnel too;
//!
//! - drive block ciphers in ECB, CBC, CFB and OFB modes, for
//!   transports using the older SSH ciphers.
//!
//! # Running a connection
//!
//! ```no_run
//! use std::sync::Arc;
//! use sshmux::{Config, Connection, filter::FilterRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Arc::new(Config::default());
//!     let (connection, mut outgoing) =
//!         Connection::new(config, Arc::new(()), FilterRegistry::with_defaults());
//!     let (_to_connection, incoming) = tokio::sync::mpsc::unbounded_channel();
//!     tokio::spawn(async move {
//!         while let Some(_packet) = outgoing.recv().await {
//!             // encrypt and send the packet to the remote side.
//!         }
//!     });
//!     // Feed decrypted packets from the remote side into `_to_connection`.
//!     connection.run(incoming).await.unwrap();
//! }
//! ```
//!
//! # Flow control
//!
//! Each side of a channel advertises a *window*, the number of bytes
//! the other side may send before it must wait for a window
//! adjustment. [`Channel::write`](channel::Channel::write) waits when
//! the window is exhausted, and
//! [`Channel::read`](channel::Channel::read) gives credit back to the
//! remote side as the application consumes data. A remote side sending
//! more than its window is a protocol error, fatal to the whole
//! connection.

mod encoding;
mod msg;

pub mod channel;
pub mod cipher;
pub mod config;
pub mod connection;
pub mod connector;
pub mod filter;
pub mod forward;
pub mod handler;

pub use channel::{Channel, ChannelError, ChannelInfo, ChannelState};
pub use config::Config;
pub use connection::Connection;
pub use cryptovec::CryptoVec;
pub use handler::Handler;

#[derive(Debug)]
/// Errors.
pub enum Error {
    /// The remote side violated the channel protocol (malformed
    /// message, window overrun). The connection cannot be trusted
    /// anymore.
    ProtocolViolation(String),

    /// A channel open request was refused by policy.
    ChannelOpenRejected {
        /// Reason code sent to, or received from, the remote side.
        reason: ChannelOpenFailure,
        /// Human-readable explanation.
        description: String,
    },

    /// Could not connect the local end of a channel.
    ChannelOpenTransportFailure(std::io::Error),

    /// A stream filter could not rewrite a line.
    FilterRewrite(String),

    /// I/O error on the local socket of an established channel.
    ChannelIo(std::io::Error),

    /// The channel is closed.
    ChannelClosed,

    /// Message received/sent on unopened channel.
    WrongChannel,

    /// Index out of bounds.
    IndexOutOfBounds,

    /// UTF-8 decoding error (most probably ASCII error).
    Utf8(std::str::Utf8Error),

    /// I/O error.
    IO(std::io::Error),

    /// Disconnected
    Disconnect,

    /// The remote side did not answer in time.
    Timeout,

    /// Error from the cryptography layer.
    OpenSSLStack(openssl::error::ErrorStack),

    /// Input length is not a multiple of the block size.
    InvalidBlockLength,

    /// PKCS5 padding is malformed.
    InvalidPadding,

    /// Key or IV has the wrong length for this cipher.
    InvalidKeyLength,

    /// No cipher with this name.
    UnknownCipher(String),

    /// The X11 client did not present the expected authentication cookie.
    X11Auth,
}

impl Error {
    /// Whether this error means the connection itself must be torn
    /// down, as opposed to a single channel or filter invocation.
    pub fn is_fatal(&self) -> bool {
        match *self {
            Error::ProtocolViolation(_)
            | Error::IndexOutOfBounds
            | Error::Utf8(_)
            | Error::Disconnect => true,
            _ => false,
        }
    }

    /// Reason code and description sent in a channel open failure
    /// caused by this error.
    pub(crate) fn open_failure(&self) -> (ChannelOpenFailure, String) {
        match *self {
            Error::ChannelOpenRejected {
                reason,
                ref description,
            } => (reason, description.clone()),
            ref e => (ChannelOpenFailure::ConnectFailed, e.to_string()),
        }
    }

    pub(crate) fn rejected<D: Into<String>>(reason: ChannelOpenFailure, description: D) -> Self {
        Error::ChannelOpenRejected {
            reason,
            description: description.into(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::ProtocolViolation(ref what) => write!(f, "Protocol violation: {}", what),
            Error::ChannelOpenRejected { ref description, .. } => write!(f, "{}", description),
            Error::ChannelOpenTransportFailure(ref e) => write!(f, "{}", e),
            Error::FilterRewrite(ref line) => write!(f, "Could not rewrite {:?}", line),
            Error::ChannelIo(ref e) => write!(f, "Channel I/O error: {}", e),
            Error::ChannelClosed => write!(f, "Channel closed"),
            Error::WrongChannel => write!(f, "Inexistent channel"),
            Error::IndexOutOfBounds => write!(f, "Index out of bounds in a packet"),
            Error::Utf8(ref e) => write!(f, "{}", e),
            Error::IO(ref e) => write!(f, "{}", e),
            Error::Disconnect => write!(f, "Disconnected"),
            Error::Timeout => write!(f, "Timeout"),
            Error::OpenSSLStack(ref e) => write!(f, "{}", e),
            Error::InvalidBlockLength => write!(f, "Input length is not a multiple of the block size"),
            Error::InvalidPadding => write!(f, "Invalid padding"),
            Error::InvalidKeyLength => write!(f, "Invalid key or IV length"),
            Error::UnknownCipher(ref name) => write!(f, "Unknown cipher {:?}", name),
            Error::X11Auth => write!(f, "X11 authentication cookie mismatch"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::ChannelOpenTransportFailure(ref e) => Some(e),
            Error::ChannelIo(ref e) => Some(e),
            Error::Utf8(ref e) => Some(e),
            Error::IO(ref e) => Some(e),
            Error::OpenSSLStack(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::IO(e)
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Error {
        Error::Utf8(e)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Error {
        Error::OpenSSLStack(e)
    }
}

impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Error {
        match e {
            ChannelError::Closed => Error::ChannelClosed,
            ChannelError::Io(e) => Error::ChannelIo(e),
        }
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl ChannelOpenFailure {
    /// Decode a reason code, as found in a channel open failure message.
    pub fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// The identifier of a channel, on this side of the connection.
pub struct ChannelId(pub(crate) u32);

impl ChannelId {
    /// The identifier as sent on the wire.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors() {
        assert!(Error::ProtocolViolation("window overrun".into()).is_fatal());
        assert!(Error::IndexOutOfBounds.is_fatal());
        assert!(!Error::rejected(ChannelOpenFailure::ConnectFailed, "refused").is_fatal());
        assert!(!Error::ChannelClosed.is_fatal());
    }

    #[test]
    fn open_failure_reasons() {
        let e = Error::rejected(ChannelOpenFailure::UnknownChannelType, "unknown channel type: foo");
        assert_eq!(
            e.open_failure(),
            (ChannelOpenFailure::UnknownChannelType, "unknown channel type: foo".to_string())
        );
        let e = Error::ChannelOpenTransportFailure(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(e.open_failure().0, ChannelOpenFailure::ConnectFailed);
        assert_eq!(ChannelOpenFailure::from_u32(4), Some(ChannelOpenFailure::ResourceShortage));
        assert_eq!(ChannelOpenFailure::from_u32(9), None);
    }
}
