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
//! Accepting channels opened by the remote side.
//!
//! Open requests are queued by the connection as they arrive, and
//! handled one at a time by a worker task, so that a slow TCP connect
//! never holds up the rest of the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cryptovec::CryptoVec;
use log::{debug, info};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::channel::{spawn_pumps, ChannelInfo};
use crate::connection::{Connection, WeakConnection};
use crate::encoding::{Encoding, Reader};
use crate::filter::x11::X11AuthFilter;
use crate::filter::FilterPair;
use crate::{msg, ChannelOpenFailure, Error};

/// The type of a channel, with its type-specific fields.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelType {
    Session,
    DirectTcpip {
        host: String,
        port: u32,
        origin_addr: String,
        origin_port: u32,
    },
    ForwardedTcpip {
        remote_addr: String,
        remote_port: u32,
        origin_addr: String,
        origin_port: u32,
    },
    X11 {
        origin_addr: String,
        origin_port: u32,
    },
    AuthAgent,
    Unknown(String),
}

impl ChannelType {
    /// The name of this type on the wire.
    pub fn name(&self) -> &str {
        match *self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::X11 { .. } => "x11",
            ChannelType::AuthAgent => "auth-agent@openssh.com",
            ChannelType::Unknown(ref name) => name,
        }
    }
}

/// A decoded channel open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    #[allow(missing_docs)]
    pub channel_type: ChannelType,
    /// The identifier chosen by the remote side.
    pub peer_channel_id: u32,
    /// How much we may send before the remote side adjusts the window.
    pub peer_initial_window: u32,
    /// Largest data packet the remote side accepts.
    pub peer_max_packet: u32,
}

impl OpenRequest {
    /// Decode a `CHANNEL_OPEN` message, including its message number.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.first() != Some(&msg::CHANNEL_OPEN) {
            return Err(Error::ProtocolViolation("not a channel open message".to_string()));
        }
        let mut r = buf.reader(1);
        let typ = r.read_str()?;
        let peer_channel_id = r.read_u32()?;
        let peer_initial_window = r.read_u32()?;
        let peer_max_packet = r.read_u32()?;
        let channel_type = match typ {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: r.read_str()?.to_string(),
                port: r.read_u32()?,
                origin_addr: r.read_str()?.to_string(),
                origin_port: r.read_u32()?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                remote_addr: r.read_str()?.to_string(),
                remote_port: r.read_u32()?,
                origin_addr: r.read_str()?.to_string(),
                origin_port: r.read_u32()?,
            },
            "x11" => ChannelType::X11 {
                origin_addr: r.read_str()?.to_string(),
                origin_port: r.read_u32()?,
            },
            "auth-agent" | "auth-agent@openssh.com" => ChannelType::AuthAgent,
            t => ChannelType::Unknown(t.to_string()),
        };
        Ok(OpenRequest {
            channel_type,
            peer_channel_id,
            peer_initial_window,
            peer_max_packet,
        })
    }
}

/// The queue of open requests, and its worker.
#[derive(Debug)]
pub struct Connector {
    queue: mpsc::UnboundedSender<Vec<u8>>,
    running: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
}

impl Connector {
    pub(crate) fn spawn(connection: WeakConnection) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let wakeup = Arc::new(Notify::new());
        tokio::spawn(worker(connection, receiver, running.clone(), wakeup.clone()));
        Connector {
            queue,
            running,
            wakeup,
        }
    }

    /// Queue a raw `CHANNEL_OPEN` message. Never blocks.
    pub fn submit(&self, message: &[u8]) {
        if !self.is_running() || self.queue.send(message.to_vec()).is_err() {
            debug!("connector stopped, dropping channel open")
        }
    }

    /// Stop the worker once it is done with the current request.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    #[allow(missing_docs)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn worker(
    connection: WeakConnection,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    running: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
) {
    while running.load(Ordering::SeqCst) {
        let message = tokio::select! {
            biased;
            _ = wakeup.notified() => continue,
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let connection = match connection.upgrade() {
            Some(connection) => connection,
            None => break,
        };
        if let Err(e) = process(&connection, &message).await {
            connection.abort(e);
            break;
        }
    }
    debug!("connector stopped");
}

/// Handle one open request. Only a malformed request is an error: a
/// refused one is answered and reported to the handler.
async fn process(connection: &Connection, message: &[u8]) -> Result<(), Error> {
    let request = OpenRequest::decode(message).map_err(|e| match e {
        Error::ProtocolViolation(e) => Error::ProtocolViolation(e),
        e => Error::ProtocolViolation(format!("malformed channel open: {}", e)),
    })?;
    debug!("channel open {:?}", request);
    if let Err(e) = open(connection, &request).await {
        refuse(connection, &request, &e);
    }
    Ok(())
}

async fn open(connection: &Connection, request: &OpenRequest) -> Result<(), Error> {
    let config = connection.config().clone();
    let mut filters = FilterPair::default();
    let (target_host, target_port, origin_host, origin_port) = match request.channel_type {
        ChannelType::ForwardedTcpip {
            ref remote_addr,
            remote_port,
            ref origin_addr,
            origin_port,
        } => {
            let (host, port) = connection
                .get_forward_target(remote_addr, remote_port)
                .ok_or_else(|| {
                    Error::rejected(
                        ChannelOpenFailure::AdministrativelyProhibited,
                        "unsolicited forward attempted",
                    )
                })?;
            (host, port, origin_addr.clone(), origin_port)
        }
        ChannelType::DirectTcpip {
            ref host,
            port,
            ref origin_addr,
            origin_port,
        } => {
            if !config.allow_direct_tcpip {
                return Err(Error::rejected(
                    ChannelOpenFailure::AdministrativelyProhibited,
                    "direct-tcpip channels are not allowed",
                ));
            }
            (host.clone(), port, origin_addr.clone(), origin_port)
        }
        ChannelType::X11 {
            ref origin_addr,
            origin_port,
        } => {
            let mapping = connection.x11_mapping().ok_or_else(|| {
                Error::rejected(
                    ChannelOpenFailure::AdministrativelyProhibited,
                    "x11 forwarding was not requested",
                )
            })?;
            filters.output = Some(Box::new(X11AuthFilter::new(mapping)));
            (
                config.x11_display_host.clone(),
                u32::from(config.x11_display_port),
                origin_addr.clone(),
                origin_port,
            )
        }
        ChannelType::Session => {
            return Err(Error::rejected(
                ChannelOpenFailure::AdministrativelyProhibited,
                "unexpected session channel open",
            ))
        }
        ChannelType::AuthAgent => {
            return Err(Error::rejected(
                ChannelOpenFailure::AdministrativelyProhibited,
                "unexpected agent channel open",
            ))
        }
        ChannelType::Unknown(ref name) => {
            return Err(Error::rejected(
                ChannelOpenFailure::UnknownChannelType,
                format!("unknown channel type: {}", name),
            ))
        }
    };

    let stream = connect(&target_host, target_port, config.connect_timeout).await?;

    let channel = connection.new_channel(ChannelInfo {
        id: crate::ChannelId(0),
        peer_id: request.peer_channel_id,
        channel_type: request.channel_type.name().to_string(),
        target_host,
        target_port,
        origin_host,
        origin_port,
    })?;
    let id = channel.id();
    channel
        .shared()
        .confirm(request.peer_channel_id, request.peer_initial_window, request.peer_max_packet);
    connection.send_open_confirmation(channel.shared())?;
    let info = channel.info();

    let handler = connection.handler().clone();
    match request.channel_type {
        ChannelType::ForwardedTcpip {
            ref remote_addr,
            remote_port,
            ..
        } => {
            if let Some(factory) = connection.get_forward_filter_factory(remote_addr, remote_port) {
                filters = factory.create_filter(connection, &info)
            }
            handler.remote_forwarded_connect(connection, remote_addr, remote_port, &info)
        }
        ChannelType::DirectTcpip { .. } => handler.remote_direct_connect(connection, &info),
        _ => handler.remote_x11_connect(connection, &info),
    }
    info!(
        "channel {}: {} to {}:{} from {}:{}",
        id, info.channel_type, info.target_host, info.target_port, info.origin_host, info.origin_port
    );
    let tasks = spawn_pumps(channel, stream, filters);
    connection.attach_tasks(id, tasks);
    Ok(())
}

fn refuse(connection: &Connection, request: &OpenRequest, e: &Error) {
    let (reason, description) = e.open_failure();
    info!(
        "refusing {} channel open: {}",
        request.channel_type.name(),
        description
    );
    let mut packet = CryptoVec::new();
    packet.push(msg::CHANNEL_OPEN_FAILURE);
    packet.push_u32_be(request.peer_channel_id);
    packet.push_u32_be(reason as u32);
    if !connection.config().incompatible_channel_open_failure {
        packet.extend_ssh_string(format!("open failed: {}", description).as_bytes());
        packet.extend_ssh_string(b"");
    }
    if let Err(err) = connection.transmit(packet) {
        debug!("channel open failure not sent: {}", err)
    }
    connection
        .handler()
        .remote_channel_open_failure(connection, request, e)
}

/// Connect the local end of a channel.
pub(crate) async fn connect(host: &str, port: u32, timeout: Option<Duration>) -> Result<TcpStream, Error> {
    let port = if port <= u16::MAX as u32 {
        port as u16
    } else {
        return Err(Error::ChannelOpenTransportFailure(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid port {}", port),
        )));
    };
    let stream = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(stream) => stream,
            Err(_) => {
                return Err(Error::ChannelOpenTransportFailure(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connection to {}:{} timed out", host, port),
                )))
            }
        },
        None => TcpStream::connect((host, port)).await,
    };
    stream.map_err(Error::ChannelOpenTransportFailure)
}
