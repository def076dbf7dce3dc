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
//! Listeners forwarding TCP connections through the tunnel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::channel::spawn_pumps;
use crate::connection::{Connection, WeakConnection};
use crate::filter::{FilterFactory, FilterPair};
use crate::Error;

/// Where the connections accepted by a listener go.
#[derive(Clone)]
pub(crate) enum ForwardTarget {
    /// A local forward: `direct-tcpip` channels to `host:port`.
    Direct {
        host: String,
        port: u32,
        filter: Option<Arc<dyn FilterFactory>>,
    },
    /// A listener bound for the remote side: `forwarded-tcpip` channels.
    Forwarded { bind_addr: String, bind_port: u32 },
}

pub(crate) struct ListenerControl {
    accept_max: AtomicUsize,
    stop: Notify,
}

impl ListenerControl {
    pub(crate) fn stop(&self) {
        self.stop.notify_one()
    }
}

/// A forwarding listener. Dropping this handle does not stop it.
pub struct Listener {
    local_addr: SocketAddr,
    control: Arc<ListenerControl>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("accept_max", &self.control.accept_max.load(Ordering::SeqCst))
            .finish()
    }
}

/// Bind a listening socket. The empty address and `*` mean all
/// interfaces, as in SSH forward specifications.
pub(crate) async fn bind(bind_addr: &str, port: u16) -> Result<TcpListener, Error> {
    let host = match bind_addr {
        "" | "*" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        host => host,
    };
    Ok(TcpListener::bind((host, port)).await?)
}

impl Listener {
    pub(crate) fn spawn(connection: &Connection, listener: TcpListener, target: ForwardTarget) -> Listener {
        let control = Arc::new(ListenerControl {
            accept_max: AtomicUsize::new(0),
            stop: Notify::new(),
        });
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        };
        connection.register_listener(control.clone());
        tokio::spawn(accept_loop(
            connection.downgrade(),
            listener,
            local_addr,
            target,
            control.clone(),
        ));
        Listener { local_addr, control }
    }

    #[allow(missing_docs)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The port this listener is bound to.
    pub fn listen_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop listening after `n` connections (0 means never). Set it
    /// before telling anyone about the port.
    pub fn set_accept_max(&self, n: usize) {
        self.control.accept_max.store(n, Ordering::SeqCst)
    }

    /// Stop accepting connections. Forwarded connections already
    /// established are unaffected.
    pub fn stop(&self) {
        self.control.stop()
    }
}

async fn accept_loop(
    connection: WeakConnection,
    listener: TcpListener,
    local_addr: SocketAddr,
    target: ForwardTarget,
    control: Arc<ListenerControl>,
) {
    let mut accepted = 0;
    loop {
        let (stream, peer) = tokio::select! {
            _ = control.stop.notified() => break,
            r = listener.accept() => match r {
                Ok(r) => r,
                Err(e) => {
                    warn!("listener {}: {}", local_addr, e);
                    break
                }
            }
        };
        let connection = match connection.upgrade() {
            Some(c) if !c.is_stopped() => c,
            _ => break,
        };
        accepted += 1;
        debug!("listener {}: connection from {}", local_addr, peer);
        connection.handler().listener_accept(local_addr, peer);
        tokio::spawn(forward_connection(connection, stream, peer, target.clone()));
        let max = control.accept_max.load(Ordering::SeqCst);
        if max > 0 && accepted >= max {
            debug!("listener {}: accepted {} connections", local_addr, accepted);
            break;
        }
    }
    drop(listener);
    info!("closed listener {}", local_addr);
    if let Some(connection) = connection.upgrade() {
        connection.unregister_listener(&control)
    }
}

async fn forward_connection(connection: Connection, stream: TcpStream, peer: SocketAddr, target: ForwardTarget) {
    let origin_host = peer.ip().to_string();
    let origin_port = u32::from(peer.port());
    let (channel, filter) = match target {
        ForwardTarget::Direct { host, port, filter } => {
            match connection
                .channel_open_direct_tcpip(&host, port, &origin_host, origin_port)
                .await
            {
                Ok(channel) => (channel, filter),
                Err(e) => {
                    debug!("forward from {} to {}:{}: {}", peer, host, port, e);
                    return;
                }
            }
        }
        ForwardTarget::Forwarded { bind_addr, bind_port } => {
            match connection
                .channel_open_forwarded_tcpip(&bind_addr, bind_port, &origin_host, origin_port)
                .await
            {
                Ok(channel) => (channel, None),
                Err(e) => {
                    debug!("forward from {} for {}:{}: {}", peer, bind_addr, bind_port, e);
                    return;
                }
            }
        }
    };
    let info = channel.info();
    let filters = match filter {
        Some(factory) => factory.create_filter(&connection, &info),
        None => FilterPair::default(),
    };
    if info.channel_type == "direct-tcpip" {
        connection.handler().local_direct_connect(&connection, &info)
    } else {
        connection.handler().local_forwarded_connect(&connection, &info)
    }
    let id = channel.id();
    let tasks = spawn_pumps(channel, stream, filters);
    connection.attach_tasks(id, tasks);
}
