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
//! The channel table, and everything that is shared by the channels of
//! one connection.
//!
//! A [`Connection`] does not know about the transport: decrypted
//! payloads are given to [`Connection::handle_message`] (or fed to
//! [`Connection::run`]), and outgoing payloads are produced on the
//! receiver returned by [`Connection::new`]. Either side of an SSH
//! connection may run one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use cryptovec::CryptoVec;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::AbortHandle;

use crate::channel::{Channel, ChannelInfo, ChannelMsg, ChannelShared};
use crate::config::Config;
use crate::connector::Connector;
use crate::encoding::{Encoding, Reader};
use crate::filter::x11::X11Mapping;
use crate::filter::{FilterFactory, FilterRegistry};
use crate::forward::{self, ForwardTarget, Listener, ListenerControl};
use crate::handler::Handler;
use crate::{msg, ChannelId, ChannelOpenFailure, Error};

/// The way channels reach their connection: the outgoing message
/// sink, and a weak reference to remove themselves from the table.
#[derive(Clone)]
pub(crate) struct Link {
    sender: mpsc::UnboundedSender<CryptoVec>,
    inner: Weak<Inner>,
}

impl Link {
    pub(crate) fn new(sender: mpsc::UnboundedSender<CryptoVec>, inner: Weak<Inner>) -> Self {
        Link { sender, inner }
    }

    pub(crate) fn transmit(&self, packet: CryptoVec) -> Result<(), Error> {
        self.sender.send(packet).map_err(|_| Error::Disconnect)
    }

    pub(crate) fn finish_channel(&self, id: ChannelId) {
        if let Some(inner) = self.inner.upgrade() {
            Connection { inner }.finish_channel(id)
        }
    }
}

struct ChannelEntry {
    shared: Arc<ChannelShared>,
    incoming: Option<mpsc::UnboundedSender<ChannelMsg>>,
    eof_received: bool,
    tasks: Vec<AbortHandle>,
}

/// A forward we asked the remote side for.
struct RemoteForward {
    target_host: String,
    target_port: u32,
    filter: Option<Arc<dyn FilterFactory>>,
}

pub(crate) struct Inner {
    config: Arc<Config>,
    handler: Arc<dyn Handler>,
    filters: FilterRegistry,
    sender: mpsc::UnboundedSender<CryptoVec>,
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
    next_channel: AtomicU32,
    pending_opens: Mutex<HashMap<ChannelId, oneshot::Sender<Result<(), Error>>>>,
    /// Opens we gave up on, until the remote side closes or refuses them.
    abandoned: Mutex<HashSet<ChannelId>>,
    /// Replies to global requests come in the order of the requests.
    pending_requests: Mutex<VecDeque<oneshot::Sender<Option<u32>>>>,
    remote_forwards: Mutex<HashMap<(String, u32), RemoteForward>>,
    /// Listeners bound on behalf of the remote side.
    bound_forwards: Mutex<HashMap<(String, u32), Listener>>,
    listeners: Mutex<Vec<Arc<ListenerControl>>>,
    x11: Mutex<Option<X11Mapping>>,
    connector: Connector,
    fatal: Mutex<Option<Error>>,
    fatal_message: Mutex<Option<String>>,
    stopped: AtomicBool,
    stop_notify: Notify,
}

/// A handle to a connection. Cloning it is cheap.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// A handle that does not keep the connection alive.
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<Inner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.debug_struct("Connection")
            .field("channels", &self.channel_ids())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Connection {
    /// Create a connection, and the receiver of the payloads it
    /// produces. Must be called from within a Tokio runtime, since it
    /// starts the worker accepting channel open requests.
    pub fn new(
        config: Arc<Config>,
        handler: Arc<dyn Handler>,
        filters: FilterRegistry,
    ) -> (Connection, mpsc::UnboundedReceiver<CryptoVec>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            config,
            handler,
            filters,
            sender,
            channels: Mutex::new(HashMap::new()),
            next_channel: AtomicU32::new(0),
            pending_opens: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(HashSet::new()),
            pending_requests: Mutex::new(VecDeque::new()),
            remote_forwards: Mutex::new(HashMap::new()),
            bound_forwards: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            x11: Mutex::new(None),
            connector: Connector::spawn(WeakConnection(weak.clone())),
            fatal: Mutex::new(None),
            fatal_message: Mutex::new(None),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        });
        (Connection { inner }, receiver)
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    fn link(&self) -> Link {
        Link::new(self.inner.sender.clone(), Arc::downgrade(&self.inner))
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    #[allow(missing_docs)]
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.inner.handler
    }

    /// The filters that may be named in forward specifications.
    pub fn filters(&self) -> &FilterRegistry {
        &self.inner.filters
    }

    /// The queue of channel open requests from the remote side.
    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }

    /// Send a payload to the remote side.
    pub fn transmit(&self, packet: CryptoVec) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::Disconnect);
        }
        self.inner.sender.send(packet).map_err(|_| Error::Disconnect)
    }

    /// Handle payloads from `incoming` until the transport closes it,
    /// the connection is stopped, or the remote side violates the
    /// protocol. In the last case, the violation is returned.
    pub async fn run(&self, mut incoming: mpsc::UnboundedReceiver<CryptoVec>) -> Result<(), Error> {
        loop {
            let stopped = self.inner.stop_notify.notified();
            if self.is_stopped() {
                break;
            }
            tokio::select! {
                packet = incoming.recv() => match packet {
                    Some(packet) => {
                        if let Err(e) = self.handle_message(&packet).await {
                            if e.is_fatal() {
                                self.abort(e)
                            } else {
                                debug!("{}", e)
                            }
                        }
                    }
                    None => {
                        debug!("transport closed");
                        self.stop();
                        break;
                    }
                },
                _ = stopped => {}
            }
        }
        let fatal = self.inner.fatal.lock().unwrap().take();
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop the connection after a fatal error.
    pub fn abort(&self, e: Error) {
        error!("fatal: {}", e);
        {
            let mut fatal = self.inner.fatal.lock().unwrap();
            if fatal.is_none() {
                *self.inner.fatal_message.lock().unwrap() = Some(e.to_string());
                *fatal = Some(e);
            }
        }
        self.stop()
    }

    /// The error that stopped this connection, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.inner.fatal_message.lock().unwrap().clone()
    }

    #[allow(missing_docs)]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop everything: the connector, all channels (writes fail,
    /// reads see end of file), all listeners, all pending requests.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping connection");
        self.inner.connector.stop();
        let channels: Vec<_> = self.inner.channels.lock().unwrap().drain().collect();
        for (id, entry) in channels {
            entry.shared.hard_close();
            for task in entry.tasks {
                task.abort()
            }
            self.inner.handler.channel_deleted(self, id);
        }
        let listeners: Vec<_> = self.inner.listeners.lock().unwrap().drain(..).collect();
        for listener in listeners {
            listener.stop()
        }
        self.inner.bound_forwards.lock().unwrap().clear();
        for (_, pending) in self.inner.pending_opens.lock().unwrap().drain() {
            let _ = pending.send(Err(Error::Disconnect));
        }
        self.inner.abandoned.lock().unwrap().clear();
        self.inner.pending_requests.lock().unwrap().clear();
        self.inner.stop_notify.notify_waiters();
    }

    /// Handle one decrypted payload from the remote side.
    pub async fn handle_message(&self, buf: &[u8]) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::Disconnect);
        }
        let typ = match buf.first() {
            Some(&typ) => typ,
            None => return Err(Error::ProtocolViolation("empty message".to_string())),
        };
        self.dispatch(typ, buf).await.map_err(|e| match e {
            Error::IndexOutOfBounds | Error::Utf8(_) => {
                Error::ProtocolViolation(format!("malformed message {}: {}", typ, e))
            }
            e => e,
        })
    }

    async fn dispatch(&self, typ: u8, buf: &[u8]) -> Result<(), Error> {
        let mut r = buf.reader(1);
        match typ {
            msg::CHANNEL_OPEN => {
                self.inner.connector.submit(buf);
                Ok(())
            }
            msg::CHANNEL_OPEN_CONFIRMATION => {
                let id = ChannelId(r.read_u32()?);
                let peer_id = r.read_u32()?;
                let window = r.read_u32()?;
                let max_packet = r.read_u32()?;
                // Confirmed under the lock, so that a timing out opener
                // either sees the reply or abandons the channel.
                let abandoned = {
                    let mut pending = self.inner.pending_opens.lock().unwrap();
                    match (pending.remove(&id), self.channel_shared(id)) {
                        (Some(pending), Some(shared)) => {
                            debug!("channel {} confirmed, peer id {}", id, peer_id);
                            shared.confirm(peer_id, window, max_packet);
                            let _ = pending.send(Ok(()));
                            return Ok(());
                        }
                        _ => self.inner.abandoned.lock().unwrap().contains(&id),
                    }
                };
                let mut packet = CryptoVec::new();
                packet.push(msg::CHANNEL_CLOSE);
                packet.push_u32_be(peer_id);
                self.transmit(packet)?;
                if abandoned {
                    debug!("channel {}: late confirmation, closing", id);
                    Ok(())
                } else {
                    warn!("unexpected confirmation for channel {}", id);
                    Err(Error::WrongChannel)
                }
            }
            msg::CHANNEL_OPEN_FAILURE => {
                let id = ChannelId(r.read_u32()?);
                let code = r.read_u32()?;
                let description = if r.is_empty() {
                    String::new()
                } else {
                    r.read_str()?.to_string()
                };
                let reason = ChannelOpenFailure::from_u32(code).unwrap_or(ChannelOpenFailure::ConnectFailed);
                let pending = self.inner.pending_opens.lock().unwrap().remove(&id);
                match pending {
                    Some(pending) => {
                        let _ = pending.send(Err(Error::rejected(reason, description)));
                        Ok(())
                    }
                    None if self.inner.abandoned.lock().unwrap().remove(&id) => Ok(()),
                    None => Err(Error::WrongChannel),
                }
            }
            msg::CHANNEL_WINDOW_ADJUST => {
                let id = ChannelId(r.read_u32()?);
                let amount = r.read_u32()?;
                match self.channel_shared(id) {
                    Some(shared) => shared.adjust_tx_window(amount),
                    None => self.unknown_channel(id, Error::WrongChannel),
                }
            }
            msg::CHANNEL_DATA => {
                let id = ChannelId(r.read_u32()?);
                let data = r.read_string()?;
                self.deliver(id, data)
            }
            msg::CHANNEL_EXTENDED_DATA => {
                let id = ChannelId(r.read_u32()?);
                let _code = r.read_u32()?;
                let data = r.read_string()?;
                let shared = match self.channel_shared(id) {
                    Some(shared) => shared,
                    None => {
                        let e = Error::ProtocolViolation(format!("extended data on unknown channel {}", id));
                        return self.unknown_channel(id, e);
                    }
                };
                // Forwarded streams have no use for extended data.
                shared.received_data(data.len())?;
                shared.consumed(data.len());
                Ok(())
            }
            msg::CHANNEL_EOF => {
                let id = ChannelId(r.read_u32()?);
                let mut channels = self.inner.channels.lock().unwrap();
                let entry = match channels.get_mut(&id) {
                    Some(entry) => entry,
                    None => return self.unknown_channel(id, Error::WrongChannel),
                };
                debug!("channel {}: eof", id);
                entry.eof_received = true;
                if let Some(ref incoming) = entry.incoming {
                    let _ = incoming.send(ChannelMsg::Eof);
                }
                Ok(())
            }
            msg::CHANNEL_CLOSE => {
                let id = ChannelId(r.read_u32()?);
                let shared = {
                    let mut channels = self.inner.channels.lock().unwrap();
                    channels.get_mut(&id).map(|entry| {
                        entry.incoming = None;
                        entry.shared.clone()
                    })
                };
                let shared = match shared {
                    Some(shared) => shared,
                    None if self.inner.abandoned.lock().unwrap().remove(&id) => {
                        debug!("channel {}: abandoned open closed", id);
                        return Ok(());
                    }
                    None => return Err(Error::WrongChannel),
                };
                debug!("channel {}: closed by the remote side", id);
                if shared.peer_close() {
                    self.finish_channel(id)
                }
                Ok(())
            }
            msg::CHANNEL_REQUEST => {
                let id = ChannelId(r.read_u32()?);
                let request = r.read_str()?;
                let want_reply = r.read_byte()? != 0;
                debug!("channel {}: refusing request {:?}", id, request);
                let shared = match self.channel_shared(id) {
                    Some(shared) => shared,
                    None => return self.unknown_channel(id, Error::WrongChannel),
                };
                if want_reply {
                    let mut packet = CryptoVec::new();
                    packet.push(msg::CHANNEL_FAILURE);
                    packet.push_u32_be(shared.peer_id());
                    self.transmit(packet)?;
                }
                Ok(())
            }
            msg::GLOBAL_REQUEST => {
                let request = r.read_str()?;
                let want_reply = r.read_byte()? != 0;
                let reply = match request {
                    "tcpip-forward" => {
                        let addr = r.read_str()?;
                        let port = r.read_u32()?;
                        self.bind_remote_forward(addr, port).await
                    }
                    "cancel-tcpip-forward" => {
                        let addr = r.read_str()?;
                        let port = r.read_u32()?;
                        self.cancel_remote_forward(addr, port)
                    }
                    _ => {
                        debug!("refusing global request {:?}", request);
                        None
                    }
                };
                if want_reply {
                    let mut packet = CryptoVec::new();
                    match reply {
                        Some(Some(port)) => {
                            packet.push(msg::REQUEST_SUCCESS);
                            packet.push_u32_be(port)
                        }
                        Some(None) => packet.push(msg::REQUEST_SUCCESS),
                        None => packet.push(msg::REQUEST_FAILURE),
                    }
                    self.transmit(packet)?;
                }
                Ok(())
            }
            msg::REQUEST_SUCCESS | msg::REQUEST_FAILURE => {
                let port = if typ == msg::REQUEST_FAILURE {
                    None
                } else if r.is_empty() {
                    Some(0)
                } else {
                    Some(r.read_u32()?)
                };
                let pending = self.inner.pending_requests.lock().unwrap().pop_front();
                match pending {
                    Some(pending) => {
                        let _ = pending.send(port);
                    }
                    None => warn!("reply to a global request we did not send"),
                }
                Ok(())
            }
            _ => {
                debug!("unhandled message {}", typ);
                Ok(())
            }
        }
    }

    fn deliver(&self, id: ChannelId, data: &[u8]) -> Result<(), Error> {
        let (shared, incoming) = {
            let channels = self.inner.channels.lock().unwrap();
            let entry = match channels.get(&id) {
                Some(entry) => entry,
                None => {
                    let e = Error::ProtocolViolation(format!("data on unknown channel {}", id));
                    return self.unknown_channel(id, e);
                }
            };
            if entry.eof_received {
                return Err(Error::ProtocolViolation(format!("data after eof on channel {}", id)));
            }
            (entry.shared.clone(), entry.incoming.clone())
        };
        shared.received_data(data.len())?;
        let delivered = match incoming {
            Some(incoming) => incoming
                .send(ChannelMsg::Data(Bytes::copy_from_slice(data)))
                .is_ok(),
            None => false,
        };
        if !delivered {
            // Nobody is reading anymore.
            shared.consumed(data.len())
        }
        Ok(())
    }

    /// Answer a `tcpip-forward` request. `Some(Some(port))` when a port
    /// was allocated for the remote side.
    async fn bind_remote_forward(&self, addr: &str, port: u32) -> Option<Option<u32>> {
        if !self.inner.config.allow_remote_forwarding || port > u16::MAX as u32 {
            info!("refusing remote forward {}:{}", addr, port);
            return None;
        }
        let listener = match forward::bind(addr, port as u16).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("remote forward {}:{}: {}", addr, port, e);
                return None;
            }
        };
        let bound_port = match listener.local_addr() {
            Ok(local) => u32::from(local.port()),
            Err(_) => return None,
        };
        let target = ForwardTarget::Forwarded {
            bind_addr: addr.to_string(),
            bind_port: bound_port,
        };
        let listener = Listener::spawn(self, listener, target);
        info!("forwarding {}:{} to the remote side", addr, bound_port);
        self.inner
            .bound_forwards
            .lock()
            .unwrap()
            .insert((addr.to_string(), bound_port), listener);
        if port == 0 {
            Some(Some(bound_port))
        } else {
            Some(None)
        }
    }

    fn cancel_remote_forward(&self, addr: &str, port: u32) -> Option<Option<u32>> {
        let listener = self
            .inner
            .bound_forwards
            .lock()
            .unwrap()
            .remove(&(addr.to_string(), port))?;
        info!("cancelled forward {}:{}", addr, port);
        listener.stop();
        Some(None)
    }

    /// Messages for an open we gave up on are dropped until the remote
    /// side closes it. Otherwise `e`.
    fn unknown_channel(&self, id: ChannelId, e: Error) -> Result<(), Error> {
        if self.inner.abandoned.lock().unwrap().contains(&id) {
            debug!("channel {}: dropping message for abandoned open", id);
            Ok(())
        } else {
            Err(e)
        }
    }

    fn channel_shared(&self, id: ChannelId) -> Option<Arc<ChannelShared>> {
        self.inner
            .channels
            .lock()
            .unwrap()
            .get(&id)
            .map(|entry| entry.shared.clone())
    }

    /// Description of the channel `id`, if it is in the table.
    pub fn channel(&self, id: ChannelId) -> Option<ChannelInfo> {
        self.channel_shared(id).map(|shared| shared.info())
    }

    /// Identifiers of all channels in the table.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.inner.channels.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Add a channel to the table, with a fresh identifier (the `id`
    /// field of `info` is ignored).
    pub(crate) fn new_channel(&self, mut info: ChannelInfo) -> Result<Channel, Error> {
        let (shared, receiver) = {
            let mut channels = self.inner.channels.lock().unwrap();
            if self.is_stopped() {
                return Err(Error::Disconnect);
            }
            if channels.len() >= self.inner.config.maximum_channels {
                return Err(Error::rejected(
                    ChannelOpenFailure::ResourceShortage,
                    "too many channels",
                ));
            }
            info.id = loop {
                let id = ChannelId(self.inner.next_channel.fetch_add(1, Ordering::Relaxed));
                if !channels.contains_key(&id) && !self.inner.abandoned.lock().unwrap().contains(&id) {
                    break id;
                }
            };
            let shared = Arc::new(ChannelShared::new(info, &self.inner.config, self.link()));
            let (sender, receiver) = mpsc::unbounded_channel();
            channels.insert(
                shared.id(),
                ChannelEntry {
                    shared: shared.clone(),
                    incoming: Some(sender),
                    eof_received: false,
                    tasks: Vec::new(),
                },
            );
            (shared, receiver)
        };
        self.inner.handler.channel_added(self, shared.id());
        Ok(Channel::new(shared, receiver))
    }

    /// Remove a channel that never opened.
    fn remove_channel(&self, id: ChannelId) {
        if self.inner.channels.lock().unwrap().remove(&id).is_some() {
            self.inner.handler.channel_deleted(self, id)
        }
    }

    /// Remove a channel closed on both sides.
    pub(crate) fn finish_channel(&self, id: ChannelId) {
        if self.inner.channels.lock().unwrap().remove(&id).is_some() {
            debug!("channel {}: finished", id);
            self.inner.handler.channel_closed(self, id);
            self.inner.handler.channel_deleted(self, id);
        }
    }

    pub(crate) fn send_open_confirmation(&self, shared: &ChannelShared) -> Result<(), Error> {
        let (window, max_packet) = shared.local_window();
        let mut packet = CryptoVec::new();
        packet.push(msg::CHANNEL_OPEN_CONFIRMATION);
        packet.push_u32_be(shared.peer_id());
        packet.push_u32_be(shared.id().as_u32());
        packet.push_u32_be(window);
        packet.push_u32_be(max_packet);
        self.transmit(packet)
    }

    /// Keep the pump tasks of a channel, to abort them when the
    /// connection stops.
    pub(crate) fn attach_tasks(&self, id: ChannelId, tasks: Vec<AbortHandle>) {
        let mut channels = self.inner.channels.lock().unwrap();
        match channels.get_mut(&id) {
            Some(entry) => entry.tasks.extend(tasks),
            None if self.is_stopped() => {
                for task in tasks {
                    task.abort()
                }
            }
            None => {}
        }
    }

    pub(crate) fn register_listener(&self, control: Arc<ListenerControl>) {
        if self.is_stopped() {
            control.stop();
            return;
        }
        self.inner.listeners.lock().unwrap().push(control)
    }

    pub(crate) fn unregister_listener(&self, control: &Arc<ListenerControl>) {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, control))
    }

    /// Open a `direct-tcpip` channel to `host:port` on the remote side,
    /// waiting for the confirmation (at most `Config::connect_timeout`).
    pub async fn channel_open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        origin_host: &str,
        origin_port: u32,
    ) -> Result<Channel, Error> {
        self.open_channel(ChannelInfo {
            id: ChannelId(0),
            peer_id: 0,
            channel_type: "direct-tcpip".to_string(),
            target_host: host.to_string(),
            target_port: port,
            origin_host: origin_host.to_string(),
            origin_port,
        })
        .await
    }

    /// Open a `forwarded-tcpip` channel, for a connection to
    /// `bind_addr:bind_port` forwarded on behalf of the remote side.
    pub async fn channel_open_forwarded_tcpip(
        &self,
        bind_addr: &str,
        bind_port: u32,
        origin_host: &str,
        origin_port: u32,
    ) -> Result<Channel, Error> {
        self.open_channel(ChannelInfo {
            id: ChannelId(0),
            peer_id: 0,
            channel_type: "forwarded-tcpip".to_string(),
            target_host: bind_addr.to_string(),
            target_port: bind_port,
            origin_host: origin_host.to_string(),
            origin_port,
        })
        .await
    }

    async fn open_channel(&self, info: ChannelInfo) -> Result<Channel, Error> {
        let channel_type = info.channel_type.clone();
        let channel = match self.new_channel(info) {
            Ok(channel) => channel,
            Err(e) => {
                self.inner.handler.local_channel_open_failure(self, &channel_type, &e);
                return Err(e);
            }
        };
        let id = channel.id();
        let info = channel.info();
        let (sender, mut receiver) = oneshot::channel();
        self.inner.pending_opens.lock().unwrap().insert(id, sender);

        let (window, max_packet) = channel.shared().local_window();
        let mut packet = CryptoVec::new();
        packet.push(msg::CHANNEL_OPEN);
        packet.extend_ssh_string(info.channel_type.as_bytes());
        packet.push_u32_be(id.as_u32());
        packet.push_u32_be(window);
        packet.push_u32_be(max_packet);
        packet.extend_ssh_string(info.target_host.as_bytes());
        packet.push_u32_be(info.target_port);
        packet.extend_ssh_string(info.origin_host.as_bytes());
        packet.push_u32_be(info.origin_port);

        let result = match self.transmit(packet) {
            Ok(()) => {
                match self.inner.config.connect_timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, &mut receiver).await {
                        Ok(reply) => reply.unwrap_or(Err(Error::Disconnect)),
                        Err(_) => self.abandon_open(id, &mut receiver),
                    },
                    None => receiver.await.unwrap_or(Err(Error::Disconnect)),
                }
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!("channel {}: {} open", id, channel_type);
                Ok(channel)
            }
            Err(e) => {
                info!("could not open {} channel: {}", channel_type, e);
                self.inner.pending_opens.lock().unwrap().remove(&id);
                self.remove_channel(id);
                self.inner.handler.local_channel_open_failure(self, &channel_type, &e);
                Err(e)
            }
        }
    }

    /// Give up waiting for the confirmation of `id`. The remote side may
    /// still confirm it: the id is remembered until it closes or refuses.
    fn abandon_open(&self, id: ChannelId, receiver: &mut oneshot::Receiver<Result<(), Error>>) -> Result<(), Error> {
        let mut pending = self.inner.pending_opens.lock().unwrap();
        if pending.remove(&id).is_some() {
            self.inner.abandoned.lock().unwrap().insert(id);
            Err(Error::Timeout)
        } else {
            // The reply arrived meanwhile.
            receiver.try_recv().unwrap_or(Err(Error::Timeout))
        }
    }

    /// Where connections to the remote forward `addr:port` go, if we
    /// asked for it.
    pub fn get_forward_target(&self, addr: &str, port: u32) -> Option<(String, u32)> {
        self.inner
            .remote_forwards
            .lock()
            .unwrap()
            .get(&(addr.to_string(), port))
            .map(|f| (f.target_host.clone(), f.target_port))
    }

    /// The filter to apply on connections to the remote forward
    /// `addr:port`.
    pub fn get_forward_filter_factory(&self, addr: &str, port: u32) -> Option<Arc<dyn FilterFactory>> {
        self.inner
            .remote_forwards
            .lock()
            .unwrap()
            .get(&(addr.to_string(), port))
            .and_then(|f| f.filter.clone())
    }

    /// Listen on `bind_addr:bind_port` (0 for any port), and forward
    /// every connection to `target_host:target_port` on the remote side.
    pub async fn new_local_forward(
        &self,
        bind_addr: &str,
        bind_port: u16,
        target_host: &str,
        target_port: u32,
    ) -> Result<Listener, Error> {
        self.new_local_forward_filtered(bind_addr, bind_port, target_host, target_port, None)
            .await
    }

    /// Like [`Connection::new_local_forward`], with a filter on every
    /// forwarded connection.
    pub async fn new_local_forward_filtered(
        &self,
        bind_addr: &str,
        bind_port: u16,
        target_host: &str,
        target_port: u32,
        filter: Option<Arc<dyn FilterFactory>>,
    ) -> Result<Listener, Error> {
        let listener = forward::bind(bind_addr, bind_port).await?;
        let target = ForwardTarget::Direct {
            host: target_host.to_string(),
            port: target_port,
            filter,
        };
        let listener = Listener::spawn(self, listener, target);
        info!(
            "forwarding {} to {}:{}",
            listener.local_addr(),
            target_host,
            target_port
        );
        Ok(listener)
    }

    /// Ask the remote side to listen on `bind_addr:bind_port`, and to
    /// forward connections to us, to be connected to
    /// `target_host:target_port`. Waits for the reply (at most
    /// `Config::forward_reply_timeout`), and returns whether the remote
    /// side accepted.
    pub async fn new_remote_forward_blocking(
        &self,
        bind_addr: &str,
        bind_port: u32,
        target_host: &str,
        target_port: u32,
        filter: Option<Arc<dyn FilterFactory>>,
    ) -> bool {
        let key = (bind_addr.to_string(), bind_port);
        self.inner.remote_forwards.lock().unwrap().insert(
            key.clone(),
            RemoteForward {
                target_host: target_host.to_string(),
                target_port,
                filter,
            },
        );
        let (sender, receiver) = oneshot::channel();
        let sent = {
            let mut pending = self.inner.pending_requests.lock().unwrap();
            let mut packet = CryptoVec::new();
            packet.push(msg::GLOBAL_REQUEST);
            packet.extend_ssh_string(b"tcpip-forward");
            packet.push(1);
            packet.extend_ssh_string(bind_addr.as_bytes());
            packet.push_u32_be(bind_port);
            match self.transmit(packet) {
                Ok(()) => {
                    pending.push_back(sender);
                    true
                }
                Err(_) => false,
            }
        };
        let reply = if sent {
            match tokio::time::timeout(self.inner.config.forward_reply_timeout, receiver).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => None,
                Err(_) => {
                    warn!("no reply to forward request for {}:{}", bind_addr, bind_port);
                    None
                }
            }
        } else {
            None
        };
        let mut forwards = self.inner.remote_forwards.lock().unwrap();
        match reply {
            Some(port) => {
                if bind_port == 0 && port != 0 {
                    if let Some(forward) = forwards.remove(&key) {
                        forwards.insert((bind_addr.to_string(), port), forward);
                    }
                }
                info!(
                    "remote forward {}:{} to {}:{}",
                    bind_addr,
                    if port != 0 { port } else { bind_port },
                    target_host,
                    target_port
                );
                true
            }
            None => {
                forwards.remove(&key);
                false
            }
        }
    }

    /// Forget the remote forward `addr:port`, and ask the remote side
    /// to stop listening. Returns whether there was such a forward.
    pub fn delete_remote_forward(&self, addr: &str, port: u32) -> bool {
        let existed = self
            .inner
            .remote_forwards
            .lock()
            .unwrap()
            .remove(&(addr.to_string(), port))
            .is_some();
        if existed {
            debug!("deleting remote forward {}:{}", addr, port);
            let mut packet = CryptoVec::new();
            packet.push(msg::GLOBAL_REQUEST);
            packet.extend_ssh_string(b"cancel-tcpip-forward");
            packet.push(0);
            packet.extend_ssh_string(addr.as_bytes());
            packet.push_u32_be(port);
            let _ = self.transmit(packet);
        }
        existed
    }

    /// Accept `x11` channels, authenticated with `mapping`, or refuse
    /// them if `None`.
    pub fn set_x11_mapping(&self, mapping: Option<X11Mapping>) {
        *self.inner.x11.lock().unwrap() = mapping
    }

    #[allow(missing_docs)]
    pub fn has_x11_mapping(&self) -> bool {
        self.inner.x11.lock().unwrap().is_some()
    }

    #[allow(missing_docs)]
    pub fn x11_mapping(&self) -> Option<X11Mapping> {
        self.inner.x11.lock().unwrap().clone()
    }
}
