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
//! Channels: flow-controlled byte streams multiplexed over a connection.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use cryptovec::CryptoVec;
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::{AbortHandle, JoinError, JoinHandle};

use crate::config::Config;
use crate::connection::Link;
use crate::encoding::Encoding;
use crate::filter::{FilterPair, StreamFilter};
use crate::{msg, ChannelId, Error};

const PUMP_BUFFER_SIZE: usize = 16384;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the open confirmation.
    Opening,
    /// Data may flow.
    Open,
    /// One side has closed the channel, waiting for the other.
    Closing,
    /// Both sides have closed the channel, or the connection stopped.
    Closed,
}

/// Errors of channel I/O.
#[derive(Debug)]
pub enum ChannelError {
    /// The channel was closed.
    Closed,
    /// Local socket error.
    Io(std::io::Error),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            ChannelError::Closed => write!(f, "Channel closed"),
            ChannelError::Io(ref e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            ChannelError::Io(ref e) => Some(e),
            ChannelError::Closed => None,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Io(e)
    }
}

/// Description of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Our identifier.
    pub id: ChannelId,
    /// The identifier on the remote side.
    pub peer_id: u32,
    /// `direct-tcpip`, `forwarded-tcpip`, `x11`…
    pub channel_type: String,
    /// Where the channel goes.
    pub target_host: String,
    #[allow(missing_docs)]
    pub target_port: u32,
    /// Where the channel comes from.
    pub origin_host: String,
    #[allow(missing_docs)]
    pub origin_port: u32,
}

pub(crate) enum ChannelMsg {
    Data(Bytes),
    Eof,
}

#[derive(Debug)]
struct Windows {
    state: ChannelState,
    peer_id: u32,
    tx_window: u32,
    tx_max_packet: u32,
    rx_window: u32,
    rx_initial: u32,
    rx_max_packet: u32,
    /// Bytes consumed by the application, not yet given back to the
    /// remote side.
    rx_unacked: u32,
    sent_eof: bool,
    sent_close: bool,
    received_close: bool,
}

/// The part of a channel shared between the connection (which routes
/// incoming messages to it) and the application.
pub(crate) struct ChannelShared {
    info: ChannelInfo,
    windows: Mutex<Windows>,
    window_changed: Notify,
    link: Link,
}

impl ChannelShared {
    pub(crate) fn new(info: ChannelInfo, config: &Config, link: Link) -> Self {
        let peer_id = info.peer_id;
        ChannelShared {
            info,
            windows: Mutex::new(Windows {
                state: ChannelState::Opening,
                peer_id,
                tx_window: 0,
                tx_max_packet: 0,
                rx_window: config.window_size,
                rx_initial: config.window_size,
                rx_max_packet: config.maximum_packet_size,
                rx_unacked: 0,
                sent_eof: false,
                sent_close: false,
                received_close: false,
            }),
            window_changed: Notify::new(),
            link,
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.info.id
    }

    pub(crate) fn info(&self) -> ChannelInfo {
        let mut info = self.info.clone();
        info.peer_id = self.windows.lock().unwrap().peer_id;
        info
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.windows.lock().unwrap().state
    }

    pub(crate) fn peer_id(&self) -> u32 {
        self.windows.lock().unwrap().peer_id
    }

    /// Our initial window and maximum packet size, as advertised.
    pub(crate) fn local_window(&self) -> (u32, u32) {
        let w = self.windows.lock().unwrap();
        (w.rx_initial, w.rx_max_packet)
    }

    pub(crate) fn tx_window(&self) -> u32 {
        self.windows.lock().unwrap().tx_window
    }

    pub(crate) fn rx_window(&self) -> u32 {
        self.windows.lock().unwrap().rx_window
    }

    /// Opening → Open, with the parameters of the remote side.
    pub(crate) fn confirm(&self, peer_id: u32, window: u32, max_packet: u32) -> bool {
        let confirmed = {
            let mut w = self.windows.lock().unwrap();
            if w.state == ChannelState::Opening {
                w.state = ChannelState::Open;
                w.peer_id = peer_id;
                w.tx_window = window;
                w.tx_max_packet = max_packet;
                true
            } else {
                false
            }
        };
        self.window_changed.notify_waiters();
        confirmed
    }

    pub(crate) fn adjust_tx_window(&self, amount: u32) -> Result<(), Error> {
        {
            let mut w = self.windows.lock().unwrap();
            w.tx_window = w.tx_window.checked_add(amount).ok_or_else(|| {
                Error::ProtocolViolation(format!("channel {}: window adjust overflow", self.info.id))
            })?;
            debug!("channel {}: window adjusted to {}", self.info.id, w.tx_window);
        }
        self.window_changed.notify_waiters();
        Ok(())
    }

    /// Account for `len` bytes received from the remote side.
    pub(crate) fn received_data(&self, len: usize) -> Result<(), Error> {
        let mut w = self.windows.lock().unwrap();
        if len > w.rx_max_packet as usize {
            return Err(Error::ProtocolViolation(format!(
                "channel {}: packet of {} bytes, maximum is {}",
                self.info.id, len, w.rx_max_packet
            )));
        }
        if len > w.rx_window as usize {
            return Err(Error::ProtocolViolation(format!(
                "channel {}: window overrun, {} bytes sent with {} left",
                self.info.id, len, w.rx_window
            )));
        }
        w.rx_window -= len as u32;
        Ok(())
    }

    /// Account for `len` bytes consumed by the application, and give
    /// credit back to the remote side once half of the window is used.
    pub(crate) fn consumed(&self, len: usize) {
        let mut w = self.windows.lock().unwrap();
        w.rx_unacked = w.rx_unacked.saturating_add(len as u32);
        if w.state != ChannelState::Open || w.sent_close {
            return;
        }
        if w.rx_unacked > 0 && w.rx_window <= w.rx_initial / 2 {
            let mut packet = CryptoVec::new();
            packet.push(msg::CHANNEL_WINDOW_ADJUST);
            packet.push_u32_be(w.peer_id);
            packet.push_u32_be(w.rx_unacked);
            if self.link.transmit(packet).is_ok() {
                w.rx_window = w.rx_window.saturating_add(w.rx_unacked);
                w.rx_unacked = 0;
            }
        }
    }

    pub(crate) async fn write(&self, data: &[u8]) -> Result<usize, ChannelError> {
        let mut written = 0;
        while written < data.len() {
            let notified = self.window_changed.notified();
            {
                let mut w = self.windows.lock().unwrap();
                match w.state {
                    ChannelState::Closing | ChannelState::Closed => return Err(ChannelError::Closed),
                    _ if w.sent_eof => return Err(ChannelError::Closed),
                    ChannelState::Opening => {}
                    ChannelState::Open => {
                        let credit = std::cmp::min(w.tx_window, w.tx_max_packet) as usize;
                        let n = std::cmp::min(data.len() - written, credit);
                        if n > 0 {
                            let mut packet = CryptoVec::new();
                            packet.push(msg::CHANNEL_DATA);
                            packet.push_u32_be(w.peer_id);
                            packet.extend_ssh_string(&data[written..written + n]);
                            self.link.transmit(packet).map_err(|_| ChannelError::Closed)?;
                            w.tx_window -= n as u32;
                            written += n;
                            continue;
                        }
                    }
                }
            }
            notified.await
        }
        Ok(written)
    }

    pub(crate) fn eof(&self) {
        let mut w = self.windows.lock().unwrap();
        if w.state != ChannelState::Open || w.sent_eof || w.sent_close {
            return;
        }
        w.sent_eof = true;
        let mut packet = CryptoVec::new();
        packet.push(msg::CHANNEL_EOF);
        packet.push_u32_be(w.peer_id);
        let _ = self.link.transmit(packet);
    }

    pub(crate) fn close(&self) {
        let closed = {
            let mut w = self.windows.lock().unwrap();
            if w.sent_close || w.state == ChannelState::Closed || w.state == ChannelState::Opening {
                return;
            }
            w.sent_close = true;
            let mut packet = CryptoVec::new();
            packet.push(msg::CHANNEL_CLOSE);
            packet.push_u32_be(w.peer_id);
            let _ = self.link.transmit(packet);
            w.state = if w.received_close {
                ChannelState::Closed
            } else {
                ChannelState::Closing
            };
            w.state == ChannelState::Closed
        };
        self.window_changed.notify_waiters();
        if closed {
            self.link.finish_channel(self.info.id)
        }
    }

    /// The remote side closed the channel. Returns whether both sides
    /// have now closed it.
    pub(crate) fn peer_close(&self) -> bool {
        let closed = {
            let mut w = self.windows.lock().unwrap();
            w.received_close = true;
            if w.sent_close {
                w.state = ChannelState::Closed;
                true
            } else {
                if w.state != ChannelState::Closed {
                    w.state = ChannelState::Closing
                }
                false
            }
        };
        self.window_changed.notify_waiters();
        closed
    }

    /// The connection is going away: fail pending writes immediately.
    pub(crate) fn hard_close(&self) {
        self.windows.lock().unwrap().state = ChannelState::Closed;
        self.window_changed.notify_waiters();
    }
}

/// The application's hold on a channel, shared by a `Channel` or its
/// halves. The channel is closed once the last one is dropped.
struct Owned(Arc<ChannelShared>);

impl std::ops::Deref for Owned {
    type Target = ChannelShared;
    fn deref(&self) -> &ChannelShared {
        &self.0
    }
}

impl Drop for Owned {
    fn drop(&mut self) {
        self.0.close()
    }
}

/// A channel, as seen by the application. Dropping it (or both of its
/// halves) closes it.
pub struct Channel {
    shared: Arc<Owned>,
    receiver: mpsc::UnboundedReceiver<ChannelMsg>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.debug_struct("Channel")
            .field("id", &self.shared.id())
            .field("state", &self.shared.state())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>, receiver: mpsc::UnboundedReceiver<ChannelMsg>) -> Self {
        Channel {
            shared: Arc::new(Owned(shared)),
            receiver,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared.0
    }

    /// Our identifier of this channel.
    pub fn id(&self) -> ChannelId {
        self.shared.id()
    }

    /// Description of this channel.
    pub fn info(&self) -> ChannelInfo {
        self.shared.info()
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Bytes we may still send before the remote side adjusts the window.
    pub fn tx_window(&self) -> u32 {
        self.shared.tx_window()
    }

    /// Bytes the remote side may still send.
    pub fn rx_window(&self) -> u32 {
        self.shared.rx_window()
    }

    /// Send `data`, waiting for window adjustments as needed. Fails
    /// with [`ChannelError::Closed`] if the channel closes meanwhile.
    pub async fn write(&self, data: &[u8]) -> Result<usize, ChannelError> {
        self.shared.write(data).await
    }

    /// Receive the next data from the remote side. An empty buffer
    /// means end of file, or that the channel was closed.
    pub async fn read(&mut self) -> Result<Bytes, ChannelError> {
        read(&self.shared, &mut self.receiver).await
    }

    /// Send end of file: we won't write anymore.
    pub fn eof(&self) {
        self.shared.eof()
    }

    /// Close the channel. It is removed from the connection once the
    /// remote side has closed it too.
    pub fn close(&self) {
        self.shared.close()
    }

    /// Split into a reading half and a writing half, to be used from
    /// different tasks.
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (
            ChannelReader {
                shared: self.shared.clone(),
                receiver: self.receiver,
            },
            ChannelWriter { shared: self.shared },
        )
    }
}

async fn read(
    shared: &ChannelShared,
    receiver: &mut mpsc::UnboundedReceiver<ChannelMsg>,
) -> Result<Bytes, ChannelError> {
    match receiver.recv().await {
        Some(ChannelMsg::Data(data)) => {
            shared.consumed(data.len());
            Ok(data)
        }
        Some(ChannelMsg::Eof) | None => Ok(Bytes::new()),
    }
}

/// The reading half of a channel.
pub struct ChannelReader {
    shared: Arc<Owned>,
    receiver: mpsc::UnboundedReceiver<ChannelMsg>,
}

impl ChannelReader {
    /// See [`Channel::read`].
    pub async fn read(&mut self) -> Result<Bytes, ChannelError> {
        read(&self.shared, &mut self.receiver).await
    }
}

/// The writing half of a channel.
pub struct ChannelWriter {
    shared: Arc<Owned>,
}

impl ChannelWriter {
    /// See [`Channel::write`].
    pub async fn write(&self, data: &[u8]) -> Result<usize, ChannelError> {
        self.shared.write(data).await
    }

    /// See [`Channel::eof`].
    pub fn eof(&self) {
        self.shared.eof()
    }

    /// See [`Channel::close`].
    pub fn close(&self) {
        self.shared.close()
    }
}

/// Start moving bytes between `stream` and `channel`, through
/// `filters`. The channel must be open already. Returns the handles of
/// the spawned tasks, so that the connection can abort them.
pub(crate) fn spawn_pumps(channel: Channel, stream: TcpStream, filters: FilterPair) -> Vec<AbortHandle> {
    let _ = stream.set_nodelay(true);
    let shared = channel.shared().clone();
    let (reader, writer) = channel.split();
    let (read_half, write_half) = stream.into_split();
    let outbound = tokio::spawn(local_to_peer(read_half, writer, filters.input));
    let inbound = tokio::spawn(peer_to_local(reader, write_half, filters.output));
    let mut handles = vec![outbound.abort_handle(), inbound.abort_handle()];
    let supervisor = tokio::spawn(supervise(shared, outbound, inbound));
    handles.push(supervisor.abort_handle());
    handles
}

async fn supervise(
    shared: Arc<ChannelShared>,
    mut outbound: JoinHandle<Result<(), Error>>,
    mut inbound: JoinHandle<Result<(), Error>>,
) {
    let id = shared.id();
    let mut outbound_done = false;
    let mut inbound_done = false;
    while !(outbound_done && inbound_done) {
        tokio::select! {
            r = &mut outbound, if !outbound_done => {
                outbound_done = true;
                if !pump_finished(id, "local to remote", r) {
                    break
                }
            }
            r = &mut inbound, if !inbound_done => {
                inbound_done = true;
                if !pump_finished(id, "remote to local", r) {
                    break
                }
                // The remote side closed: everything it sent is written.
                if shared.state() != ChannelState::Open {
                    break
                }
            }
        }
    }
    shared.close();
    outbound.abort();
    inbound.abort();
}

fn pump_finished(id: ChannelId, direction: &str, r: Result<Result<(), Error>, JoinError>) -> bool {
    match r {
        Ok(Ok(())) => {
            debug!("channel {}: {} done", id, direction);
            true
        }
        Ok(Err(Error::ChannelClosed)) => {
            debug!("channel {}: {} closed", id, direction);
            false
        }
        Ok(Err(e)) => {
            warn!("channel {}: {}: {}", id, direction, e);
            false
        }
        Err(e) => {
            debug!("channel {}: {}: {}", id, direction, e);
            false
        }
    }
}

async fn local_to_peer(
    mut socket: OwnedReadHalf,
    writer: ChannelWriter,
    mut filter: Option<Box<dyn StreamFilter>>,
) -> Result<(), Error> {
    let result = copy_to_channel(&mut socket, &writer, &mut filter).await;
    if let Some(ref mut filter) = filter {
        filter.close().await
    }
    result?;
    writer.eof();
    Ok(())
}

async fn copy_to_channel(
    socket: &mut OwnedReadHalf,
    writer: &ChannelWriter,
    filter: &mut Option<Box<dyn StreamFilter>>,
) -> Result<(), Error> {
    let mut buf = vec![0; PUMP_BUFFER_SIZE];
    loop {
        let n = socket.read(&mut buf).await.map_err(Error::ChannelIo)?;
        if n == 0 {
            break;
        }
        let data = Bytes::copy_from_slice(&buf[..n]);
        let data = match *filter {
            Some(ref mut filter) => filter.filter(data).await?,
            None => data,
        };
        if !data.is_empty() {
            writer.write(&data).await?;
        }
    }
    if let Some(ref mut filter) = *filter {
        let rest = filter.finish();
        if !rest.is_empty() {
            writer.write(&rest).await?;
        }
    }
    Ok(())
}

async fn peer_to_local(
    mut reader: ChannelReader,
    mut socket: OwnedWriteHalf,
    mut filter: Option<Box<dyn StreamFilter>>,
) -> Result<(), Error> {
    let result = copy_from_channel(&mut reader, &mut socket, &mut filter).await;
    if let Some(ref mut filter) = filter {
        filter.close().await
    }
    result?;
    let _ = socket.shutdown().await;
    Ok(())
}

async fn copy_from_channel(
    reader: &mut ChannelReader,
    socket: &mut OwnedWriteHalf,
    filter: &mut Option<Box<dyn StreamFilter>>,
) -> Result<(), Error> {
    loop {
        let data = reader.read().await?;
        if data.is_empty() {
            break;
        }
        let data = match *filter {
            Some(ref mut filter) => filter.filter(data).await?,
            None => data,
        };
        socket.write_all(&data).await.map_err(Error::ChannelIo)?;
    }
    if let Some(ref mut filter) = *filter {
        let rest = filter.finish();
        if !rest.is_empty() {
            socket.write_all(&rest).await.map_err(Error::ChannelIo)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Reader;
    use std::sync::Weak;
    use std::time::Duration;

    fn channel(peer_window: u32, max_packet: u32) -> (Channel, mpsc::UnboundedSender<ChannelMsg>, mpsc::UnboundedReceiver<CryptoVec>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let mut config = Config::default();
        config.window_size = 100;
        config.maximum_packet_size = 64;
        let info = ChannelInfo {
            id: ChannelId(3),
            peer_id: 0,
            channel_type: "direct-tcpip".to_string(),
            target_host: "localhost".to_string(),
            target_port: 80,
            origin_host: "127.0.0.1".to_string(),
            origin_port: 5000,
        };
        let shared = Arc::new(ChannelShared::new(info, &config, Link::new(out_tx, Weak::new())));
        assert!(shared.confirm(17, peer_window, max_packet));
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (Channel::new(shared, in_rx), in_tx, out_rx)
    }

    fn data_len(packet: &CryptoVec) -> usize {
        assert_eq!(packet[0], msg::CHANNEL_DATA);
        let mut r = packet.reader(1);
        assert_eq!(r.read_u32().unwrap(), 17);
        r.read_string().unwrap().len()
    }

    #[tokio::test]
    async fn write_respects_window_and_packet_size() {
        let (channel, _in_tx, mut out) = channel(10, 4);
        let shared = channel.shared().clone();
        let writer = shared.clone();
        let task = tokio::spawn(async move { writer.write(&[1; 25]).await });
        let mut sent = 0;
        while sent < 10 {
            let p = out.recv().await.unwrap();
            let n = data_len(&p);
            assert!(n <= 4);
            sent += n;
        }
        assert_eq!(sent, 10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(out.try_recv().is_err());
        assert_eq!(shared.tx_window(), 0);

        shared.adjust_tx_window(15).unwrap();
        while sent < 25 {
            sent += data_len(&out.recv().await.unwrap());
        }
        assert_eq!(task.await.unwrap().unwrap(), 25);
        assert_eq!(shared.tx_window(), 0);
    }

    #[tokio::test]
    async fn write_fails_when_closed() {
        let (channel, _in_tx, _out) = channel(0, 4);
        let shared = channel.shared.clone();
        let task = tokio::spawn(async move { channel.write(b"blocked").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shared.peer_close());
        match task.await.unwrap() {
            Err(ChannelError::Closed) => {}
            x => panic!("unexpected {:?}", x),
        }
    }

    #[tokio::test]
    async fn read_gives_credit_back() {
        let (mut channel, in_tx, mut out) = channel(10, 4);
        let deliver = |channel: &Channel| {
            channel.shared.received_data(20).unwrap();
            let _ = in_tx.send(ChannelMsg::Data(Bytes::from(vec![0; 20])));
        };
        deliver(&channel);
        deliver(&channel);
        assert_eq!(channel.rx_window(), 60);
        channel.read().await.unwrap();
        // 60 bytes left is more than half of 100.
        assert!(out.try_recv().is_err());
        deliver(&channel);
        channel.read().await.unwrap();
        let p = out.recv().await.unwrap();
        assert_eq!(p[0], msg::CHANNEL_WINDOW_ADJUST);
        let mut r = p.reader(1);
        assert_eq!(r.read_u32().unwrap(), 17);
        assert_eq!(r.read_u32().unwrap(), 40);
        assert_eq!(channel.rx_window(), 80);
    }

    #[test]
    fn overrun_is_a_violation() {
        let (channel, _in_tx, _out) = channel(10, 4);
        channel.shared.received_data(60).unwrap();
        let e = channel.shared.received_data(50).unwrap_err();
        assert!(e.is_fatal());
        // Larger than the maximum packet size.
        assert!(channel.shared.received_data(65).is_err());
        assert!(channel.shared.adjust_tx_window(u32::MAX).is_err());
    }

    #[tokio::test]
    async fn close_handshake() {
        let (mut channel, in_tx, mut out) = channel(10, 4);
        channel.eof();
        channel.eof();
        assert_eq!(out.recv().await.unwrap()[0], msg::CHANNEL_EOF);
        channel.close();
        assert_eq!(out.recv().await.unwrap()[0], msg::CHANNEL_CLOSE);
        assert_eq!(channel.state(), ChannelState::Closing);
        channel.close();
        assert!(out.try_recv().is_err());
        assert!(channel.shared.peer_close());
        assert_eq!(channel.state(), ChannelState::Closed);
        drop(in_tx);
        assert!(channel.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropping_closes() {
        let (channel, _in_tx, mut out) = channel(10, 4);
        let (reader, writer) = channel.split();
        drop(writer);
        assert!(out.try_recv().is_err());
        let shared = reader.shared.0.clone();
        drop(reader);
        let p = out.recv().await.unwrap();
        assert_eq!(p[0], msg::CHANNEL_CLOSE);
        assert_eq!(p.reader(1).read_u32().unwrap(), 17);
        assert_eq!(shared.state(), ChannelState::Closing);
        assert!(shared.peer_close());
    }

    #[tokio::test]
    async fn hard_close() {
        let (mut channel, in_tx, mut out) = channel(10, 4);
        channel.shared.hard_close();
        drop(in_tx);
        assert!(channel.read().await.unwrap().is_empty());
        assert!(channel.write(b"x").await.is_err());
        // Nothing is sent once the connection is gone.
        channel.close();
        assert!(out.try_recv().is_err());
    }
}
