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
use std::net::SocketAddr;

use crate::channel::ChannelInfo;
use crate::connection::Connection;
use crate::connector::OpenRequest;
use crate::{ChannelId, Error};

/// Events of a connection. All methods have a default
/// implementation doing nothing, override the ones you need.
///
/// Methods are called from the tasks of the connection (the
/// connector, the channel pumps and the listeners), and must not
/// block.
#[allow(unused_variables)]
pub trait Handler: Send + Sync {
    /// A channel was added to the channel table.
    fn channel_added(&self, connection: &Connection, channel: ChannelId) {}

    /// A channel was removed from the channel table.
    fn channel_deleted(&self, connection: &Connection, channel: ChannelId) {}

    /// Both sides of a channel have closed it.
    fn channel_closed(&self, connection: &Connection, channel: ChannelId) {}

    /// A forwarding listener accepted a connection.
    fn listener_accept(&self, listener: SocketAddr, peer: SocketAddr) {}

    /// A connection to a local forward was tunnelled to the remote side.
    fn local_direct_connect(&self, connection: &Connection, channel: &ChannelInfo) {}

    /// A connection to a listener bound on behalf of the remote side
    /// was tunnelled back to it.
    fn local_forwarded_connect(&self, connection: &Connection, channel: &ChannelInfo) {}

    /// The remote side refused a channel we tried to open.
    fn local_channel_open_failure(&self, connection: &Connection, channel_type: &str, error: &Error) {}

    /// The remote side opened a channel for a forward we requested.
    fn remote_forwarded_connect(
        &self,
        connection: &Connection,
        remote_addr: &str,
        remote_port: u32,
        channel: &ChannelInfo,
    ) {
    }

    /// The remote side opened a direct TCP channel.
    fn remote_direct_connect(&self, connection: &Connection, channel: &ChannelInfo) {}

    /// The remote side opened an X11 channel.
    fn remote_x11_connect(&self, connection: &Connection, channel: &ChannelInfo) {}

    /// A channel open request from the remote side failed. The refusal
    /// is reported back to it unless the connection is gone.
    fn remote_channel_open_failure(&self, connection: &Connection, request: &OpenRequest, error: &Error) {}
}

impl Handler for () {}
