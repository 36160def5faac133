//! # Network Module
//!
//! This module provides the envelope transport over ZMQ. Each edge host binds a single `PULL`
//! socket on which it receives all envelopes addressed to any of its applications, and lazily
//! connects one `PUSH` socket per remote host it has to talk to.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;

use log::{debug, warn};
use serde::Deserialize;
use zmq::{Context, Socket, SocketType};

use crate::msg::Envelope;

// Export zmq
pub use zmq;

// ------------------------------------------------------------------------------------------------
// MACROS
// ------------------------------------------------------------------------------------------------

macro_rules! set_sockopts {
    ($socket:expr, $(($opt:ident, $val:expr)),+) => {
        $(
            $socket.$opt($val)
                .map_err(|e| NetError::SocketOptionError(stringify!($opt).into(), e))?;
        )+
    };
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Network parameters of an edge host.
#[derive(Debug, Clone, Deserialize)]
pub struct NetParams {
    /// Endpoint the inbound `PULL` socket binds to, for example `"tcp://*:5000"`
    pub bind_endpoint: String,

    /// Receive timeout of the inbound socket in milliseconds, bounds the time one call to
    /// [`Inbox::recv`] may block.
    pub recv_timeout_ms: i32,

    /// Send timeout of the outbound sockets in milliseconds
    pub send_timeout_ms: i32,
}

/// Represents options which can be set on a socket.
///
/// Most options here correspond to those found in the
/// [`zmq_setsockopt`](http://api.zeromq.org/4-2:zmq-setsockopt) documentation.
pub struct SocketOptions {
    /// Indicates if the socket should bind itself to the endpoint. The inbox binds, outbound
    /// sockets connect.
    pub bind: bool,

    /// `ZMQ_LINGER`: Set linger period for socket shutdown
    pub linger: i32,

    /// `ZMQ_RECONNECT_IVL`: Set reconnection interval
    pub reconnect_ivl: i32,

    /// `ZMQ_CONNECT_TIMEOUT`: Set `connect()` timeout
    pub connect_timeout: i32,

    /// `ZMQ_RCVTIMEO`: Maximum time before a recv operation returns with `EAGAIN`
    pub recv_timeout: i32,

    /// `ZMQ_SNDTIMEO`: Maximum time before a send operation returns with `EAGAIN`
    pub send_timeout: i32,

    /// `ZMQ_SNDHWM`/`ZMQ_RCVHWM`: High water mark for queued messages
    pub hwm: i32,
}

/// Inbound side of the transport.
pub struct Inbox {
    socket: Socket,
}

/// Outbound side of the transport, one `PUSH` socket per remote socket address.
pub struct Outbox {
    ctx: Context,
    send_timeout_ms: i32,
    sockets: HashMap<String, Socket>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum NetError {
    #[error("Error creating the socket: {0}")]
    CreateSocketError(zmq::Error),

    #[error("Could not bind or connect the socket to {0}: {1}")]
    CouldNotConnect(String, zmq::Error),

    #[error("Could not set the {0} socket option: {1}")]
    SocketOptionError(String, zmq::Error),

    #[error("Could not send an envelope to {0}: {1}")]
    SendError(String, zmq::Error),

    #[error("Could not receive an envelope: {0}")]
    RecvError(zmq::Error),

    #[error("Could not serialize the envelope: {0}")]
    SerializationError(serde_json::Error),

    #[error("Could not deserialize the envelope: {0}")]
    DeserializeError(serde_json::Error),

    #[error("Received a message which was not valid UTF-8")]
    NonUtf8Message,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Inbox {
    /// Bind the inbound socket of this host.
    pub fn new(ctx: &Context, params: &NetParams) -> Result<Self, NetError> {
        let opts = SocketOptions {
            bind: true,
            recv_timeout: params.recv_timeout_ms,
            ..Default::default()
        };

        let socket = open_socket(ctx, zmq::PULL, &opts, &params.bind_endpoint)?;

        Ok(Self { socket })
    }

    /// Receive the next envelope.
    ///
    /// If no envelope arrives before the receive timeout `Ok(None)` is returned.
    pub fn recv(&self) -> Result<Option<Envelope>, NetError> {
        let msg_str = match self.socket.recv_string(0) {
            Ok(Ok(s)) => s,
            Ok(Err(_)) => return Err(NetError::NonUtf8Message),
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(NetError::RecvError(e)),
        };

        serde_json::from_str(&msg_str)
            .map(Some)
            .map_err(NetError::DeserializeError)
    }
}

impl Outbox {
    pub fn new(ctx: &Context, params: &NetParams) -> Self {
        Self {
            ctx: ctx.clone(),
            send_timeout_ms: params.send_timeout_ms,
            sockets: HashMap::new(),
        }
    }

    /// Send an envelope to the socket of its destination endpoint, connecting to it first if
    /// this is the first envelope for that socket.
    pub fn send(&mut self, envelope: &Envelope) -> Result<(), NetError> {
        let addr = envelope.to.socket_addr();

        if !self.sockets.contains_key(&addr) {
            let opts = SocketOptions {
                send_timeout: self.send_timeout_ms,
                ..Default::default()
            };
            let socket = open_socket(&self.ctx, zmq::PUSH, &opts, &addr)?;
            debug!("Opened outbound socket to {}", addr);
            self.sockets.insert(addr.clone(), socket);
        }

        let msg_str = serde_json::to_string(envelope).map_err(NetError::SerializationError)?;

        match self.sockets.get(&addr) {
            Some(s) => s
                .send(&msg_str, 0)
                .map_err(|e| NetError::SendError(addr.clone(), e)),
            None => {
                warn!("Outbound socket to {} vanished before sending", addr);
                Ok(())
            }
        }
    }

    /// Close the outbound socket to the given address, if one is open.
    pub fn disconnect(&mut self, socket_addr: &str) {
        if self.sockets.remove(socket_addr).is_some() {
            debug!("Closed outbound socket to {}", socket_addr);
        }
    }
}

impl SocketOptions {
    /// Set these options on the given socket.
    pub fn set(&self, socket: &Socket) -> Result<(), NetError> {
        set_sockopts!(
            socket,
            (set_connect_timeout, self.connect_timeout),
            (set_linger, self.linger),
            (set_reconnect_ivl, self.reconnect_ivl),
            (set_rcvtimeo, self.recv_timeout),
            (set_sndtimeo, self.send_timeout),
            (set_sndhwm, self.hwm),
            (set_rcvhwm, self.hwm)
        );

        Ok(())
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            bind: false,
            linger: 100,
            reconnect_ivl: 100,
            connect_timeout: 1000,
            recv_timeout: 10,
            send_timeout: 10,
            hwm: 1000,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn open_socket(
    ctx: &Context,
    socket_type: SocketType,
    opts: &SocketOptions,
    endpoint: &str,
) -> Result<Socket, NetError> {
    let socket = ctx.socket(socket_type).map_err(NetError::CreateSocketError)?;

    opts.set(&socket)?;

    match opts.bind {
        true => socket.bind(endpoint),
        false => socket.connect(endpoint),
    }
    .map_err(|e| NetError::CouldNotConnect(endpoint.into(), e))?;

    Ok(socket)
}
