use kconnect_protocol::{Channel, ConnectError, ConnectResult};
use tracing::debug;

/// Linger applied to every channel socket so process exit is not held up
/// by unsent messages.
pub const SOCKET_LINGER_MS: i32 = 1000;

pub fn socket_type(channel: Channel) -> zmq::SocketType {
    match channel {
        Channel::Hb => zmq::REQ,
        Channel::Shell | Channel::Stdin | Channel::Control => zmq::DEALER,
        Channel::Iopub => zmq::SUB,
    }
}

/// Creates the socket pattern `channel` uses and connects it to `url`.
/// iopub sockets subscribe to every topic. Connection errors propagate.
pub fn connect_socket(
    context: &zmq::Context,
    channel: Channel,
    url: &str,
    identity: Option<&[u8]>,
) -> ConnectResult<zmq::Socket> {
    let socket_error = |error: zmq::Error| ConnectError::Socket(format!("{channel} {url}: {error}"));

    debug!(%channel, url, "connecting channel socket");
    let socket = context.socket(socket_type(channel)).map_err(socket_error)?;
    socket.set_linger(SOCKET_LINGER_MS).map_err(socket_error)?;
    if let Some(identity) = identity.filter(|identity| !identity.is_empty()) {
        socket.set_identity(identity).map_err(socket_error)?;
    }
    socket.connect(url).map_err(socket_error)?;
    if channel == Channel::Iopub {
        socket.set_subscribe(b"").map_err(socket_error)?;
    }
    Ok(socket)
}
