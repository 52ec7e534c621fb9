use crate::library::config::Direction;
use libc::c_int;
use socket2::{Domain, Protocol, Socket, Type};
use std::{io, os::fd::IntoRawFd, os::fd::RawFd};
use tracing::trace;

/// Open a socket on behalf of the transfer engine and tune it for bulk traffic.
/// Ownership of the returned descriptor passes to the caller.
pub fn prepare_outgoing_socket(
    family: c_int,
    socktype: c_int,
    protocol: c_int,
    buffer_hint: Option<usize>,
    direction: Direction,
) -> io::Result<RawFd> {
    // socket2 hands us CLOEXEC for free, so forked children never inherit a transfer.
    let socket: Socket = Socket::new(
        Domain::from(family),
        Type::from(socktype),
        Some(Protocol::from(protocol)),
    )?;
    if socktype == libc::SOCK_STREAM {
        // Disable Nagle. Request headers should not sit around waiting for company.
        socket.set_tcp_nodelay(true)?;
    }
    if let Some(size) = buffer_hint {
        match direction {
            Direction::Download => {
                socket.set_recv_buffer_size(size)?;
                // Check if the OS actually listened to us or just pretended to.
                trace!("Real rcvbuf size: {} bytes", socket.recv_buffer_size()?);
            }
            Direction::Upload => {
                socket.set_send_buffer_size(size)?;
                trace!("Real sndbuf size: {} bytes", socket.send_buffer_size()?);
            }
        }
    }
    let fd: RawFd = socket.into_raw_fd();
    trace!("Opened {direction} socket FD:{fd}");
    Ok(fd)
}
