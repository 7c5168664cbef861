//! RTP destination socket setup.
//!
//! Depending on [`RtpMode`](super::RtpMode) the socket either joins a
//! multicast group, sets `SO_BROADCAST`, or is left plain for
//! unicast/on-request peers. The socket is connected to its destination
//! so every subsequent `send` needs no per-packet address.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::utils::{validate_fixed_destination, AddressValidationError};

use super::RtpMode;

#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    #[error("invalid destination address: {0}")]
    Address(#[from] AddressValidationError),
    #[error("broadcast/multicast mode requires a destination address")]
    MissingDestination,
    #[error("socket setup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds and connects the UDP socket used to transmit RTP packets,
/// according to `mode`. `destination` and `bind_from` correspond to the
/// `broadcast`/`broadcast_from` configuration keys.
pub fn bind_destination(
    mode: RtpMode,
    destination: Option<SocketAddr>,
    bind_from: Option<SocketAddr>,
    multicast_ttl: u32,
    multicast_loop: bool,
) -> Result<UdpSocket, DestinationError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    match mode {
        RtpMode::Request => {
            // No fixed destination; bind to the wildcard address and let
            // per-connection `request` handling choose peers individually.
            let bind_addr: SocketAddr = bind_from.unwrap_or_else(|| {
                SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            });
            socket.bind(&bind_addr.into())?;
        }
        RtpMode::Broadcast => {
            let dest = destination.ok_or(DestinationError::MissingDestination)?;
            validate_fixed_destination(&dest.ip())?;
            socket.set_broadcast(true)?;
            if let Some(from) = bind_from {
                socket.bind(&from.into())?;
            }
            socket.connect(&dest.into())?;
        }
        RtpMode::Multicast => {
            let dest = destination.ok_or(DestinationError::MissingDestination)?;
            let group = validate_fixed_destination(&dest.ip())?;
            socket.set_multicast_ttl_v4(multicast_ttl)?;
            socket.set_multicast_loop_v4(multicast_loop)?;
            let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, dest.port());
            socket.bind(&bind_addr.into())?;
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
            socket.connect(&dest.into())?;
        }
        RtpMode::Unicast => {
            let dest = destination.ok_or(DestinationError::MissingDestination)?;
            if let Some(from) = bind_from {
                socket.bind(&from.into())?;
            }
            socket.connect(&dest.into())?;
        }
    }

    // §4.E: "Enlarge SO_SNDBUF to 128 KiB" so a burst of queued packets
    // (pacing catch-up after a stall, or several unicast `rtp-request`
    // destinations fanning out the same tick) doesn't hit EWOULDBLOCK on
    // the kernel's default send buffer.
    socket.set_send_buffer_size(131_072)?;

    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_buffer_is_enlarged_to_at_least_128kib() {
        let socket = bind_destination(RtpMode::Request, None, None, 1, false).unwrap();
        let socket2 = socket2::Socket::from(socket.into_std().unwrap());
        let size = socket2.send_buffer_size().unwrap();
        assert!(size >= 131_072, "send buffer was only {size} bytes");
    }
}
