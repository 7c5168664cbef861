//! RTP audio broadcast.
//!
//! A 12-byte RTP header (RFC 1889/3550) carries raw PCM per RFC 3551's
//! L16 payload types, sent over a broadcast, multicast, or unicast UDP
//! destination chosen at startup and fixed for the life of the process.

mod destination;
mod packet;
mod sender;

pub use destination::{bind_destination, DestinationError};
pub use packet::RtpPacketBuilder;
pub use sender::RtpSender;

use serde::{Deserialize, Serialize};

/// How the RTP destination socket is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtpMode {
    /// Send to a fixed broadcast address (`255.255.255.255`-style).
    Broadcast,
    /// Join and send to a multicast group.
    Multicast,
    /// Send to a single fixed unicast peer.
    Unicast,
    /// No fixed destination; peers attach via the `request` protocol
    /// command and are added to the send set individually.
    Request,
}
