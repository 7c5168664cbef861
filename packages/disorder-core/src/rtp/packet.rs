//! RTP packet framing.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{
    RTP_HEADER_BYTES, RTP_MARKER_BIT, RTP_PAYLOAD_TYPE_MONO, RTP_PAYLOAD_TYPE_STEREO, RTP_VERSION,
};

/// Builds RTP packets for a single stream: fixed SSRC, monotonically
/// increasing sequence number, and a sample-clock timestamp supplied by
/// the caller (the sender owns `rtp_time` bookkeeping; this type only
/// knows how to lay out bytes).
pub struct RtpPacketBuilder {
    ssrc: u32,
    seq: u16,
    stereo: bool,
}

impl RtpPacketBuilder {
    pub fn new(ssrc: u32, stereo: bool) -> Self {
        Self {
            ssrc,
            seq: 0,
            stereo,
        }
    }

    /// Builds one packet: a 12-byte header followed by `payload`. `marker`
    /// is set on the first packet transmitted after an idle gap, per the
    /// AVT profile's convention for talkspurt boundaries.
    pub fn build(&mut self, timestamp: u32, marker: bool, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_BYTES + payload.len());

        // V=2, P=0, X=0, CC=0
        buf.put_u8(RTP_VERSION << 6);

        let pt = if self.stereo {
            RTP_PAYLOAD_TYPE_STEREO
        } else {
            RTP_PAYLOAD_TYPE_MONO
        };
        buf.put_u8(if marker { RTP_MARKER_BIT } else { 0 } | pt);

        buf.put_u16(self.seq);
        self.seq = self.seq.wrapping_add(1);

        buf.put_u32(timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(payload);

        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_matches_rfc1889() {
        let mut builder = RtpPacketBuilder::new(0xdead_beef, true);
        let packet = builder.build(0, true, &[1, 2, 3, 4]);
        assert_eq!(packet[0], 0x80); // V=2
        assert_eq!(packet[1], 0x80 | 10); // marker | stereo payload type
        assert_eq!(&packet[4..8], &0u32.to_be_bytes());
        assert_eq!(&packet[8..12], &0xdead_beefu32.to_be_bytes());
        assert_eq!(&packet[12..], &[1, 2, 3, 4]);
    }

    #[test]
    fn sequence_number_increments_and_wraps() {
        let mut builder = RtpPacketBuilder::new(1, false);
        let first = builder.build(0, false, &[]);
        let second = builder.build(0, false, &[]);
        assert_eq!(u16::from_be_bytes([first[2], first[3]]), 0);
        assert_eq!(u16::from_be_bytes([second[2], second[3]]), 1);
        assert_eq!(second[1] & 0x7f, RTP_PAYLOAD_TYPE_MONO);
    }
}
