//! Sample-clocked RTP packet sender.
//!
//! A 64-bit sample counter (`rtp_time`) is paced against the wall clock
//! so the receiver's jitter buffer sees a steady stream, with the
//! idle-gap skip and marker-bit behavior RFC 3550 §5.1 expects at the
//! start of a talkspurt.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::net::UdpSocket;

use crate::constants::{BYTES_PER_SAMPLE, RTP_ERROR_ABORT_THRESHOLD, SAMPLE_RATE_HZ};

use super::packet::RtpPacketBuilder;
use super::RtpMode;

struct ClockState {
    session_start: Instant,
    /// Samples transmitted since `session_start`, counting each channel of
    /// a stereo frame separately (so a stereo frame advances this by 2).
    rtp_time: u64,
    /// True once a gap has been observed; causes the next packet sent to
    /// carry the marker bit and to re-sync `rtp_time` to the wall clock.
    pending_resync: bool,
}

/// Transmits a continuous RTP audio stream, pacing packets against the
/// wall clock and recovering gracefully across idle gaps.
pub struct RtpSender {
    socket: UdpSocket,
    mode: RtpMode,
    /// Dynamic unicast peers registered via `rtp-request`. Only consulted
    /// in [`RtpMode::Request`]; fixed modes use the socket's connected
    /// peer instead.
    destinations: RwLock<HashSet<SocketAddr>>,
    builder: Mutex<RtpPacketBuilder>,
    clock: Mutex<ClockState>,
    ahead: Duration,
    max_payload: usize,
    channels: u8,
    error_count: AtomicU32,
    aborted: std::sync::atomic::AtomicBool,
}

impl RtpSender {
    /// Builds a sender around an already-configured destination socket
    /// (see [`super::destination::bind_destination`]).
    pub fn new(socket: UdpSocket, mode: RtpMode, stereo: bool, ahead: Duration, max_payload: usize) -> Self {
        let ssrc = rand::rng().next_u32();
        Self {
            socket,
            mode,
            destinations: RwLock::new(HashSet::new()),
            builder: Mutex::new(RtpPacketBuilder::new(ssrc, stereo)),
            clock: Mutex::new(ClockState {
                session_start: Instant::now(),
                rtp_time: 0,
                pending_resync: true,
            }),
            ahead,
            max_payload,
            channels: if stereo { 2 } else { 1 },
            error_count: AtomicU32::new(0),
            aborted: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Registers a dynamic unicast destination (`rtp-request`). No-op
    /// outside [`RtpMode::Request`].
    pub fn add_destination(&self, addr: SocketAddr) {
        self.destinations.write().insert(addr);
    }

    /// Removes a dynamic unicast destination (`rtp-cancel`, or implicitly
    /// on connection close).
    pub fn remove_destination(&self, addr: SocketAddr) {
        self.destinations.write().remove(&addr);
    }

    /// True once the error counter has hit [`RTP_ERROR_ABORT_THRESHOLD`].
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// True if the next packet will resynchronize `rtp_time` to the wall
    /// clock and carry the marker bit — i.e. [`Self::note_idle`] was
    /// called and no packet has been sent since.
    pub fn is_idle_pending(&self) -> bool {
        self.clock.lock().pending_resync
    }

    /// Samples transmitted so far this session (see [`ClockState::rtp_time`]).
    pub fn rtp_time(&self) -> u64 {
        self.clock.lock().rtp_time
    }

    fn frame_bytes(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Marks the sender idle: the next call to [`Self::send_pcm`] or
    /// [`Self::send_silence`] will resynchronize `rtp_time` to the wall
    /// clock and carry the marker bit, per the idle-gap discipline.
    pub fn note_idle(&self) {
        self.clock.lock().pending_resync = true;
    }

    fn samples_to_duration(&self, samples: u64) -> Duration {
        let per_channel = samples / self.channels.max(1) as u64;
        Duration::from_secs_f64(per_channel as f64 / SAMPLE_RATE_HZ as f64)
    }

    fn elapsed_samples(&self, since: Instant) -> u64 {
        let secs = since.elapsed().as_secs_f64();
        (secs * SAMPLE_RATE_HZ as f64 * self.channels as f64) as u64
    }

    /// Resyncs `rtp_time` on resume from an idle gap: if the wall clock
    /// has moved further than our packet clock, skip forward over the
    /// silence. If our packet clock is still ahead (we had buffered more
    /// than the ahead window before going idle), leave it alone so pacing
    /// naturally catches down.
    fn resync_if_pending(&self, clock: &mut ClockState) -> bool {
        if !clock.pending_resync {
            return false;
        }
        clock.pending_resync = false;
        let target = self.elapsed_samples(clock.session_start);
        if target > clock.rtp_time {
            clock.rtp_time = target;
        }
        true
    }

    /// Blocks until pacing allows the next packet: stops sending once
    /// `rtp_time` is more than `ahead` in front of the wall clock.
    async fn pace(&self, rtp_time: u64, session_start: Instant) {
        loop {
            let target = self.elapsed_samples(session_start);
            let ahead_samples =
                (self.ahead.as_secs_f64() * SAMPLE_RATE_HZ as f64 * self.channels as f64) as u64;
            if rtp_time <= target.saturating_add(ahead_samples) {
                return;
            }
            let overrun = rtp_time - target - ahead_samples;
            tokio::time::sleep(self.samples_to_duration(overrun.max(1))).await;
        }
    }

    /// Transmits `pcm` (raw big-endian L16 samples) as one or more RTP
    /// packets, advancing the sample clock and pacing against the wall
    /// clock. `pcm` is chunked to respect `max_payload`, aligned to whole
    /// sample frames.
    pub async fn send_pcm(&self, pcm: &[u8]) -> std::io::Result<()> {
        if self.is_aborted() || pcm.is_empty() {
            return Ok(());
        }
        let frame = self.frame_bytes();
        let chunk_frames = (self.max_payload / frame).max(1);
        let chunk_bytes = chunk_frames * frame;

        for chunk in pcm.chunks(chunk_bytes) {
            let (timestamp, marker, session_start) = {
                let mut clock = self.clock.lock();
                let marker = self.resync_if_pending(&mut clock);
                let timestamp = clock.rtp_time;
                (timestamp, marker, clock.session_start)
            };

            self.pace(timestamp, session_start).await;

            let packet = {
                let mut builder = self.builder.lock();
                builder.build(timestamp as u32, marker, chunk)
            };
            self.transmit(packet).await;

            let frames = chunk.len() / frame;
            self.clock.lock().rtp_time += (frames * self.channels as usize) as u64;
        }
        Ok(())
    }

    /// Sends one empty-payload packet carrying the current timestamp, used
    /// while the playing track is paused so receivers keep their clock
    /// without decoding any audio.
    pub async fn send_silence(&self) -> std::io::Result<()> {
        if self.is_aborted() {
            return Ok(());
        }
        let (timestamp, marker, session_start) = {
            let mut clock = self.clock.lock();
            let marker = self.resync_if_pending(&mut clock);
            (clock.rtp_time, marker, clock.session_start)
        };
        self.pace(timestamp, session_start).await;
        let packet = {
            let mut builder = self.builder.lock();
            builder.build(timestamp as u32, marker, &[])
        };
        self.transmit(packet).await;
        Ok(())
    }

    async fn transmit(&self, packet: Bytes) {
        let result = match self.mode {
            RtpMode::Request => {
                let dests: Vec<SocketAddr> = self.destinations.read().iter().copied().collect();
                let mut last = Ok(0);
                for dest in dests {
                    last = self.socket.send_to(&packet, dest).await;
                }
                last
            }
            _ => self.socket.send(&packet).await,
        };

        match result {
            Ok(_) => {
                // Halve the error count on a clean send (exponential decay).
                let mut count = self.error_count.load(Ordering::Relaxed);
                while count > 0 {
                    match self.error_count.compare_exchange_weak(
                        count,
                        count / 2,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(observed) => count = observed,
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%err, "rtp send failed");
                let prev = self.error_count.fetch_add(1, Ordering::Relaxed);
                if prev + 1 >= RTP_ERROR_ABORT_THRESHOLD {
                    tracing::error!("rtp sender aborting after repeated send errors");
                    self.aborted.store(true, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Shared handle used by connection handlers to register/deregister
/// `rtp-request` unicast destinations.
pub type SharedRtpSender = Arc<RtpSender>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::destination::bind_destination;

    async fn loopback_sender(mode: RtpMode) -> RtpSender {
        let dest: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = bind_destination(mode, Some(dest), None, 1, false).unwrap();
        RtpSender::new(socket, mode, true, Duration::from_millis(200), 1400)
    }

    #[tokio::test]
    async fn rtp_time_advances_by_frame_count() {
        let sender = loopback_sender(RtpMode::Unicast).await;
        let pcm = vec![0u8; 4 * 100]; // 100 stereo frames
        sender.send_pcm(&pcm).await.unwrap();
        assert_eq!(sender.clock.lock().rtp_time, 200);
    }

    #[tokio::test]
    async fn marker_set_only_on_first_packet_after_idle() {
        let sender = loopback_sender(RtpMode::Unicast).await;
        let pcm = vec![0u8; 4 * 10];
        sender.send_pcm(&pcm).await.unwrap();
        assert!(!sender.clock.lock().pending_resync);

        sender.note_idle();
        assert!(sender.clock.lock().pending_resync);
        sender.send_pcm(&pcm).await.unwrap();
        assert!(!sender.clock.lock().pending_resync);
    }

    #[tokio::test]
    async fn request_mode_destinations_can_be_added_and_removed() {
        let sender = loopback_sender(RtpMode::Request).await;
        let peer: SocketAddr = "127.0.0.1:5004".parse().unwrap();
        sender.add_destination(peer);
        assert!(sender.destinations.read().contains(&peer));
        sender.remove_destination(peer);
        assert!(!sender.destinations.read().contains(&peer));
    }

    #[tokio::test]
    async fn error_counter_aborts_after_threshold() {
        let sender = loopback_sender(RtpMode::Unicast).await;
        for _ in 0..RTP_ERROR_ABORT_THRESHOLD {
            sender.error_count.fetch_add(1, Ordering::Relaxed);
        }
        sender.aborted.store(
            sender.error_count.load(Ordering::Relaxed) >= RTP_ERROR_ABORT_THRESHOLD,
            Ordering::Relaxed,
        );
        assert!(sender.is_aborted());
    }
}
