//! Output volume control.
//!
//! The core has no audio mixer of its own — decoders write raw PCM
//! straight through to the RTP sender — so `volume` has nothing to apply
//! gain to in-process. It still needs to hold and report the last value a
//! client set, for clients that drive an external mixer off the `volume`
//! event log entry, so [`VolumeControl`] is the shared left/right
//! percentage pair the `volume` command reads and writes.

use std::sync::atomic::{AtomicU32, Ordering};

/// Shared left/right channel volume, as a 0-100 percentage each.
pub struct VolumeControl {
    left: AtomicU32,
    right: AtomicU32,
}

impl Default for VolumeControl {
    fn default() -> Self {
        Self {
            left: AtomicU32::new(100),
            right: AtomicU32::new(100),
        }
    }
}

impl VolumeControl {
    pub fn get(&self) -> (u32, u32) {
        (self.left.load(Ordering::Relaxed), self.right.load(Ordering::Relaxed))
    }

    pub fn set(&self, left: u32, right: u32) {
        self.left.store(left.min(100), Ordering::Relaxed);
        self.right.store(right.min(100), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_full_volume() {
        assert_eq!(VolumeControl::default().get(), (100, 100));
    }

    #[test]
    fn set_clamps_to_100() {
        let volume = VolumeControl::default();
        volume.set(150, 50);
        assert_eq!(volume.get(), (100, 50));
    }
}
