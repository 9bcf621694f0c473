//! Packet reordering and loss recovery.
//!
//! BLE notifications carry no ordering or delivery guarantee. The engine turns
//! the decoded packet stream back into samples ordered by running counter,
//! holding at most `window` out-of-order packets. When the window overflows the
//! missing packet is treated as lost: the engine jumps to the lowest buffered
//! counter and carries on. The gap stays visible as a jump in
//! [`CombinedSample::index`] and in [`ReorderStats`].
//!
//! The device tends to repeat the very first packet (counter 0) several times
//! before real counters begin. Counter 0 is therefore always buffered, with
//! later copies replacing earlier ones, and released once a higher counter
//! arrives.
//!
//! # Thread Safety
//!
//! Not thread-safe. A session owns one engine inside its worker task.

use std::collections::BTreeMap;

use log::{debug, warn};
use serde::Serialize;

use crate::samples::{AcquisitionPacket, CombinedSample};

/// Default number of out-of-order packets held before skipping ahead.
pub const DEFAULT_REORDER_WINDOW: usize = 3;

/// A forced skip-ahead over packets that never arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Skip {
    /// Counter that was expected when the window overflowed.
    pub from: u32,
    /// Counter the engine resumed from.
    pub to: u32,
}

/// Counters describing how a session's packet stream was repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReorderStats {
    /// Packets delivered downstream.
    pub emitted_packets: u64,
    /// Frame samples delivered downstream.
    pub emitted_samples: u64,
    /// Packets discarded because their counter was already passed.
    pub stale_packets: u64,
    /// Packets buffered because they arrived ahead of the expected counter.
    pub buffered_packets: u64,
    /// Buffered packets overwritten by a later copy with the same counter.
    pub replaced_packets: u64,
    /// Forced skip-aheads.
    pub skips: u64,
    /// Most recent skip-ahead.
    pub last_skip: Option<Skip>,
}

impl ReorderStats {
    pub fn has_gaps(&self) -> bool {
        self.skips > 0
    }
}

/// Counter state machine plus bounded out-of-order buffer.
#[derive(Debug)]
pub struct ReorderEngine {
    samples_per_packet: u32,
    window: usize,
    next_expected: u32,
    pending: BTreeMap<u32, AcquisitionPacket>,
    stats: ReorderStats,
}

impl ReorderEngine {
    /// Create an engine.
    ///
    /// `samples_per_packet` is the counter increment per packet, taken from
    /// `DeviceConfiguration::samples_per_channel`. A `window` of zero is
    /// treated as one.
    pub fn new(samples_per_packet: u8, window: usize) -> Self {
        Self {
            samples_per_packet: samples_per_packet as u32,
            window: window.max(1),
            next_expected: 0,
            pending: BTreeMap::new(),
            stats: ReorderStats::default(),
        }
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    /// Forget all state, as at the start of a session.
    pub fn reset(&mut self) {
        self.next_expected = 0;
        self.pending.clear();
        self.stats = ReorderStats::default();
    }

    /// Feed one decoded packet and return the samples that became deliverable,
    /// in order.
    pub fn push(&mut self, packet: AcquisitionPacket) -> Vec<CombinedSample> {
        let mut out = Vec::new();
        self.push_into(packet, &mut out);
        out
    }

    /// Like [`push`](Self::push) but appends to `out`.
    pub fn push_into(&mut self, packet: AcquisitionPacket, out: &mut Vec<CombinedSample>) {
        let counter = packet.counter();

        if counter < self.next_expected {
            self.stats.stale_packets += 1;
            debug!(
                "stale packet discarded: counter={}, next_expected={}",
                counter, self.next_expected
            );
            return;
        }

        if self.next_expected == 0 && counter > 0 {
            if let Some(initial) = self.pending.remove(&0) {
                debug!("releasing buffered initial packet before counter={}", counter);
                self.emit(initial, out);
            }
        }

        if counter == 0 || counter != self.next_expected {
            self.buffer(packet);
            if self.pending.len() > self.window {
                self.skip_ahead();
                self.drain(out);
            }
            return;
        }

        self.emit(packet, out);
        self.drain(out);
    }

    fn buffer(&mut self, packet: AcquisitionPacket) {
        let counter = packet.counter();
        if self.pending.insert(counter, packet).is_some() {
            self.stats.replaced_packets += 1;
            debug!("replaced buffered packet: counter={}", counter);
        } else {
            self.stats.buffered_packets += 1;
        }
    }

    fn skip_ahead(&mut self) {
        let Some(&first) = self.pending.keys().next() else {
            return;
        };
        let skip = Skip {
            from: self.next_expected,
            to: first,
        };
        warn!(
            "reorder window overflow ({} pending): skipping from counter {} to {}",
            self.pending.len(),
            skip.from,
            skip.to
        );
        self.next_expected = first;
        self.stats.skips += 1;
        self.stats.last_skip = Some(skip);
    }

    fn drain(&mut self, out: &mut Vec<CombinedSample>) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next_expected {
                break;
            }
            let packet = entry.remove();
            self.emit(packet, out);
        }
    }

    fn emit(&mut self, packet: AcquisitionPacket, out: &mut Vec<CombinedSample>) {
        let base = packet.counter();
        let samples = packet.samples();
        out.extend(samples.iter().enumerate().map(|(i, frame)| CombinedSample {
            index: base.wrapping_add(i as u32),
            channels: frame.channels,
        }));
        self.stats.emitted_packets += 1;
        self.stats.emitted_samples += samples.len() as u64;
        self.next_expected = base.wrapping_add(self.samples_per_packet);
    }
}
