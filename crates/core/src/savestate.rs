//! Save/restore for the root counter subsystem.
//!
//! Captures the counter array, the hsync pump bookkeeping, and the scheduler
//! baseline using bincode serialization with deflate compression.
//!
//! ## Blob format
//!
//! ```text
//! +------------------+
//! | Magic "PRCS"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```
//!
//! The pump's lines-until-next-event field is deliberately not stored: it is
//! derived state, and a blob written by a slightly different build could
//! carry a stale value. Restore recomputes it from the hsync counter's cycle
//! baseline instead.

use serde::{Deserialize, Serialize};

use crate::counter::CountPhase;
use crate::mode::CounterMode;
use crate::rcnt::RootCounters;
use crate::{COUNTER_COUNT, HSYNC_COUNTER};

/// Magic bytes identifying a root counter state blob.
const MAGIC: &[u8; 4] = b"PRCS";
/// Current state format version.
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
pub struct CounterState {
    pub mode: u16,
    pub target: u16,
    pub rate: u32,
    pub irq: u32,
    pub counting_to_target: bool,
    pub irq_fired: bool,
    pub cycle: u32,
    pub cycle_start: u32,
}

#[derive(Serialize, Deserialize)]
pub struct RootCountersState {
    pub counters: [CounterState; COUNTER_COUNT],
    pub hsync_count: u32,
    pub spu_sync_count: u32,
    pub next_event: u32,
    pub next_event_base: u32,
}

impl RootCounters {
    /// Serialize the full subsystem state into a framed, compressed blob.
    pub fn serialize(&self) -> Result<Vec<u8>, String> {
        let snap = |index: usize| {
            let c = &self.counters[index];
            CounterState {
                mode: c.mode.bits(),
                target: c.target,
                rate: c.rate,
                irq: c.irq,
                counting_to_target: c.phase == CountPhase::ToTarget,
                irq_fired: c.irq_fired,
                cycle: c.cycle,
                cycle_start: c.cycle_start,
            }
        };
        let state = RootCountersState {
            counters: [snap(0), snap(1), snap(2), snap(3)],
            hsync_count: self.hsync_count,
            spu_sync_count: self.spu_sync_count,
            next_event: self.next_event,
            next_event_base: self.next_event_base,
        };

        let payload = bincode::serialize(&state)
            .map_err(|e| format!("Serialize error: {}", e))?;
        let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

        let mut out = Vec::with_capacity(8 + compressed.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Restore subsystem state from a blob produced by [`Self::serialize`].
    ///
    /// `now` is the CPU cycle register as restored by the CPU core; it is
    /// needed to rebuild the pump's line-step count, which is recomputed
    /// rather than trusted from the blob. Region timings and compatibility
    /// flags are configuration, not state, and are left as constructed.
    pub fn deserialize(&mut self, blob: &[u8], now: u32) -> Result<(), String> {
        if blob.len() < 8 {
            return Err("State blob too small".into());
        }
        if &blob[0..4] != MAGIC {
            return Err("Invalid state blob (bad magic)".into());
        }
        let version = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        if version != FORMAT_VERSION {
            return Err(format!(
                "Unsupported state version {} (expected {})",
                version, FORMAT_VERSION
            ));
        }

        let payload = miniz_oxide::inflate::decompress_to_vec(&blob[8..])
            .map_err(|e| format!("Decompress error: {:?}", e))?;
        let state: RootCountersState = bincode::deserialize(&payload)
            .map_err(|e| format!("Deserialize error: {}", e))?;

        for (counter, saved) in self.counters.iter_mut().zip(state.counters.iter()) {
            counter.mode = CounterMode::from_bits_retain(saved.mode);
            counter.target = saved.target;
            counter.rate = saved.rate;
            counter.irq = saved.irq;
            counter.phase = if saved.counting_to_target {
                CountPhase::ToTarget
            } else {
                CountPhase::ToOverflow
            };
            counter.irq_fired = saved.irq_fired;
            counter.cycle = saved.cycle;
            counter.cycle_start = saved.cycle_start;
        }

        self.hsync_count = state.hsync_count;
        self.spu_sync_count = state.spu_sync_count;
        self.next_event = state.next_event;
        self.next_event_base = state.next_event_base;

        // Rebuild the derived line-step count from the restored baseline.
        let hsync = &self.counters[HSYNC_COUNTER];
        let line_cycles = u32::from(hsync.target);
        self.hsync_steps = if line_cycles != 0 {
            now.wrapping_sub(hsync.cycle_start) / line_cycles
        } else {
            1
        };

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rcnt::CounterHost;
    use crate::{CompatFlags, CounterMode, Region};

    struct IrqOnly(Vec<u32>);
    impl CounterHost for IrqOnly {
        fn set_irq(&mut self, mask: u32) {
            self.0.push(mask);
        }
        fn vblank_enter(&mut self, _l: &mut u32, _f: &mut bool) {}
        fn vblank_leave(&mut self, _l: &mut u32, _f: &mut bool) {}
        fn update_lace(&mut self) {}
        fn frame_complete(&mut self) {}
    }

    /// Run a machine with some counter traffic up to `end`.
    fn busy_machine(end: u32) -> RootCounters {
        let mut rc = RootCounters::new(Region::Ntsc, CompatFlags::default());
        let mut host = IrqOnly(Vec::new());
        rc.write_mode(
            0,
            (CounterMode::COUNT_TO_TARGET | CounterMode::IRQ_ON_TARGET | CounterMode::IRQ_REPEAT)
                .bits(),
            0,
            &mut host,
        );
        rc.write_target(0, 0x300, 0, &mut host);
        rc.write_mode(2, CounterMode::ONE_EIGHTH_CLOCK.bits(), 0, &mut host);

        let mut now = 0u32;
        while now < end {
            let step = rc.cycles_until_next_event(now).clamp(1, end - now);
            now += step;
            rc.update(now, &mut host);
        }
        rc
    }

    #[test]
    fn test_save_restore_round_trip() {
        let now = 100_000;
        let saved = busy_machine(now);
        let blob = saved.serialize().unwrap();

        let mut restored = RootCounters::new(Region::Ntsc, CompatFlags::default());
        restored.deserialize(&blob, now).unwrap();

        for index in 0..4 {
            let a = &saved.counters[index];
            let b = &restored.counters[index];
            assert_eq!(a.mode, b.mode);
            assert_eq!(a.target, b.target);
            assert_eq!(a.rate, b.rate);
            assert_eq!(a.irq, b.irq);
            assert_eq!(a.phase, b.phase);
            assert_eq!(a.irq_fired, b.irq_fired);
            assert_eq!(a.cycle, b.cycle);
            assert_eq!(a.cycle_start, b.cycle_start);
            assert_eq!(a.count_at(now), b.count_at(now));
        }
        assert_eq!(saved.hsync_count, restored.hsync_count);
        assert_eq!(saved.spu_sync_count, restored.spu_sync_count);
        assert_eq!(
            saved.cycles_until_next_event(now),
            restored.cycles_until_next_event(now)
        );
    }

    #[test]
    fn test_restore_recomputes_line_steps() {
        let now = 100_000;
        let saved = busy_machine(now);
        let blob = saved.serialize().unwrap();

        let mut restored = RootCounters::new(Region::Ntsc, CompatFlags::default());
        restored.deserialize(&blob, now).unwrap();

        let hsync = &restored.counters[crate::HSYNC_COUNTER];
        let expected = now.wrapping_sub(hsync.cycle_start) / u32::from(hsync.target);
        assert_eq!(restored.hsync_steps, expected);
    }

    #[test]
    fn test_restored_machine_keeps_running() {
        let now = 100_000;
        let saved = busy_machine(now);
        let blob = saved.serialize().unwrap();

        let mut restored = RootCounters::new(Region::Ntsc, CompatFlags::default());
        restored.deserialize(&blob, now).unwrap();

        // The restored machine produces the same counter 0 interrupt cadence.
        let mut host = IrqOnly(Vec::new());
        let mut t = now;
        while t < now + 0x300 * 4 {
            let step = restored.cycles_until_next_event(t).max(1);
            t += step;
            restored.update(t, &mut host);
        }
        assert!(host.0.contains(&crate::IRQ_RCNT0));
    }

    #[test]
    fn test_rejects_bad_blobs() {
        let mut rc = RootCounters::new(Region::Ntsc, CompatFlags::default());

        assert!(rc.deserialize(b"PRC", 0).is_err());
        assert!(rc.deserialize(b"XXXX\x01\x00\x00\x00", 0).is_err());

        let mut wrong_version = Vec::new();
        wrong_version.extend_from_slice(MAGIC);
        wrong_version.extend_from_slice(&99u32.to_le_bytes());
        let err = rc.deserialize(&wrong_version, 0).unwrap_err();
        assert!(err.contains("version"));
    }
}
