//! Root counter subsystem: expiry evaluation, the hsync pump, the next-event
//! scheduler, and the guest-visible register API.
//!
//! The host CPU core drives this module in a pull loop: execute up to the
//! number of cycles returned by [`RootCounters::update`], then call `update`
//! again. Guest register accesses force an update pass first so the state
//! they observe or mutate is always caught up to the cycle register.

use crate::counter::{CountPhase, Counter};
use crate::mode::{self, CounterMode, RATE_DISABLED};
use crate::{
    CompatFlags, Region, BIAS, COUNTER_COUNT, HSYNC_COUNTER, IRQ_RCNT0, IRQ_RCNT1, IRQ_RCNT2,
    IRQ_VBLANK,
};

/// Machine callbacks injected into the counter core.
///
/// All methods are invoked synchronously from [`RootCounters::update`] (or
/// from a register access that forced an update pass) and must not re-enter
/// the counter subsystem.
pub trait CounterHost {
    /// Set bits in the shared interrupt-pending register.
    fn set_irq(&mut self, mask: u32);

    /// Advance the SPU by one audio update interval, given in CPU cycles.
    /// The default is a no-op for machines running without audio.
    fn spu_update(&mut self, _cycles: u32) {}

    /// The beam reached the vblank start line. The GPU may rewrite the line
    /// counter or request per-line pump stepping through the references.
    fn vblank_enter(&mut self, hsync_count: &mut u32, fine_step: &mut bool);

    /// The frame ended and the line counter was reset.
    fn vblank_leave(&mut self, hsync_count: &mut u32, fine_step: &mut bool);

    /// Per-frame interlace/line update, after vblank leave.
    fn update_lace(&mut self);

    /// One emulated frame completed.
    fn frame_complete(&mut self);
}

/// Host that ignores every callback. Useful for headless operation and for
/// code that only exercises counter arithmetic.
pub struct NullHost;

impl CounterHost for NullHost {
    fn set_irq(&mut self, _mask: u32) {}
    fn vblank_enter(&mut self, _hsync_count: &mut u32, _fine_step: &mut bool) {}
    fn vblank_leave(&mut self, _hsync_count: &mut u32, _fine_step: &mut bool) {}
    fn update_lace(&mut self) {}
    fn frame_complete(&mut self) {}
}

/// The root counter subsystem of one emulated machine.
///
/// Owns the three guest-visible counters, the synthetic hsync counter, the
/// pump bookkeeping shared with it, and the scheduler state. Multiple
/// instances are independent; there is no process-wide state.
pub struct RootCounters {
    pub(crate) counters: [Counter; COUNTER_COUNT],
    region: Region,
    compat: CompatFlags,

    /// Current hsync line within the frame.
    pub(crate) hsync_count: u32,
    /// Lines accumulated toward the next SPU update.
    pub(crate) spu_sync_count: u32,
    /// Lines covered by the hsync counter's current deadline.
    pub(crate) hsync_steps: u32,
    /// GPU request for single-line pump granularity.
    pub(crate) gpu_wants_hsync: bool,

    /// Cycle distance from `next_event_base` to the nearest deadline.
    pub(crate) next_event: u32,
    /// Cycle at which `next_event` was computed.
    pub(crate) next_event_base: u32,
}

impl RootCounters {
    /// Create the subsystem in power-on state at cycle 0.
    pub fn new(region: Region, compat: CompatFlags) -> Self {
        let mut rc = RootCounters {
            counters: [
                Counter::new(IRQ_RCNT0),
                Counter::new(IRQ_RCNT1),
                Counter::new(IRQ_RCNT2),
                Counter::new(0),
            ],
            region,
            compat,
            hsync_count: 0,
            spu_sync_count: 0,
            hsync_steps: 1,
            gpu_wants_hsync: false,
            next_event: 0,
            next_event_base: 0,
        };
        rc.reset(0);
        rc
    }

    /// Reset all counters and pump bookkeeping to power-on defaults.
    pub fn reset(&mut self, now: u32) {
        self.counters = [
            Counter::new(IRQ_RCNT0),
            Counter::new(IRQ_RCNT1),
            Counter::new(IRQ_RCNT2),
            Counter::new(0),
        ];

        // The hsync counter is a fixed-rate line timer: its target is the
        // cycles-per-line divisor and is not guest-writable.
        let hsync = &mut self.counters[HSYNC_COUNTER];
        hsync.mode = CounterMode::COUNT_TO_TARGET;
        hsync.target = self.region.timings().hsync_divisor() as u16;

        for counter in self.counters.iter_mut() {
            counter.set_count(now, 0);
        }

        self.hsync_count = 0;
        self.spu_sync_count = 0;
        self.hsync_steps = 1;
        self.gpu_wants_hsync = false;

        self.schedule(now);
    }

    /// Video standard this subsystem was configured with.
    pub fn region(&self) -> Region {
        self.region
    }

    /// Current hsync line within the frame.
    pub fn hsync_line(&self) -> u32 {
        self.hsync_count
    }

    /// Resolve any counters whose deadline has passed, run the hsync pump if
    /// its line deadline was reached, and return the scheduling hint: the
    /// number of cycles the CPU core may execute before calling again.
    ///
    /// Idempotent at a fixed `now`: a second call without cycle progress
    /// changes nothing.
    pub fn update(&mut self, now: u32, host: &mut impl CounterHost) -> u32 {
        for index in 0..HSYNC_COUNTER {
            if self.counters[index].rate == RATE_DISABLED {
                continue;
            }
            if self.counters[index].due(now) {
                self.resolve_expiry(index, now, host);
            }
        }

        if self.counters[HSYNC_COUNTER].due(now) {
            self.pump_hsync(now, host);
        }

        self.cycles_until_next_event(now)
    }

    /// Cycles remaining until the nearest deadline, derived from the stored
    /// scheduler pair without rescanning the counters.
    pub fn cycles_until_next_event(&self, now: u32) -> u32 {
        let elapsed = now.wrapping_sub(self.next_event_base);
        self.next_event.saturating_sub(elapsed)
    }

    // ─── Guest register API (counters 0–2) ──────────────────────────────────

    /// Write a counter's count register. Values past 16 bits are masked.
    pub fn write_count(&mut self, index: usize, value: u32, now: u32, host: &mut impl CounterHost) {
        let index = checked_index(index);
        log::trace!("[RCNT {}] wcount: {:04x}", index, value);

        self.update(now, host);
        self.counters[index].set_count(now, value);
        self.schedule(now);
    }

    /// Read a counter's instantaneous count.
    pub fn read_count(&mut self, index: usize, now: u32, host: &mut impl CounterHost) -> u16 {
        let index = checked_index(index);
        self.update(now, host);

        let counter = &self.counters[index];
        let mut count = u32::from(counter.count_at(now));

        // Counter 2 read workaround: some titles poll this counter against a
        // wall-clock loop and need it slowed at the read boundary while it
        // runs toward its target. Internal accounting is untouched.
        if self.compat.rcnt2_read_fix && index == 2 && counter.phase == CountPhase::ToTarget {
            count /= BIAS;
        }

        log::trace!("[RCNT {}] rcount: {:04x}", index, count);
        count as u16
    }

    /// Write a counter's mode register: stores the raw word, re-arms the
    /// one-shot interrupt, re-resolves the clock rate, and restarts the
    /// count from zero.
    pub fn write_mode(&mut self, index: usize, value: u16, now: u32, host: &mut impl CounterHost) {
        let index = checked_index(index);
        log::trace!("[RCNT {}] wmode: {:04x}", index, value);

        self.update(now, host);

        let counter = &mut self.counters[index];
        counter.mode = CounterMode::from_bits_retain(value);
        counter.irq_fired = false;
        counter.rate = mode::resolve_rate(index, counter.mode, self.region.timings());
        counter.set_count(now, 0);

        self.schedule(now);
    }

    /// Read a counter's mode register. Returns the full word, then clears
    /// the two sticky status bits (target reached, overflowed).
    pub fn read_mode(&mut self, index: usize, now: u32, host: &mut impl CounterHost) -> u16 {
        let index = checked_index(index);
        self.update(now, host);

        let counter = &mut self.counters[index];
        let word = counter.mode.bits();
        counter
            .mode
            .remove(CounterMode::REACHED_TARGET | CounterMode::OVERFLOWED);

        log::trace!("[RCNT {}] rmode: {:04x}", index, word);
        word
    }

    /// Write a counter's target register. The count already accumulated is
    /// preserved: the deadline is re-derived from the current projection.
    pub fn write_target(&mut self, index: usize, value: u16, now: u32, host: &mut impl CounterHost) {
        let index = checked_index(index);
        log::trace!("[RCNT {}] wtarget: {:04x}", index, value);

        self.update(now, host);

        let counter = &mut self.counters[index];
        counter.target = value;
        let count = u32::from(counter.count_at(now));
        counter.set_count(now, count);

        self.schedule(now);
    }

    /// Read a counter's target register. The target is not cycle-derived,
    /// so no update pass is needed.
    pub fn read_target(&self, index: usize) -> u16 {
        let index = checked_index(index);
        self.counters[index].target
    }

    // ─── Internals ──────────────────────────────────────────────────────────

    /// Recompute the scheduler pair: the minimum deadline distance across
    /// all counters, measured from `now`. An already-overdue counter forces
    /// an immediate hint; stopped counters never contribute.
    fn schedule(&mut self, now: u32) {
        self.next_event_base = now;
        self.next_event = 0x7FFF_FFFF;

        for counter in self.counters.iter() {
            if counter.rate == RATE_DISABLED {
                continue;
            }
            let distance = counter.cycle.wrapping_sub(counter.elapsed(now)) as i32;
            if distance < 0 {
                self.next_event = 0;
                break;
            }
            if (distance as u32) < self.next_event {
                self.next_event = distance as u32;
            }
        }
    }

    /// A counter reached its tracked deadline: re-arm it and apply the
    /// interrupt policy and sticky status flags.
    fn resolve_expiry(&mut self, index: usize, now: u32, host: &mut impl CounterHost) {
        let counter = &mut self.counters[index];

        match counter.phase {
            CountPhase::ToTarget => {
                // In count-to-target mode the period restarts at the target,
                // carrying any overshoot; otherwise the count keeps running.
                let count = if counter.mode.contains(CounterMode::COUNT_TO_TARGET) {
                    counter
                        .raw_count_at(now)
                        .wrapping_sub(u32::from(counter.target))
                } else {
                    u32::from(counter.count_at(now))
                };
                counter.set_count(now, count);

                if counter.mode.contains(CounterMode::IRQ_ON_TARGET)
                    && (counter.mode.contains(CounterMode::IRQ_REPEAT) || !counter.irq_fired)
                {
                    log::trace!("[RCNT {}] target irq: {:04x}", index, count);
                    host.set_irq(counter.irq);
                    counter.irq_fired = true;
                }

                counter.mode.insert(CounterMode::REACHED_TARGET);
            }
            CountPhase::ToOverflow => {
                let count = counter.raw_count_at(now).wrapping_sub(0xFFFF);
                counter.set_count(now, count);

                if counter.mode.contains(CounterMode::IRQ_ON_OVERFLOW)
                    && (counter.mode.contains(CounterMode::IRQ_REPEAT) || !counter.irq_fired)
                {
                    log::trace!("[RCNT {}] overflow irq: {:04x}", index, count);
                    host.set_irq(counter.irq);
                    counter.irq_fired = true;
                }

                counter.mode.insert(CounterMode::OVERFLOWED);
            }
        }

        // Hardware sets this status bit on every expiry, whatever the mode.
        counter.mode.insert(CounterMode::STATUS);

        self.schedule(now);
    }

    /// The hsync counter reached its line deadline: account the elapsed
    /// lines into the SPU and vblank state machines, then re-arm for the
    /// next interesting line boundary.
    fn pump_hsync(&mut self, now: u32, host: &mut impl CounterHost) {
        let timings = self.region.timings();
        let line_cycles = u32::from(self.counters[HSYNC_COUNTER].target);
        // Cycles the CPU ran past the deadline; the re-armed baseline is
        // shifted back by this so fractional error never accumulates.
        let overrun = self.counters[HSYNC_COUNTER]
            .elapsed(now)
            .wrapping_sub(self.counters[HSYNC_COUNTER].cycle);

        self.spu_sync_count += self.hsync_steps;
        self.hsync_count += self.hsync_steps;

        if self.spu_sync_count >= timings.spu_update_interval {
            self.spu_sync_count = 0;
            host.spu_update(timings.spu_update_interval * line_cycles);
        }

        if self.hsync_count == timings.vblank_start {
            host.vblank_enter(&mut self.hsync_count, &mut self.gpu_wants_hsync);
        }

        let frame_lines = if self.compat.vsync_workaround {
            timings.hsync_total / BIAS
        } else {
            timings.hsync_total
        };
        if self.hsync_count >= frame_lines {
            self.hsync_count = 0;

            host.vblank_leave(&mut self.hsync_count, &mut self.gpu_wants_hsync);
            host.set_irq(IRQ_VBLANK);

            host.frame_complete();
            host.update_lace();
        }

        // Next pump stop: the nearest of the SPU cadence, vblank start, and
        // frame end. Distances are wrapping; a boundary already behind the
        // beam wraps huge and drops out of the minimum.
        self.hsync_steps = timings.spu_update_interval - self.spu_sync_count;
        let next_vblank = timings.vblank_start.wrapping_sub(self.hsync_count);
        let next_frame = timings.hsync_total.wrapping_sub(self.hsync_count);
        if next_vblank != 0 && next_vblank < self.hsync_steps {
            self.hsync_steps = next_vblank;
        }
        if next_frame != 0 && next_frame < self.hsync_steps {
            self.hsync_steps = next_frame;
        }
        if self.gpu_wants_hsync {
            self.hsync_steps = 1;
        }

        let hsync = &mut self.counters[HSYNC_COUNTER];
        hsync.cycle_start = now.wrapping_sub(overrun);
        hsync.cycle = self.hsync_steps * line_cycles;

        self.schedule(now);
    }
}

/// Guest registers exist for counters 0–2 (and internal callers may touch
/// counter 3). Anything else is a caller bug: fail fast in debug builds,
/// clamp in release.
fn checked_index(index: usize) -> usize {
    debug_assert!(index < COUNTER_COUNT, "counter index out of range: {}", index);
    index.min(COUNTER_COUNT - 1)
}
