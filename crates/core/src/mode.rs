//! Bit-exact counter mode/status register and clock-rate resolution.
//!
//! The mode word is stored exactly as the guest wrote it: several bits are
//! undocumented and games are known to read back whatever they put there, so
//! nothing outside the sticky status bits is ever rewritten by the core.

use bitflags::bitflags;

use crate::RegionTimings;

bitflags! {
    /// 16-bit counter mode register. Bit 0 changes meaning per counter;
    /// bits 1, 2, 7, 13–15 are undocumented and kept verbatim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CounterMode: u16 {
        /// Gate/sync enable (counters 0 and 1). Not implemented in hardware
        /// terms; stored for read-back only.
        const GATE = 0x0001;
        /// Counter 2 reuses bit 0 as a stop bit.
        const DISABLE = 0x0001;
        /// Reset the count when the target is reached.
        const COUNT_TO_TARGET = 0x0008;
        /// Raise the counter's interrupt when the target is reached.
        const IRQ_ON_TARGET = 0x0010;
        /// Raise the counter's interrupt on 16-bit overflow.
        const IRQ_ON_OVERFLOW = 0x0020;
        /// Repeat interrupts; without this the interrupt is one-shot until
        /// the next mode write.
        const IRQ_REPEAT = 0x0040;
        /// Counter 0: count the dotclock instead of the system clock.
        const PIXEL_CLOCK = 0x0100;
        /// Counter 1: count hsync pulses instead of the system clock.
        const HSYNC_CLOCK = 0x0100;
        /// Counter 2: count system clock ÷ 8.
        const ONE_EIGHTH_CLOCK = 0x0200;
        /// Undocumented status bit; hardware sets it on every expiry
        /// regardless of mode.
        const STATUS = 0x0400;
        /// Sticky: count reached the target. Cleared by a mode read.
        const REACHED_TARGET = 0x0800;
        /// Sticky: the count overflowed 16 bits. Cleared by a mode read.
        const OVERFLOWED = 0x1000;
    }
}

/// Rate sentinel for a stopped counter. A counter carrying this rate never
/// reaches a deadline and is skipped by the scheduler.
pub const RATE_DISABLED: u32 = 0xFFFF_FFFF;

/// Dotclock approximation: one count per five CPU cycles.
const PIXEL_CLOCK_RATE: u32 = 5;
/// Counter 2 slow clock: one count per eight CPU cycles.
const ONE_EIGHTH_RATE: u32 = 8;

/// Effective cycle divisor for a counter's selected clock source.
///
/// Total over the mode-bit space: combinations with no defined clock select
/// fall back to the system clock (rate 1). Counter 3 has no guest-selectable
/// source and always counts raw cycles.
pub fn resolve_rate(index: usize, mode: CounterMode, timings: &RegionTimings) -> u32 {
    match index {
        0 if mode.contains(CounterMode::PIXEL_CLOCK) => PIXEL_CLOCK_RATE,
        1 if mode.contains(CounterMode::HSYNC_CLOCK) => timings.hsync_divisor(),
        2 if mode.contains(CounterMode::DISABLE) => RATE_DISABLED,
        2 if mode.contains(CounterMode::ONE_EIGHTH_CLOCK) => ONE_EIGHTH_RATE,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Region;

    #[test]
    fn test_rate_defaults_to_system_clock() {
        let t = Region::Ntsc.timings();
        for index in 0..4 {
            assert_eq!(resolve_rate(index, CounterMode::empty(), t), 1);
        }
        // Unrecognized bit soup still resolves
        let junk = CounterMode::from_bits_retain(0xE086);
        assert_eq!(resolve_rate(0, junk, t), 1);
    }

    #[test]
    fn test_alternate_clock_sources() {
        let t = Region::Ntsc.timings();
        assert_eq!(resolve_rate(0, CounterMode::PIXEL_CLOCK, t), 5);
        assert_eq!(resolve_rate(1, CounterMode::HSYNC_CLOCK, t), 2146);
        assert_eq!(resolve_rate(2, CounterMode::ONE_EIGHTH_CLOCK, t), 8);
        // The hsync select bit means nothing on counter 2
        assert_eq!(resolve_rate(2, CounterMode::HSYNC_CLOCK, t), 1);
    }

    #[test]
    fn test_disable_wins_over_clock_select() {
        let t = Region::Ntsc.timings();
        let m = CounterMode::DISABLE | CounterMode::ONE_EIGHTH_CLOCK;
        assert_eq!(resolve_rate(2, m, t), RATE_DISABLED);
        // Bit 0 only stops counter 2
        assert_eq!(resolve_rate(0, CounterMode::GATE, t), 1);
        assert_eq!(resolve_rate(1, CounterMode::GATE, t), 1);
    }

    #[test]
    fn test_mode_word_is_bit_exact() {
        let m = CounterMode::from_bits_retain(0xFFFF);
        assert_eq!(m.bits(), 0xFFFF);
        let m = CounterMode::from_bits_retain(0x2086);
        assert_eq!(m.bits(), 0x2086);
    }
}
