//! SoC-level contracts consumed by the driver.
//!
//! The driver never dereferences registers itself; it talks to the hardware
//! through [`TimerRegisters`] and to the surrounding subsystems through the
//! collaborator traits below. A concrete chip (or a test double) implements
//! these and hands the driver a [`Soc`] bundle. Keeping the bundle an
//! explicit, injected value instead of ambient statics is what makes the
//! driver testable off-target.

use alloc::{boxed::Box, sync::Arc};

use fugit::HertzU32;

use crate::Error;

/// Number of timer groups in the SoC.
pub const GROUP_COUNT: usize = 2;

/// Number of general-purpose timers per group.
pub const TIMERS_PER_GROUP: usize = 2;

/// Smallest clock divider the prescaler supports.
pub const MIN_DIVIDER: u32 = 2;

/// Largest clock divider the prescaler supports.
pub const MAX_DIVIDER: u32 = 65536;

/// Interrupt priority levels the timer interrupt may use, as a bitmask
/// (levels 1..=3; higher levels are reserved for the system).
pub const ALLOWED_INTR_PRIORITIES: u32 = 0b1110;

/// Bit of `timer` in the group's interrupt status/enable registers.
pub const fn alarm_event_bit(timer: usize) -> u32 {
    1 << timer
}

/// Clock sources a timer can count from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockSource {
    /// The APB bus clock (default).
    #[default]
    Apb,
    /// The external crystal oscillator.
    Xtal,
    /// The internal fast RC oscillator.
    RcFast,
}

/// Counting direction of a timer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Count up from the start value.
    #[default]
    Up,
    /// Count down from the start value.
    Down,
}

/// Register-file access for the timer groups.
///
/// Callers serialize access themselves: the driver takes the group critical
/// section before touching the shared interrupt status/enable registers and
/// the per-timer critical section before touching a timer's counter, alarm
/// and reload registers.
pub trait TimerRegisters: Send + Sync {
    /// Gate the group's bus clock. The enable bit may be shared with other
    /// peripherals; the driver reference-counts calls to this.
    fn enable_bus_clock(&self, group: usize, enable: bool);
    /// Reset the group's register file to its power-on state.
    fn reset_registers(&self, group: usize);

    /// Program the clock prescaler of one timer.
    fn set_clock_prescale(&self, group: usize, timer: usize, divider: u32);
    /// Set the counting direction of one timer.
    fn set_count_direction(&self, group: usize, timer: usize, direction: Direction);

    /// Start or stop the counter.
    fn enable_counter(&self, group: usize, timer: usize, enable: bool);
    /// Load the counter with a value.
    fn set_counter_value(&self, group: usize, timer: usize, value: u64);
    /// Latch and read the current counter value.
    fn counter_value(&self, group: usize, timer: usize) -> u64;

    /// Program the alarm target.
    fn set_alarm_value(&self, group: usize, timer: usize, value: u64);
    /// Program the reload value used when auto-reload triggers.
    fn set_reload_value(&self, group: usize, timer: usize, value: u64);
    /// Arm or disarm the alarm comparator. The hardware disarms it by
    /// itself whenever the alarm fires.
    fn enable_alarm(&self, group: usize, timer: usize, enable: bool);
    /// Enable or disable reloading the counter on alarm.
    fn enable_auto_reload(&self, group: usize, timer: usize, enable: bool);

    /// Mask or unmask events in the group's shared interrupt enable register.
    fn enable_interrupt(&self, group: usize, mask: u32, enable: bool);
    /// Read the group's shared interrupt status register.
    fn interrupt_status(&self, group: usize) -> u32;
    /// Clear bits in the group's shared interrupt status register.
    fn clear_interrupt_status(&self, group: usize, mask: u32);
}

/// Clock-tree access.
///
/// Implementations reference-count [`ClockTree::enable`]; the driver pairs
/// every enable with exactly one disable over a timer's lifetime.
pub trait ClockTree: Send + Sync {
    /// Nominal frequency of a clock source.
    fn frequency(&self, source: ClockSource) -> Result<HertzU32, Error>;
    /// Enable or disable the underlying oscillator.
    fn enable(&self, source: ClockSource, enable: bool) -> Result<(), Error>;
}

/// Parameters for allocating a timer's interrupt vector.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterruptRequest {
    /// Timer group the interrupt belongs to.
    pub group: usize,
    /// Timer within the group.
    pub timer: usize,
    /// Requested priority level, `0` meaning "any".
    pub priority: u8,
    /// Whether the interrupt line may be shared with other users.
    pub shared: bool,
    /// Bit of this timer in the group status register; the controller only
    /// invokes the handler when a status bit in this mask is set.
    pub status_mask: u32,
}

/// Handler invoked by the interrupt controller when the vector fires.
pub type IsrHandler = Arc<dyn Fn() + Send + Sync>;

/// An allocated interrupt vector. Dropping the handle frees the vector.
pub trait IntrHandle: Send + Sync {
    /// Unmask the vector.
    fn enable(&self);
    /// Mask the vector.
    fn disable(&self);
}

/// Interrupt-matrix access.
pub trait InterruptController: Send + Sync {
    /// Allocate a vector for the given request. The vector starts out
    /// disabled; [`IntrHandle::enable`] arms it.
    fn allocate(
        &self,
        request: InterruptRequest,
        handler: IsrHandler,
    ) -> Result<Box<dyn IntrHandle>, Error>;

    /// Ask the scheduler to reconsider the running task when the current
    /// interrupt returns.
    fn yield_from_isr(&self);
}

/// Kinds of power-management locks the driver may hold while a timer is
/// enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PmLockKind {
    /// Pin the APB frequency so the derived divider stays valid.
    MaxApbFrequency,
    /// Keep the system out of light sleep.
    NoLightSleep,
}

/// A created power-management lock. Dropping the handle deletes the lock.
pub trait PmLock: Send + Sync {
    /// Take the lock.
    fn acquire(&self);
    /// Release the lock.
    fn release(&self);
}

/// Power-management access. Absent from [`Soc`] when the build has no
/// power management.
pub trait PowerManager: Send + Sync {
    /// Create a lock of the given kind.
    fn create_lock(&self, kind: PmLockKind, name: &'static str) -> Result<Box<dyn PmLock>, Error>;
}

/// Sleep-retention access. Absent from [`Soc`] when the target cannot
/// retain timer state across power-down.
pub trait SleepRetention: Send + Sync {
    /// Register a group's registers for save/restore across light sleep.
    fn register_group(&self, group: usize, backup_before_sleep: bool) -> Result<(), Error>;
    /// Undo [`SleepRetention::register_group`].
    fn unregister_group(&self, group: usize);
}

/// The injectable bundle of SoC services the driver runs against.
#[derive(Clone)]
pub struct Soc {
    /// Timer-group register file.
    pub registers: Arc<dyn TimerRegisters>,
    /// Clock tree.
    pub clock_tree: Arc<dyn ClockTree>,
    /// Interrupt matrix.
    pub interrupts: Arc<dyn InterruptController>,
    /// Power management, if the build has it.
    pub power: Option<Arc<dyn PowerManager>>,
    /// Sleep retention, if the target supports it.
    pub retention: Option<Arc<dyn SleepRetention>>,
}
