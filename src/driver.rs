//! Timer lifecycle: creation and teardown, the FSM transitions, alarm
//! programming and callback registration.

use alloc::{boxed::Box, sync::Arc};

use fugit::{HertzU32, RateExtU32};
use log::{debug, warn};
use portable_atomic::{AtomicU8, Ordering};

use crate::{
    clock::{select_clock, ClockGuard},
    registry::{GroupRegistry, TimerGroup},
    soc::{
        alarm_event_bit,
        ClockSource,
        Direction,
        InterruptRequest,
        IntrHandle,
        IsrHandler,
        PmLock,
        SleepRetention,
        Soc,
        ALLOWED_INTR_PRIORITIES,
        GROUP_COUNT,
    },
    sync::Locked,
    Error,
};

/// Lifecycle states of a [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum State {
    /// Freshly created or fully disabled; the only state a timer may be
    /// deleted from.
    Init = 0,
    /// Interrupt machinery armed and the power-management lock held, counter
    /// stopped.
    Enable = 1,
    /// Counter running.
    Run = 2,
    /// Transient while `start`/`stop` reprogram the hardware. Other callers
    /// observe either the pre- or the post-state, never the half-programmed
    /// registers.
    Wait = 3,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Init,
            1 => State::Enable,
            2 => State::Run,
            _ => State::Wait,
        }
    }
}

/// The FSM variable. All committed transitions go through a compare-and-swap
/// so concurrent callers never observe a torn state.
struct Fsm(AtomicU8);

impl Fsm {
    fn new() -> Self {
        Self(AtomicU8::new(State::Init as u8))
    }

    fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from` -> `to`, failing with the actual current state. Failures
    /// are surfaced to the caller, never retried.
    fn transit(&self, from: State, to: State) -> Result<(), State> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(State::from_u8)
    }
}

/// Behavior flags of a timer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigFlags {
    /// Allocate the interrupt on a shared line.
    pub intr_shared: bool,
    /// Allow powering down the timer's domain in light sleep; requires
    /// sleep-retention support from the target.
    pub allow_pd: bool,
    /// Save the register state by software before entering sleep instead of
    /// relying on the retention hardware doing it in the background.
    pub backup_before_sleep: bool,
}

/// Configuration of a new timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Requested counting resolution. The achieved resolution may be lower,
    /// see [`Timer::resolution`].
    pub resolution: HertzU32,
    /// Clock source to count from.
    pub clk_src: ClockSource,
    /// Counting direction.
    pub direction: Direction,
    /// Interrupt priority level, `0` meaning "any".
    pub intr_priority: u8,
    /// Behavior flags.
    pub flags: ConfigFlags,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolution: 1u32.MHz(),
            clk_src: ClockSource::default(),
            direction: Direction::default(),
            intr_priority: 0,
            flags: ConfigFlags::default(),
        }
    }
}

impl Config {
    /// Set the requested resolution.
    pub fn with_resolution(mut self, resolution: HertzU32) -> Self {
        self.resolution = resolution;
        self
    }

    /// Set the clock source.
    pub fn with_clk_src(mut self, clk_src: ClockSource) -> Self {
        self.clk_src = clk_src;
        self
    }

    /// Set the counting direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Set the interrupt priority level.
    pub fn with_intr_priority(mut self, intr_priority: u8) -> Self {
        self.intr_priority = intr_priority;
        self
    }

    /// Set the behavior flags.
    pub fn with_flags(mut self, flags: ConfigFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Alarm configuration, programmed with [`Timer::set_alarm_action`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlarmConfig {
    /// Counter target that fires the alarm.
    pub alarm_count: u64,
    /// Value the counter is reloaded with on alarm when auto-reload is on.
    pub reload_count: u64,
    /// Reload the counter on alarm and keep the alarm armed, making the
    /// alarm periodic. Requires `alarm_count != reload_count`.
    pub auto_reload_on_alarm: bool,
}

/// Data handed to the alarm callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlarmEvent {
    /// Counter value at the time the interrupt was served.
    pub count_value: u64,
    /// Alarm target that fired.
    pub alarm_value: u64,
}

/// Alarm callback. Runs in interrupt context; returning `true` signals that
/// a higher-priority task was unblocked and the scheduler should be invoked
/// on interrupt exit.
pub type OnAlarm = Arc<dyn Fn(&Timer, &AlarmEvent) -> bool + Send + Sync>;

pub(crate) struct DriverInner {
    pub soc: Soc,
    pub registry: GroupRegistry,
}

impl DriverInner {
    /// First-fit scan: ascending group id, ascending slot id. Deterministic,
    /// but not a load-balancing guarantee.
    fn register_to_group(self: &Arc<Self>) -> Result<GroupSlot, Error> {
        for id in 0..GROUP_COUNT {
            let group = self.registry.acquire(&self.soc, id);
            let claimed = group.slots.with(|slots| {
                for (slot, taken) in slots.iter_mut().enumerate() {
                    if !*taken {
                        *taken = true;
                        return Some(slot);
                    }
                }
                None
            });
            if let Some(timer_id) = claimed {
                return Ok(GroupSlot {
                    driver: self.clone(),
                    group,
                    timer_id,
                });
            }
            self.registry.release(&self.soc, id);
        }
        warn!("no free timer slot in any group");
        Err(Error::NotFound)
    }
}

/// The driver context: owns the group registry and the SoC services.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl Driver {
    /// Create a driver running against the given SoC services.
    pub fn new(soc: Soc) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                soc,
                registry: GroupRegistry::new(),
            }),
        }
    }

    /// Create a new timer in the first free slot across all groups.
    ///
    /// The timer comes back in [`State::Init`] with the counter zeroed and
    /// stopped, the interrupt masked and no alarm armed.
    pub fn new_timer(&self, config: Config) -> Result<Timer, Error> {
        // Argument validation happens before anything is acquired, so a
        // rejected config has no observable side effects.
        if config.resolution.to_Hz() == 0 {
            return Err(Error::InvalidArgument);
        }
        if config.intr_priority != 0
            && 1u32
                .checked_shl(config.intr_priority as u32)
                .map_or(true, |bit| bit & ALLOWED_INTR_PRIORITIES == 0)
        {
            return Err(Error::InvalidArgument);
        }
        if config.flags.allow_pd && self.inner.soc.retention.is_none() {
            return Err(Error::NotSupported);
        }

        let slot = self.inner.register_to_group()?;
        let group = slot.group.clone();
        let (g, t) = (group.id, slot.timer_id);
        let soc = &self.inner.soc;

        // Losing retention only costs register state across light sleep,
        // never the timer itself; non-fatal by design.
        let retention = if config.flags.allow_pd {
            match RetentionGuard::register(soc, g, config.flags.backup_before_sleep) {
                Ok(guard) => Some(guard),
                Err(err) => {
                    warn!("sleep retention unavailable for group {}: {:?}", g, err);
                    None
                }
            }
        } else {
            None
        };

        soc.registers.enable_counter(g, t, false);
        soc.registers.set_counter_value(g, t, 0);

        // Errors from here on unwind through the guards already collected:
        // clock disable, PM-lock delete and slot release all happen on drop.
        let clock = select_clock(soc, g, t, config.clk_src, config.resolution)?;

        soc.registers.set_count_direction(g, t, config.direction);

        group.slots.with(|_| {
            soc.registers.enable_interrupt(g, alarm_event_bit(t), false);
            soc.registers.clear_interrupt_status(g, alarm_event_bit(t));
        });

        debug!("new timer ({},{}) resolution {}", g, t, clock.resolution);

        Ok(Timer {
            inner: Arc::new(TimerInner {
                fsm: Fsm::new(),
                resolution: clock.resolution,
                clk_src: config.clk_src,
                intr_priority: config.intr_priority,
                intr_shared: config.flags.intr_shared,
                clock: clock.guard,
                pm_lock: clock.pm_lock,
                shared: Locked::new(TimerShared::new()),
                retention,
                slot,
            }),
        })
    }
}

/// RAII claim on one (group, slot) pair; releases the slot and the group
/// reference on drop.
struct GroupSlot {
    driver: Arc<DriverInner>,
    group: Arc<TimerGroup>,
    timer_id: usize,
}

impl Drop for GroupSlot {
    fn drop(&mut self) {
        self.group.slots.with(|slots| slots[self.timer_id] = false);
        self.driver.registry.release(&self.driver.soc, self.group.id);
    }
}

/// RAII registration with the sleep-retention subsystem.
struct RetentionGuard {
    retention: Arc<dyn SleepRetention>,
    group: usize,
}

impl RetentionGuard {
    fn register(soc: &Soc, group: usize, backup_before_sleep: bool) -> Result<Self, Error> {
        let retention = soc.retention.as_ref().ok_or(Error::NotSupported)?.clone();
        retention.register_group(group, backup_before_sleep)?;
        Ok(Self { retention, group })
    }
}

impl Drop for RetentionGuard {
    fn drop(&mut self) {
        self.retention.unregister_group(self.group);
    }
}

/// Mutable timer state guarded by the per-timer spinlock. Touched from both
/// task context and the alarm ISR.
pub(crate) struct TimerShared {
    pub alarm_count: u64,
    pub reload_count: u64,
    pub auto_reload_on_alarm: bool,
    pub alarm_en: bool,
    pub captured_count: u64,
    pub intr: Option<Box<dyn IntrHandle>>,
    pub on_alarm: Option<OnAlarm>,
}

impl TimerShared {
    fn new() -> Self {
        Self {
            alarm_count: 0,
            reload_count: 0,
            auto_reload_on_alarm: false,
            alarm_en: false,
            captured_count: 0,
            intr: None,
            on_alarm: None,
        }
    }
}

// Field order is teardown order: the interrupt handle (inside `shared`) and
// the PM lock go before the clock guard, the group slot is released last.
pub(crate) struct TimerInner {
    fsm: Fsm,
    resolution: HertzU32,
    clk_src: ClockSource,
    intr_priority: u8,
    intr_shared: bool,
    pub(crate) shared: Locked<TimerShared>,
    pm_lock: Option<Box<dyn PmLock>>,
    clock: ClockGuard,
    retention: Option<RetentionGuard>,
    slot: GroupSlot,
}

impl TimerInner {
    pub(crate) fn soc(&self) -> &Soc {
        &self.slot.driver.soc
    }

    pub(crate) fn group(&self) -> &TimerGroup {
        &self.slot.group
    }

    pub(crate) fn group_id(&self) -> usize {
        self.slot.group.id
    }

    pub(crate) fn timer_id(&self) -> usize {
        self.slot.timer_id
    }

    fn enable(&self) -> Result<(), Error> {
        self.fsm
            .transit(State::Init, State::Enable)
            .map_err(|_| Error::InvalidState)?;
        if let Some(pm_lock) = &self.pm_lock {
            pm_lock.acquire();
        }
        self.shared.with(|shared| {
            if let Some(intr) = &shared.intr {
                intr.enable();
            }
        });
        Ok(())
    }

    fn disable(&self) -> Result<(), Error> {
        self.fsm
            .transit(State::Enable, State::Init)
            .map_err(|_| Error::InvalidState)?;
        self.shared.with(|shared| {
            if let Some(intr) = &shared.intr {
                intr.disable();
            }
        });
        if let Some(pm_lock) = &self.pm_lock {
            pm_lock.release();
        }
        Ok(())
    }

    fn start(&self) -> Result<(), Error> {
        let (g, t) = (self.group_id(), self.timer_id());
        match self.fsm.transit(State::Enable, State::Wait) {
            Ok(()) => {
                self.shared.with(|shared| {
                    let regs = &self.soc().registers;
                    if shared.alarm_en {
                        regs.enable_alarm(g, t, true);
                    }
                    regs.enable_counter(g, t, true);
                    // Commit before leaving the critical section so nobody
                    // ever observes WAIT together with released locks.
                    self.fsm.store(State::Run);
                });
                Ok(())
            }
            // Already running; idempotent, no hardware touched.
            Err(State::Run) => Ok(()),
            Err(_) => Err(Error::InvalidState),
        }
    }

    fn stop(&self) -> Result<(), Error> {
        let (g, t) = (self.group_id(), self.timer_id());
        match self.fsm.transit(State::Run, State::Wait) {
            Ok(()) => {
                self.shared.with(|_| {
                    let regs = &self.soc().registers;
                    regs.enable_counter(g, t, false);
                    regs.enable_alarm(g, t, false);
                    self.fsm.store(State::Enable);
                });
                Ok(())
            }
            // Already stopped; idempotent, no hardware touched.
            Err(State::Enable) => Ok(()),
            Err(_) => Err(Error::InvalidState),
        }
    }

    fn set_alarm_action(&self, config: Option<AlarmConfig>) -> Result<(), Error> {
        let (g, t) = (self.group_id(), self.timer_id());
        let regs = &self.soc().registers;

        if let Some(config) = config {
            // A reload target equal to the alarm target would never trigger
            // the reload; reject before mutating anything.
            if config.auto_reload_on_alarm && config.alarm_count == config.reload_count {
                return Err(Error::InvalidArgument);
            }
            self.shared.with(|shared| {
                shared.reload_count = config.reload_count;
                shared.alarm_count = config.alarm_count;
                shared.auto_reload_on_alarm = config.auto_reload_on_alarm;
                shared.alarm_en = true;
                regs.set_reload_value(g, t, config.reload_count);
                regs.set_alarm_value(g, t, config.alarm_count);
            });
        } else {
            self.shared.with(|shared| {
                shared.auto_reload_on_alarm = false;
                shared.alarm_en = false;
            });
        }

        // Second short section: program the enable bits from the committed
        // flags, re-read under the same lock the ISR uses.
        self.shared.with(|shared| {
            regs.enable_auto_reload(g, t, shared.auto_reload_on_alarm);
            regs.enable_alarm(g, t, shared.alarm_en);
        });
        Ok(())
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        // Deleting a timer that is not in INIT can only happen by dropping
        // the handle; quiesce the hardware before the guards tear down.
        if self.fsm.load() == State::Run {
            warn!(
                "timer ({},{}) dropped while running",
                self.group_id(),
                self.timer_id()
            );
            let _ = self.stop();
        }
        if self.fsm.load() == State::Enable {
            let _ = self.disable();
        }
        debug!("del timer ({},{})", self.group_id(), self.timer_id());
    }
}

/// One general-purpose timer claimed out of a timer group.
///
/// Dropping the handle tears the timer down (stopping and disabling it
/// first when necessary); [`Timer::delete`] does the same but enforces the
/// INIT-state precondition instead of forcing the shutdown.
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl core::fmt::Debug for Timer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Timer")
            .field("group_id", &self.group_id())
            .field("timer_id", &self.timer_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Timer {
    pub(crate) fn from_inner(inner: Arc<TimerInner>) -> Self {
        Self { inner }
    }

    /// Lifecycle state of the timer.
    pub fn state(&self) -> State {
        self.inner.fsm.load()
    }

    /// Actually achieved counting resolution.
    pub fn resolution(&self) -> HertzU32 {
        self.inner.resolution
    }

    /// Clock source the timer counts from.
    pub fn clk_src(&self) -> ClockSource {
        self.inner.clk_src
    }

    /// Group the timer lives in.
    pub fn group_id(&self) -> usize {
        self.inner.group_id()
    }

    /// Slot of the timer within its group.
    pub fn timer_id(&self) -> usize {
        self.inner.timer_id()
    }

    /// Load the counter with a value.
    pub fn set_raw_count(&self, value: u64) {
        let (g, t) = (self.inner.group_id(), self.inner.timer_id());
        self.inner
            .shared
            .with(|_| self.inner.soc().registers.set_counter_value(g, t, value));
    }

    /// Latch and read the current counter value.
    pub fn raw_count(&self) -> u64 {
        let (g, t) = (self.inner.group_id(), self.inner.timer_id());
        self.inner
            .shared
            .with(|_| self.inner.soc().registers.counter_value(g, t))
    }

    /// Counter value captured by the most recent alarm event.
    pub fn captured_count(&self) -> u64 {
        self.inner.shared.with(|shared| shared.captured_count)
    }

    /// Register (or with `None`, unregister) the alarm callback.
    ///
    /// The first registration installs the interrupt vector and is only
    /// legal in [`State::Init`]. Swapping the callback afterwards is legal
    /// in any state: the exchange happens under the per-timer lock, and the
    /// hardware interrupt line simply follows whether a callback is present.
    pub fn register_event_callbacks(&self, on_alarm: Option<OnAlarm>) -> Result<(), Error> {
        let inner = &self.inner;
        let (g, t) = (inner.group_id(), inner.timer_id());
        let has_alarm_cb = on_alarm.is_some();

        inner.shared.with(|shared| -> Result<(), Error> {
            // The vector is only worth allocating once there is a callback
            // to dispatch to; unregistering on a vectorless timer is a no-op.
            if shared.intr.is_some() || !has_alarm_cb {
                return Ok(());
            }
            // Installing a vector on a live timer is rejected; only the
            // callback value itself may change later.
            if inner.fsm.load() != State::Init {
                return Err(Error::InvalidState);
            }
            let weak = Arc::downgrade(inner);
            let handler: IsrHandler = Arc::new(move || {
                if let Some(timer) = weak.upgrade() {
                    crate::isr::handle_alarm(&timer);
                }
            });
            let request = InterruptRequest {
                group: g,
                timer: t,
                priority: inner.intr_priority,
                shared: inner.intr_shared,
                status_mask: alarm_event_bit(t),
            };
            shared.intr = Some(inner.soc().interrupts.allocate(request, handler)?);
            Ok(())
        })?;

        // The status line in the shared enable register follows callback
        // presence; that register belongs to the group critical section.
        inner.group().slots.with(|_| {
            inner
                .soc()
                .registers
                .enable_interrupt(g, alarm_event_bit(t), has_alarm_cb);
        });

        inner.shared.with(|shared| shared.on_alarm = on_alarm);
        Ok(())
    }

    /// Program (or with `None`, disarm) the alarm.
    ///
    /// Can be called in any state, including from within the alarm callback,
    /// which is the supported way to chain one-shot alarms, since the
    /// hardware disarms the alarm line on every fire.
    pub fn set_alarm_action(&self, config: Option<AlarmConfig>) -> Result<(), Error> {
        self.inner.set_alarm_action(config)
    }

    /// Arm the interrupt machinery and take the power-management lock:
    /// [`State::Init`] -> [`State::Enable`].
    pub fn enable(&self) -> Result<(), Error> {
        self.inner.enable()
    }

    /// Release the interrupt machinery and the power-management lock:
    /// [`State::Enable`] -> [`State::Init`].
    pub fn disable(&self) -> Result<(), Error> {
        self.inner.disable()
    }

    /// Start the counter: [`State::Enable`] -> [`State::Run`]. Calling this
    /// on a running timer is a no-op success.
    pub fn start(&self) -> Result<(), Error> {
        self.inner.start()
    }

    /// Stop the counter: [`State::Run`] -> [`State::Enable`]. Calling this
    /// on a stopped-but-enabled timer is a no-op success.
    pub fn stop(&self) -> Result<(), Error> {
        self.inner.stop()
    }

    /// Delete the timer, releasing its slot, clock, interrupt and locks.
    ///
    /// Only legal in [`State::Init`]; otherwise the untouched handle is
    /// returned together with [`Error::InvalidState`].
    pub fn delete(self) -> Result<(), (Error, Self)> {
        if self.inner.fsm.load() != State::Init {
            return Err((Error::InvalidState, self));
        }
        Ok(())
    }
}
