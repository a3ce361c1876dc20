//! Simulated SoC collaborators backing the driver tests.
//!
//! The simulation keeps per-timer register cells plus counters for the
//! side effects the tests assert on: bus-clock edges, hardware writes,
//! clock-tree reference counts, PM-lock balance and ISR yield requests.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use esp_gptimer::{
    soc::{
        ClockSource, ClockTree, Direction, InterruptController, InterruptRequest, IntrHandle,
        IsrHandler, PmLock, PmLockKind, PowerManager, SleepRetention, Soc, TimerRegisters,
        GROUP_COUNT, TIMERS_PER_GROUP,
    },
    Error,
};
use fugit::HertzU32;

#[derive(Default)]
pub struct TimerCell {
    pub counter: AtomicU64,
    pub alarm_value: AtomicU64,
    pub reload_value: AtomicU64,
    pub prescale: AtomicU32,
    pub count_up: AtomicBool,
    pub counter_en: AtomicBool,
    pub alarm_en: AtomicBool,
    pub auto_reload_en: AtomicBool,
}

#[derive(Default)]
pub struct GroupCell {
    pub timers: [TimerCell; TIMERS_PER_GROUP],
    pub int_status: AtomicU32,
    pub int_ena: AtomicU32,
    pub bus_clock_on: AtomicBool,
    pub resets: AtomicUsize,
}

/// Register file double. Every mutating access bumps `hw_writes` so tests
/// can assert that no-op paths really touch no hardware.
#[derive(Default)]
pub struct SimRegisters {
    pub groups: [GroupCell; GROUP_COUNT],
    pub bus_clock_enables: AtomicUsize,
    pub bus_clock_disables: AtomicUsize,
    pub hw_writes: AtomicUsize,
}

impl SimRegisters {
    fn wrote(&self) {
        self.hw_writes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.hw_writes.load(Ordering::SeqCst)
    }
}

impl TimerRegisters for SimRegisters {
    fn enable_bus_clock(&self, group: usize, enable: bool) {
        self.wrote();
        self.groups[group].bus_clock_on.store(enable, Ordering::SeqCst);
        if enable {
            self.bus_clock_enables.fetch_add(1, Ordering::SeqCst);
        } else {
            self.bus_clock_disables.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn reset_registers(&self, group: usize) {
        self.wrote();
        self.groups[group].resets.fetch_add(1, Ordering::SeqCst);
    }

    fn set_clock_prescale(&self, group: usize, timer: usize, divider: u32) {
        self.wrote();
        self.groups[group].timers[timer]
            .prescale
            .store(divider, Ordering::SeqCst);
    }

    fn set_count_direction(&self, group: usize, timer: usize, direction: Direction) {
        self.wrote();
        self.groups[group].timers[timer]
            .count_up
            .store(direction == Direction::Up, Ordering::SeqCst);
    }

    fn enable_counter(&self, group: usize, timer: usize, enable: bool) {
        self.wrote();
        self.groups[group].timers[timer]
            .counter_en
            .store(enable, Ordering::SeqCst);
    }

    fn set_counter_value(&self, group: usize, timer: usize, value: u64) {
        self.wrote();
        self.groups[group].timers[timer]
            .counter
            .store(value, Ordering::SeqCst);
    }

    fn counter_value(&self, group: usize, timer: usize) -> u64 {
        self.groups[group].timers[timer].counter.load(Ordering::SeqCst)
    }

    fn set_alarm_value(&self, group: usize, timer: usize, value: u64) {
        self.wrote();
        self.groups[group].timers[timer]
            .alarm_value
            .store(value, Ordering::SeqCst);
    }

    fn set_reload_value(&self, group: usize, timer: usize, value: u64) {
        self.wrote();
        self.groups[group].timers[timer]
            .reload_value
            .store(value, Ordering::SeqCst);
    }

    fn enable_alarm(&self, group: usize, timer: usize, enable: bool) {
        self.wrote();
        self.groups[group].timers[timer]
            .alarm_en
            .store(enable, Ordering::SeqCst);
    }

    fn enable_auto_reload(&self, group: usize, timer: usize, enable: bool) {
        self.wrote();
        self.groups[group].timers[timer]
            .auto_reload_en
            .store(enable, Ordering::SeqCst);
    }

    fn enable_interrupt(&self, group: usize, mask: u32, enable: bool) {
        self.wrote();
        if enable {
            self.groups[group].int_ena.fetch_or(mask, Ordering::SeqCst);
        } else {
            self.groups[group].int_ena.fetch_and(!mask, Ordering::SeqCst);
        }
    }

    fn interrupt_status(&self, group: usize) -> u32 {
        self.groups[group].int_status.load(Ordering::SeqCst)
    }

    fn clear_interrupt_status(&self, group: usize, mask: u32) {
        self.wrote();
        self.groups[group].int_status.fetch_and(!mask, Ordering::SeqCst);
    }
}

/// Clock tree double with adjustable source frequencies and a per-source
/// enable reference count.
pub struct SimClockTree {
    freqs: Mutex<HashMap<ClockSource, u32>>,
    refs: Mutex<HashMap<ClockSource, i64>>,
    pub fail_frequency: AtomicBool,
}

impl SimClockTree {
    pub fn new() -> Self {
        let mut freqs = HashMap::new();
        freqs.insert(ClockSource::Apb, 80_000_000);
        freqs.insert(ClockSource::Xtal, 40_000_000);
        freqs.insert(ClockSource::RcFast, 17_500_000);
        Self {
            freqs: Mutex::new(freqs),
            refs: Mutex::new(HashMap::new()),
            fail_frequency: AtomicBool::new(false),
        }
    }

    pub fn set_frequency(&self, source: ClockSource, hz: u32) {
        self.freqs.lock().unwrap().insert(source, hz);
    }

    pub fn refs(&self, source: ClockSource) -> i64 {
        *self.refs.lock().unwrap().get(&source).unwrap_or(&0)
    }
}

impl ClockTree for SimClockTree {
    fn frequency(&self, source: ClockSource) -> Result<HertzU32, Error> {
        if self.fail_frequency.load(Ordering::SeqCst) {
            return Err(Error::Internal);
        }
        Ok(HertzU32::from_raw(self.freqs.lock().unwrap()[&source]))
    }

    fn enable(&self, source: ClockSource, enable: bool) -> Result<(), Error> {
        let mut refs = self.refs.lock().unwrap();
        let count = refs.entry(source).or_insert(0);
        *count += if enable { 1 } else { -1 };
        assert!(*count >= 0, "clock source disabled more often than enabled");
        Ok(())
    }
}

struct SimVector {
    handler: IsrHandler,
    enabled: Arc<AtomicBool>,
}

type VectorTable = Mutex<HashMap<(usize, usize), SimVector>>;

/// Interrupt matrix double: stores the allocated handler per (group, timer)
/// and lets the tests fire it like the hardware would.
pub struct SimInterrupts {
    table: Arc<VectorTable>,
    pub yields: AtomicUsize,
    pub allocated: AtomicUsize,
    pub exhausted: AtomicBool,
}

impl SimInterrupts {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            yields: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Invoke the vector of (group, timer), honoring its enable state.
    /// Returns whether a handler actually ran.
    pub fn fire(&self, group: usize, timer: usize) -> bool {
        let vector = {
            let table = self.table.lock().unwrap();
            match table.get(&(group, timer)) {
                Some(v) if v.enabled.load(Ordering::SeqCst) => Some(v.handler.clone()),
                _ => None,
            }
        };
        match vector {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    pub fn vectors_live(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

struct SimIntrHandle {
    key: (usize, usize),
    enabled: Arc<AtomicBool>,
    table: Arc<VectorTable>,
}

impl IntrHandle for SimIntrHandle {
    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

impl Drop for SimIntrHandle {
    fn drop(&mut self) {
        self.table.lock().unwrap().remove(&self.key);
    }
}

impl InterruptController for SimInterrupts {
    fn allocate(
        &self,
        request: InterruptRequest,
        handler: IsrHandler,
    ) -> Result<Box<dyn IntrHandle>, Error> {
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(Error::NoMemory);
        }
        let key = (request.group, request.timer);
        let enabled = Arc::new(AtomicBool::new(false));
        let mut table = self.table.lock().unwrap();
        assert!(
            !table.contains_key(&key),
            "vector for {:?} allocated twice",
            key
        );
        table.insert(
            key,
            SimVector {
                handler,
                enabled: enabled.clone(),
            },
        );
        self.allocated.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimIntrHandle {
            key,
            enabled,
            table: self.table.clone(),
        }))
    }

    fn yield_from_isr(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
    }
}

struct SimPmLock {
    acquired: Arc<AtomicI64>,
    deleted: Arc<AtomicUsize>,
}

impl PmLock for SimPmLock {
    fn acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        let prev = self.acquired.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "PM lock released more often than acquired");
    }
}

impl Drop for SimPmLock {
    fn drop(&mut self) {
        self.deleted.fetch_add(1, Ordering::SeqCst);
    }
}

/// Power-management double tracking lock balance.
pub struct SimPower {
    pub created: AtomicUsize,
    deleted: Arc<AtomicUsize>,
    acquired: Arc<AtomicI64>,
    pub last_kind: Mutex<Option<PmLockKind>>,
}

impl SimPower {
    pub fn new() -> Self {
        Self {
            created: AtomicUsize::new(0),
            deleted: Arc::new(AtomicUsize::new(0)),
            acquired: Arc::new(AtomicI64::new(0)),
            last_kind: Mutex::new(None),
        }
    }

    pub fn acquired(&self) -> i64 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }
}

impl PowerManager for SimPower {
    fn create_lock(
        &self,
        kind: PmLockKind,
        _name: &'static str,
    ) -> Result<Box<dyn PmLock>, Error> {
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.last_kind.lock().unwrap() = Some(kind);
        Ok(Box::new(SimPmLock {
            acquired: self.acquired.clone(),
            deleted: self.deleted.clone(),
        }))
    }
}

/// Sleep-retention double; can be made to fail to exercise the best-effort
/// path.
pub struct SimRetention {
    pub fail: AtomicBool,
    pub registered: AtomicUsize,
    pub unregistered: AtomicUsize,
}

impl SimRetention {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            registered: AtomicUsize::new(0),
            unregistered: AtomicUsize::new(0),
        }
    }
}

impl SleepRetention for SimRetention {
    fn register_group(&self, _group: usize, _backup_before_sleep: bool) -> Result<(), Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Internal);
        }
        self.registered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister_group(&self, _group: usize) {
        self.unregistered.fetch_add(1, Ordering::SeqCst);
    }
}

/// The full simulated SoC.
pub struct SimSoc {
    pub registers: Arc<SimRegisters>,
    pub clock_tree: Arc<SimClockTree>,
    pub interrupts: Arc<SimInterrupts>,
    pub power: Arc<SimPower>,
    pub retention: Arc<SimRetention>,
}

impl SimSoc {
    pub fn new() -> Self {
        Self {
            registers: Arc::new(SimRegisters::default()),
            clock_tree: Arc::new(SimClockTree::new()),
            interrupts: Arc::new(SimInterrupts::new()),
            power: Arc::new(SimPower::new()),
            retention: Arc::new(SimRetention::new()),
        }
    }

    /// Bundle with all collaborators present.
    pub fn soc(&self) -> Soc {
        Soc {
            registers: self.registers.clone(),
            clock_tree: self.clock_tree.clone(),
            interrupts: self.interrupts.clone(),
            power: Some(self.power.clone()),
            retention: Some(self.retention.clone()),
        }
    }

    /// Bundle for a target without power management or sleep retention.
    pub fn bare_soc(&self) -> Soc {
        Soc {
            registers: self.registers.clone(),
            clock_tree: self.clock_tree.clone(),
            interrupts: self.interrupts.clone(),
            power: None,
            retention: None,
        }
    }

    /// Emulate the hardware raising the alarm event of (group, timer):
    /// disarm the alarm, latch the status bit, deliver the interrupt if the
    /// line is enabled, then apply auto-reload. Returns whether a handler
    /// ran.
    pub fn trigger_alarm(&self, group: usize, timer: usize) -> bool {
        let cell = &self.registers.groups[group].timers[timer];
        if !cell.counter_en.load(Ordering::SeqCst) || !cell.alarm_en.load(Ordering::SeqCst) {
            return false;
        }
        // The comparator disarms itself on fire; the driver's ISR re-arms
        // it for auto-reload alarms.
        cell.alarm_en.store(false, Ordering::SeqCst);
        self.registers.groups[group]
            .int_status
            .fetch_or(1 << timer, Ordering::SeqCst);

        let line_enabled =
            self.registers.groups[group].int_ena.load(Ordering::SeqCst) & (1 << timer) != 0;
        let delivered = line_enabled && self.interrupts.fire(group, timer);

        if cell.auto_reload_en.load(Ordering::SeqCst) {
            cell.counter
                .store(cell.reload_value.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        delivered
    }
}
