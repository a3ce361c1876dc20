//! Timer-group pooling: lazy group construction, reference counting and the
//! shared bus-clock enable bit.

use alloc::sync::Arc;
use core::cell::RefCell;

use critical_section::Mutex;
use log::debug;

use crate::{
    soc::{Soc, GROUP_COUNT, TIMERS_PER_GROUP},
    sync::Locked,
};

/// Reference counts for the group bus-clock enable bits.
///
/// The enable bit is a physical resource shared with peripherals outside
/// this driver (the group watchdog rides the same bit), so it is counted
/// separately from the registry's own group lifetime count: one tier decides
/// whether a `TimerGroup` object exists, this tier decides whether the
/// physical clock bit is on.
pub(crate) struct SharedClockRefs {
    counts: Mutex<RefCell<[usize; GROUP_COUNT]>>,
}

impl SharedClockRefs {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(RefCell::new([0; GROUP_COUNT])),
        }
    }

    /// Increment the sharer count of `bit`, running `turn_on` only on the
    /// 0 -> 1 transition.
    pub fn acquire(&self, bit: usize, turn_on: impl FnOnce()) {
        critical_section::with(|cs| {
            let mut counts = self.counts.borrow_ref_mut(cs);
            let prev = counts[bit];
            counts[bit] += 1;
            log::trace!("bus clock {} ref {} -> {}", bit, prev, prev + 1);
            if prev == 0 {
                turn_on();
            }
        })
    }

    /// Decrement the sharer count of `bit`, running `turn_off` only on the
    /// 1 -> 0 transition.
    pub fn release(&self, bit: usize, turn_off: impl FnOnce()) {
        critical_section::with(|cs| {
            let mut counts = self.counts.borrow_ref_mut(cs);
            let prev = counts[bit];
            assert!(prev != 0, "unbalanced bus clock release");
            counts[bit] -= 1;
            log::trace!("bus clock {} ref {} -> {}", bit, prev, prev - 1);
            if prev == 1 {
                turn_off();
            }
        })
    }
}

/// One hardware timer group: a fixed set of timer slots behind a shared
/// interrupt status register and one spinlock.
pub(crate) struct TimerGroup {
    pub id: usize,
    /// Slot occupancy. The lock on this table doubles as the group critical
    /// section guarding the shared interrupt status/enable registers.
    pub slots: Locked<[bool; TIMERS_PER_GROUP]>,
}

impl TimerGroup {
    fn new(id: usize) -> Self {
        Self {
            id,
            slots: Locked::new([false; TIMERS_PER_GROUP]),
        }
    }
}

struct GroupEntry {
    group: Option<Arc<TimerGroup>>,
    ref_count: usize,
}

/// Maps group ids to lazily-created, reference-counted [`TimerGroup`]s.
///
/// A group object exists exactly while its reference count is non-zero;
/// creation enables the bus clock and resets the register file (through
/// [`SharedClockRefs`], since the clock bit has sharers outside this
/// registry), destruction disables it symmetrically.
pub(crate) struct GroupRegistry {
    entries: Locked<[GroupEntry; GROUP_COUNT]>,
    rcc: SharedClockRefs,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            entries: Locked::new(core::array::from_fn(|_| GroupEntry {
                group: None,
                ref_count: 0,
            })),
            rcc: SharedClockRefs::new(),
        }
    }

    /// Get the group for `id`, creating it on first use, and take one
    /// reference on it. Every `acquire` must be paired with one
    /// [`GroupRegistry::release`].
    pub fn acquire(&self, soc: &Soc, id: usize) -> Arc<TimerGroup> {
        self.entries.with(|entries| {
            let entry = &mut entries[id];
            let group = match &entry.group {
                Some(group) => group.clone(),
                None => {
                    let group = Arc::new(TimerGroup::new(id));
                    self.rcc.acquire(id, || {
                        soc.registers.enable_bus_clock(id, true);
                        soc.registers.reset_registers(id);
                    });
                    entry.group = Some(group.clone());
                    debug!("new group ({})", id);
                    group
                }
            };
            entry.ref_count += 1;
            group
        })
    }

    /// Drop one reference on group `id`, destroying it when the last
    /// reference goes away.
    pub fn release(&self, soc: &Soc, id: usize) {
        self.entries.with(|entries| {
            let entry = &mut entries[id];
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                entry.group = None;
                self.rcc.release(id, || soc.registers.enable_bus_clock(id, false));
                debug!("del group ({})", id);
            }
        })
    }
}
