//! Clock-source selection and prescale derivation.

use alloc::{boxed::Box, sync::Arc};

use fugit::HertzU32;
use log::{debug, warn};

use crate::{
    soc::{ClockSource, ClockTree, PmLock, PmLockKind, Soc, MAX_DIVIDER, MIN_DIVIDER},
    Error,
};

/// Keeps a reference-counted clock source enabled for the lifetime of a
/// timer; the drop pairs the enable taken in [`select_clock`].
pub(crate) struct ClockGuard {
    clock_tree: Arc<dyn ClockTree>,
    source: ClockSource,
}

impl Drop for ClockGuard {
    fn drop(&mut self) {
        if self.clock_tree.enable(self.source, false).is_err() {
            warn!("failed to release clock source {:?}", self.source);
        }
    }
}

/// Outcome of selecting a clock source for one timer.
pub(crate) struct ClockSelection {
    /// Actually achieved resolution, post-prescale.
    pub resolution: HertzU32,
    /// Power-management lock pinning the source frequency, when the build
    /// has power management.
    pub pm_lock: Option<Box<dyn PmLock>>,
    /// Keeps the source oscillator enabled.
    pub guard: ClockGuard,
}

/// Integer divider bringing `source_freq` down to `resolution`.
///
/// A divider below the hardware minimum (including the "source slower than
/// the requested resolution" case, where the floor is 0) or above the
/// maximum is rejected; dividers are never silently wrapped or clamped into
/// range.
pub(crate) fn divider_for(source_freq: HertzU32, resolution: HertzU32) -> Result<u32, Error> {
    debug_assert!(resolution.to_Hz() != 0);
    let divider = source_freq.to_Hz() / resolution.to_Hz();
    if !(MIN_DIVIDER..=MAX_DIVIDER).contains(&divider) {
        warn!(
            "divider {} for {} / {} out of range [{}, {}]",
            divider,
            source_freq,
            resolution,
            MIN_DIVIDER,
            MAX_DIVIDER
        );
        return Err(Error::InvalidArgument);
    }
    Ok(divider)
}

/// Resolve `source`, enable it, derive and program the prescaler for the
/// requested resolution and take a power-management lock so frequency
/// scaling cannot invalidate the derived divider while the timer lives.
pub(crate) fn select_clock(
    soc: &Soc,
    group: usize,
    timer: usize,
    source: ClockSource,
    requested: HertzU32,
) -> Result<ClockSelection, Error> {
    let source_freq = soc.clock_tree.frequency(source)?;

    let pm_lock = match &soc.power {
        Some(power) => {
            let kind = match source {
                ClockSource::Apb => PmLockKind::MaxApbFrequency,
                _ => PmLockKind::NoLightSleep,
            };
            Some(power.create_lock(kind, "gptimer")?)
        }
        None => None,
    };

    soc.clock_tree.enable(source, true)?;
    let guard = ClockGuard {
        clock_tree: soc.clock_tree.clone(),
        source,
    };

    let divider = divider_for(source_freq, requested)?;
    soc.registers.set_clock_prescale(group, timer, divider);

    let resolution = HertzU32::from_raw(source_freq.to_Hz() / divider);
    if resolution != requested {
        // Not an error: the approximation is documented, callers read the
        // actual value back through `Timer::resolution`.
        warn!(
            "resolution lost, expect {}, real {}",
            requested, resolution
        );
    }
    debug!(
        "timer ({},{}) clock {:?} {} divider {}",
        group, timer, source, source_freq, divider
    );

    Ok(ClockSelection {
        resolution,
        pm_lock,
        guard,
    })
}
