//! # General-purpose Timer (GPTIMER) driver
//!
//! ## Overview
//!
//! The SoC bundles its general-purpose timers into a small number of timer
//! groups. Each group shares one interrupt status register and one bus-clock
//! enable bit between its timers. This crate pools those timers: callers ask
//! the [`Driver`] for *a* timer, and the driver claims the first free slot
//! across all groups, lazily powering groups up and down as timers come and
//! go.
//!
//! Each [`Timer`] is based on a 16-bit prescaler and a 64-bit
//! auto-reload-capable up-down counter, and walks a small lifecycle state
//! machine ([`State`]): `Init` → `enable()` → `Enable` → `start()` → `Run`.
//! Alarms are a hardware comparator on the counter; when one fires, the
//! registered callback runs in interrupt context with a snapshot of the
//! counter and alarm values.
//!
//! The driver does not touch hardware directly. Everything SoC-specific
//! (the register file, the clock tree, the interrupt matrix, power-management
//! locks and sleep retention) is consumed through the traits in [`soc`] and
//! injected via [`soc::Soc`], so the same driver logic serves different
//! chips and test doubles.
//!
//! ## Configuration
//!
//! A timer is created from a [`Config`]: requested resolution, clock source,
//! count direction, interrupt priority and flags. The achieved resolution
//! may differ from the requested one when the source frequency is not an
//! integer multiple; the actual value is reported by [`Timer::resolution`].
//!
//! ## Examples
//!
//! ```rust, no_run
//! use esp_gptimer::{AlarmConfig, Config, Driver};
//! # fn example(soc: esp_gptimer::soc::Soc) -> Result<(), esp_gptimer::Error> {
//! let driver = Driver::new(soc);
//! let timer = driver.new_timer(Config::default())?;
//!
//! timer.set_alarm_action(Some(AlarmConfig {
//!     alarm_count: 1_000_000,
//!     reload_count: 0,
//!     auto_reload_on_alarm: true,
//! }))?;
//! timer.enable()?;
//! timer.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
#![doc = document_features::document_features!()]
#![no_std]

extern crate alloc;

mod clock;
mod driver;
mod isr;
mod registry;
pub mod soc;
mod sync;

pub use driver::{AlarmConfig, AlarmEvent, Config, ConfigFlags, Driver, OnAlarm, State, Timer};
pub use soc::{ClockSource, Direction};

/// Driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// An argument is out of range or inconsistent (zero resolution,
    /// disallowed interrupt priority, divider outside the hardware range,
    /// auto-reload target equal to the alarm target).
    InvalidArgument,
    /// The operation is not legal in the timer's current lifecycle state.
    InvalidState,
    /// No free timer slot is left in any group.
    NotFound,
    /// A collaborator ran out of resources (e.g. interrupt vectors).
    NoMemory,
    /// The configuration requests a capability the target cannot provide.
    NotSupported,
    /// A SoC collaborator reported an unexpected failure.
    Internal,
}
