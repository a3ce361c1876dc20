//! The alarm interrupt service path.

use alloc::sync::Arc;

use crate::{
    driver::{AlarmEvent, Timer, TimerInner},
    soc::alarm_event_bit,
};

/// Serve an alarm interrupt for one timer.
///
/// The status register is shared by every timer in the group and the vector
/// may be on a shared line, so this handler can run when another timer's
/// event (or none at all) is pending; it then simply returns. An ISR has no
/// caller to report errors to, so every check here just bails out.
pub(crate) fn handle_alarm(inner: &Arc<TimerInner>) {
    let soc = inner.soc();
    let (g, t) = (inner.group_id(), inner.timer_id());

    let status = soc.registers.interrupt_status(g);
    if status & alarm_event_bit(t) == 0 {
        return;
    }

    let count_value = soc.registers.counter_value(g, t);
    let alarm_value = inner.shared.with_from_isr(|shared| {
        shared.captured_count = count_value;
        shared.alarm_count
    });
    let event = AlarmEvent {
        count_value,
        alarm_value,
    };

    // Status clear and re-arm must be atomic against the other timers'
    // handlers in this group and against task code reprogramming the alarm:
    // group critical section first, per-timer nested inside.
    inner.group().slots.with_from_isr(|_| {
        soc.registers.clear_interrupt_status(g, alarm_event_bit(t));
        // The hardware disarmed the alarm when it fired; re-arming here is
        // what makes auto-reload alarms periodic. One-shot users re-arm
        // with `set_alarm_action` from their callback instead. The flag
        // check and the enable write stay in one per-timer section so a
        // concurrent `set_alarm_action(None)` cannot slip between them and
        // get its disarm overwritten.
        inner.shared.with_from_isr(|shared| {
            if shared.auto_reload_on_alarm {
                soc.registers.enable_alarm(g, t, true);
            }
        });
    });

    // The callback runs outside any critical section.
    let on_alarm = inner.shared.with_from_isr(|shared| shared.on_alarm.clone());
    if let Some(on_alarm) = on_alarm {
        let timer = Timer::from_inner(inner.clone());
        if on_alarm(&timer, &event) {
            soc.interrupts.yield_from_isr();
        }
    }
}
