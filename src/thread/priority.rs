//! VM priority mapping onto kernel scheduling classes.
//!
//! Three stages. A VM priority (1..10 or critical) goes through a
//! configurable table to the 0..127 native scale, then gets scaled
//! proportionally into the bounds of whichever scheduling class the process
//! actually runs under. The class is probed once at startup; its bounds never
//! change afterwards.

use std::io;

/// The priority bounds of one scheduling class. `max` may be numerically
/// smaller than `min` (nice values), the scaling handles either direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClassLimits {
    pub min: i32,
    pub max: i32,
    /// Sentinel in the mapping table meaning "leave the kernel value alone".
    pub no_change: i32,
}

/// The kernel scheduling class this process runs under, with its bounds.
/// A closed set; probing an unknown kernel policy falls back to
/// [`SchedClass::TimeShare`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedClass {
    /// Strict-priority preemptive class, privileged.
    RealTime(ClassLimits),
    /// Time-share with an interactivity boost.
    Interactive(ClassLimits),
    /// The default fair class.
    TimeShare(ClassLimits),
    /// Fixed priority, no decay. The target of a critical-tier switch.
    FixedPriority(ClassLimits),
}

impl SchedClass {
    pub fn limits(&self) -> ClassLimits {
        match *self {
            SchedClass::RealTime(l)
            | SchedClass::Interactive(l)
            | SchedClass::TimeShare(l)
            | SchedClass::FixedPriority(l) => l,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedClass::RealTime(_) => "real-time",
            SchedClass::Interactive(_) => "interactive",
            SchedClass::TimeShare(_) => "time-share",
            SchedClass::FixedPriority(_) => "fixed-priority",
        }
    }

    /// Probe the class the calling process runs under.
    pub fn current() -> Self {
        platform_current_class()
    }
}

/// A VM-scale thread priority.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmPriority {
    /// The ordinary 1 (lowest) to 10 (highest) scale.
    Level(u8),
    /// Above every ordinary level. Asks for the most privileged scheduling
    /// class available, falling back inside the current class when the switch
    /// is denied.
    Critical,
}

impl VmPriority {
    pub const MIN: VmPriority = VmPriority::Level(1);
    pub const NORMAL: VmPriority = VmPriority::Level(5);
    pub const MAX: VmPriority = VmPriority::Level(10);

    /// An out-of-range level is a contract violation; release builds clamp.
    pub fn new(level: u8) -> VmPriority {
        debug_assert!((1..=10).contains(&level), "priority {} out of range", level);
        VmPriority::Level(level.clamp(1, 10))
    }

    pub(crate) fn to_raw(self) -> i32 {
        match self {
            VmPriority::Level(level) => level as i32,
            VmPriority::Critical => 11,
        }
    }

    pub(crate) fn from_raw(raw: i32) -> Option<VmPriority> {
        match raw {
            1..=10 => Some(VmPriority::Level(raw as u8)),
            11 => Some(VmPriority::Critical),
            _ => None,
        }
    }
}

/// How a priority request was honored.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PriorityOutcome {
    /// The requested priority is in effect.
    Applied,
    /// The thread has no scheduling-unit id yet; the request is remembered
    /// and will be replayed by the thread itself once it runs.
    Deferred,
    /// A critical request could not switch class (typically a privilege
    /// failure); the best priority of the original class is in effect instead.
    FellBack,
}

/// VM level to native 0..127 scale. Index 0 is unused; the table ships with an
/// even spread but is meant to be tuned per deployment.
#[derive(Debug, Clone)]
pub struct PriorityTable {
    entries: [u8; 11],
}

impl Default for PriorityTable {
    fn default() -> Self {
        PriorityTable {
            entries: [0, 12, 25, 38, 51, 64, 76, 89, 102, 114, 127],
        }
    }
}

impl PriorityTable {
    pub fn new(entries: [u8; 11]) -> Self {
        PriorityTable { entries }
    }

    pub fn native_for(&self, prio: VmPriority) -> u8 {
        match prio {
            VmPriority::Level(level) => self.entries[level.clamp(1, 10) as usize],
            VmPriority::Critical => 127,
        }
    }
}

/// Proportionally place a 0..127 native priority inside a class's bounds.
/// 127 pins to the class maximum exactly; everything else interpolates, so the
/// result never exceeds `max` in the direction of increasing priority and
/// never falls outside `[min, max]`.
pub fn scale_to_class(native: u8, limits: ClassLimits) -> i32 {
    let x = native.min(127) as i64;
    if x == 127 {
        return limits.max;
    }
    let (min, max) = (limits.min as i64, limits.max as i64);
    (x * (max - min) / 128 + min) as i32
}

/// The startup-probed scheduling policy, shared by the service and by every
/// thread replaying a deferred request.
pub struct PriorityPolicy {
    class: SchedClass,
    table: PriorityTable,
}

impl PriorityPolicy {
    pub fn probe() -> Self {
        let class = SchedClass::current();
        debug!("scheduling class: {} {:?}", class.name(), class.limits());
        PriorityPolicy {
            class,
            table: PriorityTable::default(),
        }
    }

    pub fn with_table(mut self, table: PriorityTable) -> Self {
        self.table = table;
        self
    }

    pub fn class(&self) -> SchedClass {
        self.class
    }

    /// The native-scale priority a VM priority maps to under the table.
    pub fn native_for(&self, prio: VmPriority) -> u8 {
        self.table.native_for(prio)
    }

    /// Apply `prio` to the thread with kernel id `unit_id`.
    ///
    /// Critical first tries to move the thread into the most privileged class
    /// at its maximum; a denied switch degrades to the current class's
    /// maximum. Kernel refusals never propagate, a thread always starts.
    pub fn apply(&self, unit_id: i64, prio: VmPriority) -> PriorityOutcome {
        let limits = self.class.limits();
        if prio == VmPriority::Critical {
            match platform_enter_privileged_class(unit_id) {
                Ok(()) => {
                    trace!("thread {} entered privileged class", unit_id);
                    return PriorityOutcome::Applied;
                }
                Err(err) => {
                    debug!(
                        "privileged class denied for thread {} ({}), staying {}",
                        unit_id,
                        err,
                        self.class.name()
                    );
                    if let Err(err) = platform_set_priority(unit_id, &self.class, limits.max) {
                        warn!("priority fallback failed for thread {}: {}", unit_id, err);
                    }
                    return PriorityOutcome::FellBack;
                }
            }
        }
        let native = self.table.native_for(prio);
        let value = scale_to_class(native, limits);
        if value == limits.no_change {
            return PriorityOutcome::Applied;
        }
        if let Err(err) = platform_set_priority(unit_id, &self.class, value) {
            debug!("set_priority({}) for thread {} refused: {}", value, unit_id, err);
        }
        PriorityOutcome::Applied
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn limits_for_policy(policy: libc::c_int) -> ClassLimits {
            let min = unsafe { libc::sched_get_priority_min(policy) };
            let max = unsafe { libc::sched_get_priority_max(policy) };
            ClassLimits { min, max, no_change: i32::MIN }
        }

        fn platform_current_class() -> SchedClass {
            // Nice values: 19 is weakest, -20 strongest, so min > max.
            let nice = ClassLimits { min: 19, max: -20, no_change: i32::MIN };
            match unsafe { libc::sched_getscheduler(0) } {
                libc::SCHED_FIFO => SchedClass::RealTime(limits_for_policy(libc::SCHED_FIFO)),
                libc::SCHED_RR => SchedClass::FixedPriority(limits_for_policy(libc::SCHED_RR)),
                _ => SchedClass::TimeShare(nice),
            }
        }

        fn platform_set_priority(unit_id: i64, class: &SchedClass, value: i32) -> io::Result<()> {
            use crate::util::memory::wrap_libc_call;
            match class {
                SchedClass::TimeShare(_) | SchedClass::Interactive(_) => wrap_libc_call(
                    // PRIO_PROCESS's type differs between libcs.
                    &|| unsafe {
                        libc::setpriority(libc::PRIO_PROCESS as _, unit_id as libc::id_t, value)
                    },
                    0,
                ),
                SchedClass::RealTime(_) | SchedClass::FixedPriority(_) => {
                    let param = libc::sched_param { sched_priority: value };
                    wrap_libc_call(
                        &|| unsafe { libc::sched_setparam(unit_id as libc::pid_t, &param) },
                        0,
                    )
                }
            }
        }

        fn platform_enter_privileged_class(unit_id: i64) -> io::Result<()> {
            use crate::util::memory::wrap_libc_call;
            let limits = limits_for_policy(libc::SCHED_FIFO);
            let param = libc::sched_param { sched_priority: limits.max };
            wrap_libc_call(
                &|| unsafe {
                    libc::sched_setscheduler(unit_id as libc::pid_t, libc::SCHED_FIFO, &param)
                },
                0,
            )
        }
    } else {
        fn platform_current_class() -> SchedClass {
            SchedClass::TimeShare(ClassLimits { min: 19, max: -20, no_change: i32::MIN })
        }

        fn platform_set_priority(_unit_id: i64, _class: &SchedClass, _value: i32) -> io::Result<()> {
            Ok(())
        }

        fn platform_enter_privileged_class(_unit_id: i64) -> io::Result<()> {
            Err(io::Error::from_raw_os_error(libc::EPERM))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RT: ClassLimits = ClassLimits { min: 1, max: 99, no_change: i32::MIN };
    const NICE: ClassLimits = ClassLimits { min: 19, max: -20, no_change: i32::MIN };

    #[test]
    fn full_scale_pins_to_class_max() {
        assert_eq!(scale_to_class(127, RT), 99);
        assert_eq!(scale_to_class(127, NICE), -20);
    }

    #[test]
    fn above_max_clamps_never_wraps() {
        // A request above the representable native scale degrades to the
        // class maximum, never past it and never negative in a class whose
        // range is non-negative.
        assert_eq!(scale_to_class(255, RT), 99);
        for x in 0..=255u8 {
            let v = scale_to_class(x, RT);
            assert!((RT.min..=RT.max).contains(&v));
        }
    }

    #[test]
    fn zero_maps_to_class_min() {
        assert_eq!(scale_to_class(0, RT), 1);
        assert_eq!(scale_to_class(0, NICE), 19);
    }

    #[test]
    fn scaling_is_monotonic() {
        let mut last = i32::MIN;
        for x in 0..=127u8 {
            let v = scale_to_class(x, RT);
            assert!(v >= last);
            last = v;
        }
        // Nice values run the other way.
        let mut last = i32::MAX;
        for x in 0..=127u8 {
            let v = scale_to_class(x, NICE);
            assert!(v <= last);
            last = v;
        }
    }

    #[test]
    fn table_is_monotonic_and_tops_out() {
        let table = PriorityTable::default();
        let mut last = 0;
        for level in 1..=10 {
            let native = table.native_for(VmPriority::new(level));
            assert!(native >= last);
            last = native;
        }
        assert_eq!(table.native_for(VmPriority::MAX), 127);
        assert_eq!(table.native_for(VmPriority::Critical), 127);
    }

    #[test]
    fn out_of_range_level_clamps_in_release() {
        if !cfg!(debug_assertions) {
            assert_eq!(VmPriority::new(0), VmPriority::Level(1));
            assert_eq!(VmPriority::new(99), VmPriority::Level(10));
        }
    }

    #[test]
    fn raw_round_trip() {
        for prio in [VmPriority::MIN, VmPriority::NORMAL, VmPriority::MAX, VmPriority::Critical] {
            assert_eq!(VmPriority::from_raw(prio.to_raw()), Some(prio));
        }
        assert_eq!(VmPriority::from_raw(-1), None);
    }
}
