// Licensed under the Apache-2.0 license

//! Health monitor: polls a table of status registers once DDR is trained
//! and start-up has finished, and reports values outside their expected
//! range. Reports for one register are throttled so a stuck fault does not
//! flood the console.

use core::fmt::{self, Write};

use arrayvec::ArrayString;
use hss_hal::Ticks;
use log::{error, warn};
use strum_macros::IntoStaticStr;

use crate::sm::{Service, StateHandlers, StateMachine, StateTimes};
use crate::{Event, Platform};

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum HealthState {
    #[strum(serialize = "init")]
    Init,
    #[strum(serialize = "monitoring")]
    Monitoring,
}

/// Condition under which a register value is reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Check {
    Above(u32),
    Below(u32),
    AboveOrBelow { min: u32, max: u32 },
    Equal(u32),
    NotEqual(u32),
    ChangedSinceLast,
}

impl Check {
    pub fn name(self) -> &'static str {
        match self {
            Check::Above(_) => "above threshold",
            Check::Below(_) => "below threshold",
            Check::AboveOrBelow { .. } => "outside range",
            Check::Equal(_) => "equal to",
            Check::NotEqual(_) => "not equal to",
            Check::ChangedSinceLast => "changed since last read",
        }
    }
}

/// One monitored register.
#[derive(Clone, Copy, Debug)]
pub struct MonitorDesc {
    pub name: &'static str,
    pub addr: u64,
    pub check: Check,
    /// Applied before `mask`.
    pub shift: u8,
    /// Zero leaves the value unmasked.
    pub mask: u32,
    pub throttle_secs: u32,
    pub trigger: Option<fn(addr: u64)>,
}

impl MonitorDesc {
    const fn new(name: &'static str, addr: u64, check: Check, shift: u8, mask: u32, throttle_secs: u32) -> Self {
        Self {
            name,
            addr,
            check,
            shift,
            mask,
            throttle_secs,
            trigger: None,
        }
    }

    fn extract(&self, raw: u32) -> u32 {
        let value = raw.checked_shr(self.shift as u32).unwrap_or(0);
        if self.mask != 0 {
            value & self.mask
        } else {
            value
        }
    }
}

use Check::{ChangedSinceLast, NotEqual};

/// Registers watched on PolarFire SoC.
pub const DEFAULT_MONITORS: [MonitorDesc; 30] = [
    MonitorDesc::new("IOSCB_PLL_MSS:PLL_CTRL", 0x3E00_1004, NotEqual(1), 25, 1, 1),
    MonitorDesc::new("IOSCB_PLL_DDR:PLL_CTRL", 0x3E01_0004, NotEqual(1), 25, 1, 1),
    MonitorDesc::new("IOSCB_PLL_SGMII:PLL_CTRL", 0x3E00_1004, NotEqual(1), 25, 1, 1),
    MonitorDesc::new("IOSCB_PLL:pll_nw_0:PLL_CTRL", 0x3810_0004, NotEqual(1), 25, 1, 1),
    MonitorDesc::new("SYSREG:BOOT_FAIL_CR", 0x2000_2014, NotEqual(0), 0, 1, 5),
    MonitorDesc::new("SYSREG:DEVICE_STATUS", 0x2000_2024, NotEqual(0x1F09), 0, 0x1FFF, 5),
    MonitorDesc::new("SYSREG:MPU_VIOLATION_SR", 0x2000_20F0, NotEqual(0), 0, 1, 5),
    MonitorDesc::new("SYSREG:EDAC_SR", 0x2000_2100, NotEqual(0), 0, 0x3FFF, 5),
    MonitorDesc::new("SYSREG:EDAC_CNT_MMC", 0x2000_2108, ChangedSinceLast, 0, 0x1F, 5),
    MonitorDesc::new("SYSREG:EDAC_CNT_DDRC", 0x2000_210C, ChangedSinceLast, 0, 0x1F, 5),
    MonitorDesc::new("SYSREG:EDAC_CNT_MAC0", 0x2000_2110, ChangedSinceLast, 0, 0x1F, 5),
    MonitorDesc::new("SYSREG:EDAC_CNT_MAC1", 0x2000_2114, ChangedSinceLast, 0, 0x1F, 5),
    MonitorDesc::new("SYSREG:EDAC_CNT_USB", 0x2000_2118, ChangedSinceLast, 0, 0x1F, 5),
    MonitorDesc::new("SYSREG:EDAC_CNT_CAN0", 0x2000_211C, ChangedSinceLast, 0, 0x1F, 5),
    MonitorDesc::new("SYSREG:EDAC_CNT_CAN1", 0x2000_2120, ChangedSinceLast, 0, 0x1F, 5),
    MonitorDesc::new("SYSREG:MAINTENANCE_INT_SR", 0x2000_2148, ChangedSinceLast, 0, 0x1F_FFFF, 5),
    MonitorDesc::new("SYSREG:PLL_STATUS_SR", 0x2000_214C, NotEqual(0x707), 0, 0x7FF, 5),
    MonitorDesc::new("SYSREG:MISC_SR", 0x2000_2154, NotEqual(0), 0, 2, 5),
    MonitorDesc::new("SYSREG:DLL_STATUS_SR", 0x2000_215C, ChangedSinceLast, 0, 0x1F_FFFF, 5),
    // [3:1]: scb_buserr, timeout, scb_error
    MonitorDesc::new("IOSCBCFG:STATUS", 0x3708_0004, NotEqual(0), 0, 0xE, 5),
    MonitorDesc::new("IOSCB_PLL:pll_se_0:PLL_CTRL", 0x3801_0004, ChangedSinceLast, 25, 1, 5),
    MonitorDesc::new("IOSCB_PLL:pll_se_1:PLL_CTRL", 0x3802_0004, ChangedSinceLast, 25, 1, 5),
    MonitorDesc::new("IOSCB_PLL:pll_ne_0:PLL_CTRL", 0x3804_0004, ChangedSinceLast, 25, 1, 5),
    MonitorDesc::new("IOSCB_PLL:pll_ne_1:PLL_CTRL", 0x3808_0004, ChangedSinceLast, 25, 1, 5),
    MonitorDesc::new("IOSCB_PLL:pll_nw_1:PLL_CTRL", 0x3820_0004, ChangedSinceLast, 25, 1, 5),
    MonitorDesc::new("IOSCB_PLL:pll_sw_0:PLL_CTRL", 0x3840_0004, ChangedSinceLast, 25, 1, 5),
    MonitorDesc::new("IOSCB_PLL:pll_sw_1:PLL_CTRL", 0x3880_0004, ChangedSinceLast, 25, 1, 5),
    MonitorDesc::new("L2:Config:ECCDirFixCount", 0x0201_0108, ChangedSinceLast, 0, 0, 1),
    MonitorDesc::new("L2:Config:ECCDataFixCount", 0x0201_0148, ChangedSinceLast, 0, 0, 1),
    MonitorDesc::new("L2:Config:ECCDataFailCount", 0x0201_0168, ChangedSinceLast, 0, 0, 1),
];

#[derive(Clone, Copy, Debug, Default)]
struct MonitorStatus {
    throttle_start: Ticks,
    last_value: Option<u32>,
    count: u64,
}

/// Evaluates `check` against `value`; returns the condition that fired.
fn evaluate(check: Check, value: u32, last: Option<u32>) -> Option<Check> {
    let fired = match check {
        Check::Above(max) => value > max,
        Check::Below(min) => value < min,
        Check::AboveOrBelow { min, max } => {
            if value > max {
                return Some(Check::Above(max));
            }
            if value < min {
                return Some(Check::Below(min));
            }
            false
        }
        Check::Equal(v) => value == v,
        Check::NotEqual(v) => value != v,
        Check::ChangedSinceLast => last.is_some_and(|last| last != value),
    };
    fired.then_some(check)
}

pub struct HealthMonitor<'t, const N: usize> {
    table: &'t [MonitorDesc; N],
    status: [MonitorStatus; N],
}

impl<'t, const N: usize> HealthMonitor<'t, N> {
    pub fn new(table: &'t [MonitorDesc; N]) -> Self {
        Self {
            table,
            status: [MonitorStatus::default(); N],
        }
    }

    /// Number of times monitor `index` has fired.
    pub fn count(&self, index: usize) -> u64 {
        self.status.get(index).map_or(0, |s| s.count)
    }

    fn check_all(&mut self, platform: &mut Platform<'_>) {
        let clock = platform.clock;
        for (desc, status) in self.table.iter().zip(self.status.iter_mut()) {
            if !clock.is_elapsed(status.throttle_start, clock.secs(desc.throttle_secs.into())) {
                continue;
            }
            let raw = match platform.memory.read_u32(desc.addr) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("healthmon: cannot read {} at 0x{:x}: {}", desc.name, desc.addr, e);
                    continue;
                }
            };
            let value = desc.extract(raw);
            let fired = evaluate(desc.check, value, status.last_value);
            if desc.check == Check::ChangedSinceLast {
                status.last_value = Some(value);
            }
            let Some(fired) = fired else {
                continue;
            };

            status.count += 1;
            match fired {
                Check::Above(limit) | Check::Below(limit) | Check::Equal(limit) | Check::NotEqual(limit) => {
                    error!("{} {} 0x{:x} (0x{:x})", desc.name, fired.name(), limit, value)
                }
                _ => error!("{} {} (0x{:x})", desc.name, fired.name(), value),
            }
            if let Some(trigger) = desc.trigger {
                trigger(desc.addr);
            }
            status.throttle_start = clock.now();
        }
    }

    /// Per-monitor trigger counts.
    pub fn dump_stats(&self, out: &mut dyn Write) -> fmt::Result {
        writeln!(out, "Health Monitoring Counts per trigger:")?;
        for (desc, status) in self.table.iter().zip(self.status.iter()) {
            let mut line = ArrayString::<80>::new();
            // overlong names are cut short rather than dropped
            let _ = match desc.check {
                Check::Above(v) | Check::Below(v) | Check::Equal(v) | Check::NotEqual(v) => {
                    write!(line, "{} => {} 0x{:x}", desc.name, desc.check.name(), v)
                }
                Check::AboveOrBelow { min, max } => {
                    write!(line, "{} => {} 0x{:x} <=> 0x{:x}", desc.name, desc.check.name(), min, max)
                }
                Check::ChangedSinceLast => write!(line, "{} => {}", desc.name, desc.check.name()),
            };
            writeln!(out, "{:>60}: {}", line.as_str(), status.count)?;
        }
        Ok(())
    }
}

impl<const N: usize> Service for HealthMonitor<'_, N> {
    type State = HealthState;
}

impl<'b, const N: usize> StateHandlers<Platform<'b>> for HealthMonitor<'_, N> {
    fn handler(&mut self, state: HealthState, _times: &StateTimes, env: &mut Platform<'b>) -> HealthState {
        match state {
            HealthState::Init => {
                if env.events.is_set(Event::DDR_TRAINED | Event::STARTUP_COMPLETE) {
                    HealthState::Monitoring
                } else {
                    HealthState::Init
                }
            }
            HealthState::Monitoring => {
                self.check_all(env);
                HealthState::Monitoring
            }
        }
    }
}

/// The health monitor as a superloop machine.
pub fn healthmon_service<const N: usize>(table: &[MonitorDesc; N]) -> StateMachine<HealthMonitor<'_, N>> {
    StateMachine::new("healthmon_service", HealthMonitor::new(table), HealthState::Init)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::pmp::PmpTable;
    use crate::ipi::Ipi;
    use crate::Triggers;
    use hss_config::HssConfig;
    use hss_hal::mock::{MockClock, MockMsip, RamBus};
    use hss_hal::MemoryBus;

    const BASE: u64 = 0x2000_2000;

    const TABLE: [MonitorDesc; 4] = [
        MonitorDesc::new("STATUS", BASE, Check::NotEqual(0x1F09), 0, 0x1FFF, 5),
        MonitorDesc::new("COUNTER", BASE + 4, Check::ChangedSinceLast, 0, 0x1F, 1),
        MonitorDesc::new("TEMP", BASE + 8, Check::AboveOrBelow { min: 10, max: 20 }, 0, 0, 1),
        MonitorDesc::new("PLL", BASE + 12, Check::NotEqual(1), 25, 1, 1),
    ];

    #[test]
    fn test_evaluate() {
        assert_eq!(evaluate(Check::Above(5), 6, None), Some(Check::Above(5)));
        assert_eq!(evaluate(Check::Above(5), 5, None), None);
        assert_eq!(evaluate(Check::Below(5), 4, None), Some(Check::Below(5)));
        assert_eq!(
            evaluate(Check::AboveOrBelow { min: 1, max: 3 }, 0, None),
            Some(Check::Below(1))
        );
        assert_eq!(evaluate(Check::AboveOrBelow { min: 1, max: 3 }, 2, None), None);
        assert_eq!(evaluate(Check::Equal(7), 7, None), Some(Check::Equal(7)));
        assert_eq!(evaluate(Check::ChangedSinceLast, 7, None), None);
        assert_eq!(evaluate(Check::ChangedSinceLast, 7, Some(7)), None);
        assert_eq!(
            evaluate(Check::ChangedSinceLast, 8, Some(7)),
            Some(Check::ChangedSinceLast)
        );
        assert_eq!(TABLE[3].extract(1 << 25 | 0xff), 1);
        assert_eq!(TABLE[2].extract(0xdead_beef), 0xdead_beef);
    }

    #[test]
    fn test_monitoring() {
        let clock = MockClock::new(1000);
        let msip = MockMsip::default();
        let mut ipi = Ipi::new();
        let mut bus = RamBus::new(BASE, 16);
        let pmp = PmpTable::default();
        let events = Triggers::new();
        let config = HssConfig::default();

        let mut machine = healthmon_service(&TABLE);

        bus.write_u32(BASE, 0x1F09).unwrap();
        bus.write_u32(BASE + 8, 15).unwrap();
        bus.write_u32(BASE + 12, 1 << 25).unwrap();
        {
            let mut platform = Platform {
                ipi: &mut ipi,
                msip: &msip,
                clock: &clock,
                memory: &mut bus,
                pmp: &pmp,
                events: &events,
                config: &config,
            };
            machine.run(&mut platform, &clock);
            machine.run(&mut platform, &clock);
            assert_eq!(machine.state(), HealthState::Init);

            events.notify(Event::DDR_TRAINED | Event::STARTUP_COMPLETE);
            machine.run(&mut platform, &clock);
            assert_eq!(machine.state(), HealthState::Monitoring);

            // everything nominal; the counter takes its first sample
            clock.advance_secs(6);
            machine.run(&mut platform, &clock);
            assert!((0..4).all(|i| machine.service().count(i) == 0));
        }

        bus.write_u32(BASE, 0x0F09).unwrap();
        bus.write_u32(BASE + 4, 3).unwrap();
        bus.write_u32(BASE + 8, 25).unwrap();
        bus.write_u32(BASE + 12, 0).unwrap();
        let mut platform = Platform {
            ipi: &mut ipi,
            msip: &msip,
            clock: &clock,
            memory: &mut bus,
            pmp: &pmp,
            events: &events,
            config: &config,
        };
        machine.run(&mut platform, &clock);
        assert!((0..4).all(|i| machine.service().count(i) == 1));

        // fired monitors are throttled
        clock.advance(500);
        machine.run(&mut platform, &clock);
        assert!((0..4).all(|i| machine.service().count(i) == 1));

        clock.advance_secs(2);
        machine.run(&mut platform, &clock);
        assert_eq!(machine.service().count(0), 1);
        // the counter has not moved since it fired
        assert_eq!(machine.service().count(1), 1);
        assert_eq!(machine.service().count(2), 2);
        assert_eq!(machine.service().count(3), 2);

        let mut out = String::new();
        machine.service().dump_stats(&mut out).unwrap();
        assert!(out.starts_with("Health Monitoring Counts per trigger:\n"));
        assert!(out.contains("TEMP => outside range 0xa <=> 0x14: 2"));
        assert!(out.contains("COUNTER => changed since last read: 1"));
    }

    #[test]
    fn test_default_table_dump() {
        let monitor = HealthMonitor::new(&DEFAULT_MONITORS);
        let mut out = String::new();
        monitor.dump_stats(&mut out).unwrap();
        assert_eq!(out.lines().count(), DEFAULT_MONITORS.len() + 1);
        assert!(out.contains("SYSREG:DEVICE_STATUS => not equal to 0x1f09: 0"));
    }
}
