// Licensed under the Apache-2.0 license

//! TinyCLI: the line-oriented debug shell on the E51 console.
//!
//! Commands are resolved case-insensitively, first by full name and then
//! by unique prefix, so `hel` runs `HELP` but `s` is ambiguous between
//! `SDCARD` and `SPI`.

use core::fmt::{self, Write};

use arrayvec::{ArrayString, ArrayVec};
use hss_boot_image::CRC32;
use hss_config::{BootSource, HssConfig, CLI_MAX_MONITORS, CLI_MAX_TOKENS};
use hss_error::HssError;
use hss_hal::{Clock, HexBytes, MemoryBus, SerialPort, Ticks};
use log::warn;
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{EnumCount, EnumIter, IntoStaticStr};

const DEFAULT_DUMP_LEN: u64 = 256;
const HEXDUMP_LINE: usize = 16;
const ESC: u8 = 0x1b;

/// The parts of the system the shell can inspect or drive.
pub trait CliBackend {
    fn clock(&self) -> &dyn Clock;

    fn memory(&self) -> &dyn MemoryBus;

    /// True once the U54s have been released.
    fn post_boot(&self) -> bool;

    fn version(&mut self, out: &mut dyn Write) -> fmt::Result;

    fn reset(&mut self);

    /// Storage back-ends built into this firmware.
    fn supported_boot_sources(&self) -> &[BootSource];

    /// Set name and length of the registered boot image.
    fn boot_image_info(&self) -> Option<(&str, u64)>;

    /// Loads and validates the image, then releases the U54s.
    fn boot(&mut self) -> Result<(), HssError>;

    /// Calls `found` with the index and set name (if readable) of every
    /// boot partition.
    fn boot_partitions(&mut self, found: &mut dyn FnMut(usize, Option<&str>))
        -> Result<(), HssError>;

    fn select_boot_partition(&mut self, index: usize);

    fn ymodem(&mut self, out: &mut dyn Write) -> fmt::Result;

    fn dump_state_machines(&mut self, out: &mut dyn Write) -> fmt::Result;

    fn dump_ipi(&mut self, out: &mut dyn Write) -> fmt::Result;

    fn dump_health(&mut self, _out: &mut dyn Write) -> fmt::Result {
        Ok(())
    }
}

/// What the caller should do after a command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// `BOOT` was run; leave the shell.
    Exit,
}

trait CommandTable: Copy + IntoEnumIterator + Into<&'static str> {
    fn help(self) -> &'static str;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumCount, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
enum Command {
    Ymodem,
    Boot,
    Reset,
    Help,
    Version,
    Uptime,
    Debug,
    Qspi,
    Emmc,
    Mmc,
    Sdcard,
    Payload,
    Spi,
}

impl Command {
    /// Commands that can upset running payloads.
    fn warn_post_boot(self) -> bool {
        !matches!(
            self,
            Command::Boot | Command::Help | Command::Version | Command::Uptime | Command::Debug
        )
    }

    fn boot_source(self) -> Option<BootSource> {
        match self {
            Command::Qspi => Some(BootSource::Qspi),
            Command::Emmc => Some(BootSource::Emmc),
            Command::Mmc => Some(BootSource::Mmc),
            Command::Sdcard => Some(BootSource::SdCard),
            Command::Payload => Some(BootSource::Payload),
            Command::Spi => Some(BootSource::Spi),
            _ => None,
        }
    }
}

impl CommandTable for Command {
    fn help(self) -> &'static str {
        match self {
            Command::Ymodem => "Run YMODEM utility to download an image to DDR.",
            Command::Boot => "Quit TinyCLI and return to regular boot process.",
            Command::Reset => "Reset PolarFire SoC.",
            Command::Help => "Display command summary / command help information.",
            Command::Version => "Display system version information.",
            Command::Uptime => "Display uptime information.",
            Command::Debug => "Display debug information.",
            Command::Qspi => "Select boot via QSPI.",
            Command::Emmc => "Select boot via eMMC.",
            Command::Mmc => "Select boot via SDCARD/eMMC.",
            Command::Sdcard => "Select boot via SDCARD.",
            Command::Payload => "Select boot via payload.",
            Command::Spi => "Select boot via SPI.",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
enum DebugCommand {
    Healthmon,
    Sm,
    Ipi,
    Crc32,
    Hexdump,
    Monitor,
}

impl CommandTable for DebugCommand {
    fn help(self) -> &'static str {
        match self {
            DebugCommand::Healthmon => "debug health monitor",
            DebugCommand::Sm => "debug state machines",
            DebugCommand::Ipi => "debug HSS IPI Queues",
            DebugCommand::Crc32 => "calculate CRC32 over memory region",
            DebugCommand::Hexdump => "display memory as hex dump",
            DebugCommand::Monitor => "monitor memory locations periodically",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
enum MonitorCommand {
    Create,
    Destroy,
    Enable,
    Disable,
    List,
}

impl CommandTable for MonitorCommand {
    fn help(self) -> &'static str {
        match self {
            MonitorCommand::Create => "<interval> 0x<start_addr> 0x<length>",
            MonitorCommand::Destroy | MonitorCommand::Enable | MonitorCommand::Disable => {
                "<index>"
            }
            MonitorCommand::List => "",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
enum BootCommand {
    Info,
    List,
    Select,
}

impl CommandTable for BootCommand {
    fn help(self) -> &'static str {
        match self {
            BootCommand::Info => "display info about currently registered boot image",
            BootCommand::List => "list boot partitions",
            BootCommand::Select => "select active boot partition",
        }
    }
}

/// Full case-insensitive match first, then a prefix that selects exactly
/// one command.
fn resolve<C: CommandTable>(token: &str) -> Option<C> {
    let mut partial = None;
    let mut matches = 0;
    for cmd in C::iter() {
        let name: &'static str = cmd.into();
        if name.eq_ignore_ascii_case(token) {
            return Some(cmd);
        }
        if name.len() >= token.len() && name[..token.len()].eq_ignore_ascii_case(token) {
            partial = Some(cmd);
            matches += 1;
        }
    }
    if matches == 1 {
        partial
    } else {
        None
    }
}

fn display_help<C: CommandTable>(out: &mut dyn Write, sub: bool) -> fmt::Result {
    writeln!(out, "Supported {}commands:", if sub { "sub" } else { "" })?;
    for cmd in C::iter() {
        let name: &'static str = cmd.into();
        write!(out, "{} ", name)?;
    }
    writeln!(out)
}

/// Splits a command line on spaces and newlines, keeping at most
/// `CLI_MAX_TOKENS` tokens.
pub fn tokenize(line: &str) -> ArrayVec<&str, CLI_MAX_TOKENS> {
    line.split(|c: char| c == ' ' || c == '\n' || c == '\r' || c == '\t')
        .filter(|t| !t.is_empty())
        .take(CLI_MAX_TOKENS)
        .collect()
}

/// `0x`-prefixed hex or plain decimal.
pub fn parse_number(token: &str) -> Option<u64> {
    match token.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("0x") => u64::from_str_radix(&token[2..], 16).ok(),
        _ => token.parse().ok(),
    }
}

/// Writes `secs` as e.g. `1 day, 2 hours, 5 seconds`.
pub fn format_duration(out: &mut dyn Write, secs: u64) -> fmt::Result {
    let parts = [
        (secs / 86_400, "day"),
        (secs % 86_400 / 3600, "hour"),
        (secs % 3600 / 60, "minute"),
        (secs % 60, "second"),
    ];
    let mut first = true;
    for (value, unit) in parts.into_iter().filter(|(value, _)| *value != 0) {
        if !first {
            out.write_str(", ")?;
        }
        write!(out, "{} {}{}", value, unit, if value == 1 { "" } else { "s" })?;
        first = false;
    }
    if first {
        out.write_str("0 seconds")?;
    }
    Ok(())
}

/// Hex dump of `count` bytes at `start`, sixteen per line.
pub fn hexdump(out: &mut dyn Write, memory: &dyn MemoryBus, start: u64, count: u64) -> fmt::Result {
    let mut line = [0u8; HEXDUMP_LINE];
    let mut addr = start;
    let end = start.saturating_add(count);
    while addr < end {
        let len = ((end - addr) as usize).min(HEXDUMP_LINE);
        if memory.read(addr, &mut line[..len]).is_err() {
            return writeln!(out, "Memory access at 0x{:x} failed", addr);
        }
        write!(out, "{:016x}: {:#}", addr, HexBytes(&line[..len]))?;
        for _ in len..HEXDUMP_LINE {
            out.write_str("   ")?;
        }
        out.write_str("  ")?;
        for &b in &line[..len] {
            out.write_char(if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })?;
        }
        writeln!(out)?;
        addr += len as u64;
    }
    Ok(())
}

/// Waits for a key press. Returns false on timeout or ESC.
pub fn wait_for_key(
    port: &mut dyn SerialPort,
    config: &HssConfig,
    out: &mut dyn Write,
) -> Result<bool, fmt::Error> {
    writeln!(out, "Press a key to enter CLI, ESC to skip")?;
    match port.read_byte(config.tinycli_timeout_secs) {
        Some(ESC) | None => {
            writeln!(out, "CLI boot interrupt timeout")?;
            Ok(false)
        }
        Some(_) => {
            writeln!(out, "Type HELP for list of commands")?;
            Ok(true)
        }
    }
}

/// Reads one line with echo and backspace handling. Returns false if the
/// line timed out before CR or LF.
pub fn read_line<const N: usize>(
    port: &mut dyn SerialPort,
    line: &mut ArrayString<N>,
    timeout_secs: u32,
) -> bool {
    line.clear();
    loop {
        match port.read_byte(timeout_secs) {
            None => return false,
            Some(b'\r' | b'\n') => {
                port.write_all(b"\r\n");
                return true;
            }
            Some(0x08 | 0x7f) => {
                if line.pop().is_some() {
                    port.write_all(b"\x08 \x08");
                }
            }
            Some(b) if b.is_ascii() && !b.is_ascii_control() => {
                if line.try_push(b as char).is_ok() {
                    port.write_byte(b);
                }
            }
            Some(_) => {}
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Monitor {
    allocated: bool,
    active: bool,
    interval_secs: u64,
    start: u64,
    count: u64,
    last: Ticks,
}

/// Shell state that survives between command lines.
pub struct TinyCli {
    armed: [bool; Command::COUNT],
    monitors: [Monitor; CLI_MAX_MONITORS],
    hexdump_start: Option<u64>,
    hexdump_count: u64,
    ddr_base: u64,
    requested_source: Option<BootSource>,
}

impl TinyCli {
    pub fn new(config: &HssConfig) -> Self {
        let mut armed = [false; Command::COUNT];
        for cmd in Command::iter() {
            armed[cmd as usize] = cmd.warn_post_boot();
        }
        Self {
            armed,
            monitors: [Monitor::default(); CLI_MAX_MONITORS],
            hexdump_start: None,
            hexdump_count: DEFAULT_DUMP_LEN,
            ddr_base: config.ddr_base,
            requested_source: None,
        }
    }

    /// Boot source picked by the last storage command.
    pub fn requested_boot_source(&self) -> Option<BootSource> {
        self.requested_source
    }

    /// Runs one command line.
    pub fn execute(
        &mut self,
        line: &str,
        backend: &mut dyn CliBackend,
        out: &mut dyn Write,
    ) -> Result<Flow, fmt::Error> {
        let tokens = tokenize(line);
        let Some(&first) = tokens.first() else {
            return Ok(Flow::Continue);
        };
        let Some(cmd) = resolve::<Command>(first) else {
            writeln!(out, "Unknown command >>{}<< ({} tokens)", first, tokens.len())?;
            for arg in &tokens[1..] {
                writeln!(out, "Argument: {}", arg)?;
            }
            return Ok(Flow::Continue);
        };

        if self.armed[cmd as usize] && backend.post_boot() {
            self.armed[cmd as usize] = false;
            let name: &'static str = cmd.into();
            warn!("Command {} issued post boot", name);
            writeln!(out, "Command {} may cause problems post boot.", name)?;
            writeln!(out, "Please type it again if you definitely want to execute it")?;
            return Ok(Flow::Continue);
        }

        match cmd {
            Command::Ymodem => backend.ymodem(out)?,
            Command::Boot => return self.boot(&tokens, backend, out),
            Command::Reset => backend.reset(),
            Command::Help => self.help(&tokens, out)?,
            Command::Version => backend.version(out)?,
            Command::Uptime => {
                let clock = backend.clock();
                out.write_str("Uptime is ")?;
                format_duration(out, clock.now() / clock.ticks_per_sec().max(1))?;
                writeln!(out)?;
            }
            Command::Debug => self.debug(&tokens, backend, out)?,
            storage => {
                if let Some(source) = storage.boot_source() {
                    self.select_source(source, backend, out)?;
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn help(&self, tokens: &[&str], out: &mut dyn Write) -> fmt::Result {
        let mut handled = false;
        for token in &tokens[1..] {
            if let Some(cmd) = resolve::<Command>(token) {
                let name: &'static str = cmd.into();
                writeln!(out, "{}: {}", name, cmd.help())?;
                handled = true;
            }
        }
        if !handled {
            display_help::<Command>(out, false)?;
        }
        Ok(())
    }

    fn select_source(
        &mut self,
        source: BootSource,
        backend: &mut dyn CliBackend,
        out: &mut dyn Write,
    ) -> fmt::Result {
        let supported = backend.supported_boot_sources();
        if supported.contains(&source) {
            writeln!(out, "Selecting {} as boot source", source)?;
            self.requested_source = Some(source);
            return Ok(());
        }
        writeln!(out, "{} not supported in this build of the HSS.", source)?;
        writeln!(out, "Supported boot mechanisms:")?;
        for s in supported {
            writeln!(out, " - {}", s)?;
        }
        Ok(())
    }

    fn boot(
        &mut self,
        tokens: &[&str],
        backend: &mut dyn CliBackend,
        out: &mut dyn Write,
    ) -> Result<Flow, fmt::Error> {
        match tokens.get(1).and_then(|t| resolve::<BootCommand>(t)) {
            Some(BootCommand::Info) => match backend.boot_image_info() {
                Some((name, length)) => {
                    writeln!(out, "Set Name: {}", name)?;
                    writeln!(out, "Length:   {} bytes", length)?;
                }
                None => writeln!(out, "Valid boot image not registered")?,
            },
            Some(BootCommand::List) => {
                let mut result = Ok(());
                let listed = backend.boot_partitions(&mut |index, name| {
                    result = result.and_then(|()| {
                        writeln!(out, "Boot Partition found at index {}", index)?;
                        match name {
                            Some(name) => writeln!(out, ">>{}<<", name),
                            None => Ok(()),
                        }
                    });
                });
                result?;
                if let Err(e) = listed {
                    writeln!(out, "Unable to list boot partitions: {}", e)?;
                }
            }
            Some(BootCommand::Select) => {
                match tokens.get(2).and_then(|t| parse_number(t)) {
                    Some(index) => backend.select_boot_partition(index as usize),
                    None => writeln!(out, "Usage:\n\tboot select <partition_index>\n")?,
                }
            }
            None => {
                if let Err(e) = backend.boot() {
                    writeln!(out, "Boot failed: {}", e)?;
                    return Ok(Flow::Continue);
                }
                return Ok(Flow::Exit);
            }
        }
        Ok(Flow::Continue)
    }

    fn debug(
        &mut self,
        tokens: &[&str],
        backend: &mut dyn CliBackend,
        out: &mut dyn Write,
    ) -> fmt::Result {
        let Some(cmd) = tokens.get(1).and_then(|t| resolve::<DebugCommand>(t)) else {
            return display_help::<DebugCommand>(out, true);
        };
        match cmd {
            DebugCommand::Healthmon => backend.dump_health(out),
            DebugCommand::Sm => backend.dump_state_machines(out),
            DebugCommand::Ipi => backend.dump_ipi(out),
            DebugCommand::Crc32 => self.crc32(tokens, backend, out),
            DebugCommand::Hexdump => self.hexdump(tokens, backend, out),
            DebugCommand::Monitor => self.monitor(tokens, backend, out),
        }
    }

    fn crc32(&self, tokens: &[&str], backend: &dyn CliBackend, out: &mut dyn Write) -> fmt::Result {
        let Some(start) = tokens.get(2).and_then(|t| parse_number(t)) else {
            return writeln!(out, "Usage:\n\tcrc32 0x<start_addr> 0x<length>\n");
        };
        let count = tokens
            .get(3)
            .and_then(|t| parse_number(t))
            .unwrap_or(DEFAULT_DUMP_LEN);

        let memory = backend.memory();
        let mut digest = CRC32.digest();
        let mut chunk = [0u8; 256];
        let mut addr = start;
        let end = start.saturating_add(count);
        while addr < end {
            let len = ((end - addr) as usize).min(chunk.len());
            if memory.read(addr, &mut chunk[..len]).is_err() {
                return writeln!(out, "Memory access at 0x{:x} failed", addr);
            }
            digest.update(&chunk[..len]);
            addr += len as u64;
        }
        writeln!(out, "CRC32: 0x{:x}", digest.finalize())
    }

    /// `hexdump` alone continues where the previous dump stopped.
    fn hexdump(&mut self, tokens: &[&str], backend: &dyn CliBackend, out: &mut dyn Write) -> fmt::Result {
        let start = match tokens.get(2) {
            None => {
                let start = match self.hexdump_start {
                    Some(prev) => prev.saturating_add(self.hexdump_count),
                    None => self.ddr_base,
                };
                self.hexdump_start = Some(start);
                start
            }
            Some(token) => {
                let Some(start) = parse_number(token) else {
                    return writeln!(out, "Usage:\n\thexdump 0x<start_addr> 0x<length>\n");
                };
                if let Some(count) = tokens.get(3).and_then(|t| parse_number(t)) {
                    self.hexdump_count = count;
                }
                self.hexdump_start = Some(start);
                start
            }
        };
        hexdump(out, backend.memory(), start, self.hexdump_count)
    }

    fn monitor(&mut self, tokens: &[&str], backend: &dyn CliBackend, out: &mut dyn Write) -> fmt::Result {
        let Some(cmd) = tokens.get(2).and_then(|t| resolve::<MonitorCommand>(t)) else {
            return monitor_usage(out);
        };
        if cmd == MonitorCommand::List {
            return self.list_monitors(out);
        }
        if cmd == MonitorCommand::Create {
            let args: Option<ArrayVec<u64, 3>> =
                tokens.get(3..6).map(|args| args.iter().filter_map(|t| parse_number(t)).collect());
            let Some([interval_secs, start, count]) = args.and_then(|a| a.into_inner().ok()) else {
                return monitor_usage(out);
            };
            let Some(index) = self.monitors.iter().position(|m| !m.allocated) else {
                return writeln!(out, "All monitors are allocated");
            };
            self.monitors[index] = Monitor {
                allocated: true,
                interval_secs,
                start,
                count,
                ..Default::default()
            };
            return writeln!(out, "Allocated monitor index {}", index);
        }

        let Some(index) = tokens
            .get(3)
            .and_then(|t| parse_number(t))
            .map(|i| i as usize)
            .filter(|&i| i < CLI_MAX_MONITORS)
        else {
            return monitor_usage(out);
        };
        let monitor = &mut self.monitors[index];
        if !monitor.allocated {
            return writeln!(out, "Monitor index {} not allocated", index);
        }
        match cmd {
            MonitorCommand::Destroy => {
                *monitor = Monitor::default();
                writeln!(out, "Destroyed monitor index {}", index)
            }
            MonitorCommand::Enable => {
                monitor.active = true;
                monitor.last = backend.clock().now();
                writeln!(out, "Enabled monitor index {}", index)
            }
            _ => {
                monitor.active = false;
                writeln!(out, "Disabled monitor index {}", index)
            }
        }
    }

    fn list_monitors(&self, out: &mut dyn Write) -> fmt::Result {
        writeln!(out, " Index Active Allocated Interval       Start_Addr    Count")?;
        writeln!(out, "===========================================================")?;
        for (index, m) in self.monitors.iter().enumerate() {
            writeln!(
                out,
                " {:5} {:6} {:9} {:8} {:16x} {:8x}",
                index, m.active as u8, m.allocated as u8, m.interval_secs, m.start, m.count
            )?;
        }
        Ok(())
    }

    /// Dumps every active monitor whose interval has elapsed.
    pub fn run_monitors(&mut self, backend: &dyn CliBackend, out: &mut dyn Write) -> fmt::Result {
        let clock = backend.clock();
        for monitor in self.monitors.iter_mut().filter(|m| m.active) {
            if clock.is_elapsed(monitor.last, clock.secs(monitor.interval_secs)) {
                out.write_str(": ")?;
                hexdump(out, backend.memory(), monitor.start, monitor.count)?;
                monitor.last = clock.now();
            }
        }
        Ok(())
    }
}

fn monitor_usage(out: &mut dyn Write) -> fmt::Result {
    for cmd in MonitorCommand::iter() {
        let name: &'static str = cmd.into();
        writeln!(out, "DEBUG MONITOR {} {}", name, cmd.help())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hss_hal::mock::{MockClock, RamBus, ScriptedSerial};

    const DDR: u64 = 0x8000_0000;

    struct TestBackend {
        clock: MockClock,
        bus: RamBus,
        post_boot: bool,
        resets: u32,
        boots: u32,
        selected_partition: Option<usize>,
        image: Option<(&'static str, u64)>,
    }

    impl TestBackend {
        fn new() -> Self {
            let mut bus = RamBus::new(DDR, 0x1000);
            for (i, b) in bus.data.iter_mut().enumerate() {
                *b = i as u8;
            }
            Self {
                clock: MockClock::new(1000),
                bus,
                post_boot: false,
                resets: 0,
                boots: 0,
                selected_partition: None,
                image: None,
            }
        }
    }

    impl CliBackend for TestBackend {
        fn clock(&self) -> &dyn Clock {
            &self.clock
        }

        fn memory(&self) -> &dyn MemoryBus {
            &self.bus
        }

        fn post_boot(&self) -> bool {
            self.post_boot
        }

        fn version(&mut self, out: &mut dyn Write) -> fmt::Result {
            writeln!(out, "HSS test build")
        }

        fn reset(&mut self) {
            self.resets += 1;
        }

        fn supported_boot_sources(&self) -> &[BootSource] {
            &[BootSource::Mmc, BootSource::Emmc, BootSource::Payload]
        }

        fn boot_image_info(&self) -> Option<(&str, u64)> {
            self.image
        }

        fn boot(&mut self) -> Result<(), HssError> {
            self.boots += 1;
            if self.image.is_some() {
                Ok(())
            } else {
                Err(HssError::NoBootImage)
            }
        }

        fn boot_partitions(
            &mut self,
            found: &mut dyn FnMut(usize, Option<&str>),
        ) -> Result<(), HssError> {
            found(1, Some("linux"));
            found(3, None);
            Ok(())
        }

        fn select_boot_partition(&mut self, index: usize) {
            self.selected_partition = Some(index);
        }

        fn ymodem(&mut self, out: &mut dyn Write) -> fmt::Result {
            writeln!(out, "ymodem")
        }

        fn dump_state_machines(&mut self, out: &mut dyn Write) -> fmt::Result {
            writeln!(out, "machines")
        }

        fn dump_ipi(&mut self, out: &mut dyn Write) -> fmt::Result {
            writeln!(out, "ipi")
        }
    }

    fn run(cli: &mut TinyCli, backend: &mut TestBackend, line: &str) -> (Flow, String) {
        let mut out = String::new();
        let flow = cli.execute(line, backend, &mut out).unwrap();
        (flow, out)
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve::<Command>("help"), Some(Command::Help));
        assert_eq!(resolve::<Command>("HeL"), Some(Command::Help));
        assert_eq!(resolve::<Command>("mmc"), Some(Command::Mmc));
        assert_eq!(resolve::<Command>("s"), None);
        assert_eq!(resolve::<Command>("sd"), Some(Command::Sdcard));
        assert_eq!(resolve::<Command>("helpme"), None);
        assert_eq!(resolve::<DebugCommand>("hex"), Some(DebugCommand::Hexdump));
    }

    #[test]
    fn test_tokenize_and_numbers() {
        let tokens = tokenize("  debug   hexdump 0x80000000\r\n");
        assert_eq!(&tokens[..], &["debug", "hexdump", "0x80000000"]);
        let long = "a ".repeat(50);
        assert_eq!(tokenize(&long).len(), CLI_MAX_TOKENS);

        assert_eq!(parse_number("0x1F"), Some(0x1f));
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0xzz"), None);
    }

    #[test]
    fn test_format_duration() {
        let fmt = |secs| {
            let mut s = String::new();
            format_duration(&mut s, secs).unwrap();
            s
        };
        assert_eq!(fmt(0), "0 seconds");
        assert_eq!(fmt(86_400 + 3600 + 60 + 1), "1 day, 1 hour, 1 minute, 1 second");
        assert_eq!(fmt(2 * 3600 + 5), "2 hours, 5 seconds");
    }

    #[test]
    fn test_help_and_unknown() {
        let mut cli = TinyCli::new(&HssConfig::default());
        let mut backend = TestBackend::new();

        let (_, out) = run(&mut cli, &mut backend, "help");
        assert!(out.starts_with("Supported commands:"));
        assert!(out.contains("SDCARD"));

        let (_, out) = run(&mut cli, &mut backend, "help upt");
        assert_eq!(out, "UPTIME: Display uptime information.\n");

        let (_, out) = run(&mut cli, &mut backend, "frobnicate now");
        assert_eq!(out, "Unknown command >>frobnicate<< (2 tokens)\nArgument: now\n");

        let (flow, out) = run(&mut cli, &mut backend, "   ");
        assert_eq!(flow, Flow::Continue);
        assert!(out.is_empty());
    }

    #[test]
    fn test_uptime_and_version() {
        let mut cli = TinyCli::new(&HssConfig::default());
        let mut backend = TestBackend::new();
        backend.clock.advance_secs(3661);
        let (_, out) = run(&mut cli, &mut backend, "UPTIME");
        assert_eq!(out, "Uptime is 1 hour, 1 minute, 1 second\n");
        let (_, out) = run(&mut cli, &mut backend, "ver");
        assert_eq!(out, "HSS test build\n");
    }

    #[test]
    fn test_boot_source_selection() {
        let mut cli = TinyCli::new(&HssConfig::default());
        let mut backend = TestBackend::new();
        assert_eq!(cli.requested_boot_source(), None);

        let (_, out) = run(&mut cli, &mut backend, "emmc");
        assert_eq!(out, "Selecting Emmc as boot source\n");
        assert_eq!(cli.requested_boot_source(), Some(BootSource::Emmc));

        let (_, out) = run(&mut cli, &mut backend, "qspi");
        assert!(out.starts_with("Qspi not supported in this build of the HSS."));
        assert!(out.contains(" - Payload"));
        assert_eq!(cli.requested_boot_source(), Some(BootSource::Emmc));
    }

    #[test]
    fn test_post_boot_warning_arms_once() {
        let mut cli = TinyCli::new(&HssConfig::default());
        let mut backend = TestBackend::new();
        backend.post_boot = true;

        let (_, out) = run(&mut cli, &mut backend, "reset");
        assert!(out.contains("may cause problems post boot"));
        assert_eq!(backend.resets, 0);

        run(&mut cli, &mut backend, "reset");
        run(&mut cli, &mut backend, "reset");
        assert_eq!(backend.resets, 2);

        // safe commands never warn
        let (_, out) = run(&mut cli, &mut backend, "version");
        assert_eq!(out, "HSS test build\n");
    }

    #[test]
    fn test_boot_commands() {
        let mut cli = TinyCli::new(&HssConfig::default());
        let mut backend = TestBackend::new();

        let (_, out) = run(&mut cli, &mut backend, "boot info");
        assert_eq!(out, "Valid boot image not registered\n");

        let (flow, out) = run(&mut cli, &mut backend, "boot");
        assert_eq!(flow, Flow::Continue);
        assert!(out.starts_with("Boot failed"));

        backend.image = Some(("demo-set", 4096));
        let (_, out) = run(&mut cli, &mut backend, "boot info");
        assert_eq!(out, "Set Name: demo-set\nLength:   4096 bytes\n");

        let (_, out) = run(&mut cli, &mut backend, "boot list");
        assert_eq!(
            out,
            "Boot Partition found at index 1\n>>linux<<\nBoot Partition found at index 3\n"
        );

        run(&mut cli, &mut backend, "boot select 3");
        assert_eq!(backend.selected_partition, Some(3));
        let (_, out) = run(&mut cli, &mut backend, "boot sel");
        assert!(out.starts_with("Usage:"));

        let (flow, _) = run(&mut cli, &mut backend, "boot");
        assert_eq!(flow, Flow::Exit);
        assert_eq!(backend.boots, 2);
    }

    #[test]
    fn test_debug_dispatch() {
        let mut cli = TinyCli::new(&HssConfig::default());
        let mut backend = TestBackend::new();

        let (_, out) = run(&mut cli, &mut backend, "debug");
        assert!(out.starts_with("Supported subcommands:"));
        assert!(out.contains("HEXDUMP"));
        let (_, out) = run(&mut cli, &mut backend, "debug sm");
        assert_eq!(out, "machines\n");
        let (_, out) = run(&mut cli, &mut backend, "debug ipi");
        assert_eq!(out, "ipi\n");
    }

    #[test]
    fn test_crc32_command() {
        let mut cli = TinyCli::new(&HssConfig::default());
        let mut backend = TestBackend::new();
        let expected = CRC32.checksum(backend.bus.slice(DDR + 0x10, 0x300));

        let (_, out) = run(&mut cli, &mut backend, "debug crc32 0x80000010 0x300");
        assert_eq!(out, format!("CRC32: 0x{:x}\n", expected));

        let (_, out) = run(&mut cli, &mut backend, "debug crc32 0x10");
        assert_eq!(out, "Memory access at 0x10 failed\n");
    }

    #[test]
    fn test_hexdump_continuation() {
        let mut cli = TinyCli::new(&HssConfig::default());
        let mut backend = TestBackend::new();

        let (_, out) = run(&mut cli, &mut backend, "debug hexdump 0x80000020 20");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000000080000020: 20 21 22 23"));
        assert!(lines[0].ends_with(" !\"#$%&'()*+,-./"));
        assert!(lines[1].starts_with("0000000080000030: 30 31 32 33  "));

        let (_, out) = run(&mut cli, &mut backend, "debug hexdump");
        assert!(out.starts_with("0000000080000034: 34 35"));
    }

    #[test]
    fn test_hexdump_defaults_to_ddr() {
        let mut cli = TinyCli::new(&HssConfig::default());
        let mut backend = TestBackend::new();
        let (_, out) = run(&mut cli, &mut backend, "debug hexdump");
        assert_eq!(out.lines().count(), 16);
        assert!(out.starts_with("0000000080000000: 00 01"));
    }

    #[test]
    fn test_monitors() {
        let mut cli = TinyCli::new(&HssConfig::default());
        let mut backend = TestBackend::new();

        let (_, out) = run(&mut cli, &mut backend, "debug monitor create 2 0x80000000 4");
        assert_eq!(out, "Allocated monitor index 0\n");
        let (_, out) = run(&mut cli, &mut backend, "debug monitor enable 5");
        assert_eq!(out, "Monitor index 5 not allocated\n");
        let (_, out) = run(&mut cli, &mut backend, "debug monitor create 2");
        assert!(out.starts_with("DEBUG MONITOR CREATE"));

        run(&mut cli, &mut backend, "debug monitor enable 0");
        let (_, out) = run(&mut cli, &mut backend, "debug mon list");
        assert!(out.lines().nth(2).unwrap().starts_with("     0      1         1        2"));

        let mut out = String::new();
        cli.run_monitors(&backend, &mut out).unwrap();
        assert!(out.is_empty());

        backend.clock.advance_secs(3);
        cli.run_monitors(&backend, &mut out).unwrap();
        assert!(out.starts_with(": 0000000080000000: 00 01 02 03"));

        out.clear();
        cli.run_monitors(&backend, &mut out).unwrap();
        assert!(out.is_empty());

        run(&mut cli, &mut backend, "debug monitor destroy 0");
        backend.clock.advance_secs(3);
        cli.run_monitors(&backend, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_read_line_and_key_wait() {
        let mut port = ScriptedSerial::default();
        port.queue(b"hx\x7felp\r");
        let mut line = ArrayString::<32>::new();
        assert!(read_line(&mut port, &mut line, 1));
        assert_eq!(line.as_str(), "help");
        assert_eq!(port.tx, b"hx\x08 \x08elp\r\n");

        port.queue(b"ab");
        assert!(!read_line(&mut port, &mut line, 1));

        let config = HssConfig::default();
        let mut out = String::new();
        port.queue(&[ESC]);
        assert_eq!(wait_for_key(&mut port, &config, &mut out), Ok(false));
        port.queue(b" ");
        assert_eq!(wait_for_key(&mut port, &config, &mut out), Ok(true));
        assert!(out.ends_with("Type HELP for list of commands\n"));
    }
}
