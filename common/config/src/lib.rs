// Licensed under the Apache-2.0 license

#![cfg_attr(target_arch = "riscv64", no_std)]

mod boot;
pub use boot::*;

/// Depth of each inter-hart message queue.
pub const IPI_MAX_QUEUE_MSGS: usize = 16;

/// Number of PMP entries implemented per hart.
pub const PMP_ENTRIES: usize = 16;

/// Memory monitors available from the CLI.
pub const CLI_MAX_MONITORS: usize = 10;

/// Maximum tokens in one CLI line.
pub const CLI_MAX_TOKENS: usize = 40;

pub const MAC_RX_RING_SIZE: usize = 4;
pub const MAC_TX_RING_SIZE: usize = 2;
pub const MAC_QUEUE_COUNT: usize = 4;

/// Tunables for the E51 services. These are the defaults that a board
/// can override before the services are started.
#[derive(Clone, Debug)]
pub struct HssConfig {
    /// Machine timer rate (the MSS RTC toggle clock).
    pub ticks_per_sec: u64,
    /// Ticks a single superloop pass may take before a warning is logged.
    pub loop_time_budget: u64,
    /// Superloop passes between statistics dumps; 0 disables them.
    pub stats_dump_interval: u64,
    pub log_state_transitions: bool,
    pub boot_pmp_setup_timeout_secs: u64,
    /// Wait-state timeout as a divisor of one second.
    pub boot_wait_timeout_div: u64,
    /// Address of the MSS status register whose low bits flag booted U54s.
    pub mss_status_addr: u64,
    pub ymodem_max_sync_attempts: u32,
    pub ymodem_pre_sync_timeout_secs: u32,
    pub ymodem_post_sync_timeout_secs: u32,
    pub ymodem_bad_packet_retries: u32,
    pub ddr_base: u64,
    pub ddr_size: u64,
    /// Interrupt line overflow count after which receive is restarted.
    pub mac_rx_overflow_restart: u32,
    pub mac_disable_tx_crc: bool,
    pub tinycli_timeout_secs: u32,
}

impl Default for HssConfig {
    fn default() -> Self {
        HssConfig {
            ticks_per_sec: 1_000_000,
            loop_time_budget: 25_000,
            stats_dump_interval: 0,
            log_state_transitions: true,
            boot_pmp_setup_timeout_secs: 20,
            boot_wait_timeout_div: 20,
            mss_status_addr: 0x2000_2040,
            ymodem_max_sync_attempts: 20,
            ymodem_pre_sync_timeout_secs: 2,
            ymodem_post_sync_timeout_secs: 1,
            ymodem_bad_packet_retries: 10,
            ddr_base: 0x8000_0000,
            ddr_size: 0x4000_0000,
            mac_rx_overflow_restart: 4,
            mac_disable_tx_crc: false,
            tinycli_timeout_secs: 5,
        }
    }
}

impl HssConfig {
    pub fn one_sec(&self) -> u64 {
        self.ticks_per_sec
    }

    #[cfg(not(target_arch = "riscv64"))]
    pub fn hash_map(&self) -> std::collections::HashMap<String, String> {
        let mut map = std::collections::HashMap::new();
        let mut put = |name: &str, value: u64| {
            map.insert(name.to_string(), format!("0x{:x}", value));
        };
        put("TICKS_PER_SEC", self.ticks_per_sec);
        put("LOOP_TIME_BUDGET", self.loop_time_budget);
        put("STATS_DUMP_INTERVAL", self.stats_dump_interval);
        put("LOG_STATE_TRANSITIONS", self.log_state_transitions as u64);
        put("BOOT_PMP_SETUP_TIMEOUT_SECS", self.boot_pmp_setup_timeout_secs);
        put("BOOT_WAIT_TIMEOUT_DIV", self.boot_wait_timeout_div);
        put("MSS_STATUS_ADDR", self.mss_status_addr);
        put("YMODEM_MAX_SYNC_ATTEMPTS", self.ymodem_max_sync_attempts.into());
        put(
            "YMODEM_PRE_SYNC_TIMEOUT_SECS",
            self.ymodem_pre_sync_timeout_secs.into(),
        );
        put(
            "YMODEM_POST_SYNC_TIMEOUT_SECS",
            self.ymodem_post_sync_timeout_secs.into(),
        );
        put(
            "YMODEM_BAD_PACKET_RETRIES",
            self.ymodem_bad_packet_retries.into(),
        );
        put("DDR_BASE", self.ddr_base);
        put("DDR_SIZE", self.ddr_size);
        put("MAC_RX_OVERFLOW_RESTART", self.mac_rx_overflow_restart.into());
        put("MAC_DISABLE_TX_CRC", self.mac_disable_tx_crc as u64);
        put("TINYCLI_TIMEOUT_SECS", self.tinycli_timeout_secs.into());
        put("IPI_MAX_QUEUE_MSGS", IPI_MAX_QUEUE_MSGS as u64);
        map
    }
}
