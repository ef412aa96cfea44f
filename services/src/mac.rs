// Licensed under the Apache-2.0 license

//! Ethernet MAC DMA descriptor rings and interrupt demultiplexing.
//!
//! Each priority queue owns a small RX ring and a two-entry TX ring. TX is
//! single-packet: descriptor 0 carries the frame and descriptor 1 stays
//! USED so the DMA engine halts after one frame.
//!
//! Descriptor tables are handed to the hardware by address, so a [`Mac`]
//! must stay put (in a `static`) once a queue has been armed.

use core::fmt::{self, Write};

use bitflags::bitflags;
use hss_config::{HssConfig, MAC_QUEUE_COUNT, MAC_RX_RING_SIZE, MAC_TX_RING_SIZE};
use hss_error::HssError;
use log::{error, warn};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

bitflags! {
    /// Flag bits in the low word of an RX descriptor address.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RxAddrFlags: u32 {
        /// Set by the DMA once the buffer holds a frame.
        const USED = 1 << 0;
        const WRAP = 1 << 1;
        const TS_PRESENT = 1 << 2;
    }

    /// TX descriptor status word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TxDescFlags: u32 {
        const USED = 1 << 31;
        const WRAP = 1 << 30;
        const NO_CRC = 1 << 16;
        const LAST = 1 << 15;
    }

    /// Per-queue interrupt status (write one to clear).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MacInterrupt: u32 {
        const RECEIVE_COMPLETE = 1 << 1;
        const RX_USED_BIT_READ = 1 << 2;
        const AMBA_ERROR = 1 << 6;
        const TRANSMIT_COMPLETE = 1 << 7;
        const RECEIVE_OVERRUN = 1 << 10;
        const RESP_NOT_OK = 1 << 11;
        const PAUSE_QUANTUM_RX = 1 << 12;
        const PAUSE_TIME_ELAPSED = 1 << 13;
        const PAUSE_FRAME_TRANSMITTED = 1 << 14;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NetworkControl: u32 {
        const ENABLE_RECEIVE = 1 << 2;
        const ENABLE_TRANSMIT = 1 << 3;
        const TRANSMIT_START = 1 << 9;
        const TRANSMIT_HALT = 1 << 10;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RxStatus: u32 {
        const BUFFER_NOT_AVAILABLE = 1 << 0;
        const FRAME_RECEIVED = 1 << 1;
        const RECEIVE_OVERRUN = 1 << 2;
        const RESP_NOT_OK = 1 << 3;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TxStatus: u32 {
        const AMBA_ERROR = 1 << 4;
        const TRANSMIT_COMPLETE = 1 << 5;
    }
}

/// Frame length field of an RX descriptor status word, jumbo bit included.
pub const RX_LEN_MASK: u32 = 0x3fff;
pub const TX_LEN_MASK: u32 = 0x3fff;
/// Set in the length passed to [`Mac::send_pkt`] to suppress the FCS.
pub const TX_NO_CRC_REQUEST: u32 = 1 << 31;

const HANDLED: MacInterrupt = MacInterrupt::RECEIVE_COMPLETE
    .union(MacInterrupt::RX_USED_BIT_READ)
    .union(MacInterrupt::TRANSMIT_COMPLETE)
    .union(MacInterrupt::RECEIVE_OVERRUN)
    .union(MacInterrupt::RESP_NOT_OK)
    .union(MacInterrupt::PAUSE_QUANTUM_RX)
    .union(MacInterrupt::PAUSE_TIME_ELAPSED)
    .union(MacInterrupt::PAUSE_FRAME_TRANSMITTED);

/// 64-bit addressing mode DMA descriptor.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DmaDescriptor {
    pub addr_low: u32,
    pub status: u32,
    pub addr_high: u32,
    pub reserved: u32,
}

impl DmaDescriptor {
    fn set_addr(&mut self, addr: u64, flags: u32) {
        self.addr_low = addr as u32 | flags;
        self.addr_high = (addr >> 32) as u32;
    }

    fn rx_buffer(&self) -> u64 {
        let flags = RxAddrFlags::all().bits();
        (self.addr_low & !flags) as u64 | (self.addr_high as u64) << 32
    }

    fn rx_used(&self) -> bool {
        self.addr_low & RxAddrFlags::USED.bits() != 0
    }
}

/// Register-level access to one MAC instance.
pub trait MacRegisters {
    fn network_control(&self) -> NetworkControl;
    fn set_network_control(&mut self, value: NetworkControl);

    fn int_status(&self, queue: usize) -> MacInterrupt;
    fn int_mask(&self, queue: usize) -> MacInterrupt;
    fn clear_int_status(&mut self, queue: usize, bits: MacInterrupt);

    fn rx_status(&self) -> RxStatus;
    fn clear_rx_status(&mut self, bits: RxStatus);
    fn tx_status(&self) -> TxStatus;
    fn clear_tx_status(&mut self, bits: TxStatus);

    fn set_rx_queue_base(&mut self, queue: usize, addr: u64);
    fn set_tx_queue_base(&mut self, queue: usize, addr: u64);

    /// Masks or unmasks the queue's interrupt line at the interrupt controller.
    fn set_queue_irq(&mut self, queue: usize, enabled: bool);
}

/// Upcalls made from the interrupt handler.
pub trait PacketHandler {
    fn packet_received(&mut self, queue: usize, buffer: u64, len: u32, user: usize);

    fn packet_sent(&mut self, queue: usize, user: usize);
}

/// How `receive_pkt` treats the receiver after queueing a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxMode {
    /// Receiver stays off while a chain of buffers is built.
    Disable,
    /// Restart reception from the start of the ring and unmask the interrupt.
    Arm,
    /// Turn the receiver back on if an overflow stopped it.
    Enable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ingress: u64,
    pub egress: u64,
    pub rx_overflow: u32,
    pub hresp_error: u32,
    pub rx_restart: u32,
    pub tx_amba_errors: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PauseStats {
    pub tx_pause: u32,
    pub rx_pause: u32,
    pub pause_elapsed: u32,
}

struct MacQueue {
    rx_desc: [DmaDescriptor; MAC_RX_RING_SIZE],
    tx_desc: [DmaDescriptor; MAC_TX_RING_SIZE],
    rx_user: [usize; MAC_RX_RING_SIZE],
    tx_user: usize,
    available_rx: usize,
    available_tx: usize,
    next_free_rx: usize,
    first_rx: usize,
    in_isr: bool,
    overflow_counter: u32,
    stats: QueueStats,
}

impl MacQueue {
    fn new() -> Self {
        let mut queue = Self {
            rx_desc: [DmaDescriptor::new_zeroed(); MAC_RX_RING_SIZE],
            tx_desc: [DmaDescriptor::new_zeroed(); MAC_TX_RING_SIZE],
            rx_user: [0; MAC_RX_RING_SIZE],
            tx_user: 0,
            available_rx: MAC_RX_RING_SIZE,
            available_tx: MAC_TX_RING_SIZE,
            next_free_rx: 0,
            first_rx: 0,
            in_isr: false,
            overflow_counter: 0,
            stats: QueueStats::default(),
        };
        for desc in queue.tx_desc.iter_mut() {
            desc.status = TxDescFlags::USED.bits();
        }
        queue.tx_desc[MAC_TX_RING_SIZE - 1].status |= TxDescFlags::WRAP.bits();
        queue.rx_desc[MAC_RX_RING_SIZE - 1].addr_low |= RxAddrFlags::WRAP.bits();
        queue
    }

    fn rx_ring_addr(&self) -> u64 {
        self.rx_desc.as_ptr() as u64
    }

    fn tx_ring_addr(&self) -> u64 {
        self.tx_desc.as_ptr() as u64
    }

    fn wrap_flag(index: usize) -> u32 {
        if index == MAC_RX_RING_SIZE - 1 {
            RxAddrFlags::WRAP.bits()
        } else {
            0
        }
    }
}

pub struct Mac<R: MacRegisters> {
    regs: R,
    queues: [MacQueue; MAC_QUEUE_COUNT],
    append_crc: bool,
    rx_discard: bool,
    overflow_restart: u32,
    pause: PauseStats,
}

impl<R: MacRegisters> Mac<R> {
    pub fn new(regs: R, config: &HssConfig) -> Self {
        Self {
            regs,
            queues: core::array::from_fn(|_| MacQueue::new()),
            append_crc: !config.mac_disable_tx_crc,
            rx_discard: false,
            overflow_restart: config.mac_rx_overflow_restart,
            pause: PauseStats::default(),
        }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut R {
        &mut self.regs
    }

    /// When set, received buffers go straight back onto the ring without
    /// being reported.
    pub fn set_rx_discard(&mut self, discard: bool) {
        self.rx_discard = discard;
    }

    pub fn queue_stats(&self, queue: usize) -> Option<QueueStats> {
        self.queues.get(queue).map(|q| q.stats)
    }

    pub fn pause_stats(&self) -> PauseStats {
        self.pause
    }

    fn control_update(&mut self, set: NetworkControl, clear: NetworkControl) {
        let value = (self.regs.network_control() - clear) | set;
        self.regs.set_network_control(value);
    }

    /// Hands `buffer` to the RX ring of `queue`; `user` comes back with the
    /// frame.
    pub fn receive_pkt(
        &mut self,
        queue: usize,
        buffer: u64,
        user: usize,
        mode: RxMode,
    ) -> Result<(), HssError> {
        if queue >= MAC_QUEUE_COUNT || buffer % 4 != 0 {
            return Err(HssError::InvalidArgument);
        }
        let in_isr = self.queues[queue].in_isr;
        if !in_isr {
            self.regs.set_queue_irq(queue, false);
        }

        let result = if self.queues[queue].available_rx == 0 {
            Err(HssError::MacRingFull)
        } else {
            if mode == RxMode::Disable {
                self.control_update(NetworkControl::empty(), NetworkControl::ENABLE_RECEIVE);
            }

            let q = &mut self.queues[queue];
            q.available_rx -= 1;
            let index = q.next_free_rx;
            q.rx_desc[index].set_addr(buffer, MacQueue::wrap_flag(index));
            q.rx_desc[index].status = 0;
            q.rx_user[index] = user;
            q.next_free_rx = (index + 1) % MAC_RX_RING_SIZE;
            let ring = q.rx_ring_addr();

            match mode {
                RxMode::Arm => {
                    self.control_update(NetworkControl::empty(), NetworkControl::ENABLE_RECEIVE);
                    self.regs.set_rx_queue_base(queue, ring);
                    self.control_update(NetworkControl::ENABLE_RECEIVE, NetworkControl::empty());
                }
                RxMode::Enable => {
                    if !self.regs.network_control().contains(NetworkControl::ENABLE_RECEIVE) {
                        self.control_update(NetworkControl::ENABLE_RECEIVE, NetworkControl::empty());
                    }
                }
                RxMode::Disable => {}
            }
            Ok(())
        };

        if mode == RxMode::Arm && !in_isr {
            self.regs.set_queue_irq(queue, true);
        }
        result
    }

    /// Starts transmission of one frame. Bit 31 of `length` suppresses the
    /// FCS for this frame only.
    pub fn send_pkt(
        &mut self,
        queue: usize,
        buffer: u64,
        length: u32,
        user: usize,
    ) -> Result<(), HssError> {
        let no_crc = !self.append_crc || length & TX_NO_CRC_REQUEST != 0;
        let length = length & !TX_NO_CRC_REQUEST;
        if queue >= MAC_QUEUE_COUNT || length == 0 || length > TX_LEN_MASK || buffer % 4 != 0 {
            return Err(HssError::InvalidArgument);
        }

        let in_isr = self.queues[queue].in_isr;
        if !in_isr {
            self.regs.set_queue_irq(queue, false);
        }

        let q = &mut self.queues[queue];
        let result = if q.available_tx == MAC_TX_RING_SIZE {
            q.available_tx = 0;
            let mut status = TxDescFlags::LAST;
            if no_crc {
                status |= TxDescFlags::NO_CRC;
            }
            q.tx_desc[0].set_addr(buffer, 0);
            q.tx_desc[0].status = length | status.bits();
            q.tx_user = user;
            q.stats.egress += length as u64;
            let ring = q.tx_ring_addr();

            self.control_update(
                NetworkControl::ENABLE_TRANSMIT | NetworkControl::TRANSMIT_HALT,
                NetworkControl::empty(),
            );
            self.regs.set_tx_queue_base(queue, ring);
            self.control_update(NetworkControl::TRANSMIT_START, NetworkControl::empty());
            Ok(())
        } else {
            Err(HssError::MacRingFull)
        };

        if !in_isr {
            self.regs.set_queue_irq(queue, true);
        }
        result
    }

    /// Reports every frame the DMA has finished with, oldest first.
    fn reap_rx(&mut self, queue: usize, handler: &mut dyn PacketHandler) {
        for _ in 0..MAC_RX_RING_SIZE {
            let q = &mut self.queues[queue];
            let index = q.first_rx;
            let desc = q.rx_desc[index];
            // an unarmed slot left behind by a ring restart ends the walk
            if !desc.rx_used() || desc.rx_buffer() == 0 {
                break;
            }
            q.available_rx += 1;
            let buffer = desc.rx_buffer();
            let user = q.rx_user[index];
            q.rx_desc[index].addr_low &= !RxAddrFlags::USED.bits();
            q.first_rx = (index + 1) % MAC_RX_RING_SIZE;

            if self.rx_discard {
                if let Err(e) = self.receive_pkt(queue, buffer, user, RxMode::Enable) {
                    warn!("mac: cannot recycle RX buffer 0x{:x}: {}", buffer, e);
                }
            } else {
                let len = desc.status & RX_LEN_MASK;
                self.queues[queue].stats.ingress += len as u64;
                handler.packet_received(queue, buffer, len, user);
            }
        }
    }

    /// Throws away everything on the RX ring and restarts reception.
    fn restart_rx(&mut self, queue: usize) {
        self.control_update(NetworkControl::empty(), NetworkControl::ENABLE_RECEIVE);
        let q = &mut self.queues[queue];
        q.overflow_counter = 0;
        q.stats.rx_restart += 1;
        q.available_rx = MAC_RX_RING_SIZE;
        q.next_free_rx = 0;
        q.first_rx = 0;
        for (index, desc) in q.rx_desc.iter_mut().enumerate() {
            // software-owned until re-armed
            desc.set_addr(0, RxAddrFlags::USED.bits() | MacQueue::wrap_flag(index));
        }
        let ring = q.rx_ring_addr();
        self.regs.set_rx_queue_base(queue, ring);
        self.control_update(NetworkControl::ENABLE_RECEIVE, NetworkControl::empty());
    }

    /// Interrupt service for `queue`. Status bits are cleared before each
    /// condition is handled so events raised meanwhile are seen next time.
    pub fn irq_handler(
        &mut self,
        queue: usize,
        handler: &mut dyn PacketHandler,
    ) -> Result<(), HssError> {
        if queue >= MAC_QUEUE_COUNT {
            return Err(HssError::InvalidArgument);
        }
        self.queues[queue].in_isr = true;
        let pending = self.regs.int_status(queue) - self.regs.int_mask(queue);

        if pending.contains(MacInterrupt::RECEIVE_COMPLETE) {
            self.regs.clear_rx_status(RxStatus::FRAME_RECEIVED);
            self.regs.clear_int_status(queue, MacInterrupt::RECEIVE_COMPLETE);
            self.reap_rx(queue, handler);
            self.queues[queue].overflow_counter = 0;
        }
        if pending.contains(MacInterrupt::RECEIVE_OVERRUN) {
            self.regs.clear_rx_status(RxStatus::RECEIVE_OVERRUN);
            self.regs.clear_int_status(queue, MacInterrupt::RECEIVE_OVERRUN);
            self.reap_rx(queue, handler);
            let q = &mut self.queues[queue];
            q.overflow_counter += 1;
            q.stats.rx_overflow += 1;
        }
        if pending.contains(MacInterrupt::RX_USED_BIT_READ) {
            self.regs.clear_rx_status(RxStatus::BUFFER_NOT_AVAILABLE);
            self.regs.clear_int_status(queue, MacInterrupt::RX_USED_BIT_READ);
            self.reap_rx(queue, handler);
            let q = &mut self.queues[queue];
            q.overflow_counter += 1;
            q.stats.rx_overflow += 1;
        }
        if pending.contains(MacInterrupt::RESP_NOT_OK) {
            self.regs.clear_rx_status(RxStatus::RESP_NOT_OK);
            self.regs.clear_int_status(queue, MacInterrupt::RESP_NOT_OK);
            self.reap_rx(queue, handler);
            self.control_update(NetworkControl::ENABLE_RECEIVE, NetworkControl::empty());
            self.queues[queue].stats.hresp_error += 1;
        }
        if pending.contains(MacInterrupt::TRANSMIT_COMPLETE)
            && self.regs.tx_status().contains(TxStatus::TRANSMIT_COMPLETE)
        {
            self.regs.clear_tx_status(TxStatus::TRANSMIT_COMPLETE);
            self.regs.clear_int_status(queue, MacInterrupt::TRANSMIT_COMPLETE);
            let user = self.queues[queue].tx_user;
            handler.packet_sent(queue, user);
            self.queues[queue].available_tx = MAC_TX_RING_SIZE;
        }

        if self.queues[queue].overflow_counter > self.overflow_restart {
            warn!("mac: queue {} stuck in RX overflow, restarting", queue);
            self.restart_rx(queue);
        }

        for (bit, counter) in [
            (MacInterrupt::PAUSE_FRAME_TRANSMITTED, &mut self.pause.tx_pause),
            (MacInterrupt::PAUSE_TIME_ELAPSED, &mut self.pause.pause_elapsed),
            (MacInterrupt::PAUSE_QUANTUM_RX, &mut self.pause.rx_pause),
        ] {
            if pending.contains(bit) {
                self.regs.clear_int_status(queue, bit);
                *counter += 1;
            }
        }

        let mut result = Ok(());
        let rest = pending - HANDLED;
        if rest.contains(MacInterrupt::AMBA_ERROR) {
            self.regs.clear_int_status(queue, MacInterrupt::AMBA_ERROR);
            self.regs.clear_tx_status(TxStatus::AMBA_ERROR);
            let q = &mut self.queues[queue];
            q.stats.tx_amba_errors += 1;
            q.available_tx = MAC_TX_RING_SIZE;
        } else if !rest.is_empty() {
            error!("mac: unexpected interrupt 0x{:x} on queue {}", rest.bits(), queue);
            result = Err(HssError::MacUnexpectedInterrupt);
        }

        self.queues[queue].in_isr = false;
        result
    }

    pub fn dump_stats(&self, out: &mut dyn Write) -> fmt::Result {
        for (index, q) in self.queues.iter().enumerate() {
            let s = &q.stats;
            writeln!(
                out,
                "queue {}: ingress {} egress {} rx_overflow {} hresp_error {} rx_restart {} tx_amba_errors {}",
                index, s.ingress, s.egress, s.rx_overflow, s.hresp_error, s.rx_restart, s.tx_amba_errors
            )?;
        }
        writeln!(
            out,
            "pause: tx {} rx {} elapsed {}",
            self.pause.tx_pause, self.pause.rx_pause, self.pause.pause_elapsed
        )
    }
}
