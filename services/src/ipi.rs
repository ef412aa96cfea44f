// Licensed under the Apache-2.0 license

//! Inter-hart messaging.
//!
//! Every ordered pair of distinct harts owns a fixed-depth outbox. A sender
//! fills the first free slot of `queue(me -> target)`, records the slot's
//! transaction id as the last one sent on that queue, and raises the
//! target's software interrupt. A receiver compares the last id against a
//! shadow copy to notice new traffic, then consumes messages of the type it
//! is interested in.
//!
//! The sender side also keeps a small completion table: a slot is
//! allocated per outstanding request, delivered with the slot's transaction
//! id, and flips out of `Pending` when the peer's ACK comes back.

use core::fmt::{self, Write};

use hss_config::IPI_MAX_QUEUE_MSGS;
use hss_hal::{HartId, SoftwareInterrupt, ALL_U54_MASK, NUM_PEERS};
use log::{error, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::IntoStaticStr;

pub const IPI_VERSION: u32 = 0x0101;

pub const NUM_QUEUES: usize = NUM_PEERS * (NUM_PEERS - 1);

/// Size of the completion table.
pub const MAX_OUTSTANDING: usize = IPI_MAX_QUEUE_MSGS * 4;

/// Completion index meaning "nothing outstanding".
pub const NO_COMPLETION: usize = MAX_OUTSTANDING;

pub type TxId = u32;

#[repr(u8)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, IntoStaticStr,
)]
pub enum IpiMsgType {
    #[default]
    NoMessage = 0,
    BootRequest,
    PmpSetup,
    SpiXfer,
    NetRxPoll,
    NetTx,
    ScatterGatherDma,
    WdogInit,
    GpioSet,
    UartTx,
    UartPollRx,
    PowerMode,
    FlashFreeze,
    AckPending,
    AckComplete,
    Halt,
    Continue,
    Goto,
    OpenSbiInit,
}

impl IpiMsgType {
    pub fn is_ack(self) -> bool {
        matches!(self, IpiMsgType::AckPending | IpiMsgType::AckComplete)
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum IpiStatus {
    Fail = 0,
    Success,
    #[default]
    Pending,
    Idle,
}

/// One outbox slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpiMessage {
    pub msg_type: IpiMsgType,
    pub transaction_id: TxId,
    pub immediate_arg: u32,
    pub ext_addr: u64,
    pub anc_addr: u64,
}

/// What a message handler is told about the request it is servicing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpiRequest {
    pub source: HartId,
    pub transaction_id: TxId,
    pub immediate_arg: u32,
    pub ext_addr: u64,
    pub anc_addr: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Queue {
    msgs: [IpiMessage; IPI_MAX_QUEUE_MSGS],
    count: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct Completion {
    used: bool,
    transaction_id: TxId,
    status: IpiStatus,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpiStats {
    pub message_allocs: u64,
    pub message_delivers: u64,
    pub message_frees: u64,
    pub consume_intents: u64,
    pub ipi_sends: u64,
}

/// Maps a (source, target) pair onto its outbox. Returns `None` when a hart
/// addresses itself.
pub fn queue_index(source: HartId, target: HartId) -> Option<usize> {
    if source == target {
        return None;
    }
    let (s, t) = (source.index(), target.index());
    let index = s * (NUM_PEERS - 1) + t;
    Some(if t > s { index - 1 } else { index })
}

/// The shared messaging area.
pub struct Ipi {
    version: u32,
    queues: [Queue; NUM_QUEUES],
    completions: [Completion; MAX_OUTSTANDING],
    last_txid: [TxId; NUM_QUEUES],
    shadow_txid: [TxId; NUM_QUEUES],
    my_txid: [TxId; NUM_PEERS],
    stats: [IpiStats; NUM_PEERS],
}

impl Default for Ipi {
    fn default() -> Self {
        Self::new()
    }
}

impl Ipi {
    pub fn new() -> Self {
        Self {
            version: IPI_VERSION,
            queues: [Queue::default(); NUM_QUEUES],
            completions: [Completion::default(); MAX_OUTSTANDING],
            last_txid: [0; NUM_QUEUES],
            shadow_txid: [0; NUM_QUEUES],
            my_txid: [1; NUM_PEERS],
            stats: [IpiStats::default(); NUM_PEERS],
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn stats(&self, hart: HartId) -> &IpiStats {
        &self.stats[hart.index()]
    }

    /// Transaction id that `hart` will use for its next allocation.
    pub fn next_txid(&self, hart: HartId) -> TxId {
        self.my_txid[hart.index()]
    }

    /// Messages counted in `queue(source -> target)` at the last poll.
    pub fn pending_count(&self, source: HartId, target: HartId) -> u32 {
        queue_index(source, target).map_or(0, |i| self.queues[i].count)
    }

    /// Occupied slots of `queue(source -> target)`, in slot order.
    pub fn messages(
        &self,
        source: HartId,
        target: HartId,
    ) -> impl Iterator<Item = &IpiMessage> + '_ {
        let slots: &[IpiMessage] = match queue_index(source, target) {
            Some(i) => &self.queues[i].msgs,
            None => &[],
        };
        slots.iter().filter(|m| m.msg_type != IpiMsgType::NoMessage)
    }

    /// Places a message in the first free slot of `queue(me -> target)` and
    /// interrupts the target.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &mut self,
        msip: &dyn SoftwareInterrupt,
        me: HartId,
        target: HartId,
        msg_type: IpiMsgType,
        transaction_id: TxId,
        immediate_arg: u32,
        ext_addr: u64,
        anc_addr: u64,
    ) -> bool {
        let Some(index) = queue_index(me, target) else {
            error!("{} cannot send {:?} to itself", me.name(), msg_type);
            return false;
        };

        let queue = &mut self.queues[index];
        let Some(slot) = queue
            .msgs
            .iter_mut()
            .find(|m| m.msg_type == IpiMsgType::NoMessage)
        else {
            error!(
                "No space in queue {} -> {} for {:?}",
                me.name(),
                target.name(),
                msg_type
            );
            return false;
        };

        *slot = IpiMessage {
            msg_type,
            transaction_id,
            immediate_arg,
            ext_addr,
            anc_addr,
        };
        self.last_txid[index] = transaction_id;

        msip.raise(target);
        self.stats[target.index()].ipi_sends += 1;
        true
    }

    /// Looks for new traffic addressed to `me` from any hart in `mask`.
    /// Queues with news get their pending count refreshed.
    pub fn poll_receive(&mut self, me: HartId, mask: u32) -> bool {
        let mut result = false;
        for source in HartId::ALL {
            if source == me || source.mask() & mask == 0 {
                continue;
            }
            let Some(index) = queue_index(source, me) else {
                continue;
            };
            if self.shadow_txid[index] != self.last_txid[index] {
                self.shadow_txid[index] = self.last_txid[index];
                let queue = &mut self.queues[index];
                queue.count = queue
                    .msgs
                    .iter()
                    .filter(|m| m.msg_type != IpiMsgType::NoMessage)
                    .count() as u32;
                result = true;
            }
        }
        result
    }

    /// Services the first message of `msg_type` waiting in
    /// `queue(source -> me)`.
    ///
    /// ACK messages are handled internally by updating the completion table
    /// and `handler` is ignored for them. Other messages get an ACK sent back
    /// according to the handler's status. Messages of the requested type that
    /// have no handler are cleared and skipped. Returns whether a message was
    /// serviced.
    pub fn consume_intent(
        &mut self,
        msip: &dyn SoftwareInterrupt,
        me: HartId,
        source: HartId,
        msg_type: IpiMsgType,
        mut handler: Option<&mut dyn FnMut(&IpiRequest) -> IpiStatus>,
    ) -> bool {
        let Some(index) = queue_index(source, me) else {
            return false;
        };

        for slot in 0..IPI_MAX_QUEUE_MSGS {
            let msg = self.queues[index].msgs[slot];
            if msg.msg_type != msg_type {
                continue;
            }

            let request = IpiRequest {
                source,
                transaction_id: msg.transaction_id,
                immediate_arg: msg.immediate_arg,
                ext_addr: msg.ext_addr,
                anc_addr: msg.anc_addr,
            };

            let status = if msg_type.is_ack() {
                self.update_status(msg.transaction_id, IpiStatus::Idle);
                IpiStatus::Success
            } else if let Some(handler) = handler.as_deref_mut() {
                handler(&request)
            } else {
                warn!(
                    "{}: no handler found for {:?} from {}, force clearing",
                    me.name(),
                    msg_type,
                    source.name()
                );
                self.queues[index].msgs[slot] = IpiMessage::default();
                continue;
            };
            self.stats[me.index()].consume_intents += 1;

            if !msg_type.is_ack() {
                let reply = match status {
                    IpiStatus::Success => Some((IpiMsgType::AckComplete, IpiStatus::Success)),
                    IpiStatus::Pending => Some((IpiMsgType::AckPending, IpiStatus::Pending)),
                    IpiStatus::Fail => Some((IpiMsgType::AckComplete, IpiStatus::Fail)),
                    IpiStatus::Idle => None,
                };
                if let Some((ack, code)) = reply {
                    self.send(
                        msip,
                        me,
                        source,
                        ack,
                        msg.transaction_id,
                        code.into(),
                        0,
                        0,
                    );
                }
            }

            self.queues[index].msgs[slot] = IpiMessage::default();
            return true;
        }
        false
    }

    /// Drains ACKs sent to `me` by any other hart.
    pub fn poll_and_consume_acks(&mut self, msip: &dyn SoftwareInterrupt, me: HartId) {
        if !self.poll_receive(me, ALL_U54_MASK) {
            return;
        }
        for source in HartId::ALL {
            if source == me || self.pending_count(source, me) == 0 {
                continue;
            }
            self.consume_intent(msip, me, source, IpiMsgType::AckComplete, None);
            self.consume_intent(msip, me, source, IpiMsgType::AckPending, None);
        }
    }

    /// Reserves a completion slot for a request `me` is about to send.
    pub fn alloc(&mut self, me: HartId) -> Option<usize> {
        let index = self.completions.iter().position(|c| !c.used)?;
        let txid = self.my_txid[me.index()];
        self.completions[index] = Completion {
            used: true,
            transaction_id: txid,
            status: IpiStatus::Pending,
        };
        self.my_txid[me.index()] = txid.wrapping_add(1);
        self.stats[me.index()].message_allocs += 1;
        Some(index)
    }

    /// Sends a message carrying the transaction id of completion `index`.
    #[allow(clippy::too_many_arguments)]
    pub fn deliver(
        &mut self,
        msip: &dyn SoftwareInterrupt,
        me: HartId,
        index: usize,
        target: HartId,
        msg_type: IpiMsgType,
        immediate_arg: u32,
        ext_addr: u64,
        anc_addr: u64,
    ) -> bool {
        let Some(completion) = self.completions.get(index).filter(|c| c.used) else {
            return false;
        };
        let txid = completion.transaction_id;
        let sent = self.send(
            msip,
            me,
            target,
            msg_type,
            txid,
            immediate_arg,
            ext_addr,
            anc_addr,
        );
        if sent {
            self.stats[me.index()].message_delivers += 1;
        }
        sent
    }

    /// True once the request behind `index` is no longer pending.
    /// [`NO_COMPLETION`] is always complete; an unused slot never is.
    pub fn check_if_complete(&self, index: usize) -> bool {
        if index == NO_COMPLETION {
            return true;
        }
        match self.completions.get(index) {
            Some(c) if c.used => c.status != IpiStatus::Pending,
            _ => false,
        }
    }

    pub fn update_status(&mut self, transaction_id: TxId, status: IpiStatus) -> bool {
        match self
            .completions
            .iter_mut()
            .find(|c| c.transaction_id == transaction_id)
        {
            Some(c) => {
                c.status = status;
                true
            }
            None => false,
        }
    }

    pub fn free(&mut self, me: HartId, index: usize) {
        if let Some(c) = self.completions.get_mut(index) {
            if c.used {
                c.used = false;
                self.stats[me.index()].message_frees += 1;
            }
        }
    }

    pub fn dump_stats(&self, out: &mut dyn Write) -> fmt::Result {
        for hart in HartId::ALL {
            let s = &self.stats[hart.index()];
            writeln!(out, "{}:", hart.name())?;
            writeln!(out, "  message_allocs:   {}", s.message_allocs)?;
            writeln!(out, "  message_delivers: {}", s.message_delivers)?;
            writeln!(out, "  message_frees:    {}", s.message_frees)?;
            writeln!(out, "  consume_intents:  {}", s.consume_intents)?;
            writeln!(out, "  ipi_sends:        {}", s.ipi_sends)?;
        }
        Ok(())
    }
}
