// Licensed under the Apache-2.0 license

//! Boot service: one state machine per U54 that sets up the hart's PMPs,
//! copies its chunks out of the registered boot image, and releases it into
//! its payload with an `OPENSBI_INIT` request.

pub mod loader;
pub mod pmp;

use arrayvec::ArrayVec;
use hss_boot_image::{BootChunkDesc, BootImageView, HartDesc, ZiChunkDesc};
use hss_error::HssError;
use hss_hal::{HartId, HartTarget, NUM_PEERS, NUM_U54S};
use log::{debug, error, info, warn};
use strum_macros::IntoStaticStr;

use crate::ipi::{IpiMsgType, IpiRequest, IpiStatus, NO_COMPLETION};
use crate::sm::{MachineStats, Runnable, Service, StateHandlers, StateMachine, StateTimes};
use crate::Platform;

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum BootState {
    Init,
    #[strum(serialize = "SetupPMP")]
    SetupPmp,
    #[strum(serialize = "SetupPMPComplete")]
    SetupPmpComplete,
    Download,
    Wait,
    Idle,
    Error,
}

const MACHINE_NAMES: [&str; NUM_U54S] = [
    "boot_service(u54_1)",
    "boot_service(u54_2)",
    "boot_service(u54_3)",
    "boot_service(u54_4)",
];

/// What one boot machine sees while it runs.
pub struct BootContext<'p, 'b> {
    platform: &'p mut Platform<'b>,
    image: Option<BootImageView<'p>>,
}

/// Per-hart boot progress.
pub struct BootHart {
    name: &'static str,
    target: HartId,
    chunk_cursor: usize,
    zi_cursor: usize,
    msg_index: usize,
    /// Completions for peers in the same boot set.
    aux_indices: ArrayVec<usize, { NUM_U54S - 1 }>,
}

impl BootHart {
    fn new(target: HartId) -> Self {
        Self {
            name: MACHINE_NAMES[target.index() - 1],
            target,
            chunk_cursor: 0,
            zi_cursor: 0,
            msg_index: NO_COMPLETION,
            aux_indices: ArrayVec::new(),
        }
    }

    fn desc<'i>(&self, image: &'i BootImageView<'_>) -> &'i HartDesc {
        &image.header().hart[self.target.index() - 1]
    }

    fn release_completions(&mut self, platform: &mut Platform<'_>) {
        for index in self.aux_indices.drain(..) {
            platform.ipi.free(HartId::E51, index);
        }
        if self.msg_index != NO_COMPLETION {
            platform.ipi.free(HartId::E51, self.msg_index);
            self.msg_index = NO_COMPLETION;
        }
    }

    /// True once every outstanding request has been acknowledged. Acknowledged
    /// peer requests are released as they come in.
    fn check_for_acks(&mut self, platform: &mut Platform<'_>) -> bool {
        let ipi = &mut *platform.ipi;
        let mut done = true;
        self.aux_indices.retain(|index| {
            if ipi.check_if_complete(*index) {
                ipi.free(HartId::E51, *index);
                false
            } else {
                done = false;
                true
            }
        });
        if self.msg_index != NO_COMPLETION {
            done &= ipi.check_if_complete(self.msg_index);
            if done {
                ipi.free(HartId::E51, self.msg_index);
                self.msg_index = NO_COMPLETION;
            }
        }
        done
    }

    /// Allocates a completion and delivers `msg_type` to `to`. The completion
    /// is released again when delivery fails.
    fn request(
        &self,
        platform: &mut Platform<'_>,
        to: HartId,
        msg_type: IpiMsgType,
        immediate_arg: u32,
        ext_addr: u64,
    ) -> Option<usize> {
        let Some(index) = platform.ipi.alloc(HartId::E51) else {
            error!("{}::no free completion for {:?}", self.name, msg_type);
            return None;
        };
        if platform.ipi.deliver(
            platform.msip,
            HartId::E51,
            index,
            to,
            msg_type,
            immediate_arg,
            ext_addr,
            0,
        ) {
            Some(index)
        } else {
            info!("hart {}: failed to send message, so freeing", to.name());
            platform.ipi.free(HartId::E51, index);
            None
        }
    }

    fn download_chunk(&self, platform: &mut Platform<'_>, image: &BootImageView<'_>, chunk: &BootChunkDesc) {
        if !platform.pmp.check_write(self.target, chunk.exec_addr, chunk.size) {
            error!(
                "Target {} is skipping chunk 0x{:x} due to invalid permissions",
                self.target.name(),
                chunk.exec_addr
            );
            return;
        }
        let Some(data) = image.chunk_data(chunk) else {
            error!("{}::chunk data at 0x{:x} lies outside the image", self.name, chunk.load_addr);
            return;
        };
        debug!(
            "{}::chunk@0x{:x}->0x{:x}, {} bytes",
            self.name, chunk.load_addr, chunk.exec_addr, chunk.size
        );
        if let Err(err) = platform.memory.write(chunk.exec_addr, data) {
            error!("{}::copy to 0x{:x} failed: {}", self.name, chunk.exec_addr, err);
        }
    }

    fn zero_chunk(&self, platform: &mut Platform<'_>, zi: &ZiChunkDesc) {
        if !platform.pmp.check_write(self.target, zi.exec_addr, zi.size) {
            error!(
                "Target {} is skipping ZI chunk 0x{:x} due to invalid permissions",
                self.target.name(),
                zi.exec_addr
            );
            return;
        }
        if let Err(err) = platform.memory.fill(zi.exec_addr, 0, zi.size) {
            error!("{}::zero fill at 0x{:x} failed: {}", self.name, zi.exec_addr, err);
        }
    }

    /// Flags the hart as booted in the MSS status register.
    fn mark_booted(&self, platform: &mut Platform<'_>) {
        let addr = platform.config.mss_status_addr;
        let bit = 1u32 << (self.target.index() - 1);
        let result = platform
            .memory
            .read_u32(addr)
            .and_then(|status| platform.memory.write_u32(addr, status | bit));
        if let Err(err) = result {
            warn!("{}::unable to update boot status: {}", self.name, err);
        }
    }

    fn download(&mut self, platform: &mut Platform<'_>, image: &BootImageView<'_>) -> BootState {
        let desc = *self.desc(image);
        if desc.num_chunks == 0 {
            return BootState::Idle;
        }

        if self.chunk_cursor as u64 <= desc.last_chunk {
            if let Some(chunk) = image.chunk(self.chunk_cursor).filter(|c| c.size != 0) {
                if chunk.owner == u32::from(u8::from(self.target)) {
                    self.download_chunk(platform, image, &chunk);
                }
                self.chunk_cursor += 1;
                return BootState::Download;
            }
        }

        if let Some(zi) = image.zi_chunk(self.zi_cursor).filter(|z| z.size != 0) {
            if zi.owner == u32::from(u8::from(self.target)) {
                self.zero_chunk(platform, &zi);
            }
            self.zi_cursor += 1;
            return BootState::Download;
        }

        BootState::Wait
    }

    /// Releases the hart, and any boot-set peers sharing its entry point,
    /// into their payloads.
    fn start_payload(&mut self, platform: &mut Platform<'_>, image: &BootImageView<'_>) {
        let desc = *self.desc(image);
        if desc.entry_point == 0 {
            info!(
                "{}::target is {}, skipping sbi_init (no entry point)",
                self.name,
                self.target.name()
            );
            return;
        }
        if desc.num_chunks == 0 {
            return;
        }

        for peer in HartId::U54S {
            if peer == self.target {
                continue;
            }
            let peer_desc = &image.header().hart[peer.index() - 1];
            if peer_desc.entry_point != desc.entry_point {
                continue;
            }
            info!("{}::{}:sbi_init 0x{:x}", self.name, peer.name(), peer_desc.entry_point);
            let request = self.request(
                platform,
                peer,
                IpiMsgType::OpenSbiInit,
                peer_desc.priv_mode.into(),
                peer_desc.entry_point,
            );
            if let Some(index) = request {
                // Capacity equals the number of possible peers.
                let _ = self.aux_indices.try_push(index);
            }
        }

        info!("{}::{}:sbi_init 0x{:x}", self.name, self.target.name(), desc.entry_point);
        self.msg_index = self
            .request(
                platform,
                self.target,
                IpiMsgType::OpenSbiInit,
                desc.priv_mode.into(),
                desc.entry_point,
            )
            .unwrap_or(NO_COMPLETION);
    }
}

impl Service for BootHart {
    type State = BootState;
}

impl<'p, 'b> StateHandlers<BootContext<'p, 'b>> for BootHart {
    fn entry(&mut self, state: BootState, ctx: &mut BootContext<'p, 'b>) {
        match state {
            BootState::Init => self.release_completions(ctx.platform),
            BootState::SetupPmp => {
                self.msg_index = NO_COMPLETION;
                self.aux_indices.clear();
            }
            BootState::Download => {
                let Some(image) = ctx.image else {
                    return;
                };
                let desc = self.desc(&image);
                self.chunk_cursor = desc.first_chunk as usize;
                self.zi_cursor = 0;
                if desc.num_chunks != 0 {
                    info!("{}::Processing boot image:\n  \"{}\"", self.name, desc.name());
                }
            }
            BootState::Wait => info!("{}::Checking for IPI ACKs: - -", self.name),
            _ => {}
        }
    }

    fn handler(&mut self, state: BootState, times: &StateTimes, ctx: &mut BootContext<'p, 'b>) -> BootState {
        let clock = ctx.platform.clock;
        let config = ctx.platform.config;
        match state {
            BootState::Init => {
                if ctx.image.is_some() {
                    BootState::SetupPmp
                } else {
                    error!("{}::\tNo Boot Image registered", self.name);
                    BootState::Error
                }
            }
            BootState::SetupPmp => {
                if self.msg_index == NO_COMPLETION {
                    match self.request(ctx.platform, self.target, IpiMsgType::PmpSetup, 0, 0) {
                        Some(index) => self.msg_index = index,
                        None => return BootState::SetupPmp,
                    }
                }
                BootState::SetupPmpComplete
            }
            BootState::SetupPmpComplete => {
                let timeout = clock.secs(config.boot_pmp_setup_timeout_secs);
                if clock.is_elapsed(times.state_entered, timeout) {
                    error!("{}::Timeout after {} iterations", self.name, times.execution_count);
                    self.release_completions(ctx.platform);
                    BootState::Error
                } else if self.check_for_acks(ctx.platform) {
                    info!("{}::PMP setup completed", self.name);
                    BootState::Download
                } else {
                    BootState::SetupPmpComplete
                }
            }
            BootState::Download => match ctx.image {
                Some(image) => self.download(ctx.platform, &image),
                None => BootState::Error,
            },
            BootState::Wait => {
                let Some(image) = ctx.image else {
                    return BootState::Error;
                };
                let timeout = config.one_sec() / config.boot_wait_timeout_div.max(1);
                if self.desc(&image).entry_point == 0 {
                    BootState::Idle
                } else if clock.is_elapsed(times.state_entered, timeout) {
                    error!("{}::Timeout after {} iterations", self.name, times.execution_count);
                    self.release_completions(ctx.platform);
                    BootState::Error
                } else if self.check_for_acks(ctx.platform) {
                    self.mark_booted(ctx.platform);
                    info!("{}::Checking for IPI ACKs: ACK/IDLE ACK", self.name);
                    BootState::Idle
                } else {
                    BootState::Wait
                }
            }
            BootState::Error => {
                error!(
                    "{}::\n\
                     *******************************************************************\n\
                     * WARNING: Boot Error - transitioning to IDLE                     *\n\
                     *******************************************************************",
                    self.name
                );
                BootState::Idle
            }
            BootState::Idle => {
                let platform = &mut *ctx.platform;
                let mut requested = false;
                let mut on_request = |req: &IpiRequest| {
                    info!("boot request from hart {}", req.source.name());
                    requested = true;
                    IpiStatus::Success
                };
                platform.ipi.consume_intent(
                    platform.msip,
                    HartId::E51,
                    self.target,
                    IpiMsgType::BootRequest,
                    Some(&mut on_request),
                );
                if requested {
                    BootState::Init
                } else {
                    BootState::Idle
                }
            }
        }
    }

    fn exit(&mut self, state: BootState, ctx: &mut BootContext<'p, 'b>) {
        if state == BootState::Download {
            if let Some(image) = ctx.image {
                self.start_payload(ctx.platform, &image);
            }
        }
    }
}

/// The four per-U54 boot machines and the image they share.
pub struct BootService<'a> {
    image: Option<BootImageView<'a>>,
    machines: [StateMachine<BootHart>; NUM_U54S],
    pmp_setup_done: [bool; NUM_PEERS],
}

impl Default for BootService<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> BootService<'a> {
    pub fn new() -> Self {
        let machines = HartId::U54S.map(|hart| {
            let mut sm = StateMachine::new(
                MACHINE_NAMES[hart.index() - 1],
                BootHart::new(hart),
                BootState::Idle,
            );
            sm.set_debug(true);
            sm
        });
        Self {
            image: None,
            machines,
            pmp_setup_done: [false; NUM_PEERS],
        }
    }

    pub fn register_image(&mut self, image: BootImageView<'a>) {
        self.image = Some(image);
    }

    pub fn image(&self) -> Option<&BootImageView<'a>> {
        self.image.as_ref()
    }

    pub fn state(&self, hart: HartId) -> Option<BootState> {
        let index = hart.index().checked_sub(1)?;
        self.machines.get(index).map(|m| m.state())
    }

    pub fn set_debug(&mut self, debug: bool) {
        for m in self.machines.iter_mut() {
            m.set_debug(debug);
        }
    }

    /// Restarts the boot flow on the targeted harts. A machine can only be
    /// restarted from Init, Idle or SetupPMPComplete; the result reflects the
    /// last machine visited.
    pub fn boot_harts(&mut self, target: HartTarget) -> bool {
        let mut result = false;
        for (i, m) in self.machines.iter_mut().enumerate() {
            if !target.includes(HartId::U54S[i]) {
                continue;
            }
            match m.state() {
                BootState::Init | BootState::Idle | BootState::SetupPmpComplete => {
                    m.set_state(BootState::Init);
                    result = true;
                }
                state => {
                    error!("invalid hart state {:?} for hart {}", state, i);
                    result = false;
                }
            }
        }
        result
    }

    pub fn restart_core(&mut self, target: HartTarget) -> IpiStatus {
        match target {
            HartTarget::One(hart) => info!("called for hart {}", hart.name()),
            HartTarget::AllU54s => info!("called for all harts"),
        }
        if self.boot_harts(target) {
            IpiStatus::Success
        } else {
            IpiStatus::Fail
        }
    }

    /// `BOOT_REQUEST` from a U54 asks for that hart to be booted again.
    pub fn boot_request_handler(&mut self, request: &IpiRequest) -> IpiStatus {
        self.restart_core(HartTarget::One(request.source))
    }

    /// `PMP_SETUP` as serviced on the U54 side. PMPs can only be programmed
    /// once per reset, so repeats are acknowledged without effect.
    pub fn pmp_setup_handler(&mut self, me: HartId) -> IpiStatus {
        let done = &mut self.pmp_setup_done[me.index()];
        if *done {
            info!("Hart{} PMPs already configured", me.index());
        } else {
            *done = true;
            info!("Hart{} setup complete", me.index());
        }
        IpiStatus::Success
    }

    /// Validates and registers a boot image, then restarts every U54.
    pub fn boot_init(&mut self, bytes: &'a [u8]) -> Result<(), HssError> {
        info!("Initializing Boot Image..");
        let image = BootImageView::parse(bytes).map_err(|err| {
            error!("Boot image rejected: {}", err);
            err
        })?;
        info!("Boot image set name: \"{}\"", image.header().set_name());
        self.register_image(image);
        info!("Boot Image registered...");
        match self.restart_core(HartTarget::AllU54s) {
            IpiStatus::Success => Ok(()),
            _ => Err(HssError::InvalidState),
        }
    }

    /// True when no machine is in the middle of booting its hart.
    pub fn is_quiescent(&self) -> bool {
        self.machines
            .iter()
            .all(|m| matches!(m.state(), BootState::Idle | BootState::Error))
    }
}

impl<'a, 'b> Runnable<Platform<'b>> for BootService<'a> {
    fn run(&mut self, env: &mut Platform<'b>, clock: &dyn hss_hal::Clock) {
        let mut ctx = BootContext {
            platform: env,
            image: self.image,
        };
        for m in self.machines.iter_mut() {
            m.run(&mut ctx, clock);
        }
    }

    fn report(&self, sink: &mut dyn FnMut(&MachineStats)) {
        for m in &self.machines {
            sink(&m.stats());
        }
    }
}
