//! Firmware flashing.
//!
//! ```text
//! Idle → Downloading → Verifying → EnteringBootloader → Erasing
//!      → Programming → VerifyingFlash → Rebooting → Complete
//!                                     ↘ any stage → Error
//! ```
//!
//! The state machine is a pure `step(event) -> actions` function over an
//! explicit stage enum; [`FlashRunner`] interprets the actions against a
//! [`FlashEnv`], which is how tests drive the whole sequence over a
//! loopback transport. Timeouts, NAK exhaustion and CRC failures are fatal
//! for the flash; transport loss between bootloader entry and programming
//! is expected (USB renumeration) within a bounded window.

pub mod avrdude;
pub mod dfu;
pub mod hooks;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::detect::{DetectedBoard, Flasher};
use crate::error::{FirmwareError, FlashCause, FlashError};
use crate::event::{Event, EventSender};
use crate::firmware::image::{self, FirmwareImage};
use crate::firmware::{FirmwareCache, FirmwareVersion, ManifestService};
use crate::link::Link;
use crate::mavlink::messages::{self, CommandLongData, MavMessage};
use crate::msp::{function, reboot_mode};
use crate::stboot::{self, BootloaderClient, BootloaderError, CHUNK};
use crate::transport::Transport;

pub use hooks::PostFlashStep;

/// Renumeration window after a reboot-to-bootloader command.
pub const REENUMERATION_WAIT: Duration = Duration::from_secs(10);
/// Settle delay between the reboot command and the first reopen attempt.
pub const REBOOT_SETTLE: Duration = Duration::from_secs(2);
/// WRITE_MEMORY retry budget per chunk.
pub const WRITE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStage {
    Idle,
    Downloading,
    Verifying,
    EnteringBootloader,
    Erasing,
    Programming,
    VerifyingFlash,
    Rebooting,
    Complete,
    Aborting,
    Error,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlashOptions {
    /// Skip the protocol reboot command; the board is already in (or will
    /// be put into) its bootloader by the operator.
    pub no_reboot_sequence: bool,
    pub full_chip_erase: bool,
    pub verify_after_write: bool,
    /// Operator override for the image/board id cross-check.
    pub ignore_board_mismatch: bool,
}

/// What to flash: a catalogue version (download first) or a local file.
#[derive(Debug, Clone)]
pub enum FirmwareRef {
    Release(FirmwareVersion),
    LocalFile(PathBuf),
}

#[derive(Clone)]
pub struct FlashJob {
    pub board: DetectedBoard,
    pub reference: FirmwareRef,
    pub options: FlashOptions,
    /// Declarative steps run after a successful flash (e.g. the iNav plane
    /// mixer fix-up). Empty for most jobs.
    pub post_flash: Vec<PostFlashStep>,
}

/// Machine inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashEvent {
    Start,
    Downloaded,
    Verified,
    BootloaderReady,
    Erased,
    Programmed,
    FlashVerified,
    Rebooted,
    Failed,
    Abort,
}

/// Machine outputs, interpreted by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashAction {
    Download,
    Verify,
    EnterBootloader,
    Erase,
    Program,
    VerifyFlash,
    Reboot,
    Finish,
    Fail,
    SafeExit,
}

/// Pure flash state machine.
pub struct FlashFsm {
    stage: FlashStage,
    verify_after_write: bool,
}

impl FlashFsm {
    pub fn new(verify_after_write: bool) -> Self {
        Self {
            stage: FlashStage::Idle,
            verify_after_write,
        }
    }

    pub fn stage(&self) -> FlashStage {
        self.stage
    }

    pub fn step(&mut self, event: FlashEvent) -> Vec<FlashAction> {
        use FlashAction as A;
        use FlashEvent as E;
        use FlashStage as S;
        match (self.stage, event) {
            (_, E::Failed) => {
                self.stage = S::Error;
                vec![A::Fail]
            }
            (_, E::Abort) => {
                self.stage = S::Aborting;
                vec![A::SafeExit]
            }
            (S::Idle, E::Start) => {
                self.stage = S::Downloading;
                vec![A::Download]
            }
            (S::Downloading, E::Downloaded) => {
                self.stage = S::Verifying;
                vec![A::Verify]
            }
            (S::Verifying, E::Verified) => {
                self.stage = S::EnteringBootloader;
                vec![A::EnterBootloader]
            }
            (S::EnteringBootloader, E::BootloaderReady) => {
                self.stage = S::Erasing;
                vec![A::Erase]
            }
            (S::Erasing, E::Erased) => {
                self.stage = S::Programming;
                vec![A::Program]
            }
            (S::Programming, E::Programmed) if self.verify_after_write => {
                self.stage = S::VerifyingFlash;
                vec![A::VerifyFlash]
            }
            (S::Programming, E::Programmed) => {
                self.stage = S::Rebooting;
                vec![A::Reboot]
            }
            (S::VerifyingFlash, E::FlashVerified) => {
                self.stage = S::Rebooting;
                vec![A::Reboot]
            }
            (S::Rebooting, E::Rebooted) => {
                self.stage = S::Complete;
                vec![A::Finish]
            }
            (stage, event) => {
                log::warn!("flash fsm ignoring {event:?} in {stage:?}");
                vec![]
            }
        }
    }
}

/// Platform access the runner needs; tests substitute a scripted one.
#[async_trait]
pub trait FlashEnv: Send {
    /// Wait for the board to (re)appear and open its bootloader-mode
    /// serial transport (even parity).
    async fn open_bootloader_port(
        &mut self,
        board: &DetectedBoard,
        wait: Duration,
    ) -> Result<Box<dyn Transport>, FlashCause>;

    /// Run the whole DFU erase/program/manifest sequence for native-USB
    /// boards.
    async fn run_dfu(
        &mut self,
        image: &FirmwareImage,
        options: &FlashOptions,
        events: &EventSender,
    ) -> Result<(), FlashCause>;

    /// Delegate to the external `avrdude` tool (it verifies on its own).
    async fn run_avrdude(
        &mut self,
        file: &Path,
        board: &DetectedBoard,
    ) -> Result<(), FlashCause>;

    /// Reopen a normal MSP link to the application firmware, for post-flash
    /// hooks.
    async fn open_msp_link(&mut self, board: &DetectedBoard) -> Result<Arc<Link>, FlashCause>;
}

/// The production [`FlashEnv`].
pub struct RealFlashEnv;

#[async_trait]
impl FlashEnv for RealFlashEnv {
    async fn open_bootloader_port(
        &mut self,
        board: &DetectedBoard,
        wait: Duration,
    ) -> Result<Box<dyn Transport>, FlashCause> {
        let deadline = tokio::time::Instant::now() + wait;
        let wanted = board.port.clone();
        loop {
            if let Ok(ports) = crate::transport::enumerate() {
                let hit = ports.iter().find(|p| match &wanted {
                    Some(path) => &p.path == path,
                    None => false,
                });
                if let Some(port) = hit {
                    match crate::transport::SerialTransport::open(
                        &port.path,
                        115_200,
                        crate::transport::Parity::Even,
                    ) {
                        Ok(mut transport) => {
                            // Classic bridge wiring: RTS drives BOOT0, DTR
                            // pulses NRST.
                            if board.flasher == Flasher::Serial {
                                let _ = transport.set_dtr_rts(true, true);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                let _ = transport.set_dtr_rts(false, true);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                            return Ok(Box::new(transport));
                        }
                        Err(e) => log::debug!("bootloader port not ready yet: {e}"),
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FlashCause::ReenumerationTimeout);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn run_dfu(
        &mut self,
        image: &FirmwareImage,
        options: &FlashOptions,
        events: &EventSender,
    ) -> Result<(), FlashCause> {
        dfu::flash(image, options, events).await
    }

    async fn run_avrdude(
        &mut self,
        file: &Path,
        board: &DetectedBoard,
    ) -> Result<(), FlashCause> {
        avrdude::flash(file, board).await
    }

    async fn open_msp_link(&mut self, board: &DetectedBoard) -> Result<Arc<Link>, FlashCause> {
        let path = board
            .port
            .clone()
            .ok_or(FlashCause::ReenumerationTimeout)?;
        let transport =
            crate::transport::SerialTransport::open(&path, 115_200, crate::transport::Parity::None)
                .map_err(FlashCause::Transport)?;
        Ok(Arc::new(Link::open(
            Box::new(transport),
            crate::link::LinkConfig {
                protocols: crate::link::ProtocolSet::msp_only(),
                ..Default::default()
            },
            EventSender::sink(),
        )))
    }
}

/// Abort handle handed to the shell.
#[derive(Clone)]
pub struct FlashAbort {
    tx: watch::Sender<bool>,
}

impl FlashAbort {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Drives one [`FlashJob`] to completion.
pub struct FlashRunner<E: FlashEnv> {
    job: FlashJob,
    env: E,
    manifest: Arc<ManifestService>,
    cache: Arc<FirmwareCache>,
    events: EventSender,
    /// Live link to the application firmware, used for the reboot command
    /// then dropped.
    link: Option<Arc<Link>>,
    abort_rx: watch::Receiver<bool>,
    abort_tx: watch::Sender<bool>,
}

impl<E: FlashEnv> FlashRunner<E> {
    pub fn new(
        job: FlashJob,
        env: E,
        manifest: Arc<ManifestService>,
        cache: Arc<FirmwareCache>,
        events: EventSender,
        link: Option<Arc<Link>>,
    ) -> Self {
        let (abort_tx, abort_rx) = watch::channel(false);
        Self {
            job,
            env,
            manifest,
            cache,
            events,
            link,
            abort_rx,
            abort_tx,
        }
    }

    pub fn abort_handle(&self) -> FlashAbort {
        FlashAbort {
            tx: self.abort_tx.clone(),
        }
    }

    fn aborted(&self) -> bool {
        *self.abort_rx.borrow()
    }

    pub async fn run(mut self) -> Result<(), FlashError> {
        let mut fsm = FlashFsm::new(self.job.options.verify_after_write);
        let mut actions = fsm.step(FlashEvent::Start);
        let mut file: Option<PathBuf> = None;
        let mut image: Option<FirmwareImage> = None;
        let mut bootloader: Option<BootloaderClient<Box<dyn Transport>>> = None;
        let mut failure: Option<FlashCause> = None;
        // The stage an error occurred in, for the FlashError report; by the
        // time Fail runs the machine has already moved to Error.
        let mut failed_stage = FlashStage::Idle;

        while let Some(action) = actions.first().copied() {
            actions.remove(0);
            let stage = fsm.stage();
            self.events.emit(Event::FlashStage { stage }).await;
            if self.aborted() && !matches!(action, FlashAction::SafeExit | FlashAction::Fail) {
                failed_stage = stage;
                actions = fsm.step(FlashEvent::Abort);
                continue;
            }
            let event = match action {
                FlashAction::Download => match self.download().await {
                    Ok(path) => {
                        file = Some(path);
                        FlashEvent::Downloaded
                    }
                    Err(cause) => {
                        failure = Some(cause);
                        FlashEvent::Failed
                    }
                },
                FlashAction::Verify => {
                    let path = file.as_deref().expect("download ran first");
                    match self.verify(path) {
                        Ok(parsed) => {
                            image = Some(parsed);
                            FlashEvent::Verified
                        }
                        Err(cause) => {
                            failure = Some(cause);
                            FlashEvent::Failed
                        }
                    }
                }
                FlashAction::EnterBootloader => match self.enter_bootloader().await {
                    Ok(client) => {
                        bootloader = client;
                        FlashEvent::BootloaderReady
                    }
                    Err(cause) => {
                        failure = Some(cause);
                        FlashEvent::Failed
                    }
                },
                FlashAction::Erase => {
                    let image = image.as_ref().expect("verify ran first");
                    match self.erase(bootloader.as_mut(), image).await {
                        Ok(()) => FlashEvent::Erased,
                        Err(cause) => {
                            failure = Some(cause);
                            FlashEvent::Failed
                        }
                    }
                }
                FlashAction::Program => {
                    let image = image.as_ref().expect("verify ran first");
                    let file = file.as_deref().expect("download ran first");
                    match self.program(bootloader.as_mut(), image, file).await {
                        Ok(()) => FlashEvent::Programmed,
                        Err(cause) => {
                            failure = Some(cause);
                            FlashEvent::Failed
                        }
                    }
                }
                FlashAction::VerifyFlash => {
                    let image = image.as_ref().expect("verify ran first");
                    match self.verify_flash(bootloader.as_mut(), image).await {
                        Ok(()) => FlashEvent::FlashVerified,
                        Err(cause) => {
                            failure = Some(cause);
                            FlashEvent::Failed
                        }
                    }
                }
                FlashAction::Reboot => match self.reboot(bootloader.as_mut(), image.as_ref()).await
                {
                    Ok(()) => FlashEvent::Rebooted,
                    Err(cause) => {
                        failure = Some(cause);
                        FlashEvent::Failed
                    }
                },
                FlashAction::Finish => {
                    self.events.emit(Event::FlashComplete).await;
                    if !self.job.post_flash.is_empty() {
                        let steps = self.job.post_flash.clone();
                        hooks::run_hooks(&steps, &mut self.env, &self.job.board, &self.events)
                            .await;
                    }
                    return Ok(());
                }
                FlashAction::SafeExit => {
                    // Best-effort: leave the MCU running its application.
                    if let Some(client) = bootloader.as_mut() {
                        let base = image
                            .as_ref()
                            .and_then(FirmwareImage::base_address)
                            .unwrap_or(stboot::FLASH_BASE);
                        let _ = client.go(base).await;
                    }
                    failure = Some(FlashCause::Aborted);
                    FlashEvent::Failed
                }
                FlashAction::Fail => {
                    let cause = failure.take().unwrap_or(FlashCause::Aborted);
                    self.events
                        .emit(Event::FlashFailed {
                            stage: failed_stage,
                            cause: cause.to_string(),
                        })
                        .await;
                    return Err(FlashError {
                        stage: failed_stage,
                        cause,
                    });
                }
            };
            if event == FlashEvent::Failed {
                failed_stage = stage;
            }
            if actions.is_empty() {
                actions = fsm.step(event);
            }
        }
        Ok(())
    }

    async fn download(&mut self) -> Result<PathBuf, FlashCause> {
        match &self.job.reference {
            FirmwareRef::LocalFile(path) => {
                if !path.exists() {
                    return Err(FlashCause::Firmware(FirmwareError::Io(
                        std::io::ErrorKind::NotFound.into(),
                    )));
                }
                Ok(path.clone())
            }
            FirmwareRef::Release(version) => {
                let source = version.source.as_str();
                if let Some(cached) = self
                    .cache
                    .lookup(source, &version.board, &version.version)
                    .await
                    .map_err(FlashCause::Firmware)?
                {
                    log::info!("firmware cache hit: {}", cached.display());
                    self.events
                        .emit(Event::FlashProgress {
                            stage: FlashStage::Downloading,
                            done: 1,
                            total: 1,
                        })
                        .await;
                    return Ok(cached);
                }
                let bytes = self
                    .download_streaming(version)
                    .await
                    .map_err(FlashCause::Firmware)?;
                let stored = self
                    .cache
                    .store(
                        source,
                        &version.board,
                        &version.version,
                        extension_of(&version.download_url),
                        &bytes,
                    )
                    .await
                    .map_err(FlashCause::Firmware)?;
                Ok(stored)
            }
        }
    }

    async fn download_streaming(
        &self,
        version: &FirmwareVersion,
    ) -> Result<Vec<u8>, FirmwareError> {
        let mut response = self
            .manifest
            .http()
            .get(&version.download_url)
            .send()
            .await
            .map_err(|e| FirmwareError::ManifestUnreachable {
                origin: version.source.as_str(),
                reason: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| FirmwareError::ManifestUnreachable {
                origin: version.source.as_str(),
                reason: e.to_string(),
            })?;
        let total = version
            .file_size
            .or_else(|| response.content_length())
            .unwrap_or(0);
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FirmwareError::ManifestUnreachable {
                origin: version.source.as_str(),
                reason: e.to_string(),
            })?
        {
            bytes.extend_from_slice(&chunk);
            self.events
                .emit(Event::FlashProgress {
                    stage: FlashStage::Downloading,
                    done: bytes.len() as u64,
                    total,
                })
                .await;
        }
        if let Some(expected) = version.file_size {
            if expected != bytes.len() as u64 {
                return Err(FirmwareError::BadImageFormat(format!(
                    "downloaded {} bytes, manifest said {expected}",
                    bytes.len()
                )));
            }
        }
        Ok(bytes)
    }

    fn verify(&self, path: &Path) -> Result<FirmwareImage, FlashCause> {
        let image = image::parse_file(path).map_err(FlashCause::Firmware)?;
        if let (Some(image_id), Some(board_id), false) = (
            image.board_id,
            self.job.board.board_id,
            self.job.options.ignore_board_mismatch,
        ) {
            if image_id != board_id {
                return Err(FlashCause::Firmware(FirmwareError::IncompatibleImage {
                    expected: board_id,
                    image: image_id,
                }));
            }
        }
        Ok(image)
    }

    /// Returns the bootloader client for serial-path boards; DFU and AVR
    /// boards are handled wholesale inside their backends later.
    async fn enter_bootloader(
        &mut self,
    ) -> Result<Option<BootloaderClient<Box<dyn Transport>>>, FlashCause> {
        let board = self.job.board.clone();

        if !board.in_bootloader && !self.job.options.no_reboot_sequence {
            self.send_reboot_command().await;
        }
        // From here on the link must stay silent; the port is about to
        // renumerate.
        if let Some(link) = self.link.take() {
            link.close().await;
        }

        match board.flasher {
            Flasher::Dfu | Flasher::Avrdude => Ok(None),
            Flasher::Serial | Flasher::Ardupilot => {
                if !board.in_bootloader {
                    tokio::time::sleep(REBOOT_SETTLE).await;
                }
                let transport = match self
                    .env
                    .open_bootloader_port(&board, REENUMERATION_WAIT)
                    .await
                {
                    Ok(t) => t,
                    Err(cause) => {
                        if board.flasher == Flasher::Serial {
                            self.events
                                .emit(Event::RequireManualBootPads {
                                    board: board.name.clone(),
                                })
                                .await;
                        }
                        return Err(cause);
                    }
                };
                let mut client = BootloaderClient::new(transport);
                match client.sync().await {
                    Ok(()) => Ok(Some(client)),
                    Err(e) => {
                        // A serial-bridge board that never ACKs needs its
                        // BOOT pads bridged by hand; that is a recovery
                        // path, not a failure message.
                        if board.flasher == Flasher::Serial
                            && matches!(e, BootloaderError::Timeout { .. })
                        {
                            self.events
                                .emit(Event::RequireManualBootPads {
                                    board: board.name.clone(),
                                })
                                .await;
                        }
                        Err(FlashCause::Bootloader(e))
                    }
                }
            }
        }
    }

    /// Protocol-specific reboot-to-bootloader request, best effort.
    async fn send_reboot_command(&self) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        let config = link.config().clone();
        if config.protocols.mavlink {
            let _ = link
                .send_mavlink(MavMessage::CommandLong(CommandLongData {
                    param1: 3.0, // keep main CPU, reboot to bootloader
                    param2: 0.0,
                    param3: 0.0,
                    param4: 0.0,
                    param5: 0.0,
                    param6: 0.0,
                    param7: 0.0,
                    command: messages::cmd::PREFLIGHT_REBOOT_SHUTDOWN,
                    target_system: config.target_system,
                    target_component: config.target_component,
                    confirmation: 0,
                }))
                .await;
        } else if config.protocols.msp {
            let _ = link
                .call_msp(
                    function::MSP_REBOOT,
                    vec![reboot_mode::BOOTLOADER_ROM],
                    Duration::from_millis(500),
                )
                .await;
        }
    }

    async fn erase(
        &mut self,
        bootloader: Option<&mut BootloaderClient<Box<dyn Transport>>>,
        image: &FirmwareImage,
    ) -> Result<(), FlashCause> {
        match self.job.board.flasher {
            Flasher::Dfu => {
                // The DFU backend fuses erase/program/verify into one pass.
                Ok(())
            }
            Flasher::Avrdude => Ok(()),
            Flasher::Serial | Flasher::Ardupilot => {
                let client = bootloader.expect("serial path has a bootloader client");
                let pages = if self.job.options.full_chip_erase {
                    None
                } else {
                    self.job
                        .board
                        .chip_id
                        .and_then(stboot::chip_family)
                        .map(|family| {
                            let mut pages = Vec::new();
                            for segment in &image.segments {
                                pages.extend(
                                    family
                                        .layout
                                        .sectors_for_range(segment.address, segment.data.len() as u32),
                                );
                            }
                            pages.sort_unstable();
                            pages.dedup();
                            pages
                        })
                };
                client.erase(pages.as_deref()).await?;
                Ok(())
            }
        }
    }

    async fn program(
        &mut self,
        bootloader: Option<&mut BootloaderClient<Box<dyn Transport>>>,
        image: &FirmwareImage,
        file: &Path,
    ) -> Result<(), FlashCause> {
        match self.job.board.flasher {
            Flasher::Dfu => {
                self.env
                    .run_dfu(image, &self.job.options, &self.events)
                    .await
            }
            Flasher::Avrdude => self.env.run_avrdude(file, &self.job.board).await,
            Flasher::Serial | Flasher::Ardupilot => {
                let client = bootloader.expect("serial path has a bootloader client");
                let total = image.total_len() as u64;
                let mut done: u64 = 0;
                for segment in &image.segments {
                    // Addresses within a region only ever move forward.
                    let mut address = segment.address;
                    for chunk in segment.data.chunks(CHUNK) {
                        if self.aborted() {
                            return Err(FlashCause::Aborted);
                        }
                        write_chunk_with_retry(client, address, chunk).await?;
                        address += chunk.len() as u32;
                        done += chunk.len() as u64;
                        self.events
                            .emit(Event::FlashProgress {
                                stage: FlashStage::Programming,
                                done,
                                total,
                            })
                            .await;
                    }
                }
                Ok(())
            }
        }
    }

    async fn verify_flash(
        &mut self,
        bootloader: Option<&mut BootloaderClient<Box<dyn Transport>>>,
        image: &FirmwareImage,
    ) -> Result<(), FlashCause> {
        match self.job.board.flasher {
            // avrdude verifies on its own; DFU manifest-phase checksums.
            Flasher::Dfu | Flasher::Avrdude => Ok(()),
            Flasher::Serial | Flasher::Ardupilot => {
                let client = bootloader.expect("serial path has a bootloader client");
                let total = image.total_len() as u64;
                let mut done: u64 = 0;
                for segment in &image.segments {
                    let mut address = segment.address;
                    for chunk in segment.data.chunks(CHUNK) {
                        let read = client.read_memory(address, chunk.len()).await?;
                        if read != chunk {
                            return Err(FlashCause::VerifyMismatch { address });
                        }
                        address += chunk.len() as u32;
                        done += chunk.len() as u64;
                        self.events
                            .emit(Event::FlashProgress {
                                stage: FlashStage::VerifyingFlash,
                                done,
                                total,
                            })
                            .await;
                    }
                }
                Ok(())
            }
        }
    }

    async fn reboot(
        &mut self,
        bootloader: Option<&mut BootloaderClient<Box<dyn Transport>>>,
        image: Option<&FirmwareImage>,
    ) -> Result<(), FlashCause> {
        match self.job.board.flasher {
            Flasher::Dfu | Flasher::Avrdude => Ok(()),
            Flasher::Serial | Flasher::Ardupilot => {
                let client = bootloader.expect("serial path has a bootloader client");
                let base = image
                    .and_then(FirmwareImage::base_address)
                    .unwrap_or(stboot::FLASH_BASE);
                client.go(base).await?;
                Ok(())
            }
        }
    }
}

async fn write_chunk_with_retry(
    client: &mut BootloaderClient<Box<dyn Transport>>,
    address: u32,
    chunk: &[u8],
) -> Result<(), FlashCause> {
    let mut last: Option<BootloaderError> = None;
    for attempt in 0..WRITE_RETRIES {
        match client.write_memory(address, chunk).await {
            Ok(()) => return Ok(()),
            Err(e @ BootloaderError::Nak { .. }) => {
                log::warn!("WRITE_MEMORY NAK at {address:#010x}, attempt {}", attempt + 1);
                last = Some(e);
            }
            Err(e) => return Err(FlashCause::Bootloader(e)),
        }
    }
    Err(FlashCause::Bootloader(last.expect("retried at least once")))
}

fn extension_of(url: &str) -> &str {
    url.rsplit('.').next().unwrap_or("bin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_traverses_every_stage() {
        let mut fsm = FlashFsm::new(true);
        assert_eq!(fsm.step(FlashEvent::Start), vec![FlashAction::Download]);
        assert_eq!(fsm.step(FlashEvent::Downloaded), vec![FlashAction::Verify]);
        assert_eq!(
            fsm.step(FlashEvent::Verified),
            vec![FlashAction::EnterBootloader]
        );
        assert_eq!(
            fsm.step(FlashEvent::BootloaderReady),
            vec![FlashAction::Erase]
        );
        assert_eq!(fsm.step(FlashEvent::Erased), vec![FlashAction::Program]);
        assert_eq!(
            fsm.step(FlashEvent::Programmed),
            vec![FlashAction::VerifyFlash]
        );
        assert_eq!(
            fsm.step(FlashEvent::FlashVerified),
            vec![FlashAction::Reboot]
        );
        assert_eq!(fsm.step(FlashEvent::Rebooted), vec![FlashAction::Finish]);
        assert_eq!(fsm.stage(), FlashStage::Complete);
    }

    #[test]
    fn verify_skipped_without_option() {
        let mut fsm = FlashFsm::new(false);
        fsm.step(FlashEvent::Start);
        fsm.step(FlashEvent::Downloaded);
        fsm.step(FlashEvent::Verified);
        fsm.step(FlashEvent::BootloaderReady);
        fsm.step(FlashEvent::Erased);
        assert_eq!(fsm.step(FlashEvent::Programmed), vec![FlashAction::Reboot]);
    }

    #[test]
    fn failure_is_terminal_from_any_stage() {
        let mut fsm = FlashFsm::new(false);
        fsm.step(FlashEvent::Start);
        assert_eq!(fsm.step(FlashEvent::Failed), vec![FlashAction::Fail]);
        assert_eq!(fsm.stage(), FlashStage::Error);
    }

    #[test]
    fn abort_runs_safe_exit() {
        let mut fsm = FlashFsm::new(false);
        fsm.step(FlashEvent::Start);
        fsm.step(FlashEvent::Downloaded);
        assert_eq!(fsm.step(FlashEvent::Abort), vec![FlashAction::SafeExit]);
        assert_eq!(fsm.stage(), FlashStage::Aborting);
    }
}
