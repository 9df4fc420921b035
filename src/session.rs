//! Shell-facing call surface.
//!
//! One [`Session`] per process. It owns the port watcher, the firmware
//! services and at most one open link; every other component is reached
//! through it. The graphical shell drives these calls and consumes the
//! ordered event stream returned by [`Session::new`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::detect::{self, DetectTimeouts, DetectedBoard};
use crate::error::{DetectionError, MissionError, RpcError, TransportError};
use crate::event::{Event, EventBus, EventReceiver, EventSender, DEFAULT_EVENT_CAPACITY};
use crate::firmware::{
    BoardSummary, FirmwareCache, FirmwareSource, FirmwareVersion, ManifestService, Vehicle,
    VersionGroup,
};
use crate::flash::{FlashAbort, FlashJob, FlashRunner, RealFlashEnv};
use crate::link::{
    DeliveryMode, Link, LinkConfig, ProtocolSet, StreamKind, TelemetryReceiver, TelemetryToken,
};
use crate::mavlink::messages::{CommandLongData, MavMessage};
use crate::mission::{MissionClient, RallyPoint};
use crate::modes::{ModeClient, ModeRange};
use crate::msp::{function, reboot_mode};
use crate::params::{Param, ParamClient};
use crate::transport::{self, PortInfo, PortWatcher, SerialTransport};
use crate::{error::FirmwareError, error::FlashError, mavlink::messages::MissionItemIntData};

/// How the station reboots a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootMode {
    Firmware,
    Bootloader,
}

struct Connection {
    link: Arc<Link>,
    params: Arc<ParamClient>,
    modes: Arc<ModeClient>,
    mission: Arc<MissionClient>,
}

pub struct Session {
    events: EventSender,
    watcher: PortWatcher,
    manifest: Arc<ManifestService>,
    cache: Arc<FirmwareCache>,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl Session {
    /// Build a session; the returned receiver is the shell's event stream.
    pub fn new(cache_root: impl Into<PathBuf>) -> (Self, EventReceiver) {
        let (events, receiver) = EventBus::channel(DEFAULT_EVENT_CAPACITY);
        let watcher = PortWatcher::spawn(transport::DEFAULT_POLL_PERIOD, events.clone());
        (
            Self {
                events,
                watcher,
                manifest: Arc::new(ManifestService::new()),
                cache: Arc::new(FirmwareCache::new(cache_root)),
                connection: Mutex::new(None),
            },
            receiver,
        )
    }

    pub fn list_ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        transport::enumerate()
    }

    /// Open `path` exclusively and start the link. `protocols` defaults to
    /// all decoders enabled (the detection FSM narrows it down).
    pub async fn connect(
        &self,
        path: &str,
        baud: u32,
        protocols: Option<ProtocolSet>,
    ) -> Result<Arc<Link>, TransportError> {
        let link = {
            let mut slot = self.connection.lock().unwrap();
            if slot.is_some() {
                return Err(TransportError::Busy);
            }
            let transport = SerialTransport::open(path, baud, transport::Parity::None)?;
            let config = LinkConfig {
                protocols: protocols.unwrap_or_else(ProtocolSet::all),
                ..Default::default()
            };
            let link = Arc::new(Link::open(
                Box::new(transport),
                config,
                self.events.clone(),
            ));
            let connection = Arc::new(Connection {
                params: Arc::new(ParamClient::new(Arc::clone(&link), self.events.clone())),
                modes: Arc::new(ModeClient::new(Arc::clone(&link))),
                mission: Arc::new(MissionClient::new(Arc::clone(&link), self.events.clone())),
                link: Arc::clone(&link),
            });
            *slot = Some(connection);
            link
        };
        self.watcher.set_active_port(Some(path.to_owned()));
        self.events
            .emit(Event::LinkConnected {
                path: path.to_owned(),
            })
            .await;
        // One disconnect notification per connection, whatever kills it.
        let mut dropped = link.disconnected();
        let events = self.events.clone();
        let watched_path = path.to_owned();
        tokio::spawn(async move {
            if dropped.changed().await.is_ok() {
                events
                    .emit(Event::LinkDisconnected { path: watched_path })
                    .await;
            }
        });
        Ok(link)
    }

    /// Close the link and invalidate the per-connection caches.
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().unwrap().take();
        self.watcher.set_active_port(None);
        if let Some(connection) = connection {
            connection.link.close().await;
        }
    }

    fn active(&self) -> Result<Arc<Connection>, RpcError> {
        self.connection
            .lock()
            .unwrap()
            .clone()
            .ok_or(RpcError::Disconnected)
    }

    /// Link of the active connection.
    pub fn link(&self) -> Option<Arc<Link>> {
        self.connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| Arc::clone(&c.link))
    }

    /// Detect the board behind `path`. Opens a throwaway all-protocols
    /// link when none is active.
    pub async fn detect_board(&self, path: &str) -> Result<DetectedBoard, DetectionError> {
        let ports = transport::enumerate()?;
        let port = ports
            .into_iter()
            .find(|p| p.path == path)
            .ok_or(TransportError::NotFound)?;
        let link = match self.link() {
            Some(link) => link,
            None => {
                let transport = SerialTransport::open(path, 115_200, transport::Parity::None)?;
                Arc::new(Link::open(
                    Box::new(transport),
                    LinkConfig::default(),
                    self.events.clone(),
                ))
            }
        };
        let result = detect::run(
            &link,
            &port,
            Some(self.watcher.subscribe()),
            DetectTimeouts::default(),
            &self.events,
        )
        .await;
        if self.link().is_none() {
            link.close().await;
        }
        result
    }

    pub async fn fetch_boards(
        &self,
        source: FirmwareSource,
        vehicle: Vehicle,
        query: Option<&str>,
    ) -> Result<Vec<BoardSummary>, FirmwareError> {
        self.manifest.fetch_boards(source, vehicle, query).await
    }

    pub async fn fetch_versions(
        &self,
        source: FirmwareSource,
        vehicle: Vehicle,
        board_id: &str,
    ) -> Result<Vec<VersionGroup>, FirmwareError> {
        self.manifest.fetch_versions(source, vehicle, board_id).await
    }

    /// Download into the content-addressed cache, returning the local
    /// path.
    pub async fn download_firmware(
        &self,
        version: &FirmwareVersion,
    ) -> Result<PathBuf, FirmwareError> {
        let source = version.source.as_str();
        if let Some(cached) = self
            .cache
            .lookup(source, &version.board, &version.version)
            .await?
        {
            return Ok(cached);
        }
        let bytes = self.manifest.download(version).await?;
        let extension = version
            .download_url
            .rsplit('.')
            .next()
            .unwrap_or("bin");
        self.cache
            .store(source, &version.board, &version.version, extension, &bytes)
            .await
    }

    /// Run a flash job to completion. The returned handle aborts it.
    pub fn flash(&self, job: FlashJob) -> (FlashAbort, tokio::task::JoinHandle<Result<(), FlashError>>) {
        let link = self.link();
        let runner = FlashRunner::new(
            job,
            RealFlashEnv,
            Arc::clone(&self.manifest),
            Arc::clone(&self.cache),
            self.events.clone(),
            link,
        );
        let abort = runner.abort_handle();
        // The link is consumed by the reboot step; drop our reference.
        self.connection.lock().unwrap().take();
        (abort, tokio::spawn(runner.run()))
    }

    pub async fn get_param(&self, id: &str) -> Result<Param, RpcError> {
        self.active()?.params.get(id).await
    }

    pub async fn set_param(&self, id: &str, value: f32, param_type: u8) -> Result<Param, RpcError> {
        self.active()?.params.set(id, value, param_type).await
    }

    pub async fn dump_params(&self) -> Result<Vec<Param>, RpcError> {
        self.active()?.params.dump().await
    }

    pub async fn download_mission(&self) -> Result<Vec<MissionItemIntData>, MissionError> {
        self.active()
            .map_err(MissionError::Rpc)?
            .mission
            .download(crate::mission::mission_type::MISSION)
            .await
    }

    pub async fn upload_mission(&self, items: &[MissionItemIntData]) -> Result<(), MissionError> {
        self.active()
            .map_err(MissionError::Rpc)?
            .mission
            .upload(items, crate::mission::mission_type::MISSION)
            .await
    }

    pub async fn clear_mission(&self) -> Result<(), MissionError> {
        self.active()
            .map_err(MissionError::Rpc)?
            .mission
            .clear(crate::mission::mission_type::MISSION)
            .await
    }

    pub async fn download_rally(&self) -> Result<Vec<RallyPoint>, MissionError> {
        self.active().map_err(MissionError::Rpc)?.mission.download_rally().await
    }

    pub async fn upload_rally(&self, points: &[RallyPoint]) -> Result<(), MissionError> {
        self.active()
            .map_err(MissionError::Rpc)?
            .mission
            .upload_rally(points)
            .await
    }

    pub async fn clear_rally(&self) -> Result<(), MissionError> {
        self.active().map_err(MissionError::Rpc)?.mission.clear_rally().await
    }

    pub async fn read_mode_ranges(&self) -> Result<Vec<ModeRange>, RpcError> {
        self.active()?.modes.read().await
    }

    pub async fn write_mode_range(&self, slot: u8, range: ModeRange) -> Result<bool, RpcError> {
        self.active()?.modes.write_slot(slot, range).await
    }

    pub async fn save_eeprom(&self) -> Result<(), RpcError> {
        self.active()?.modes.save_eeprom().await
    }

    /// Reboot the board, via whichever protocol the link speaks.
    pub async fn reboot(&self, mode: RebootMode) -> Result<(), RpcError> {
        let connection = self.active()?;
        let config = connection.link.config().clone();
        if config.protocols.msp {
            let payload = vec![match mode {
                RebootMode::Firmware => reboot_mode::FIRMWARE,
                RebootMode::Bootloader => reboot_mode::BOOTLOADER_ROM,
            }];
            // The port drops mid-reply; a timeout is expected.
            let _ = connection
                .link
                .call_msp(function::MSP_REBOOT, payload, Duration::from_millis(500))
                .await;
            Ok(())
        } else {
            connection
                .link
                .send_mavlink(MavMessage::CommandLong(CommandLongData {
                    param1: match mode {
                        RebootMode::Firmware => 1.0,
                        RebootMode::Bootloader => 3.0,
                    },
                    param2: 0.0,
                    param3: 0.0,
                    param4: 0.0,
                    param5: 0.0,
                    param6: 0.0,
                    param7: 0.0,
                    command: crate::mavlink::messages::cmd::PREFLIGHT_REBOOT_SHUTDOWN,
                    target_system: config.target_system,
                    target_component: config.target_component,
                    confirmation: 0,
                }))
                .await
        }
    }

    /// Subscribe to a telemetry stream at `rate_hz` (capped at 20 Hz).
    pub async fn subscribe_telemetry(
        &self,
        stream: StreamKind,
        rate_hz: f32,
        mode: DeliveryMode,
    ) -> Result<(TelemetryToken, TelemetryReceiver), RpcError> {
        let connection = self.active()?;
        let (token, receiver) = connection.link.subscribe(stream, mode);
        if stream == StreamKind::MspTelemetry {
            Link::start_msp_poller(&connection.link, rate_hz);
        } else {
            connection.link.request_mavlink_stream(rate_hz).await?;
        }
        Ok((token, receiver))
    }

    pub fn unsubscribe(&self, token: TelemetryToken) -> Result<(), RpcError> {
        self.active()?.link.unsubscribe(token);
        Ok(())
    }
}
