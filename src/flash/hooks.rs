//! Declarative post-flash steps.
//!
//! Some firmware/vehicle pairs need a fix-up after the board reboots into
//! its new firmware. The canonical case: iNav flashed onto a plane target
//! boots with the multirotor mixer, so the station reconnects over MSP and
//! sets `platformType` to AIRPLANE. Steps are data, not code, so other
//! pairs can add their own sequence without touching the flash machine.
//! The delay constants are empirical, not protocol-mandated; they are
//! parameters of the step list, not of the runner.

use std::sync::Arc;
use std::time::Duration;

use crate::detect::DetectedBoard;
use crate::error::FlashCause;
use crate::event::EventSender;
use crate::link::Link;
use crate::msp::{function, reboot_mode};

/// iNav `platformType` value for fixed wing.
pub const INAV_PLATFORM_AIRPLANE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostFlashStep {
    /// Let the board finish booting before touching the port.
    Settle(Duration),
    /// Try to open an MSP link, `attempts` times, `delay` apart.
    Reconnect { attempts: u32, delay: Duration },
    /// Read `MSP2_INAV_MIXER` and, when `platformType` differs, write it
    /// back with the wanted value. `inter_command_delay` spaces the MSP
    /// commands out for freshly-booted firmware.
    EnsureInavPlatformType {
        platform_type: u8,
        inter_command_delay: Duration,
    },
    SaveEeprom,
    Reboot,
}

/// The iNav-on-a-plane sequence with its empirical timing defaults.
pub fn inav_plane_hook() -> Vec<PostFlashStep> {
    vec![
        PostFlashStep::Settle(Duration::from_secs(6)),
        PostFlashStep::Reconnect {
            attempts: 3,
            delay: Duration::from_secs(3),
        },
        PostFlashStep::EnsureInavPlatformType {
            platform_type: INAV_PLATFORM_AIRPLANE,
            inter_command_delay: Duration::from_millis(500),
        },
        PostFlashStep::SaveEeprom,
        PostFlashStep::Reboot,
    ]
}

/// Execute the steps. Hook failures are logged, not fatal: the flash
/// itself already succeeded.
pub async fn run_hooks<E: super::FlashEnv>(
    steps: &[PostFlashStep],
    env: &mut E,
    board: &DetectedBoard,
    events: &EventSender,
) {
    let _ = events; // hooks report through the log only
    let mut link: Option<Arc<Link>> = None;
    for step in steps {
        let result = run_step(step, env, board, &mut link).await;
        if let Err(e) = result {
            log::warn!("post-flash step {step:?} failed: {e}");
            return;
        }
    }
    if let Some(link) = link {
        link.close().await;
    }
}

async fn run_step<E: super::FlashEnv>(
    step: &PostFlashStep,
    env: &mut E,
    board: &DetectedBoard,
    link: &mut Option<Arc<Link>>,
) -> Result<(), FlashCause> {
    match step {
        PostFlashStep::Settle(delay) => {
            tokio::time::sleep(*delay).await;
            Ok(())
        }
        PostFlashStep::Reconnect { attempts, delay } => {
            let mut last = FlashCause::ReenumerationTimeout;
            for attempt in 0..*attempts {
                match env.open_msp_link(board).await {
                    Ok(opened) => {
                        *link = Some(opened);
                        return Ok(());
                    }
                    Err(e) => {
                        log::debug!("post-flash reconnect attempt {} failed", attempt + 1);
                        last = e;
                    }
                }
                tokio::time::sleep(*delay).await;
            }
            Err(last)
        }
        PostFlashStep::EnsureInavPlatformType {
            platform_type,
            inter_command_delay,
        } => {
            let link = link.as_ref().ok_or(FlashCause::ReenumerationTimeout)?;
            let mixer = link
                .call_msp(function::MSP2_INAV_MIXER, Vec::new(), Duration::from_secs(1))
                .await
                .map_err(FlashCause::Rpc)?;
            // payload: motorDirectionInverted, 0, platformType, hasFlaps,
            // appliedMixerPreset(le16), ...
            if mixer.payload.get(2) == Some(platform_type) {
                return Ok(());
            }
            let mut payload = mixer.payload.clone();
            if payload.len() < 3 {
                payload.resize(3, 0);
            }
            payload[2] = *platform_type;
            tokio::time::sleep(*inter_command_delay).await;
            link.call_msp(function::MSP2_INAV_SET_MIXER, payload, Duration::from_secs(1))
                .await
                .map_err(FlashCause::Rpc)?;
            tokio::time::sleep(*inter_command_delay).await;
            Ok(())
        }
        PostFlashStep::SaveEeprom => {
            let link = link.as_ref().ok_or(FlashCause::ReenumerationTimeout)?;
            link.call_msp(function::MSP_EEPROM_WRITE, Vec::new(), Duration::from_secs(2))
                .await
                .map_err(FlashCause::Rpc)?;
            Ok(())
        }
        PostFlashStep::Reboot => {
            let link = link.as_ref().ok_or(FlashCause::ReenumerationTimeout)?;
            // Fire and forget; the board drops the port mid-reply.
            let _ = link
                .call_msp(
                    function::MSP_REBOOT,
                    vec![reboot_mode::FIRMWARE],
                    Duration::from_millis(500),
                )
                .await;
            Ok(())
        }
    }
}
