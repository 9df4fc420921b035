//! DFU 1.1 / DfuSe backend for native-USB STM32 targets.
//!
//! STM32 ROMs in DFU mode enumerate as `0483:df11` with the DfuSe
//! extensions: vendor commands ride `DFU_DNLOAD` block 0 (`0x41` erase,
//! `0x21` set address pointer) and firmware data rides blocks ≥ 2. Every
//! download is followed by `DFU_GETSTATUS` polling until the device leaves
//! the busy state. `rusb` is blocking, so the whole sequence runs on a
//! blocking thread with progress reported back over a channel.

use std::time::Duration;

use rusb::{Device, DeviceHandle, GlobalContext};
use tokio::sync::mpsc;

use super::{FlashOptions, FlashStage};
use crate::error::FlashCause;
use crate::event::{Event, EventSender};
use crate::firmware::image::FirmwareImage;

pub const DFU_VID: u16 = 0x0483;
pub const DFU_PID: u16 = 0xDF11;

const REQ_DNLOAD: u8 = 1;
const REQ_GETSTATUS: u8 = 3;
const REQ_CLRSTATUS: u8 = 4;

const CMD_SET_ADDRESS: u8 = 0x21;
const CMD_ERASE: u8 = 0x41;

// bState values from the DFU 1.1 spec.
const STATE_DFU_DNBUSY: u8 = 4;
const STATE_DFU_DNLOAD_IDLE: u8 = 5;
const STATE_DFU_MANIFEST: u8 = 7;
const STATE_DFU_ERROR: u8 = 10;

const TRANSFER_SIZE: usize = 2048;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Flash `image` over DFU. Progress is emitted as `Programming` events.
pub async fn flash(
    image: &FirmwareImage,
    options: &FlashOptions,
    events: &EventSender,
) -> Result<(), FlashCause> {
    let image = image.clone();
    let options = *options;
    let (progress_tx, mut progress_rx) = mpsc::channel::<(u64, u64)>(16);

    let worker = tokio::task::spawn_blocking(move || flash_blocking(&image, &options, progress_tx));

    while let Some((done, total)) = progress_rx.recv().await {
        events
            .emit(Event::FlashProgress {
                stage: FlashStage::Programming,
                done,
                total,
            })
            .await;
    }

    worker
        .await
        .map_err(|e| FlashCause::Usb(format!("dfu worker panicked: {e}")))?
}

fn flash_blocking(
    image: &FirmwareImage,
    options: &FlashOptions,
    progress: mpsc::Sender<(u64, u64)>,
) -> Result<(), FlashCause> {
    let device = find_device()?;
    let mut handle = device.open().map_err(usb)?;
    let _ = handle.set_auto_detach_kernel_driver(true);
    handle.claim_interface(0).map_err(usb)?;
    clear_status(&handle)?;

    let total: u64 = image.segments.iter().map(|s| s.data.len() as u64).sum();
    let mut done: u64 = 0;

    for segment in &image.segments {
        if options.full_chip_erase {
            // DfuSe mass erase: the erase command with no address.
            dnload(&handle, 0, &[CMD_ERASE])?;
            wait_idle(&handle)?;
        } else {
            // Page-by-page erase of the range this segment covers.
            let mut addr = segment.address;
            let end = segment.address + segment.data.len() as u32;
            while addr < end {
                let mut cmd = vec![CMD_ERASE];
                cmd.extend_from_slice(&addr.to_le_bytes());
                dnload(&handle, 0, &cmd)?;
                wait_idle(&handle)?;
                addr = addr.saturating_add(TRANSFER_SIZE as u32);
            }
        }

        let mut cmd = vec![CMD_SET_ADDRESS];
        cmd.extend_from_slice(&segment.address.to_le_bytes());
        dnload(&handle, 0, &cmd)?;
        wait_idle(&handle)?;

        for (index, chunk) in segment.data.chunks(TRANSFER_SIZE).enumerate() {
            // Data blocks start at wValue 2; block N lands at
            // address + (N - 2) * transfer_size.
            dnload(&handle, (index + 2) as u16, chunk)?;
            wait_idle(&handle)?;
            done += chunk.len() as u64;
            let _ = progress.blocking_send((done, total));
        }
    }

    // Zero-length download enters the manifest phase and boots the image.
    dnload(&handle, 0, &[])?;
    let _ = wait_manifest(&handle);
    Ok(())
}

fn find_device() -> Result<Device<GlobalContext>, FlashCause> {
    let devices = rusb::devices().map_err(usb)?;
    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() == DFU_VID && descriptor.product_id() == DFU_PID {
            return Ok(device);
        }
    }
    Err(FlashCause::Usb("no DFU device (0483:df11) present".into()))
}

fn usb(e: rusb::Error) -> FlashCause {
    FlashCause::Usb(e.to_string())
}

fn dnload(handle: &DeviceHandle<GlobalContext>, block: u16, data: &[u8]) -> Result<(), FlashCause> {
    // bmRequestType: host-to-device | class | interface
    handle
        .write_control(0x21, REQ_DNLOAD, block, 0, data, IO_TIMEOUT)
        .map_err(usb)?;
    Ok(())
}

struct DfuStatus {
    state: u8,
    poll_timeout_ms: u32,
}

fn get_status(handle: &DeviceHandle<GlobalContext>) -> Result<DfuStatus, FlashCause> {
    let mut buf = [0u8; 6];
    handle
        .read_control(0xA1, REQ_GETSTATUS, 0, 0, &mut buf, IO_TIMEOUT)
        .map_err(usb)?;
    Ok(DfuStatus {
        state: buf[4],
        poll_timeout_ms: u32::from_le_bytes([buf[1], buf[2], buf[3], 0]),
    })
}

fn clear_status(handle: &DeviceHandle<GlobalContext>) -> Result<(), FlashCause> {
    let status = get_status(handle)?;
    if status.state == STATE_DFU_ERROR {
        handle
            .write_control(0x21, REQ_CLRSTATUS, 0, 0, &[], IO_TIMEOUT)
            .map_err(usb)?;
    }
    Ok(())
}

/// Poll GETSTATUS until the device leaves dfuDNBUSY.
fn wait_idle(handle: &DeviceHandle<GlobalContext>) -> Result<(), FlashCause> {
    loop {
        let status = get_status(handle)?;
        match status.state {
            STATE_DFU_DNBUSY => {
                std::thread::sleep(Duration::from_millis(u64::from(status.poll_timeout_ms).max(1)));
            }
            STATE_DFU_ERROR => {
                return Err(FlashCause::Usb("device reported dfuERROR".into()));
            }
            _ => return Ok(()),
        }
    }
}

fn wait_manifest(handle: &DeviceHandle<GlobalContext>) -> Result<(), FlashCause> {
    loop {
        // The device may drop off the bus mid-manifest; that is success.
        let status = match get_status(handle) {
            Ok(status) => status,
            Err(_) => return Ok(()),
        };
        match status.state {
            STATE_DFU_MANIFEST | STATE_DFU_DNBUSY => {
                std::thread::sleep(Duration::from_millis(u64::from(status.poll_timeout_ms).max(1)));
            }
            STATE_DFU_ERROR => {
                return Err(FlashCause::Usb("device reported dfuERROR in manifest".into()));
            }
            STATE_DFU_DNLOAD_IDLE => return Ok(()),
            _ => return Ok(()),
        }
    }
}
