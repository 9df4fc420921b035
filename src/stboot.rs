//! STM32 UART bootloader (ST AN3155).
//!
//! After bootloader entry (BOOT0 high, reset) the host sends `0x7F` and the
//! ROM answers ACK. Every command is the command byte plus its bitwise
//! complement, ACK-checked, followed by checksummed data blocks with their
//! own ACKs. Each command maps to a small scripted exchange with per-step
//! timeouts; any unexpected byte surfaces as [`BootloaderError`] tagged
//! with the step where it occurred.
//!
//! The port must be opened with even parity.

use std::time::Duration;

use thiserror::Error;

use crate::error::TransportError;
use crate::transport::Transport;

pub const ACK: u8 = 0x79;
pub const NAK: u8 = 0x1F;
/// Autobaud/sync byte sent after bootloader entry.
pub const INIT: u8 = 0x7F;

pub const CMD_GET: u8 = 0x00;
pub const CMD_GET_ID: u8 = 0x02;
pub const CMD_READ_MEMORY: u8 = 0x11;
pub const CMD_GO: u8 = 0x21;
pub const CMD_WRITE_MEMORY: u8 = 0x31;
pub const CMD_ERASE: u8 = 0x43;
pub const CMD_EXTENDED_ERASE: u8 = 0x44;

/// Default ACK wait.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(500);
/// Mass erase can take tens of seconds on large parts.
pub const ERASE_TIMEOUT: Duration = Duration::from_secs(30);
/// Maximum bytes per READ_MEMORY / WRITE_MEMORY transaction.
pub const CHUNK: usize = 256;

/// Application flash base on every supported STM32.
pub const FLASH_BASE: u32 = 0x0800_0000;

#[derive(Debug, Error)]
pub enum BootloaderError {
    #[error("NAK during {step}")]
    Nak { step: &'static str },
    #[error("unexpected byte {byte:#04x} during {step}")]
    UnexpectedByte { step: &'static str, byte: u8 },
    #[error("timeout during {step}")]
    Timeout { step: &'static str },
    #[error("transport failed during {step}: {source}")]
    Transport {
        step: &'static str,
        #[source]
        source: TransportError,
    },
}

/// One step of a scripted command exchange.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write these bytes to the wire.
    Send(Vec<u8>),
    /// Await a single ACK byte.
    ExpectAck {
        what: &'static str,
        timeout: Duration,
    },
    /// Read exactly `count` bytes into the script output.
    Read {
        what: &'static str,
        count: usize,
        timeout: Duration,
    },
    /// Read a length byte N, then N + 1 bytes, all into the output
    /// (the GET/GET_ID response shape).
    ReadLenPrefixed {
        what: &'static str,
        timeout: Duration,
    },
}

/// A scripted exchange: the full wire dialogue of one bootloader command.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub steps: Vec<Step>,
}

impl Script {
    fn send(mut self, bytes: Vec<u8>) -> Self {
        self.steps.push(Step::Send(bytes));
        self
    }

    fn ack(mut self, what: &'static str) -> Self {
        self.steps.push(Step::ExpectAck {
            what,
            timeout: ACK_TIMEOUT,
        });
        self
    }

    fn ack_within(mut self, what: &'static str, timeout: Duration) -> Self {
        self.steps.push(Step::ExpectAck { what, timeout });
        self
    }

    fn read(mut self, what: &'static str, count: usize) -> Self {
        self.steps.push(Step::Read {
            what,
            count,
            timeout: ACK_TIMEOUT,
        });
        self
    }

    fn read_len_prefixed(mut self, what: &'static str) -> Self {
        self.steps.push(Step::ReadLenPrefixed {
            what,
            timeout: ACK_TIMEOUT,
        });
        self
    }
}

fn command_bytes(cmd: u8) -> Vec<u8> {
    vec![cmd, !cmd]
}

fn address_bytes(addr: u32) -> Vec<u8> {
    let b = addr.to_be_bytes();
    let cksum = b[0] ^ b[1] ^ b[2] ^ b[3];
    vec![b[0], b[1], b[2], b[3], cksum]
}

/// Script builders, one per AN3155 command the station uses.
pub mod scripts {
    use super::*;

    pub fn sync() -> Script {
        Script::default().send(vec![INIT]).ack("sync")
    }

    pub fn get() -> Script {
        Script::default()
            .send(command_bytes(CMD_GET))
            .ack("GET command")
            .read_len_prefixed("GET response")
            .ack("GET trailer")
    }

    pub fn get_id() -> Script {
        Script::default()
            .send(command_bytes(CMD_GET_ID))
            .ack("GET_ID command")
            .read_len_prefixed("GET_ID response")
            .ack("GET_ID trailer")
    }

    pub fn read_memory(addr: u32, count: usize) -> Script {
        debug_assert!(count >= 1 && count <= CHUNK);
        let n = (count - 1) as u8;
        Script::default()
            .send(command_bytes(CMD_READ_MEMORY))
            .ack("READ_MEMORY command")
            .send(address_bytes(addr))
            .ack("READ_MEMORY address")
            .send(vec![n, !n])
            .ack("READ_MEMORY count")
            .read("READ_MEMORY data", count)
    }

    pub fn write_memory(addr: u32, data: &[u8]) -> Script {
        debug_assert!(!data.is_empty() && data.len() <= CHUNK);
        let n = (data.len() - 1) as u8;
        let mut block = Vec::with_capacity(data.len() + 2);
        block.push(n);
        block.extend_from_slice(data);
        let cksum = block.iter().fold(0u8, |acc, &b| acc ^ b);
        block.push(cksum);
        Script::default()
            .send(command_bytes(CMD_WRITE_MEMORY))
            .ack("WRITE_MEMORY command")
            .send(address_bytes(addr))
            .ack("WRITE_MEMORY address")
            .send(block)
            .ack_within("WRITE_MEMORY data", Duration::from_secs(1))
    }

    /// Legacy single-byte ERASE, global variant.
    pub fn erase_global() -> Script {
        Script::default()
            .send(command_bytes(CMD_ERASE))
            .ack("ERASE command")
            .send(vec![0xFF, 0x00])
            .ack_within("ERASE all", ERASE_TIMEOUT)
    }

    /// Two-byte EXTENDED_ERASE of an explicit page list.
    pub fn extended_erase_pages(pages: &[u16]) -> Script {
        debug_assert!(!pages.is_empty());
        let n = (pages.len() - 1) as u16;
        let mut block = Vec::with_capacity(2 + pages.len() * 2);
        block.extend_from_slice(&n.to_be_bytes());
        for page in pages {
            block.extend_from_slice(&page.to_be_bytes());
        }
        let cksum = block.iter().fold(0u8, |acc, &b| acc ^ b);
        block.push(cksum);
        Script::default()
            .send(command_bytes(CMD_EXTENDED_ERASE))
            .ack("EXTENDED_ERASE command")
            .send(block)
            .ack_within("EXTENDED_ERASE pages", ERASE_TIMEOUT)
    }

    /// EXTENDED_ERASE special mass-erase code 0xFFFF.
    pub fn extended_erase_mass() -> Script {
        Script::default()
            .send(command_bytes(CMD_EXTENDED_ERASE))
            .ack("EXTENDED_ERASE command")
            .send(vec![0xFF, 0xFF, 0x00])
            .ack_within("EXTENDED_ERASE mass", ERASE_TIMEOUT)
    }

    pub fn go(addr: u32) -> Script {
        Script::default()
            .send(command_bytes(CMD_GO))
            .ack("GO command")
            .send(address_bytes(addr))
            .ack("GO address")
    }
}

/// Flash sector geometry of one MCU family, as consumed by the erase-page
/// computation. `regions` is `(sector_size_bytes, count)` from the flash
/// base upward.
#[derive(Debug, Clone, Copy)]
pub struct FlashLayout {
    pub regions: &'static [(u32, u16)],
}

impl FlashLayout {
    /// Sector numbers overlapping `[start, start + len)` (addresses are
    /// absolute).
    pub fn sectors_for_range(&self, start: u32, len: u32) -> Vec<u16> {
        let end = start.saturating_add(len);
        let mut sectors = Vec::new();
        let mut addr = FLASH_BASE;
        let mut index: u16 = 0;
        for &(size, count) in self.regions {
            for _ in 0..count {
                let sector_end = addr + size;
                if addr < end && sector_end > start {
                    sectors.push(index);
                }
                addr = sector_end;
                index += 1;
            }
        }
        sectors
    }
}

const LAYOUT_F4: FlashLayout = FlashLayout {
    regions: &[(16 * 1024, 4), (64 * 1024, 1), (128 * 1024, 11)],
};
const LAYOUT_F7: FlashLayout = FlashLayout {
    regions: &[(32 * 1024, 4), (128 * 1024, 1), (256 * 1024, 7)],
};
const LAYOUT_H7: FlashLayout = FlashLayout {
    regions: &[(128 * 1024, 16)],
};
const LAYOUT_2K_PAGES: FlashLayout = FlashLayout {
    regions: &[(2 * 1024, 256)],
};

/// One row of the chip-id translation table.
#[derive(Debug, Clone, Copy)]
pub struct ChipFamily {
    pub chip_id: u16,
    pub name: &'static str,
    pub flash_kb: u32,
    pub layout: FlashLayout,
}

/// Static chip-id table covering the STM32 families flight controllers
/// ship with.
pub const CHIP_FAMILIES: &[ChipFamily] = &[
    ChipFamily { chip_id: 0x413, name: "STM32F405/407", flash_kb: 1024, layout: LAYOUT_F4 },
    ChipFamily { chip_id: 0x419, name: "STM32F42x/43x", flash_kb: 2048, layout: LAYOUT_F4 },
    ChipFamily { chip_id: 0x423, name: "STM32F401xB/C", flash_kb: 256, layout: LAYOUT_F4 },
    ChipFamily { chip_id: 0x431, name: "STM32F411", flash_kb: 512, layout: LAYOUT_F4 },
    ChipFamily { chip_id: 0x421, name: "STM32F446", flash_kb: 512, layout: LAYOUT_F4 },
    ChipFamily { chip_id: 0x449, name: "STM32F74x/75x", flash_kb: 1024, layout: LAYOUT_F7 },
    ChipFamily { chip_id: 0x451, name: "STM32F76x/77x", flash_kb: 2048, layout: LAYOUT_F7 },
    ChipFamily { chip_id: 0x450, name: "STM32H743", flash_kb: 2048, layout: LAYOUT_H7 },
    ChipFamily { chip_id: 0x483, name: "STM32H723/733", flash_kb: 1024, layout: LAYOUT_H7 },
    ChipFamily { chip_id: 0x422, name: "STM32F302/303", flash_kb: 256, layout: LAYOUT_2K_PAGES },
    ChipFamily { chip_id: 0x432, name: "STM32F373", flash_kb: 256, layout: LAYOUT_2K_PAGES },
    ChipFamily { chip_id: 0x438, name: "STM32F334", flash_kb: 64, layout: LAYOUT_2K_PAGES },
    ChipFamily { chip_id: 0x468, name: "STM32G431", flash_kb: 128, layout: LAYOUT_2K_PAGES },
    ChipFamily { chip_id: 0x469, name: "STM32G474", flash_kb: 512, layout: LAYOUT_2K_PAGES },
];

/// Translate a 12-bit chip id read with GET_ID.
pub fn chip_family(chip_id: u16) -> Option<&'static ChipFamily> {
    CHIP_FAMILIES.iter().find(|f| f.chip_id == chip_id)
}

/// Drives scripted bootloader exchanges over an exclusively-owned
/// transport. There is no concurrency at this layer: one script at a time,
/// strictly sequential bytes.
pub struct BootloaderClient<T: Transport> {
    transport: T,
}

impl<T: Transport> BootloaderClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Run one scripted exchange, returning every byte the read steps
    /// collected.
    pub async fn run(&mut self, script: &Script) -> Result<Vec<u8>, BootloaderError> {
        let mut output = Vec::new();
        for step in &script.steps {
            match step {
                Step::Send(bytes) => {
                    self.transport
                        .write_all(bytes)
                        .await
                        .map_err(|source| BootloaderError::Transport {
                            step: "send",
                            source,
                        })?;
                }
                Step::ExpectAck { what, timeout } => {
                    let byte = self.read_byte(what, *timeout).await?;
                    match byte {
                        ACK => {}
                        NAK => return Err(BootloaderError::Nak { step: what }),
                        other => {
                            return Err(BootloaderError::UnexpectedByte {
                                step: what,
                                byte: other,
                            })
                        }
                    }
                }
                Step::Read {
                    what,
                    count,
                    timeout,
                } => {
                    for _ in 0..*count {
                        output.push(self.read_byte(what, *timeout).await?);
                    }
                }
                Step::ReadLenPrefixed { what, timeout } => {
                    let n = self.read_byte(what, *timeout).await?;
                    output.push(n);
                    for _ in 0..usize::from(n) + 1 {
                        output.push(self.read_byte(what, *timeout).await?);
                    }
                }
            }
        }
        Ok(output)
    }

    /// Send the sync byte and await ACK. A NAK here means the ROM was
    /// already synchronised, which is equally fine.
    pub async fn sync(&mut self) -> Result<(), BootloaderError> {
        self.transport
            .write_all(&[INIT])
            .await
            .map_err(|source| BootloaderError::Transport {
                step: "sync",
                source,
            })?;
        match self.read_byte("sync", ACK_TIMEOUT).await? {
            ACK | NAK => Ok(()),
            byte => Err(BootloaderError::UnexpectedByte { step: "sync", byte }),
        }
    }

    /// Read the 12-bit product id.
    pub async fn get_id(&mut self) -> Result<u16, BootloaderError> {
        let out = self.run(&scripts::get_id()).await?;
        // out[0] is N (bytes - 1), the id follows big-endian.
        if out.len() < 3 {
            return Err(BootloaderError::UnexpectedByte {
                step: "GET_ID response",
                byte: *out.first().unwrap_or(&0),
            });
        }
        Ok(u16::from_be_bytes([out[1], out[2]]) & 0x0FFF)
    }

    /// Bootloader version and supported command list.
    pub async fn get(&mut self) -> Result<(u8, Vec<u8>), BootloaderError> {
        let out = self.run(&scripts::get()).await?;
        if out.len() < 2 {
            return Err(BootloaderError::UnexpectedByte {
                step: "GET response",
                byte: *out.first().unwrap_or(&0),
            });
        }
        Ok((out[1], out[2..].to_vec()))
    }

    pub async fn read_memory(&mut self, addr: u32, count: usize) -> Result<Vec<u8>, BootloaderError> {
        self.run(&scripts::read_memory(addr, count)).await
    }

    pub async fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<(), BootloaderError> {
        self.run(&scripts::write_memory(addr, data)).await.map(|_| ())
    }

    /// Erase the listed pages, or everything when `pages` is `None`.
    /// Prefers EXTENDED_ERASE and falls back to the legacy command when the
    /// ROM does not implement it.
    pub async fn erase(&mut self, pages: Option<&[u16]>) -> Result<(), BootloaderError> {
        let script = match pages {
            Some(pages) if !pages.is_empty() => scripts::extended_erase_pages(pages),
            _ => scripts::extended_erase_mass(),
        };
        match self.run(&script).await {
            Ok(_) => Ok(()),
            Err(BootloaderError::Nak { .. }) if pages.is_none() => {
                self.run(&scripts::erase_global()).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn go(&mut self, addr: u32) -> Result<(), BootloaderError> {
        self.run(&scripts::go(addr)).await.map(|_| ())
    }

    async fn read_byte(
        &mut self,
        step: &'static str,
        timeout: Duration,
    ) -> Result<u8, BootloaderError> {
        match tokio::time::timeout(timeout, self.read_one()).await {
            Ok(Ok(byte)) => Ok(byte),
            Ok(Err(source)) => Err(BootloaderError::Transport { step, source }),
            Err(_) => Err(BootloaderError::Timeout { step }),
        }
    }

    async fn read_one(&mut self) -> Result<u8, TransportError> {
        let mut buf = [0u8; 1];
        loop {
            let n = self.transport.read(&mut buf).await?;
            if n == 1 {
                return Ok(buf[0]);
            }
        }
    }
}
