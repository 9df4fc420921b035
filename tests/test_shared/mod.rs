//! Shared test fixtures: a scriptable fake flight controller and a
//! scripted STM32 bootloader ROM, both living on the far end of a
//! loopback transport.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use groundlink::mavlink::messages::MavMessage;
use groundlink::mavlink::{encode_frame, MavHeader, MavlinkDecoder, MavlinkVersion};
use groundlink::msp::{MspDecoder, MspFrame};
use groundlink::stboot;
use groundlink::transport::{LoopbackTransport, Transport};

/// Route `log::` output from the code under test through the test
/// harness. Safe to call from every fixture; only the first call wins.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Handlers for the protocols a fake FC speaks. Any handler left `None`
/// leaves that protocol silent (requests time out).
#[derive(Default)]
pub struct FakeFc {
    pub mavlink: Option<Box<dyn FnMut(MavMessage) -> Vec<MavMessage> + Send>>,
    pub msp: Option<Box<dyn FnMut(&MspFrame) -> Option<MspFrame> + Send>>,
    /// Raw byte handler for bootloader-mode devices; fed every byte.
    pub raw: Option<Box<dyn FnMut(u8) -> Vec<u8> + Send>>,
}

/// Run a fake FC on `transport` until the peer goes away.
pub fn spawn_fc(mut transport: LoopbackTransport, mut fc: FakeFc) -> JoinHandle<()> {
    init_logging();
    tokio::spawn(async move {
        let mut mav_decoder = MavlinkDecoder::new();
        let mut msp_decoder = MspDecoder::new();
        let mut sequence: u8 = 0;
        let mut buf = [0u8; 512];
        loop {
            let n = match transport.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            let mut outbound: Vec<u8> = Vec::new();
            for &byte in &buf[..n] {
                if let Some(raw) = fc.raw.as_mut() {
                    outbound.extend(raw(byte));
                }
                if let Some(frame) = mav_decoder.feed(byte) {
                    if let Some(handler) = fc.mavlink.as_mut() {
                        for reply in handler(frame.decode()) {
                            let header = MavHeader {
                                system_id: 1,
                                component_id: 1,
                                sequence,
                            };
                            sequence = sequence.wrapping_add(1);
                            outbound.extend(
                                encode_frame(MavlinkVersion::V2, header, &reply).unwrap(),
                            );
                        }
                    }
                }
                if let Some(frame) = msp_decoder.feed(byte) {
                    if let Some(handler) = fc.msp.as_mut() {
                        if let Some(reply) = handler(&frame) {
                            outbound.extend(reply.encode().unwrap());
                        }
                    }
                }
            }
            if !outbound.is_empty() && transport.write_all(&outbound).await.is_err() {
                return;
            }
        }
    })
}

/// Scripted AN3155 ROM with a sparse memory map.
pub struct StmRom {
    pub chip_id: u16,
    pub memory: Arc<Mutex<HashMap<u32, u8>>>,
    /// NAK this many WRITE_MEMORY data blocks before accepting.
    pub nak_writes: usize,
}

impl StmRom {
    pub fn new(chip_id: u16) -> Self {
        Self {
            chip_id,
            memory: Arc::new(Mutex::new(HashMap::new())),
            nak_writes: 0,
        }
    }
}

async fn read_exact<T: Transport>(transport: &mut T, out: &mut [u8]) -> Result<(), ()> {
    let mut filled = 0;
    while filled < out.len() {
        let n = transport.read(&mut out[filled..]).await.map_err(|_| ())?;
        filled += n;
    }
    Ok(())
}

async fn read_byte<T: Transport>(transport: &mut T) -> Result<u8, ()> {
    let mut byte = [0u8; 1];
    read_exact(transport, &mut byte).await?;
    Ok(byte[0])
}

/// Run the ROM protocol until the host sends GO or hangs up.
pub fn spawn_rom(mut transport: LoopbackTransport, mut rom: StmRom) -> JoinHandle<()> {
    init_logging();
    tokio::spawn(async move {
        loop {
            let Ok(byte) = read_byte(&mut transport).await else {
                return;
            };
            match byte {
                stboot::INIT => {
                    let _ = transport.write_all(&[stboot::ACK]).await;
                }
                cmd => {
                    let Ok(complement) = read_byte(&mut transport).await else {
                        return;
                    };
                    if complement != !cmd {
                        let _ = transport.write_all(&[stboot::NAK]).await;
                        continue;
                    }
                    if handle_command(&mut transport, &mut rom, cmd).await.is_err() {
                        return;
                    }
                    if cmd == stboot::CMD_GO {
                        return;
                    }
                }
            }
        }
    })
}

async fn handle_command(
    transport: &mut LoopbackTransport,
    rom: &mut StmRom,
    cmd: u8,
) -> Result<(), ()> {
    match cmd {
        stboot::CMD_GET_ID => {
            let id = rom.chip_id.to_be_bytes();
            transport
                .write_all(&[stboot::ACK, 0x01, id[0], id[1], stboot::ACK])
                .await
                .map_err(|_| ())
        }
        stboot::CMD_GET => transport
            .write_all(&[
                stboot::ACK,
                0x0A, // 11 bytes follow: version + 10 commands
                0x31, // bootloader version
                stboot::CMD_GET,
                stboot::CMD_GET_ID,
                stboot::CMD_READ_MEMORY,
                stboot::CMD_GO,
                stboot::CMD_WRITE_MEMORY,
                stboot::CMD_EXTENDED_ERASE,
                0x63,
                0x73,
                0x82,
                0x92,
                stboot::ACK,
            ])
            .await
            .map_err(|_| ()),
        stboot::CMD_WRITE_MEMORY => {
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())?;
            let address = read_address(transport).await?;
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())?;
            let n = read_byte(transport).await?;
            let count = usize::from(n) + 1;
            let mut block = vec![0u8; count + 1];
            read_exact(transport, &mut block).await?;
            let mut cksum = n;
            for &b in &block[..count] {
                cksum ^= b;
            }
            if cksum != block[count] {
                return transport.write_all(&[stboot::NAK]).await.map_err(|_| ());
            }
            if rom.nak_writes > 0 {
                rom.nak_writes -= 1;
                return transport.write_all(&[stboot::NAK]).await.map_err(|_| ());
            }
            {
                let mut memory = rom.memory.lock().unwrap();
                for (offset, &value) in block[..count].iter().enumerate() {
                    memory.insert(address + offset as u32, value);
                }
            }
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())
        }
        stboot::CMD_READ_MEMORY => {
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())?;
            let address = read_address(transport).await?;
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())?;
            let n = read_byte(transport).await?;
            let _complement = read_byte(transport).await?;
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())?;
            let count = usize::from(n) + 1;
            let bytes: Vec<u8> = {
                let memory = rom.memory.lock().unwrap();
                (0..count)
                    .map(|i| *memory.get(&(address + i as u32)).unwrap_or(&0xFF))
                    .collect()
            };
            transport.write_all(&bytes).await.map_err(|_| ())
        }
        stboot::CMD_EXTENDED_ERASE => {
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())?;
            let mut header = [0u8; 2];
            read_exact(transport, &mut header).await?;
            let code = u16::from_be_bytes(header);
            if code == 0xFFFF {
                let _cksum = read_byte(transport).await?;
            } else {
                let pages = usize::from(code) + 1;
                let mut rest = vec![0u8; pages * 2 + 1];
                read_exact(transport, &mut rest).await?;
            }
            rom.memory.lock().unwrap().clear();
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())
        }
        stboot::CMD_ERASE => {
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())?;
            let mut block = [0u8; 2];
            read_exact(transport, &mut block).await?;
            rom.memory.lock().unwrap().clear();
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())
        }
        stboot::CMD_GO => {
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())?;
            let _address = read_address(transport).await?;
            transport.write_all(&[stboot::ACK]).await.map_err(|_| ())
        }
        _ => transport.write_all(&[stboot::NAK]).await.map_err(|_| ()),
    }
}

async fn read_address(transport: &mut LoopbackTransport) -> Result<u32, ()> {
    let mut block = [0u8; 5];
    read_exact(transport, &mut block).await?;
    let cksum = block[0] ^ block[1] ^ block[2] ^ block[3];
    if cksum != block[4] {
        return Err(());
    }
    Ok(u32::from_be_bytes([block[0], block[1], block[2], block[3]]))
}
