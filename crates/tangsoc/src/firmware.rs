//! SD boot firmware.
//!
//! Drives the SD controller through plain bus accesses, the way the soft CPU's boot
//! code does: card identification, block transfers by DMA into main RAM, and loading
//! the emulation core's ROM image either from raw blocks or from a file on a FAT
//! volume.

use crate::error::SocError;
use crate::host::HostBus;
use crate::sdcard::card::{BLOCK_SIZE, RCA, ocr};
use std::io::{self, Read, Seek, SeekFrom, Write};
use tangsoc_hw::memory_map;
use tangsoc_hw::mmio::csr::{self, wbsdcard_events};
use tangsoc_hw::mmio::sdc::{cmd_events, command, data_events, registers};
use tracing::{debug, info, trace, warn};

/// Register polls before a command or transfer is given up
pub const POLL_LIMIT: u32 = 1_000_000;

/// ACMD41 attempts before the card is declared dead
const OP_COND_RETRIES: u32 = 1000;

/// Blocks moved per read command while booting
const BOOT_CHUNK_BLOCKS: u32 = 64;

/// Main RAM scratch block used for unaligned and FAT accesses
pub const BOUNCE_BUFFER: u32 =
    memory_map::main_ram::BASE + memory_map::main_ram::SIZE as u32 - BLOCK_SIZE as u32;

/// ACMD41 argument: high capacity supported, 2.7-3.6 V
const OP_COND_ARG: u32 = ocr::CCS | ocr::VOLTAGE_WINDOW;

pub const R1: u32 = command::RESPONSE_SHORT | command::CRC_CHECK | command::INDEX_CHECK;
pub const R1B: u32 = command::RESPONSE_SHORT_BUSY | command::CRC_CHECK | command::INDEX_CHECK;
pub const R2: u32 = command::RESPONSE_LONG | command::CRC_CHECK;
pub const R3: u32 = command::RESPONSE_SHORT;

/// What identification found out about the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    pub rca: u16,
    pub high_capacity: bool,
    pub blocks: u64,
    pub cid: [u32; 4],
}

/// Where the ROM image is stored on the card
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootImage {
    /// `blocks` consecutive blocks from `lba`
    Raw { lba: u32, blocks: u32 },
    /// A file on the FAT volume
    File(String),
}

/// Byte address of controller register `offset`
fn sdc_reg(offset: u32) -> u32 {
    memory_map::sdcard::BASE + 4 * offset
}

fn csr_reg(offset: u32) -> u32 {
    memory_map::csr::BASE + offset
}

#[derive(Debug)]
pub struct SdDriver<'a, B: HostBus> {
    bus: &'a mut B,
    clock_divider: u32,
    card: Option<CardInfo>,
}

impl<'a, B: HostBus> SdDriver<'a, B> {
    pub fn new(bus: &'a mut B) -> Self {
        Self {
            bus,
            clock_divider: 0,
            card: None,
        }
    }

    /// SD clock divider used from identification on
    pub fn with_clock_divider(mut self, divider: u32) -> Self {
        self.clock_divider = divider;
        self
    }

    pub fn card(&self) -> Option<&CardInfo> {
        self.card.as_ref()
    }

    pub fn bus(&mut self) -> &mut B {
        &mut *self.bus
    }

    fn write_reg(&mut self, offset: u32, value: u32) -> Result<(), SocError> {
        self.bus.write32(sdc_reg(offset), value)
    }

    fn read_reg(&mut self, offset: u32) -> Result<u32, SocError> {
        self.bus.read32(sdc_reg(offset))
    }

    /// Issue one command and wait for its completion event. Returns the 32-bit
    /// response payload (`RESP0`).
    pub fn command(&mut self, index: u8, arg: u32, setup: u32) -> Result<u32, SocError> {
        trace!(index, arg, setup, "sd command");
        self.write_reg(registers::CMD_ISR, 0)?;
        self.write_reg(registers::COMMAND, (index as u32) << command::INDEX_SHIFT | setup)?;
        self.write_reg(registers::ARGUMENT, arg)?;
        let isr = self
            .bus
            .poll32(sdc_reg(registers::CMD_ISR), POLL_LIMIT, |v| {
                v & cmd_events::COMPLETE != 0
            })?;
        self.write_reg(registers::CMD_ISR, 0)?;
        if isr & cmd_events::ERROR != 0 {
            return Err(SocError::Card(format!(
                "CMD{index} failed with event status {isr:#x}"
            )));
        }
        self.read_reg(registers::RESP0)
    }

    /// Application command: CMD55 then ACMD`index`
    pub fn app_command(&mut self, index: u8, arg: u32, setup: u32) -> Result<u32, SocError> {
        let rca = self.card.map_or(0, |c| c.rca);
        self.command(55, (rca as u32) << 16, R1)?;
        self.command(index, arg, setup)
    }

    fn long_response(&mut self) -> Result<[u32; 4], SocError> {
        Ok([
            self.read_reg(registers::RESP0)?,
            self.read_reg(registers::RESP1)?,
            self.read_reg(registers::RESP2)?,
            self.read_reg(registers::RESP3)?,
        ])
    }

    /// Reset the controller and bring the card into the transfer state on a 4-bit bus
    pub fn init_card(&mut self) -> Result<CardInfo, SocError> {
        info!("SD card initialization");
        self.card = None;
        self.write_reg(registers::RESET, 1)?;
        self.write_reg(registers::CLOCK_DIVIDER, self.clock_divider)?;
        self.write_reg(registers::CONTROL, 0)?;
        self.write_reg(registers::RESET, 0)?;
        self.write_reg(registers::CMD_ISER, cmd_events::COMPLETE)?;
        self.write_reg(registers::DATA_ISER, data_events::COMPLETE | data_events::ERROR)?;
        self.bus.write32(
            csr_reg(csr::registers::WBSDCARD_EV_ENABLE),
            wbsdcard_events::INT_DATA | wbsdcard_events::INT_CMD,
        )?;

        self.command(0, 0, command::RESPONSE_NONE)?;
        let echo = self.command(8, 0x1aa, R1)?;
        if echo & 0xfff != 0x1aa {
            return Err(SocError::Card(format!("CMD8 echo mismatch: {echo:#x}")));
        }

        let mut ocr_value = 0;
        for attempt in 0..OP_COND_RETRIES {
            ocr_value = self.app_command(41, OP_COND_ARG, R3)?;
            if ocr_value & ocr::READY != 0 {
                debug!(attempt, ocr = ocr_value, "card powered up");
                break;
            }
        }
        if ocr_value & ocr::READY == 0 {
            return Err(SocError::Card("card never left the busy state".to_string()));
        }

        self.command(2, 0, R2)?;
        let cid = self.long_response()?;
        let rca = (self.command(3, 0, R1)? >> 16) as u16;
        if rca != RCA {
            debug!(rca, "card picked a relative address");
        }
        self.command(9, (rca as u32) << 16, R2)?;
        let csd = self.long_response()?;
        let csd = csd
            .iter()
            .fold(0u128, |acc, &word| (acc << 32) | word as u128);
        let c_size = ((csd >> 48) & 0x3f_ffff) as u64;

        self.command(7, (rca as u32) << 16, R1B)?;
        let info = CardInfo {
            rca,
            high_capacity: ocr_value & ocr::CCS != 0,
            blocks: (c_size + 1) * 1024,
            cid,
        };
        self.card = Some(info);

        self.app_command(6, 0b10, R1)?;
        self.write_reg(registers::CONTROL, 1)?;
        self.command(16, BLOCK_SIZE as u32, R1)?;

        info!(
            "SD card ready: {} blocks ({} MiB), rca {:#06x}",
            info.blocks,
            info.blocks * BLOCK_SIZE as u64 / (1024 * 1024),
            rca
        );
        Ok(info)
    }

    /// Wait for the data-complete event through the event manager
    fn wait_data(&mut self) -> Result<(), SocError> {
        let pending = csr_reg(csr::registers::WBSDCARD_EV_PENDING);
        self.bus
            .poll32(pending, POLL_LIMIT, |v| v & wbsdcard_events::INT_DATA != 0)?;
        let isr = self.read_reg(registers::DATA_ISR)?;
        self.write_reg(registers::DATA_ISR, 0)?;
        self.bus.write32(pending, wbsdcard_events::INT_DATA)?;
        if isr & data_events::ERROR != 0 {
            return Err(SocError::Card(format!(
                "data transfer failed with event status {isr:#x}"
            )));
        }
        Ok(())
    }

    fn setup_transfer(&mut self, count: u32, addr: u32) -> Result<(), SocError> {
        if count == 0 || count > 0x1_0000 {
            return Err(SocError::Config(format!("invalid block count {count}")));
        }
        self.write_reg(registers::BLOCK_SIZE, BLOCK_SIZE as u32 - 1)?;
        self.write_reg(registers::BLOCK_COUNT, count - 1)?;
        self.write_reg(registers::DMA_ADDRESS, addr)?;
        self.write_reg(registers::DATA_ISR, 0)
    }

    /// Read `count` blocks from `lba` into memory at byte address `addr`
    pub fn read_blocks(&mut self, lba: u32, count: u32, addr: u32) -> Result<(), SocError> {
        debug!(lba, count, addr, "sd read");
        self.setup_transfer(count, addr)?;
        let multi = count > 1;
        let index = if multi { 18 } else { 17 };
        self.command(index, lba, R1 | command::DATA_READ)?;
        let result = self.wait_data();
        if multi {
            self.command(12, 0, R1B)?;
        }
        result
    }

    /// Write `count` blocks from memory at byte address `addr` to `lba`
    pub fn write_blocks(&mut self, lba: u32, count: u32, addr: u32) -> Result<(), SocError> {
        debug!(lba, count, addr, "sd write");
        self.setup_transfer(count, addr)?;
        let multi = count > 1;
        let index = if multi { 25 } else { 24 };
        self.command(index, lba, R1 | command::DATA_WRITE)?;
        let result = self.wait_data();
        if multi {
            self.command(12, 0, R1B)?;
        }
        self.wait_transfer_state()?;
        result
    }

    /// Poll CMD13 until the card has finished programming
    fn wait_transfer_state(&mut self) -> Result<(), SocError> {
        let rca = self.card.map_or(RCA, |c| c.rca);
        for _ in 0..POLL_LIMIT {
            let status = self.command(13, (rca as u32) << 16, R1)?;
            // CURRENT_STATE is bits 12:9; 4 is transfer
            if (status >> 9) & 0xf == 4 {
                return Ok(());
            }
        }
        Err(SocError::Card("card stuck programming".to_string()))
    }
}

/// Block-granular [`Read`]/[`Write`]/[`Seek`] view of the card, for FAT access.
///
/// Blocks move by DMA through [`BOUNCE_BUFFER`] and are copied by word accesses.
#[derive(Debug)]
pub struct SdDisk<'a, B: HostBus> {
    driver: SdDriver<'a, B>,
    first_lba: u64,
    len: u64,
    pos: u64,
    cached: Option<(u64, Vec<u8>)>,
}

impl<'a, B: HostBus> SdDisk<'a, B> {
    /// The card from block `first_lba` on. The driver must have identified the card.
    pub fn new(driver: SdDriver<'a, B>, first_lba: u64) -> Result<Self, SocError> {
        let blocks = driver
            .card()
            .map(|c| c.blocks)
            .ok_or_else(|| SocError::Card("card not initialized".to_string()))?;
        Ok(Self {
            driver,
            first_lba,
            len: blocks.saturating_sub(first_lba) * BLOCK_SIZE as u64,
            pos: 0,
            cached: None,
        })
    }

    pub fn into_driver(self) -> SdDriver<'a, B> {
        self.driver
    }

    fn load_block(&mut self, block: u64) -> Result<&mut Vec<u8>, SocError> {
        let hit = self.cached.as_ref().is_some_and(|(b, _)| *b == block);
        if !hit {
            let lba = u32::try_from(self.first_lba + block)
                .map_err(|_| SocError::Card(format!("block {block} beyond 32-bit LBA")))?;
            self.driver.read_blocks(lba, 1, BOUNCE_BUFFER)?;
            let mut data = Vec::with_capacity(BLOCK_SIZE);
            for word in 0..(BLOCK_SIZE / 4) as u32 {
                let value = self.driver.bus().read32(BOUNCE_BUFFER + 4 * word)?;
                data.extend_from_slice(&value.to_le_bytes());
            }
            self.cached = Some((block, data));
        }
        match self.cached.as_mut() {
            Some((_, data)) => Ok(data),
            None => Err(SocError::Card("block cache empty".to_string())),
        }
    }

    fn store_block(&mut self, block: u64, data: &[u8]) -> Result<(), SocError> {
        for (word, chunk) in data.chunks(4).enumerate() {
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            self.driver
                .bus()
                .write32(BOUNCE_BUFFER + 4 * word as u32, u32::from_le_bytes(bytes))?;
        }
        let lba = u32::try_from(self.first_lba + block)
            .map_err(|_| SocError::Card(format!("block {block} beyond 32-bit LBA")))?;
        self.driver.write_blocks(lba, 1, BOUNCE_BUFFER)
    }
}

impl<B: HostBus> Read for SdDisk<'_, B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let block = self.pos / BLOCK_SIZE as u64;
        let offset = (self.pos % BLOCK_SIZE as u64) as usize;
        let n = buf
            .len()
            .min(BLOCK_SIZE - offset)
            .min((self.len - self.pos) as usize);
        let data = self.load_block(block).map_err(io::Error::other)?;
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<B: HostBus> Write for SdDisk<'_, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let block = self.pos / BLOCK_SIZE as u64;
        let offset = (self.pos % BLOCK_SIZE as u64) as usize;
        let n = buf
            .len()
            .min(BLOCK_SIZE - offset)
            .min((self.len - self.pos) as usize);
        let data = self.load_block(block).map_err(io::Error::other)?;
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        let data = data.clone();
        self.store_block(block, &data).map_err(io::Error::other)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<B: HostBus> Seek for SdDisk<'_, B> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of card",
            )),
        }
    }
}

/// LBA of the first partition if block 0 is an MBR, else 0 (a bare volume)
fn volume_start(block0: &[u8]) -> u64 {
    let signed = block0.len() >= BLOCK_SIZE && block0[510] == 0x55 && block0[511] == 0xaa;
    // FAT boot sectors carry the same signature but start with a jump instruction
    let boot_sector = matches!(block0.first(), Some(0xeb) | Some(0xe9));
    if !signed || boot_sector {
        return 0;
    }
    let entry = &block0[446..462];
    if entry[4] == 0 {
        return 0;
    }
    u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]) as u64
}

/// Initialize the card and copy the ROM image to byte address `dest`. Returns the
/// number of bytes loaded.
pub fn sd_boot<B: HostBus>(
    bus: &mut B,
    image: &BootImage,
    dest: u32,
    clock_divider: u32,
) -> Result<usize, SocError> {
    let mut driver = SdDriver::new(bus).with_clock_divider(clock_divider);
    let card = driver.init_card()?;

    match image {
        BootImage::Raw { lba, blocks } => {
            if *lba as u64 + *blocks as u64 > card.blocks {
                return Err(SocError::Image(format!(
                    "boot image ({blocks} blocks at {lba}) beyond the end of the card"
                )));
            }
            let mut done = 0;
            while done < *blocks {
                let count = (*blocks - done).min(BOOT_CHUNK_BLOCKS);
                let addr = dest + done * BLOCK_SIZE as u32;
                driver.read_blocks(lba + done, count, addr)?;
                done += count;
            }
            let len = *blocks as usize * BLOCK_SIZE;
            info!("SD boot: {} bytes from block {} to {:#010x}", len, lba, dest);
            Ok(len)
        }
        BootImage::File(path) => {
            let mut disk = SdDisk::new(driver, 0)?;
            let start = volume_start(disk.load_block(0)?);
            if start != 0 {
                debug!(start, "FAT volume inside a partition");
                disk = SdDisk::new(disk.into_driver(), start)?;
            }
            let contents = {
                let stream = fscommon::BufStream::new(&mut disk);
                let fs = fatfs::FileSystem::new(stream, fatfs::FsOptions::new())?;
                let mut file = fs.root_dir().open_file(path)?;
                let mut contents = Vec::new();
                file.read_to_end(&mut contents)?;
                contents
            };
            let mut driver = disk.into_driver();
            for (word, chunk) in contents.chunks(4).enumerate() {
                let mut bytes = [0u8; 4];
                bytes[..chunk.len()].copy_from_slice(chunk);
                driver
                    .bus()
                    .write32(dest + 4 * word as u32, u32::from_le_bytes(bytes))?;
            }
            if contents.is_empty() {
                warn!("SD boot: {} is empty", path);
            }
            info!(
                "SD boot: {} ({} bytes) to {:#010x}",
                path,
                contents.len(),
                dest
            );
            Ok(contents.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_volume_starts_at_zero() {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[0] = 0xeb;
        block[510] = 0x55;
        block[511] = 0xaa;
        assert_eq!(volume_start(&block), 0);
    }

    #[test]
    fn mbr_points_at_first_partition() {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[446 + 4] = 0x0c;
        block[446 + 8..446 + 12].copy_from_slice(&2048u32.to_le_bytes());
        block[510] = 0x55;
        block[511] = 0xaa;
        assert_eq!(volume_start(&block), 2048);
        block[511] = 0;
        assert_eq!(volume_start(&block), 0);
    }

    #[test]
    fn registers_sit_at_word_offsets() {
        assert_eq!(sdc_reg(registers::BLOCK_SIZE), 0x3000_0110);
        assert_eq!(sdc_reg(registers::DMA_ADDRESS), 0x3000_0180);
    }
}
