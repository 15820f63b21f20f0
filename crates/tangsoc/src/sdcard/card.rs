//! SD card model speaking the native bus protocol on the pads.
//!
//! The card is clocked by `sd_clk`. On every rising edge it samples the command and
//! data lines as they were before the edge, then presents its next output bit. Commands
//! are 48-bit frames protected by CRC7; data blocks carry one CRC16 per active line.
//!
//! The card is always SDHC: block addressed, 512-byte blocks.
//!
//! # References
//! - SD Specifications Part 1, Physical Layer Simplified Specification

use super::crc::{crc7, crc16_wide};
use super::pins::{SdLines, TriState, TriStateBus};
use crate::error::SocError;
use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, trace, warn};

pub const BLOCK_SIZE: usize = 512;

/// Storage behind the card
pub trait BlockDevice: fmt::Debug {
    fn block_count(&self) -> u64;
    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> std::io::Result<()>;
    fn write_block(&mut self, lba: u64, buf: &[u8]) -> std::io::Result<()>;
}

/// Card contents held in memory
#[derive(Debug, Clone)]
pub struct MemoryBlockDevice {
    data: Vec<u8>,
}

impl MemoryBlockDevice {
    /// A zero-filled device of `blocks` blocks
    pub fn new(blocks: usize) -> Self {
        Self {
            data: vec![0; blocks * BLOCK_SIZE],
        }
    }

    /// Wrap an image, padding it to a whole number of blocks
    pub fn from_image(mut data: Vec<u8>) -> Self {
        let padded = data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        data.resize(padded, 0);
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn block_count(&self) -> u64 {
        (self.data.len() / BLOCK_SIZE) as u64
    }

    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let start = lba as usize * BLOCK_SIZE;
        let block = self
            .data
            .get(start..start + buf.len())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write_block(&mut self, lba: u64, buf: &[u8]) -> std::io::Result<()> {
        let start = lba as usize * BLOCK_SIZE;
        let block = self
            .data
            .get_mut(start..start + buf.len())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        block.copy_from_slice(buf);
        Ok(())
    }
}

/// Card contents in an image file, accessed in place
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    blocks: u64,
}

impl FileBlockDevice {
    pub fn open(path: &Path) -> Result<Self, SocError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            warn!(
                "SD card image {:?} is {} bytes, ignoring the partial last block",
                path, len
            );
        }
        let blocks = len / BLOCK_SIZE as u64;
        if blocks == 0 {
            return Err(SocError::Image(format!(
                "SD card image {path:?} holds no complete block"
            )));
        }
        debug!("Opened SD card image {:?}: {} blocks", path, blocks);
        Ok(Self { file, blocks })
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(lba * BLOCK_SIZE as u64))?;
        self.file.read_exact(buf)
    }

    fn write_block(&mut self, lba: u64, buf: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(lba * BLOCK_SIZE as u64))?;
        self.file.write_all(buf)?;
        self.file.flush()
    }
}

/// Card states, as reported in the R1 `CURRENT_STATE` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CardState {
    Idle = 0,
    Ready = 1,
    Identify = 2,
    Standby = 3,
    Transfer = 4,
    Data = 5,
    Receive = 6,
    Program = 7,
}

/// Card status bits (R1)
pub mod status {
    pub const OUT_OF_RANGE: u32 = 1 << 31;
    pub const COM_CRC_ERROR: u32 = 1 << 23;
    pub const ILLEGAL_COMMAND: u32 = 1 << 22;
    pub const ERROR: u32 = 1 << 19;
    pub const READY_FOR_DATA: u32 = 1 << 8;
    pub const APP_CMD: u32 = 1 << 5;
}

/// OCR bits (R3)
pub mod ocr {
    /// Power-up finished
    pub const READY: u32 = 1 << 31;
    /// High capacity, block addressed
    pub const CCS: u32 = 1 << 30;
    /// 2.7-3.6 V window
    pub const VOLTAGE_WINDOW: u32 = 0x00ff_8000;
}

/// Relative card address published by CMD3
pub const RCA: u16 = 0x0001;

/// Clocks between the end of a command and the start of its response
const NCR: usize = 2;
/// Clocks between the end of a read response or block and the next block
const NAC: usize = 2;
/// Clocks between a written block's end bit and its CRC status token
const NWR: usize = 2;
/// Busy clocks while a written block is programmed
const PROGRAM_CYCLES: usize = 8;
/// ACMD41 calls answered with a busy OCR before power-up completes
const POWER_UP_POLLS: u32 = 2;

const SCR: [u8; 8] = [0x02, 0x35, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    R1(u32),
    R1b(u32),
    R2([u8; 16]),
    R3(u32),
    R6(u32),
    R7(u32),
}

#[derive(Debug, Clone, Copy)]
struct ReadJob {
    next_lba: u64,
    multi: bool,
}

#[derive(Debug, Clone, Copy)]
struct WriteJob {
    lba: u64,
    multi: bool,
}

#[derive(Debug, Clone)]
struct DataRx {
    buf: Vec<u8>,
    /// Clocks received after the start bit
    count: usize,
    crc_rx: [u16; 4],
}

pub struct SdCard {
    device: Box<dyn BlockDevice>,
    state: CardState,
    status_flags: u32,
    app_command_next: bool,
    power_up_polls: u32,
    wide: bool,

    prev_clk: bool,
    cmd_rx: Option<(u64, u32)>,
    data_rx: Option<DataRx>,
    read_job: Option<ReadJob>,
    write_job: Option<WriteJob>,

    cmd_out: VecDeque<TriState>,
    dat_out: VecDeque<TriStateBus>,
    cmd_drive: TriState,
    dat_drive: TriStateBus,

    commands: u64,
}

impl fmt::Debug for SdCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdCard")
            .field("device", &self.device)
            .field("state", &self.state)
            .field("wide", &self.wide)
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

impl SdCard {
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        Self {
            device,
            state: CardState::Idle,
            status_flags: 0,
            app_command_next: false,
            power_up_polls: 0,
            wide: false,
            prev_clk: false,
            cmd_rx: None,
            data_rx: None,
            read_job: None,
            write_job: None,
            cmd_out: VecDeque::new(),
            dat_out: VecDeque::new(),
            cmd_drive: TriState::RELEASED,
            dat_drive: TriStateBus::RELEASED,
            commands: 0,
        }
    }

    pub fn state(&self) -> CardState {
        self.state
    }

    pub fn wide_bus(&self) -> bool {
        self.wide
    }

    /// Commands received with a valid frame
    pub fn commands(&self) -> u64 {
        self.commands
    }

    pub fn device(&mut self) -> &mut dyn BlockDevice {
        self.device.as_mut()
    }

    /// Output on the command line
    pub fn cmd_out(&self) -> TriState {
        self.cmd_drive
    }

    /// Output on the data lines
    pub fn dat_out(&self) -> TriStateBus {
        self.dat_drive
    }

    /// `lines` are the resolved levels before this call's clock edge
    pub fn tick(&mut self, clk: bool, lines: &SdLines) {
        let rising = clk && !self.prev_clk;
        self.prev_clk = clk;
        if !rising {
            return;
        }

        self.receive_command(lines.cmd);
        self.receive_data(lines.dat);
        self.feed_data();

        self.cmd_drive = self.cmd_out.pop_front().unwrap_or(TriState::RELEASED);
        self.dat_drive = self.dat_out.pop_front().unwrap_or(TriStateBus::RELEASED);
    }

    // ========================================================================
    // Command line
    // ========================================================================

    fn receive_command(&mut self, line: bool) {
        if self.cmd_drive.oe || !self.cmd_out.is_empty() {
            return;
        }
        let (bits, count) = match self.cmd_rx {
            None if !line => (0u64, 1u32),
            None => return,
            Some((bits, count)) => ((bits << 1) | line as u64, count + 1),
        };
        if count < 48 {
            self.cmd_rx = Some((bits, count));
            return;
        }
        self.cmd_rx = None;

        let frame = bits.to_be_bytes();
        let body = &frame[2..7];
        let crc = ((bits >> 1) & 0x7f) as u8;
        if body[0] & 0x40 == 0 {
            trace!("ignoring frame without transmission bit: {:#014x}", bits);
            return;
        }
        if crc7(body) != crc {
            warn!("SD card: command CRC mismatch in frame {:#014x}", bits);
            self.status_flags |= status::COM_CRC_ERROR;
            return;
        }
        let index = body[0] & 0x3f;
        let arg = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
        self.commands += 1;

        let app = std::mem::take(&mut self.app_command_next);
        let reply = if app {
            debug!("SD card ACMD{} arg={:#x}", index, arg);
            self.execute_acmd(index, arg)
        } else {
            debug!("SD card CMD{} arg={:#x}", index, arg);
            self.execute_cmd(index, arg)
        };
        match reply {
            Some(reply) => self.send_reply(index, reply),
            None => trace!("SD card: no response to CMD{}", index),
        }
    }

    fn send_reply(&mut self, index: u8, reply: Reply) {
        let bits: Vec<bool> = match reply {
            Reply::R1(payload) | Reply::R1b(payload) | Reply::R7(payload) => {
                short_frame(index, payload, true)
            }
            Reply::R6(payload) => short_frame(index, payload, true),
            Reply::R3(payload) => short_frame(0x3f, payload, false),
            Reply::R2(register) => {
                let mut bits = vec![false, false, true, true, true, true, true, true];
                bits.extend(register.iter().flat_map(|&b| byte_bits(b)));
                bits
            }
        };
        let len = bits.len();
        self.cmd_out.extend(std::iter::repeat_n(TriState::RELEASED, NCR));
        self.cmd_out.extend(bits.into_iter().map(TriState::drive));

        if let Reply::R1b(_) = reply {
            let busy = if self.state == CardState::Program {
                PROGRAM_CYCLES
            } else {
                2
            };
            self.dat_out.clear();
            self.dat_out
                .extend(std::iter::repeat_n(TriStateBus::RELEASED, NCR + len));
            self.dat_out
                .extend(std::iter::repeat_n(TriStateBus::dat0(false), busy));
        }
    }

    /// R1 card status: error flags are cleared once reported
    fn card_status(&mut self) -> u32 {
        let mut value = std::mem::take(&mut self.status_flags) | (self.state as u32) << 9;
        if self.state != CardState::Program && self.state != CardState::Receive {
            value |= status::READY_FOR_DATA;
        }
        if self.app_command_next {
            value |= status::APP_CMD;
        }
        value
    }

    fn illegal(&mut self, what: &str) -> Option<Reply> {
        warn!("SD card: {} in state {:?}", what, self.state);
        self.status_flags |= status::ILLEGAL_COMMAND;
        None
    }

    fn execute_cmd(&mut self, index: u8, arg: u32) -> Option<Reply> {
        match index {
            0 => self.cmd0_go_idle_state(),
            2 => self.cmd2_all_send_cid(),
            3 => self.cmd3_send_relative_addr(),
            7 => self.cmd7_select_card(arg),
            8 => self.cmd8_send_if_cond(arg),
            9 => self.cmd9_send_csd(arg),
            12 => self.cmd12_stop_transmission(),
            13 => self.cmd13_send_status(arg),
            16 => self.cmd16_set_blocklen(arg),
            17 => self.cmd17_18_read(arg, false),
            18 => self.cmd17_18_read(arg, true),
            24 => self.cmd24_25_write(arg, false),
            25 => self.cmd24_25_write(arg, true),
            55 => self.cmd55_app_cmd(),
            _ => self.illegal(&format!("unsupported CMD{index}")),
        }
    }

    fn execute_acmd(&mut self, index: u8, arg: u32) -> Option<Reply> {
        match index {
            6 => self.acmd6_set_bus_width(arg),
            13 => self.acmd13_sd_status(),
            41 => self.acmd41_sd_send_op_cond(arg),
            51 => self.acmd51_send_scr(),
            // Anything else is treated as a regular command
            _ => self.execute_cmd(index, arg),
        }
    }

    // ========================================================================
    // Individual commands
    // ========================================================================

    /// CMD0: GO_IDLE_STATE
    fn cmd0_go_idle_state(&mut self) -> Option<Reply> {
        self.state = CardState::Idle;
        self.status_flags = 0;
        self.power_up_polls = 0;
        self.wide = false;
        self.read_job = None;
        self.write_job = None;
        self.data_rx = None;
        self.dat_out.clear();
        None
    }

    /// CMD2: ALL_SEND_CID
    fn cmd2_all_send_cid(&mut self) -> Option<Reply> {
        if self.state != CardState::Ready {
            return self.illegal("CMD2");
        }
        self.state = CardState::Identify;
        Some(Reply::R2(with_crc(CID)))
    }

    /// CMD3: SEND_RELATIVE_ADDR
    fn cmd3_send_relative_addr(&mut self) -> Option<Reply> {
        if !matches!(self.state, CardState::Identify | CardState::Standby) {
            return self.illegal("CMD3");
        }
        let status = self.card_status();
        self.state = CardState::Standby;
        // R6 packs status bits 23, 22, 19 and 12:0 into 16 bits
        let packed = (status >> 8) & 0xe000 | status & 0x1fff;
        Some(Reply::R6((RCA as u32) << 16 | packed))
    }

    /// CMD7: SELECT/DESELECT_CARD
    fn cmd7_select_card(&mut self, arg: u32) -> Option<Reply> {
        if (arg >> 16) as u16 != RCA {
            if self.state == CardState::Transfer {
                debug!("SD card deselected");
                self.state = CardState::Standby;
            }
            return None;
        }
        if self.state != CardState::Standby {
            return self.illegal("CMD7");
        }
        let status = self.card_status();
        self.state = CardState::Transfer;
        Some(Reply::R1b(status))
    }

    /// CMD8: SEND_IF_COND
    fn cmd8_send_if_cond(&mut self, arg: u32) -> Option<Reply> {
        if self.state != CardState::Idle {
            return self.illegal("CMD8");
        }
        Some(Reply::R7(arg & 0xfff))
    }

    /// CMD9: SEND_CSD
    fn cmd9_send_csd(&mut self, arg: u32) -> Option<Reply> {
        if self.state != CardState::Standby || (arg >> 16) as u16 != RCA {
            return self.illegal("CMD9");
        }
        Some(Reply::R2(with_crc(self.csd())))
    }

    /// CMD12: STOP_TRANSMISSION
    fn cmd12_stop_transmission(&mut self) -> Option<Reply> {
        match self.state {
            CardState::Data => {
                let status = self.card_status();
                self.read_job = None;
                self.dat_out.clear();
                self.state = CardState::Transfer;
                Some(Reply::R1b(status))
            }
            CardState::Receive => {
                let status = self.card_status();
                self.write_job = None;
                self.data_rx = None;
                self.state = CardState::Program;
                Some(Reply::R1b(status))
            }
            _ => self.illegal("CMD12"),
        }
    }

    /// CMD13: SEND_STATUS
    fn cmd13_send_status(&mut self, arg: u32) -> Option<Reply> {
        if matches!(
            self.state,
            CardState::Idle | CardState::Ready | CardState::Identify
        ) || (arg >> 16) as u16 != RCA
        {
            return self.illegal("CMD13");
        }
        Some(Reply::R1(self.card_status()))
    }

    /// CMD16: SET_BLOCKLEN (fixed at 512 on high-capacity cards)
    fn cmd16_set_blocklen(&mut self, arg: u32) -> Option<Reply> {
        if self.state != CardState::Transfer {
            return self.illegal("CMD16");
        }
        if arg as usize != BLOCK_SIZE {
            warn!("SD card: block length {} ignored", arg);
        }
        Some(Reply::R1(self.card_status()))
    }

    /// CMD17: READ_SINGLE_BLOCK / CMD18: READ_MULTIPLE_BLOCK
    fn cmd17_18_read(&mut self, lba: u32, multi: bool) -> Option<Reply> {
        if self.state != CardState::Transfer {
            return self.illegal("read");
        }
        let lba = lba as u64;
        if lba >= self.device.block_count() {
            self.status_flags |= status::OUT_OF_RANGE;
            return Some(Reply::R1(self.card_status()));
        }
        let status = self.card_status();
        self.state = CardState::Data;
        self.dat_out.clear();
        self.dat_out
            .extend(std::iter::repeat_n(TriStateBus::RELEASED, NCR + 48 + NAC));
        self.send_block(lba);
        self.read_job = Some(ReadJob {
            next_lba: lba + 1,
            multi,
        });
        Some(Reply::R1(status))
    }

    /// CMD24: WRITE_BLOCK / CMD25: WRITE_MULTIPLE_BLOCK
    fn cmd24_25_write(&mut self, lba: u32, multi: bool) -> Option<Reply> {
        if self.state != CardState::Transfer {
            return self.illegal("write");
        }
        let lba = lba as u64;
        if lba >= self.device.block_count() {
            self.status_flags |= status::OUT_OF_RANGE;
            return Some(Reply::R1(self.card_status()));
        }
        let status = self.card_status();
        self.state = CardState::Receive;
        self.write_job = Some(WriteJob { lba, multi });
        Some(Reply::R1(status))
    }

    /// CMD55: APP_CMD
    fn cmd55_app_cmd(&mut self) -> Option<Reply> {
        self.app_command_next = true;
        Some(Reply::R1(self.card_status()))
    }

    /// ACMD6: SET_BUS_WIDTH
    fn acmd6_set_bus_width(&mut self, arg: u32) -> Option<Reply> {
        if self.state != CardState::Transfer {
            return self.illegal("ACMD6");
        }
        self.wide = arg & 0x3 == 0x2;
        debug!("SD card bus width {}", if self.wide { 4 } else { 1 });
        Some(Reply::R1(self.card_status()))
    }

    /// ACMD13: SD_STATUS
    fn acmd13_sd_status(&mut self) -> Option<Reply> {
        if self.state != CardState::Transfer {
            return self.illegal("ACMD13");
        }
        let mut sd_status = [0u8; 64];
        sd_status[0] = (self.wide as u8) << 7;
        self.send_register(&sd_status)
    }

    /// ACMD41: SD_SEND_OP_COND
    fn acmd41_sd_send_op_cond(&mut self, arg: u32) -> Option<Reply> {
        if self.state != CardState::Idle {
            return self.illegal("ACMD41");
        }
        if arg & ocr::VOLTAGE_WINDOW == 0 {
            // Inquiry only
            return Some(Reply::R3(ocr::VOLTAGE_WINDOW));
        }
        self.power_up_polls += 1;
        if self.power_up_polls <= POWER_UP_POLLS {
            return Some(Reply::R3(ocr::VOLTAGE_WINDOW));
        }
        self.state = CardState::Ready;
        Some(Reply::R3(ocr::READY | ocr::CCS | ocr::VOLTAGE_WINDOW))
    }

    /// ACMD51: SEND_SCR
    fn acmd51_send_scr(&mut self) -> Option<Reply> {
        if self.state != CardState::Transfer {
            return self.illegal("ACMD51");
        }
        self.send_register(&SCR)
    }

    fn send_register(&mut self, data: &[u8]) -> Option<Reply> {
        let status = self.card_status() | status::APP_CMD;
        self.state = CardState::Data;
        self.read_job = None;
        self.dat_out.clear();
        self.dat_out
            .extend(std::iter::repeat_n(TriStateBus::RELEASED, NCR + 48 + NAC));
        self.queue_block(data);
        Some(Reply::R1(status))
    }

    fn csd(&self) -> [u8; 16] {
        let c_size = (self.device.block_count() / 1024).saturating_sub(1) as u32;
        [
            0x40,
            0x0e,
            0x00,
            0x32,
            0x5b,
            0x59,
            0x00,
            ((c_size >> 16) & 0x3f) as u8,
            (c_size >> 8) as u8,
            c_size as u8,
            0x7f,
            0x80,
            0x0a,
            0x40,
            0x00,
            0x00,
        ]
    }

    // ========================================================================
    // Data lines
    // ========================================================================

    fn lanes(&self) -> usize {
        if self.wide { 4 } else { 1 }
    }

    fn send_block(&mut self, lba: u64) {
        let mut block = [0u8; BLOCK_SIZE];
        if let Err(e) = self.device.read_block(lba, &mut block) {
            warn!("SD card: reading block {} failed: {}", lba, e);
            self.status_flags |= status::ERROR;
        } else {
            trace!("SD card: sending block {}", lba);
        }
        self.queue_block(&block);
    }

    fn queue_block(&mut self, data: &[u8]) {
        if self.wide {
            let crcs = crc16_wide(data);
            self.dat_out.push_back(TriStateBus::nibble(0));
            for &byte in data {
                self.dat_out.push_back(TriStateBus::nibble(byte >> 4));
                self.dat_out.push_back(TriStateBus::nibble(byte & 0xf));
            }
            for bit in (0..16).rev() {
                let nibble = (0..4).fold(0u8, |acc, line| {
                    acc | (((crcs[line] >> bit) & 1) as u8) << line
                });
                self.dat_out.push_back(TriStateBus::nibble(nibble));
            }
            self.dat_out.push_back(TriStateBus::nibble(0xf));
        } else {
            let crc = super::crc::crc16(data);
            self.dat_out.push_back(TriStateBus::dat0(false));
            for &byte in data {
                self.dat_out
                    .extend(byte_bits(byte).into_iter().map(TriStateBus::dat0));
            }
            for bit in (0..16).rev() {
                self.dat_out.push_back(TriStateBus::dat0((crc >> bit) & 1 != 0));
            }
            self.dat_out.push_back(TriStateBus::dat0(true));
        }
    }

    /// Keep multi-block reads flowing and retire finished data states
    fn feed_data(&mut self) {
        if !self.dat_out.is_empty() {
            return;
        }
        match self.state {
            CardState::Data => match self.read_job {
                Some(job) if job.multi => {
                    if job.next_lba >= self.device.block_count() {
                        self.status_flags |= status::OUT_OF_RANGE;
                        self.read_job = None;
                        return;
                    }
                    self.dat_out
                        .extend(std::iter::repeat_n(TriStateBus::RELEASED, NAC));
                    self.send_block(job.next_lba);
                    self.read_job = Some(ReadJob {
                        next_lba: job.next_lba + 1,
                        multi: true,
                    });
                }
                _ => {
                    self.read_job = None;
                    self.state = CardState::Transfer;
                }
            },
            CardState::Program => {
                self.state = if self.write_job.is_some() {
                    CardState::Receive
                } else {
                    CardState::Transfer
                };
            }
            _ => {}
        }
    }

    fn receive_data(&mut self, dat: u8) {
        if self.state != CardState::Receive || !self.dat_out.is_empty() {
            return;
        }
        let Some(job) = self.write_job else {
            return;
        };
        let lanes = self.lanes();
        let data_clocks = BLOCK_SIZE * 8 / lanes;

        let Some(rx) = self.data_rx.as_mut() else {
            if dat & 1 == 0 {
                self.data_rx = Some(DataRx {
                    buf: Vec::with_capacity(BLOCK_SIZE),
                    count: 0,
                    crc_rx: [0; 4],
                });
            }
            return;
        };

        if rx.count < data_clocks {
            let pos = rx.count * lanes;
            if pos % 8 == 0 {
                rx.buf.push(0);
            }
            let value = if lanes == 4 { dat & 0xf } else { dat & 1 };
            if let Some(byte) = rx.buf.last_mut() {
                *byte |= value << (8 - lanes - pos % 8);
            }
        } else if rx.count < data_clocks + 16 {
            for (line, crc) in rx.crc_rx.iter_mut().enumerate().take(lanes) {
                *crc = (*crc << 1) | ((dat >> line) & 1) as u16;
            }
        }
        rx.count += 1;
        if rx.count <= data_clocks + 16 {
            return;
        }

        // End bit
        let Some(rx) = self.data_rx.take() else {
            return;
        };
        let expected = if lanes == 4 {
            crc16_wide(&rx.buf)
        } else {
            [super::crc::crc16(&rx.buf), 0, 0, 0]
        };
        let token: u8 = if expected != rx.crc_rx {
            warn!("SD card: CRC mismatch in block {}", job.lba);
            0b101
        } else if let Err(e) = self.device.write_block(job.lba, &rx.buf) {
            warn!("SD card: writing block {} failed: {}", job.lba, e);
            self.status_flags |= status::ERROR;
            0b110
        } else {
            trace!("SD card: wrote block {}", job.lba);
            0b010
        };

        self.dat_out
            .extend(std::iter::repeat_n(TriStateBus::RELEASED, NWR));
        self.dat_out.push_back(TriStateBus::dat0(false));
        for bit in (0..3).rev() {
            self.dat_out.push_back(TriStateBus::dat0((token >> bit) & 1 != 0));
        }
        self.dat_out.push_back(TriStateBus::dat0(true));
        self.dat_out
            .extend(std::iter::repeat_n(TriStateBus::dat0(false), PROGRAM_CYCLES));

        self.state = CardState::Program;
        self.write_job = job.multi.then_some(WriteJob {
            lba: job.lba + 1,
            multi: true,
        });
    }
}

const CID: [u8; 16] = [
    0x1d, b'T', b'S', b'T', b'A', b'N', b'G', b'S', 0x10, 0x12, 0x34, 0x56, 0x78, 0x01, 0x7a,
    0x00,
];

/// Fill in the CRC7 and end bit of a CID or CSD
fn with_crc(mut register: [u8; 16]) -> [u8; 16] {
    register[15] = (crc7(&register[..15]) << 1) | 1;
    register
}

fn byte_bits(byte: u8) -> [bool; 8] {
    std::array::from_fn(|i| (byte >> (7 - i)) & 1 != 0)
}

/// A 48-bit response: start, transmission bit (0), index, payload, CRC7 and end bit
fn short_frame(index: u8, payload: u32, with_crc: bool) -> Vec<bool> {
    let mut frame = [0u8; 6];
    frame[0] = index & 0x3f;
    frame[1..5].copy_from_slice(&payload.to_be_bytes());
    frame[5] = if with_crc {
        (crc7(&frame[..5]) << 1) | 1
    } else {
        0xff
    };
    frame.iter().flat_map(|&b| byte_bits(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::super::crc::command_frame;
    use super::*;

    /// Idle clocks between the end of a response and the next command
    const NRC: usize = 8;

    /// Drives the card's pads bit by bit, the way the controller does
    struct Host {
        card: SdCard,
    }

    impl Host {
        fn new(blocks: usize) -> Self {
            Self {
                card: SdCard::new(Box::new(MemoryBlockDevice::new(blocks))),
            }
        }

        fn clock(&mut self, cmd: bool, dat: u8) -> (TriState, TriStateBus) {
            let lines = SdLines {
                cmd: cmd && (!self.card.cmd_out().oe || self.card.cmd_out().o),
                dat: dat & (!self.card.dat_out().oe | self.card.dat_out().o) & 0xf,
            };
            self.card.tick(false, &lines);
            self.card.tick(true, &lines);
            (self.card.cmd_out(), self.card.dat_out())
        }

        /// Send a command after the `NRC` gap and collect `response_bits` bits of
        /// response
        fn command(&mut self, index: u8, arg: u32, response_bits: usize) -> Vec<bool> {
            for _ in 0..NRC {
                self.clock(true, 0xf);
            }
            for byte in command_frame(index, arg) {
                for bit in byte_bits(byte) {
                    self.clock(bit, 0xf);
                }
            }
            let mut response = Vec::new();
            let mut started = false;
            for _ in 0..(response_bits + 16) {
                let (cmd, _) = self.clock(true, 0xf);
                if cmd.oe && (started || !cmd.o) {
                    started = true;
                    response.push(cmd.o);
                }
                if response.len() == response_bits {
                    break;
                }
            }
            response
        }

        fn payload(bits: &[bool]) -> u32 {
            bits[8..40].iter().fold(0, |acc, &b| (acc << 1) | b as u32)
        }

        fn initialize(&mut self) {
            self.command(0, 0, 0);
            assert_eq!(Self::payload(&self.command(8, 0x1aa, 48)), 0x1aa);
            loop {
                self.command(55, 0, 48);
                let ocr = Self::payload(&self.command(41, 0x40ff_8000, 48));
                if ocr & ocr::READY != 0 {
                    assert_ne!(ocr & ocr::CCS, 0);
                    break;
                }
            }
            assert_eq!(self.command(2, 0, 136).len(), 136);
            let r6 = Self::payload(&self.command(3, 0, 48));
            assert_eq!(r6 >> 16, RCA as u32);
            self.command(7, (RCA as u32) << 16, 48);
            assert_eq!(self.card.state(), CardState::Transfer);
        }
    }

    #[test]
    fn response_frames_carry_valid_crc() {
        let mut host = Host::new(4);
        host.command(0, 0, 0);
        let r7 = host.command(8, 0x1aa, 48);
        let bytes: Vec<u8> = r7
            .chunks(8)
            .map(|c| c.iter().fold(0u8, |acc, &b| (acc << 1) | b as u8))
            .collect();
        assert_eq!(bytes[0], 8);
        assert_eq!(bytes[5], (crc7(&bytes[..5]) << 1) | 1);
    }

    #[test]
    fn power_up_reports_busy_first() {
        let mut host = Host::new(4);
        host.command(0, 0, 0);
        host.command(55, 0, 48);
        let ocr = Host::payload(&host.command(41, 0x40ff_8000, 48));
        assert_eq!(ocr & ocr::READY, 0);
        assert_eq!(host.card.state(), CardState::Idle);
    }

    #[test]
    fn identification_reaches_transfer_state() {
        let mut host = Host::new(2048);
        host.initialize();
        // CMD13 reports transfer state and ready for data
        let status = Host::payload(&host.command(13, (RCA as u32) << 16, 48));
        assert_eq!((status >> 9) & 0xf, CardState::Transfer as u32);
        assert_ne!(status & status::READY_FOR_DATA, 0);
    }

    #[test]
    fn command_overlapping_a_response_is_not_received() {
        let mut host = Host::new(4);
        host.command(0, 0, 0);
        assert_eq!(host.command(55, 0, 48).len(), 48);
        let received = host.card.commands();

        // Start bit on the clock right after the last response bit: the card is
        // still driving the line and does not listen
        for byte in command_frame(13, (RCA as u32) << 16) {
            for bit in byte_bits(byte) {
                host.clock(bit, 0xf);
            }
        }
        for _ in 0..64 {
            host.clock(true, 0xf);
        }
        assert_eq!(host.card.commands(), received);

        // After the gap the card answers again
        host.command(0, 0, 0);
        assert_eq!(host.card.commands(), received + 1);
        assert_eq!(Host::payload(&host.command(8, 0x1aa, 48)), 0x1aa);
    }

    #[test]
    fn bad_command_crc_gets_no_response() {
        let mut host = Host::new(4);
        let mut frame = command_frame(8, 0x1aa);
        frame[5] ^= 0x02;
        for byte in frame {
            for bit in byte_bits(byte) {
                host.clock(bit, 0xf);
            }
        }
        for _ in 0..16 {
            let (cmd, _) = host.clock(true, 0xf);
            assert!(!cmd.oe);
        }
        assert_eq!(host.card.commands(), 0);
    }

    #[test]
    fn single_block_read_streams_data_and_crc() {
        let mut host = Host::new(4);
        let pattern: Vec<u8> = (0..BLOCK_SIZE).map(|n| n as u8).collect();
        host.card.device().write_block(2, &pattern).unwrap();
        host.initialize();

        host.command(17, 2, 48);
        let mut bits = Vec::new();
        let mut started = false;
        for _ in 0..(BLOCK_SIZE * 8 + 64) {
            let (_, dat) = host.clock(true, 0xf);
            if dat.oe & 1 != 0 && (started || dat.o & 1 == 0) {
                started = true;
                bits.push(dat.o & 1 != 0);
            }
        }
        assert!(bits.len() >= 1 + BLOCK_SIZE * 8 + 17);
        let data: Vec<u8> = bits[1..1 + BLOCK_SIZE * 8]
            .chunks(8)
            .map(|c| c.iter().fold(0u8, |acc, &b| (acc << 1) | b as u8))
            .collect();
        assert_eq!(data, pattern);
        let crc = bits[1 + BLOCK_SIZE * 8..1 + BLOCK_SIZE * 8 + 16]
            .iter()
            .fold(0u16, |acc, &b| (acc << 1) | b as u16);
        assert_eq!(crc, super::super::crc::crc16(&pattern));
        assert_eq!(host.card.state(), CardState::Transfer);
    }

    #[test]
    fn out_of_range_read_is_flagged() {
        let mut host = Host::new(2);
        host.initialize();
        let status = Host::payload(&host.command(17, 2, 48));
        assert_ne!(status & status::OUT_OF_RANGE, 0);
        assert_eq!(host.card.state(), CardState::Transfer);
    }
}
