//! Behavioral model of the wrapped SD host controller (opencores `sdc_controller`).
//!
//! The controller is clocked by the system clock and divides it down to `sd_clk`. Its
//! command engine shifts 48-bit frames out on the command line and collects 48- or
//! 136-bit responses; its data engine moves blocks between the data lines and main
//! memory through a Wishbone DMA master. The SD clock is stopped while the DMA engine
//! owns the block buffer.

use super::crc::{command_frame, crc7, crc16, crc16_wide};
use super::pins::{SdLines, SdPads, TriState, TriStateBus};
use crate::wishbone::{Request, Response};
use tangsoc_hw::mmio::sdc::{cmd_events, command, data_events, defaults, registers};
use tracing::{debug, trace, warn};

/// DMA beats per Wishbone burst
const BURST_BEATS: usize = 16;
/// SD clocks a busy signal needs to appear on DAT0
const BUSY_SETTLE: u32 = 2;
/// SD clocks between the end of the command and the first write block
const WRITE_GAP: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmaDirection {
    ToMemory,
    FromMemory,
}

/// Wishbone DMA master: moves one block buffer per job
#[derive(Debug, Clone)]
struct Dma {
    direction: DmaDirection,
    base: u32,
    words: Vec<u32>,
    index: usize,
    active: bool,
    /// Idle tick between bursts
    gap: bool,
}

enum DmaEvent {
    Pending,
    Done,
    Error,
}

impl Dma {
    fn new() -> Self {
        Self {
            direction: DmaDirection::ToMemory,
            base: 0,
            words: Vec::new(),
            index: 0,
            active: false,
            gap: false,
        }
    }

    fn start(&mut self, direction: DmaDirection, base: u32, words: Vec<u32>) {
        trace!(?direction, base, words = words.len(), "dma start");
        self.direction = direction;
        self.base = base;
        self.words = words;
        self.index = 0;
        self.active = true;
        self.gap = false;
    }

    fn request(&self) -> Request {
        if !self.active || self.gap || self.index >= self.words.len() {
            return Request::idle();
        }
        let adr = self.base.wrapping_add(4 * self.index as u32) >> 2;
        let last = self.index + 1 == self.words.len() || (self.index + 1) % BURST_BEATS == 0;
        let req = match self.direction {
            DmaDirection::ToMemory => Request::write(adr, self.words[self.index], 0xf),
            DmaDirection::FromMemory => Request::read(adr, 0xf),
        };
        req.with_burst(last)
    }

    fn update(&mut self, resp: &Response) -> DmaEvent {
        if !self.active {
            return DmaEvent::Pending;
        }
        if self.gap {
            self.gap = false;
            return DmaEvent::Pending;
        }
        if resp.err {
            warn!(
                "SD DMA bus error at {:#010x}",
                self.base.wrapping_add(4 * self.index as u32)
            );
            self.active = false;
            return DmaEvent::Error;
        }
        if !resp.ack {
            return DmaEvent::Pending;
        }
        if self.direction == DmaDirection::FromMemory {
            self.words[self.index] = resp.dat_r;
        }
        self.index += 1;
        if self.index == self.words.len() {
            self.active = false;
            DmaEvent::Done
        } else {
            self.gap = self.index % BURST_BEATS == 0;
            DmaEvent::Pending
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdState {
    Idle,
    Send { frame: u64, bit: u32 },
    WaitResponse { waited: u32 },
    Response { bits: u128, count: u32, total: u32 },
    WaitBusy { waited: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DataState {
    Idle,
    ReadWait { waited: u32 },
    ReadBlock { count: usize },
    ReadDma,
    WriteDma,
    WriteSend,
    WriteToken { waited: u32 },
    WriteStatus { bits: u8, count: u32 },
    WriteBusy { waited: u32 },
}

#[derive(Debug, Clone)]
pub struct SdController {
    // Registers
    argument: u32,
    command: u32,
    resp: [u32; 4],
    data_timeout: u32,
    control: u32,
    cmd_timeout: u32,
    clock_divider: u32,
    reset: u32,
    cmd_isr: u32,
    cmd_iser: u32,
    data_isr: u32,
    data_iser: u32,
    block_size: u32,
    block_count: u32,
    dma_address: u32,

    // Internal state
    clk_count: u32,
    pads: SdPads,
    cmd_state: CmdState,
    data_state: DataState,
    write_pending: bool,
    block: u32,
    buffer: Vec<u8>,
    tx: std::collections::VecDeque<TriStateBus>,
    dma: Dma,
}

impl Default for SdController {
    fn default() -> Self {
        Self::new()
    }
}

impl SdController {
    pub fn new() -> Self {
        Self {
            argument: 0,
            command: 0,
            resp: [0; 4],
            data_timeout: defaults::DATA_TIMEOUT,
            control: 0,
            cmd_timeout: defaults::CMD_TIMEOUT,
            clock_divider: defaults::CLOCK_DIVIDER,
            reset: 0,
            cmd_isr: 0,
            cmd_iser: 0,
            data_isr: 0,
            data_iser: 0,
            block_size: defaults::BLOCK_SIZE,
            block_count: 0,
            dma_address: 0,
            clk_count: 0,
            pads: SdPads::default(),
            cmd_state: CmdState::Idle,
            data_state: DataState::Idle,
            write_pending: false,
            block: 0,
            buffer: Vec::new(),
            tx: std::collections::VecDeque::new(),
            dma: Dma::new(),
        }
    }

    /// Handle a register read; `offset` is byte-style
    pub fn read(&self, offset: u32) -> u32 {
        trace!("SD controller register read: offset={:#x}", offset);
        match offset {
            registers::ARGUMENT => self.argument,
            registers::COMMAND => self.command,
            registers::RESP0 => self.resp[0],
            registers::RESP1 => self.resp[1],
            registers::RESP2 => self.resp[2],
            registers::RESP3 => self.resp[3],
            registers::DATA_TIMEOUT => self.data_timeout,
            registers::CONTROL => self.control,
            registers::CMD_TIMEOUT => self.cmd_timeout,
            registers::CLOCK_DIVIDER => self.clock_divider,
            registers::RESET => self.reset,
            registers::VOLTAGE => defaults::VOLTAGE,
            registers::CAPABILITIES => defaults::CAPABILITIES,
            registers::CMD_ISR => self.cmd_isr,
            registers::CMD_ISER => self.cmd_iser,
            registers::DATA_ISR => self.data_isr,
            registers::DATA_ISER => self.data_iser,
            registers::BLOCK_SIZE => self.block_size,
            registers::BLOCK_COUNT => self.block_count,
            registers::DMA_ADDRESS => self.dma_address,
            _ => {
                warn!("Unknown SD controller register read: offset={:#x}", offset);
                0
            }
        }
    }

    /// Handle a register write; `offset` is byte-style
    pub fn write(&mut self, offset: u32, value: u32) {
        trace!(
            "SD controller register write: offset={:#x}, value={:#x}",
            offset, value
        );
        match offset {
            registers::ARGUMENT => {
                self.argument = value;
                self.start_command();
            }
            registers::COMMAND => self.command = value & 0x3f7f,
            registers::DATA_TIMEOUT => self.data_timeout = value & 0xffff,
            registers::CONTROL => {
                self.control = value & 1;
                debug!("SD bus width {}", if self.wide() { 4 } else { 1 });
            }
            registers::CMD_TIMEOUT => self.cmd_timeout = value & 0xffff,
            registers::CLOCK_DIVIDER => {
                self.clock_divider = value & 0xff;
                debug!("SD clock divider {}", self.clock_divider);
            }
            registers::RESET => {
                self.reset = value & 1;
                if self.reset != 0 {
                    debug!("SD controller software reset");
                    self.abort();
                }
            }
            registers::CMD_ISR => self.cmd_isr = 0,
            registers::CMD_ISER => self.cmd_iser = value & 0x1f,
            registers::DATA_ISR => self.data_isr = 0,
            registers::DATA_ISER => self.data_iser = value & 0x1f,
            registers::BLOCK_SIZE => self.block_size = value & 0xfff,
            registers::BLOCK_COUNT => self.block_count = value & 0xffff,
            registers::DMA_ADDRESS => self.dma_address = value,
            registers::VOLTAGE | registers::CAPABILITIES => {
                debug!("write to read-only SD controller register {:#x}", offset)
            }
            _ => warn!(
                "Unknown SD controller register write: offset={:#x}, value={:#x}",
                offset, value
            ),
        }
    }

    /// Command-complete interrupt source
    pub fn int_cmd(&self) -> bool {
        self.cmd_isr & self.cmd_iser != 0
    }

    /// Data-complete interrupt source
    pub fn int_data(&self) -> bool {
        self.data_isr & self.data_iser != 0
    }

    pub fn pads(&self) -> SdPads {
        self.pads
    }

    /// The DMA master's request this tick
    pub fn dma_request(&self) -> Request {
        self.dma.request()
    }

    pub fn command_busy(&self) -> bool {
        self.cmd_state != CmdState::Idle
    }

    pub fn data_busy(&self) -> bool {
        self.data_state != DataState::Idle
    }

    /// One system clock tick. `lines` are the pad levels before this tick's edge and
    /// `dma_resp` the fabric's answer to [`SdController::dma_request`]. Returns whether
    /// `sd_clk` rose.
    pub fn tick(&mut self, lines: &SdLines, dma_resp: &Response) -> bool {
        match self.dma.update(dma_resp) {
            DmaEvent::Pending => {}
            DmaEvent::Done => self.dma_done(),
            DmaEvent::Error => self.data_finish(data_events::BUS),
        }

        if self.reset != 0 || self.dma.active {
            return false;
        }
        self.clk_count += 1;
        if self.clk_count <= self.clock_divider {
            return false;
        }
        self.clk_count = 0;
        self.pads.clk = !self.pads.clk;
        if !self.pads.clk {
            return false;
        }

        self.cmd_step(lines);
        self.data_step(lines);
        true
    }

    fn wide(&self) -> bool {
        self.control & 1 != 0
    }

    fn lanes(&self) -> usize {
        if self.wide() { 4 } else { 1 }
    }

    fn block_len(&self) -> usize {
        self.block_size as usize + 1
    }

    fn abort(&mut self) {
        self.cmd_state = CmdState::Idle;
        self.data_state = DataState::Idle;
        self.write_pending = false;
        self.dma.active = false;
        self.tx.clear();
        self.pads.cmd = TriState::RELEASED;
        self.pads.dat = TriStateBus::RELEASED;
    }

    // ========================================================================
    // Command engine
    // ========================================================================

    fn start_command(&mut self) {
        if self.reset != 0 {
            warn!("SD command ignored while in software reset");
            return;
        }
        if self.cmd_state != CmdState::Idle {
            warn!("SD command ignored, previous command still running");
            return;
        }
        let index = ((self.command >> command::INDEX_SHIFT) & command::INDEX_MASK) as u8;
        debug!(
            "SD CMD{} arg={:#x} setup={:#x}",
            index, self.argument, self.command
        );
        let frame = command_frame(index, self.argument)
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64);
        self.cmd_state = CmdState::Send { frame, bit: 0 };

        self.block = 0;
        match self.command & command::DATA_MASK {
            command::DATA_READ => self.data_state = DataState::ReadWait { waited: 0 },
            command::DATA_WRITE => self.write_pending = true,
            _ => {}
        }
    }

    fn cmd_step(&mut self, lines: &SdLines) {
        self.cmd_state = match self.cmd_state {
            CmdState::Idle => CmdState::Idle,
            CmdState::Send { frame, bit } if bit < 48 => {
                self.pads.cmd = TriState::drive((frame >> (47 - bit)) & 1 != 0);
                CmdState::Send {
                    frame,
                    bit: bit + 1,
                }
            }
            CmdState::Send { .. } => {
                self.pads.cmd = TriState::RELEASED;
                if self.command & command::RESPONSE_MASK == command::RESPONSE_NONE {
                    self.cmd_finish(0);
                    CmdState::Idle
                } else {
                    CmdState::WaitResponse { waited: 0 }
                }
            }
            CmdState::WaitResponse { waited } => {
                if !lines.cmd {
                    let total = if self.command & command::RESPONSE_MASK
                        == command::RESPONSE_LONG
                    {
                        136
                    } else {
                        48
                    };
                    CmdState::Response {
                        bits: 0,
                        count: 1,
                        total,
                    }
                } else if waited + 1 >= self.cmd_timeout {
                    warn!("SD command response timeout");
                    self.cmd_finish(cmd_events::TIMEOUT);
                    CmdState::Idle
                } else {
                    CmdState::WaitResponse { waited: waited + 1 }
                }
            }
            CmdState::Response { bits, count, total } => {
                let bits = (bits << 1) | lines.cmd as u128;
                if count + 1 < total {
                    CmdState::Response {
                        bits,
                        count: count + 1,
                        total,
                    }
                } else {
                    let errors = self.store_response(bits, total);
                    let busy = self.command & command::RESPONSE_MASK
                        == command::RESPONSE_SHORT_BUSY
                        || self.command & command::BUSY_CHECK != 0;
                    if errors == 0 && busy {
                        CmdState::WaitBusy { waited: 0 }
                    } else {
                        self.cmd_finish(errors);
                        CmdState::Idle
                    }
                }
            }
            CmdState::WaitBusy { waited } => {
                if waited >= BUSY_SETTLE && lines.dat0() {
                    self.cmd_finish(0);
                    CmdState::Idle
                } else if waited >= self.data_timeout {
                    warn!("SD card busy timeout");
                    self.cmd_finish(cmd_events::TIMEOUT);
                    CmdState::Idle
                } else {
                    CmdState::WaitBusy { waited: waited + 1 }
                }
            }
        };
    }

    /// Latch the response registers; returns error event bits
    fn store_response(&mut self, bits: u128, total: u32) -> u32 {
        let mut errors = 0;
        if total == 136 {
            // The header shifted out of the top; what is left is the register itself
            let reg = bits.to_be_bytes();
            self.resp = [
                (bits >> 96) as u32,
                (bits >> 64) as u32,
                (bits >> 32) as u32,
                bits as u32,
            ];
            if self.command & command::CRC_CHECK != 0 && crc7(&reg[..15]) != reg[15] >> 1 {
                errors |= cmd_events::CRC;
            }
        } else {
            let frame = (bits as u64).to_be_bytes();
            let body = &frame[2..7];
            self.resp[0] = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
            let index = (body[0] & 0x3f) as u32;
            let expected = (self.command >> command::INDEX_SHIFT) & command::INDEX_MASK;
            if self.command & command::CRC_CHECK != 0 && crc7(body) != frame[7] >> 1 {
                errors |= cmd_events::CRC;
            }
            if self.command & command::INDEX_CHECK != 0 && index != expected {
                errors |= cmd_events::INDEX;
            }
        }
        if errors != 0 {
            warn!("SD response error {:#x}", errors);
        }
        errors
    }

    fn cmd_finish(&mut self, errors: u32) {
        let errors = if errors != 0 {
            errors | cmd_events::ERROR
        } else {
            0
        };
        self.cmd_isr |= cmd_events::COMPLETE | errors;
        trace!(isr = self.cmd_isr, "SD command complete");

        if errors != 0 {
            if self.data_state != DataState::Idle || self.write_pending {
                self.write_pending = false;
                self.data_finish(data_events::ERROR);
            }
        } else if std::mem::take(&mut self.write_pending) {
            self.start_write_dma();
        }
    }

    // ========================================================================
    // Data engine
    // ========================================================================

    fn block_address(&self) -> u32 {
        self.dma_address
            .wrapping_add(self.block * self.block_len() as u32)
    }

    fn start_write_dma(&mut self) {
        let words = vec![0; self.block_len().div_ceil(4)];
        self.dma
            .start(DmaDirection::FromMemory, self.block_address(), words);
        self.data_state = DataState::WriteDma;
    }

    fn dma_done(&mut self) {
        match self.data_state {
            DataState::ReadDma => {
                self.block += 1;
                if self.block > self.block_count {
                    self.data_finish(0);
                } else {
                    self.data_state = DataState::ReadWait { waited: 0 };
                }
            }
            DataState::WriteDma => {
                let len = self.block_len();
                let data: Vec<u8> = self
                    .dma
                    .words
                    .iter()
                    .flat_map(|w| w.to_le_bytes())
                    .take(len)
                    .collect();
                self.queue_block(&data);
                self.data_state = DataState::WriteSend;
            }
            _ => {}
        }
    }

    fn queue_block(&mut self, data: &[u8]) {
        self.tx.clear();
        self.tx
            .extend(std::iter::repeat_n(TriStateBus::RELEASED, WRITE_GAP));
        if self.wide() {
            let crcs = crc16_wide(data);
            self.tx.push_back(TriStateBus::nibble(0));
            for &byte in data {
                self.tx.push_back(TriStateBus::nibble(byte >> 4));
                self.tx.push_back(TriStateBus::nibble(byte & 0xf));
            }
            for bit in (0..16).rev() {
                let nibble = (0..4).fold(0u8, |acc, line| {
                    acc | (((crcs[line] >> bit) & 1) as u8) << line
                });
                self.tx.push_back(TriStateBus::nibble(nibble));
            }
            self.tx.push_back(TriStateBus::nibble(0xf));
        } else {
            let crc = crc16(data);
            self.tx.push_back(TriStateBus::dat0(false));
            for &byte in data {
                for bit in (0..8).rev() {
                    self.tx.push_back(TriStateBus::dat0((byte >> bit) & 1 != 0));
                }
            }
            for bit in (0..16).rev() {
                self.tx.push_back(TriStateBus::dat0((crc >> bit) & 1 != 0));
            }
            self.tx.push_back(TriStateBus::dat0(true));
        }
    }

    fn data_finish(&mut self, errors: u32) {
        let errors = if errors != 0 {
            errors | data_events::ERROR
        } else {
            0
        };
        self.data_isr |= data_events::COMPLETE | errors;
        self.data_state = DataState::Idle;
        self.tx.clear();
        self.pads.dat = TriStateBus::RELEASED;
        if errors != 0 {
            warn!(block = self.block, "SD data transfer failed: {:#x}", errors);
        } else {
            debug!(blocks = self.block, "SD data transfer complete");
        }
    }

    fn data_step(&mut self, lines: &SdLines) {
        let lanes = self.lanes();
        let block_len = self.block_len();
        match self.data_state.clone() {
            DataState::Idle | DataState::ReadDma | DataState::WriteDma => {}
            DataState::ReadWait { waited } => {
                if !lines.dat0() {
                    self.buffer.clear();
                    self.data_state = DataState::ReadBlock { count: 0 };
                } else if waited + 1 >= self.data_timeout {
                    self.data_finish(data_events::TIMEOUT);
                } else {
                    self.data_state = DataState::ReadWait { waited: waited + 1 };
                }
            }
            DataState::ReadBlock { count } => {
                let data_clocks = block_len * 8 / lanes;
                if count < data_clocks {
                    let pos = count * lanes;
                    if pos % 8 == 0 {
                        self.buffer.push(0);
                    }
                    let value = if lanes == 4 { lines.dat & 0xf } else { lines.dat & 1 };
                    if let Some(byte) = self.buffer.last_mut() {
                        *byte |= value << (8 - lanes - pos % 8);
                    }
                    self.data_state = DataState::ReadBlock { count: count + 1 };
                } else if count < data_clocks + 16 {
                    // CRC bits go into the top of the buffer tail
                    self.buffer.push(lines.dat & 0xf);
                    self.data_state = DataState::ReadBlock { count: count + 1 };
                } else {
                    self.read_block_done(block_len, lanes);
                }
            }
            DataState::WriteSend => match self.tx.pop_front() {
                Some(drive) => self.pads.dat = drive,
                None => {
                    self.pads.dat = TriStateBus::RELEASED;
                    self.data_state = DataState::WriteToken { waited: 0 };
                }
            },
            DataState::WriteToken { waited } => {
                if !lines.dat0() {
                    self.data_state = DataState::WriteStatus { bits: 0, count: 0 };
                } else if waited + 1 >= self.data_timeout {
                    self.data_finish(data_events::TIMEOUT);
                } else {
                    self.data_state = DataState::WriteToken { waited: waited + 1 };
                }
            }
            DataState::WriteStatus { bits, count } => {
                if count < 3 {
                    self.data_state = DataState::WriteStatus {
                        bits: (bits << 1) | lines.dat0() as u8,
                        count: count + 1,
                    };
                } else if bits == 0b010 {
                    self.data_state = DataState::WriteBusy { waited: 0 };
                } else {
                    warn!("SD card rejected block {}: token {:#05b}", self.block, bits);
                    self.data_finish(data_events::CRC);
                }
            }
            DataState::WriteBusy { waited } => {
                if waited >= BUSY_SETTLE && lines.dat0() {
                    self.block += 1;
                    if self.block > self.block_count {
                        self.data_finish(0);
                    } else {
                        self.start_write_dma();
                    }
                } else if waited >= self.data_timeout {
                    self.data_finish(data_events::TIMEOUT);
                } else {
                    self.data_state = DataState::WriteBusy { waited: waited + 1 };
                }
            }
        }
    }

    /// End bit of a read block: check the CRCs and hand the block to the DMA engine
    fn read_block_done(&mut self, block_len: usize, lanes: usize) {
        let crc_clocks = self.buffer.split_off(block_len);
        let mut received = [0u16; 4];
        for sample in crc_clocks {
            for (line, crc) in received.iter_mut().enumerate().take(lanes) {
                *crc = (*crc << 1) | ((sample >> line) & 1) as u16;
            }
        }
        let expected = if lanes == 4 {
            crc16_wide(&self.buffer)
        } else {
            [crc16(&self.buffer), 0, 0, 0]
        };
        if expected != received {
            warn!(
                "SD read CRC mismatch in block {}: {:04x?} != {:04x?}",
                self.block, received, expected
            );
            self.data_finish(data_events::CRC);
            return;
        }
        trace!(block = self.block, "SD block received");
        let words = self
            .buffer
            .chunks(4)
            .map(|c| {
                let mut word = [0u8; 4];
                word[..c.len()].copy_from_slice(c);
                u32::from_le_bytes(word)
            })
            .collect();
        self.dma
            .start(DmaDirection::ToMemory, self.block_address(), words);
        self.data_state = DataState::ReadDma;
    }
}
