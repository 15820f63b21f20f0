//! Whole-SoC scenarios on small video timings and short reset counts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tangsoc::core::rom_word;
use tangsoc::crg::{ClockPlan, Derivation};
use tangsoc::emu_core::CoreInputs;
use tangsoc::firmware::{BootImage, R1, SdDriver};
use tangsoc::sdcard::card::BLOCK_SIZE;
use tangsoc::video::{PixelSample, Slot0Mode};
use tangsoc::wishbone::Request;
use tangsoc::{
    CrgConfig, DemoCore, EmulationCore, FeatureSet, HostBus, MemoryBlockDevice, Rgb, Soc,
    SocConfig, SocError, VideoPolicy, VideoTimings,
};
use tangsoc_hw::memory_map;
use tangsoc_hw::mmio::csr::{registers as csr_registers, wbsdcard_events};
use tangsoc_hw::specs::clocks;

const WINDOW_PIXELS: u32 = 48;

fn small_config() -> SocConfig {
    SocConfig {
        crg: CrgConfig {
            por_cycles: 16,
            pll_lock_cycles: 4,
        },
        timings: VideoTimings {
            pixel_hz: clocks::HDMI_HZ,
            hres: 64,
            hsync_start: 66,
            hsync_end: 70,
            hscan: 80,
            vres: 16,
            vsync_start: 17,
            vsync_end: 18,
            vscan: 20,
        },
        policy: Some(VideoPolicy {
            window_x_start: 7,
            window_x_end: 8 + WINDOW_PIXELS,
            ..VideoPolicy::tang_nano_20k()
        }),
        bus_timeout: 4096,
        ..SocConfig::default()
    }
}

/// Card of `blocks` blocks where every byte of block n is `n` xor its offset
fn patterned_card(blocks: usize) -> MemoryBlockDevice {
    let image = (0..blocks * BLOCK_SIZE)
        .map(|i| ((i / BLOCK_SIZE) ^ (i % BLOCK_SIZE)) as u8)
        .collect();
    MemoryBlockDevice::from_image(image)
}

/// Core that reads ROM words `0..words` over and over, while enabled, and logs every
/// answer
struct RomReader {
    words: u32,
    next: u32,
    enabled: Rc<Cell<bool>>,
    log: Rc<RefCell<Vec<(u32, u16)>>>,
}

impl RomReader {
    fn new(words: u32, enabled: Rc<Cell<bool>>, log: Rc<RefCell<Vec<(u32, u16)>>>) -> Self {
        Self {
            words,
            next: 0,
            enabled,
            log,
        }
    }
}

impl EmulationCore for RomReader {
    fn rom_request(&self) -> Request {
        if self.enabled.get() {
            Request::read(self.next, 0b11)
        } else {
            Request::idle()
        }
    }

    fn pixel(&self) -> Option<Rgb> {
        None
    }

    fn tick(&mut self, inputs: &CoreInputs) {
        if inputs.rom.ack {
            self.log.borrow_mut().push((self.next, inputs.rom.dat_r as u16));
            self.next = (self.next + 1) % self.words;
        }
    }

    fn reset(&mut self) {
        self.next = 0;
    }
}

/// Core that answers every line request with `WINDOW_PIXELS` pixels of one color
struct LineCore {
    color: Rc<Cell<Rgb>>,
    remaining: u32,
    prev_line_ready: bool,
}

impl EmulationCore for LineCore {
    fn rom_request(&self) -> Request {
        Request::idle()
    }

    fn pixel(&self) -> Option<Rgb> {
        (self.remaining > 0).then(|| self.color.get())
    }

    fn tick(&mut self, inputs: &CoreInputs) {
        if self.remaining > 0 && inputs.pixel_accepted {
            self.remaining -= 1;
        }
        if inputs.line_ready && !self.prev_line_ready && self.remaining == 0 {
            self.remaining = WINDOW_PIXELS;
        }
        self.prev_line_ready = inputs.line_ready;
    }

    fn reset(&mut self) {
        self.remaining = 0;
        self.prev_line_ready = false;
    }
}

fn frame_steps(config: &SocConfig) -> u64 {
    // hdmi ticks every fifth scheduler step, plus slack for the crystal's edges
    config.timings.frame_ticks() * 6
}

#[test]
fn clock_plan_divides_or_synthesizes_sys() {
    let divided = ClockPlan::tang_nano_20k(clocks::SYS_HZ).unwrap();
    let sys = divided.spec(divided.require("sys").unwrap());
    assert!(matches!(sys.derivation, Derivation::Divided { ratio: 2, .. }));

    let legacy = ClockPlan::tang_nano_20k(clocks::SYS_HZ_LEGACY).unwrap();
    let sys = legacy.spec(legacy.require("sys").unwrap());
    assert_eq!(sys.derivation, Derivation::Synthesized);
}

#[test]
fn external_reset_holds_only_the_system_domain() {
    let mut soc = Soc::new(small_config(), FeatureSet::new()).unwrap();
    soc.wait_for_reset_release(10_000).unwrap();
    soc.write32(memory_map::main_ram::BASE, 0x1234_5678).unwrap();

    soc.set_external_reset(true);
    let before = soc.stats();
    for _ in 0..2000 {
        soc.step();
    }
    let held = soc.stats();
    assert_eq!(held.sys_ticks, before.sys_ticks);
    assert!(held.hdmi_ticks > before.hdmi_ticks);

    soc.set_external_reset(false);
    soc.wait_for_reset_release(10_000).unwrap();
    // SDRAM contents survive a system reset
    assert_eq!(soc.read32(memory_map::main_ram::BASE).unwrap(), 0x1234_5678);
    assert!(soc.stats().sys_ticks > held.sys_ticks);
}

#[test]
fn host_access_after_a_power_cycle_waits_for_reset_release() {
    let mut soc = Soc::new(small_config(), FeatureSet::new()).unwrap();
    soc.wait_for_reset_release(10_000).unwrap();
    soc.power_cycle();
    assert!(!soc.out_of_reset());
    // The access waits for the sequencer and then completes
    soc.write32(memory_map::csr::BASE, 3).unwrap();
    assert!(soc.out_of_reset());
    assert_eq!(soc.selector_register().get(), 3);
}

#[test]
fn pattern_slot_is_deterministic() {
    let config = SocConfig {
        selector: 2,
        ..small_config()
    };
    let steps = frame_steps(&config);
    let frames = |config: SocConfig| {
        let mut soc = Soc::new(config, FeatureSet::new()).unwrap();
        let mut samples: Vec<PixelSample> = Vec::new();
        for _ in 0..steps * 2 {
            soc.step();
            samples.push(soc.last_sample());
        }
        (samples, soc.sink().framebuffer().to_vec())
    };

    let (first, first_fb) = frames(config.clone());
    let (second, second_fb) = frames(config.clone());
    assert_eq!(first, second);
    assert_eq!(first_fb, second_fb);

    let (reseeded, _) = frames(SocConfig {
        prbs_seed: 0x1234,
        ..config
    });
    assert_ne!(first, reseeded);
}

#[test]
fn constant_slots_follow_the_csr() {
    let config = small_config();
    let policy = config.policy.unwrap();
    let steps = frame_steps(&config);
    let mut soc = Soc::new(config, FeatureSet::new()).unwrap();

    soc.write32(memory_map::csr::BASE, 4).unwrap();
    assert_eq!(soc.read32(memory_map::csr::BASE).unwrap(), 4);
    assert!(soc.step_frame(steps));
    assert!(soc.step_frame(steps));
    assert_eq!(soc.sink().pixel(20, 3), Some(policy.slot4_color));

    for select in [5u8, 0x80, 0xff] {
        soc.write32(memory_map::csr::BASE, select as u32).unwrap();
        assert!(soc.step_frame(steps));
        assert!(soc.step_frame(steps));
        assert_eq!(soc.sink().pixel(20, 3), Some(policy.fallback_color));
        assert_eq!(soc.sink().pixel(63, 15), Some(policy.fallback_color));
    }
}

#[test]
fn queued_core_pixels_fill_the_window() {
    let config = small_config();
    assert_eq!(config.policy.unwrap().slot0, Slot0Mode::QueueGated);
    let steps = frame_steps(&config);
    let core = DemoCore::new(0).with_line_pixels(WINDOW_PIXELS);
    let mut soc = Soc::new(
        config,
        FeatureSet::new().with_emulation_core(Box::new(core)),
    )
    .unwrap();
    let red: u16 = 0xf800;
    let palette: Vec<u8> = std::iter::repeat_n(red.to_le_bytes(), 64)
        .flatten()
        .collect();
    soc.load_main_ram(0, &palette).unwrap();

    for _ in 0..4 {
        assert!(soc.step_frame(steps));
    }
    let sink = soc.sink();
    assert_eq!(sink.pixel(20, 3), Some(Rgb::from_rgb565(red)));
    assert_eq!(sink.pixel(40, 10), Some(Rgb::from_rgb565(red)));
    // Outside the window the gated slot shows black
    assert_eq!(sink.pixel(2, 3), Some(Rgb::BLACK));
    assert!(soc.pixel_queue().write_level() <= tangsoc_hw::specs::video::PIXEL_QUEUE_DEPTH);
    assert!(soc.stats().rom_relayed >= 64);
}

#[test]
fn sd_dma_read_is_visible_through_the_rom_bridge() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let enabled = Rc::new(Cell::new(false));
    let reader = RomReader::new(256, enabled.clone(), log.clone());
    let features = FeatureSet::new()
        .with_sdcard(Box::new(patterned_card(2048)))
        .with_emulation_core(Box::new(reader));
    let mut soc = Soc::new(small_config(), features).unwrap();

    let copied = soc
        .sd_boot(&BootImage::Raw { lba: 5, blocks: 1 }, 0)
        .unwrap();
    assert_eq!(copied, BLOCK_SIZE);
    let expected: Vec<u8> = (0..BLOCK_SIZE).map(|i| (5 ^ i) as u8).collect();
    assert_eq!(&soc.main_ram()[..BLOCK_SIZE], &expected[..]);

    // The reader starts only once the image is in place
    assert!(log.borrow().is_empty());
    enabled.set(true);
    for _ in 0..200_000 {
        soc.step();
    }
    let log = log.borrow();
    assert!(log.len() >= 256, "only {} ROM reads", log.len());
    assert_eq!(log[0].0, 0);
    for &(word, data) in log.iter() {
        assert_eq!(Some(data), rom_word(soc.main_ram(), word), "ROM word {word}");
    }
}

#[test]
fn rom_reads_after_a_power_cycle_match_memory() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let reader = RomReader::new(64, Rc::new(Cell::new(true)), log.clone());
    let features = FeatureSet::new().with_emulation_core(Box::new(reader));
    let mut soc = Soc::new(small_config(), features).unwrap();
    let image: Vec<u8> = (0..256u32).map(|n| (n * 37 + 11) as u8).collect();
    soc.load_main_ram(0, &image).unwrap();

    // Cut power at a different point of a read each round
    for round in 0..8u64 {
        for _ in 0..5000 + 97 * round {
            soc.step();
        }
        soc.power_cycle();
        log.borrow_mut().clear();
        for _ in 0..20_000 {
            soc.step();
        }
        let log = log.borrow();
        assert!(!log.is_empty(), "round {round}: no ROM reads");
        assert_eq!(log[0].0, 0, "round {round}");
        for &(word, data) in log.iter() {
            assert_eq!(
                Some(data),
                rom_word(soc.main_ram(), word),
                "round {round}, ROM word {word}"
            );
        }
    }
}

#[test]
fn power_cycle_flushes_queued_pixels() {
    let config = small_config();
    let steps = frame_steps(&config);
    let red = Rgb::new(0xff, 0, 0);
    let blue = Rgb::new(0, 0, 0xff);
    let color = Rc::new(Cell::new(red));
    let core = LineCore {
        color: color.clone(),
        remaining: 0,
        prev_line_ready: false,
    };
    let features = FeatureSet::new().with_emulation_core(Box::new(core));
    let mut soc = Soc::new(config, features).unwrap();

    soc.wait_for_reset_release(10_000).unwrap();
    let mut waited = 0;
    while soc.pixel_queue().read_level() == 0 {
        soc.step();
        waited += 1;
        assert!(waited < steps * 4, "no pixels were ever queued");
    }

    color.set(blue);
    soc.power_cycle();
    assert_eq!(soc.pixel_queue().read_level(), 0);

    let mut hdmi_ticks = soc.stats().hdmi_ticks;
    let mut shown = 0;
    for _ in 0..steps * 3 {
        soc.step();
        let ticks = soc.stats().hdmi_ticks;
        if ticks == hdmi_ticks {
            continue;
        }
        hdmi_ticks = ticks;
        let sample = soc.last_sample();
        if sample.de {
            assert_ne!(sample.rgb(), red, "pixel queued before the power cycle shown");
            shown += (sample.rgb() == blue) as u32;
        }
    }
    assert!(shown > 0);
}

#[test]
fn sd_dma_write_reaches_the_card() {
    let features = FeatureSet::new().with_sdcard(Box::new(MemoryBlockDevice::new(2048)));
    let mut soc = Soc::new(small_config(), features).unwrap();
    let data: Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| (i * 13 + 1) as u8).collect();
    soc.load_main_ram(0x1000, &data).unwrap();

    {
        let mut driver = SdDriver::new(&mut soc);
        let card = driver.init_card().unwrap();
        assert!(card.high_capacity);
        assert_eq!(card.blocks, 2048);
        driver
            .write_blocks(3, 2, memory_map::main_ram::BASE + 0x1000)
            .unwrap();
    }

    let device = soc.sd_card_mut().unwrap().device();
    let mut block = vec![0u8; BLOCK_SIZE];
    for n in 0..2 {
        device.read_block(3 + n as u64, &mut block).unwrap();
        assert_eq!(&block[..], &data[n * BLOCK_SIZE..(n + 1) * BLOCK_SIZE]);
    }
    device.read_block(5, &mut block).unwrap();
    assert!(block.iter().all(|&b| b == 0));
}

#[test]
fn command_irq_fires_once_per_completion_until_acknowledged() {
    let features = FeatureSet::new().with_sdcard(Box::new(MemoryBlockDevice::new(2048)));
    let mut soc = Soc::new(small_config(), features).unwrap();
    let pending = memory_map::csr::BASE + csr_registers::WBSDCARD_EV_PENDING;
    let all = wbsdcard_events::INT_CMD | wbsdcard_events::INT_DATA;

    let mut driver = SdDriver::new(&mut soc).with_clock_divider(0);
    let card = driver.init_card().unwrap();
    let status_arg = (card.rca as u32) << 16;

    driver.bus().write32(pending, all).unwrap();
    assert_eq!(driver.bus().interrupts(), 0);
    let before = driver.bus().stats().sd_irqs;

    driver.command(13, status_arg, R1).unwrap();
    assert_eq!(driver.bus().read32(pending).unwrap(), wbsdcard_events::INT_CMD);
    assert_ne!(driver.bus().interrupts(), 0);
    assert_eq!(driver.bus().stats().sd_irqs, before + 1);

    // Still pending: a second completion does not raise a new edge
    driver.command(13, status_arg, R1).unwrap();
    assert_eq!(driver.bus().stats().sd_irqs, before + 1);

    driver.bus().write32(pending, wbsdcard_events::INT_CMD).unwrap();
    assert_eq!(driver.bus().interrupts(), 0);
    driver.command(13, status_arg, R1).unwrap();
    assert_eq!(driver.bus().stats().sd_irqs, before + 2);
}

#[test]
fn sd_boot_without_a_card_is_refused() {
    let mut soc = Soc::new(small_config(), FeatureSet::new()).unwrap();
    assert!(matches!(
        soc.sd_boot(&BootImage::Raw { lba: 0, blocks: 1 }, 0),
        Err(SocError::Config(_))
    ));
}
