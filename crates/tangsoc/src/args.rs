use crate::core::{Board, FeatureSet, Soc, SocConfig};
use crate::emu_core::DemoCore;
use crate::error::SocError;
use crate::firmware::BootImage;
use crate::sdcard::FileBlockDevice;
use clap::Parser;
use std::path::PathBuf;
use tangsoc_hw::mmio::sdc::defaults;
use tracing::info;

#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Path to the ROM image. If --rom-in-sd-card is set, this is a path inside the SD
    /// card image (e.g., "roms/game.nes"). Otherwise, it's a path on the local filesystem.
    pub rom: Option<PathBuf>,

    /// Path to SD card image (raw disk image, optionally with an MBR, FAT16/FAT32)
    #[arg(long)]
    pub sd_card: Option<PathBuf>,

    /// Interpret the ROM path as a path inside the SD card image.
    /// Requires --sd-card to be specified.
    #[arg(long)]
    pub rom_in_sd_card: bool,

    /// Load the ROM through the emulated SD controller instead of preloading main RAM
    #[arg(long)]
    pub sd_boot: bool,

    /// With --sd-boot: copy raw blocks starting at this LBA instead of reading a file
    #[arg(long, value_parser = parse_hex_or_dec_u32)]
    pub boot_lba: Option<u32>,

    /// With --boot-lba: number of blocks to copy
    #[arg(long, default_value_t = 64)]
    pub boot_blocks: u32,

    /// SD clock divider programmed by the boot firmware
    #[arg(long, default_value_t = defaults::CLOCK_DIVIDER)]
    pub sd_clock_divider: u32,

    /// Board variant (tang-nano-20k or tang-nano-20k-legacy)
    #[arg(long, default_value = "tang-nano-20k")]
    pub board: Board,

    /// System clock in Hz (board default when unset)
    #[arg(long)]
    pub sys_hz: Option<u64>,

    /// Run without the emulation core and ROM bridge
    #[arg(long)]
    pub no_core: bool,

    /// ROM word address of the demo core's palette (hex: 0x1234 or decimal: 1234)
    #[arg(long, default_value = "0", value_parser = parse_hex_or_dec_u32)]
    pub palette_base: u32,

    /// Video source selector out of reset
    #[arg(long, short = 's', default_value_t = 0)]
    pub selector: u8,

    /// Seed of the test pattern generator (non-zero)
    #[arg(long, default_value = "1", value_parser = parse_hex_or_dec_u32)]
    pub prbs_seed: u32,

    /// Show color bars as the timing generator's picture (passthrough slot)
    #[arg(long)]
    pub color_bars: bool,

    /// Stop after this many frames
    #[arg(long, short = 'f')]
    pub frames: Option<u64>,

    /// Stop after this many system clock ticks
    #[arg(long)]
    pub max_ticks: Option<u64>,

    /// Stop after this many milliseconds of wall-clock time
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Write the last displayed frame to this path as a PPM image
    #[arg(long)]
    pub dump_frame: Option<PathBuf>,
}

impl Args {
    /// Validate that the arguments are consistent
    pub fn validate(&self) -> Result<(), String> {
        if self.rom_in_sd_card && self.sd_card.is_none() {
            return Err("--rom-in-sd-card requires --sd-card to be specified".to_string());
        }
        if self.rom_in_sd_card && self.rom.is_none() {
            return Err("--rom-in-sd-card requires a ROM path".to_string());
        }
        if self.sd_boot {
            if self.sd_card.is_none() {
                return Err("--sd-boot requires --sd-card to be specified".to_string());
            }
            if self.boot_lba.is_none() && !self.rom_in_sd_card {
                return Err("--sd-boot needs --boot-lba or --rom-in-sd-card".to_string());
            }
        }
        if self.boot_lba.is_some() && !self.sd_boot {
            return Err("--boot-lba requires --sd-boot".to_string());
        }
        if self.prbs_seed == 0 {
            return Err("--prbs-seed must be non-zero".to_string());
        }
        Ok(())
    }

    /// Convert Args to SocConfig
    pub fn to_soc_config(&self) -> SocConfig {
        SocConfig {
            board: self.board,
            sys_hz: self.sys_hz,
            selector: self.selector,
            prbs_seed: self.prbs_seed,
            color_bars: self.color_bars,
            max_frames: self.frames,
            max_ticks: self.max_ticks,
            timeout_ms: self.timeout_ms,
            ..SocConfig::default()
        }
    }

    /// Subsystems selected on the command line
    pub fn to_feature_set(&self) -> Result<FeatureSet, SocError> {
        let mut features = FeatureSet::new();
        if let Some(path) = &self.sd_card {
            features = features.with_sdcard(Box::new(FileBlockDevice::open(path)?));
        }
        if !self.no_core {
            let core = DemoCore::new(self.palette_base);
            features = features.with_emulation_core(Box::new(core));
        }
        Ok(features)
    }

    /// How --sd-boot finds the ROM on the card
    pub fn boot_image(&self) -> Option<BootImage> {
        if !self.sd_boot {
            return None;
        }
        match (self.boot_lba, &self.rom) {
            (Some(lba), _) => Some(BootImage::Raw {
                lba,
                blocks: self.boot_blocks,
            }),
            (None, Some(rom)) => Some(BootImage::File(rom.to_string_lossy().into_owned())),
            (None, None) => None,
        }
    }
}

pub fn parse_hex_or_dec(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn parse_hex_or_dec_u32(s: &str) -> Result<u32, String> {
    let value = parse_hex_or_dec(s).map_err(|e| e.to_string())?;
    u32::try_from(value).map_err(|_| format!("{s} does not fit in 32 bits"))
}

/// Load ROM data from either a direct file path or from inside an SD card image
pub fn load_rom_data(args: &Args) -> Result<Option<Vec<u8>>, SocError> {
    use std::io::Read;

    let Some(rom) = &args.rom else {
        return Ok(None);
    };

    if args.rom_in_sd_card {
        // Load from SD card image using fatfs
        let sd_card_path = args.sd_card.as_ref().ok_or_else(|| {
            SocError::Config("--rom-in-sd-card requires --sd-card".to_string())
        })?;

        info!(
            "Loading ROM from SD card image: {:?} at path: {:?}",
            sd_card_path, rom
        );

        use fscommon::BufStream;

        let img_file = std::fs::File::open(sd_card_path)?;
        let buf_stream = BufStream::new(img_file);
        let fs = fatfs::FileSystem::new(buf_stream, fatfs::FsOptions::new())?;
        let root_dir = fs.root_dir();

        let rom_path_str = rom
            .to_str()
            .ok_or_else(|| SocError::Image("ROM path contains invalid UTF-8".to_string()))?;
        let mut rom_file = root_dir.open_file(rom_path_str)?;
        let mut contents = Vec::new();
        rom_file.read_to_end(&mut contents)?;

        info!("Successfully loaded {} bytes from SD card", contents.len());
        Ok(Some(contents))
    } else {
        info!("Loading ROM from file: {:?}", rom);
        Ok(Some(std::fs::read(rom)?))
    }
}

/// Build the SoC and put the ROM in main RAM, by preloading or by SD boot
pub fn build_soc(args: &Args) -> Result<Soc, SocError> {
    let soc_config = args.to_soc_config();
    let mut soc = Soc::new(soc_config, args.to_feature_set()?)?;

    if let Some(image) = args.boot_image() {
        info!("=== SD boot ===");
        let loaded = soc.sd_boot(&image, args.sd_clock_divider)?;
        info!("SD boot copied {} bytes", loaded);
    } else if let Some(rom) = load_rom_data(args)? {
        soc.load_main_ram(0, &rom)?;
        info!("Preloaded {} bytes of ROM", rom.len());
    }
    Ok(soc)
}
