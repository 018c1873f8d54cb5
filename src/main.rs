use anyhow::{Context, Result, bail};
use blaustahl::device_ids::Locator;
use blaustahl::image;
use blaustahl::protocol::{FRAM_SIZE, Fram, ReadPolicy};
use blaustahl::transport::{list_devices, open_device};
use clap::{ArgGroup, Parser};
use log::{LevelFilter, info};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

/// Read, write or verify the FRAM of a Blaustahl storage device
#[derive(Parser, Debug)]
#[command(name = "blaustahl", version, about)]
#[command(group(ArgGroup::new("mode").multiple(false)))]
struct Opt {
    /// Read from FRAM to <IMAGE>
    #[arg(short, long, group = "mode", requires = "image")]
    read: bool,

    /// Write <IMAGE> to FRAM
    #[arg(short, long, group = "mode", requires = "image")]
    write: bool,

    /// Verify <IMAGE> with FRAM
    #[arg(short, long, group = "mode", requires = "image")]
    verify: bool,

    /// Fill the whole FRAM with zeroes
    #[arg(short, long, group = "mode")]
    clear: bool,

    /// Check whether the whole FRAM is zero
    #[arg(short, long = "blank-check", group = "mode")]
    blank_check: bool,

    /// USB bus and address of the device to use when several are attached
    #[arg(short = 'a', long = "usb", num_args = 2, value_names = ["BUS", "ADDR"])]
    usb: Option<Vec<u8>>,

    /// Trace every command and response frame
    #[arg(short, long)]
    debug: bool,

    /// Empty responses tolerated per byte read before giving up
    #[arg(long, default_value = "1000")]
    retries: NonZeroU32,

    /// Timeout for each USB transfer in milliseconds (0 waits forever)
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,

    /// Image file to read into, write from or verify against
    image: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Mode {
    List,
    Read,
    Write,
    Verify,
    Clear,
    BlankCheck,
}

impl Opt {
    fn mode(&self) -> Mode {
        match self {
            Opt { read: true, .. } => Mode::Read,
            Opt { write: true, .. } => Mode::Write,
            Opt { verify: true, .. } => Mode::Verify,
            Opt { clear: true, .. } => Mode::Clear,
            Opt {
                blank_check: true, ..
            } => Mode::BlankCheck,
            _ => Mode::List,
        }
    }

    fn locator(&self) -> Result<Option<Locator>> {
        match self.usb.as_deref() {
            None => Ok(None),
            Some(&[bus, address]) => Ok(Some(Locator { bus, address })),
            Some(values) => bail!(
                "expected one <BUS> <ADDR> pair for --usb, got {} values",
                values.len()
            ),
        }
    }
}

fn main() -> Result<()> {
    let opt = Opt::parse();

    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("BLAUSTAHL_LOG", "info")
            .write_style("BLAUSTAHL_LOG_STYLE"),
    );
    if opt.debug {
        logger.filter_module("blaustahl", LevelFilter::Trace);
    }
    logger.init();

    let mode = opt.mode();
    let locator = opt.locator()?;

    // Source images are read up front so a bad path fails before the device is touched.
    let source = match (mode, &opt.image) {
        (Mode::Write | Mode::Verify, Some(path)) => Some(image::load(path)?),
        _ => None,
    };

    let context = rusb::Context::new().context("USB initialization failed")?;

    if mode == Mode::List {
        let devices = list_devices(&context)?;
        if devices.is_empty() {
            println!("none.");
        }
        for dev in devices {
            println!("{dev}");
        }
        return Ok(());
    }

    let timeout = Duration::from_millis(opt.timeout_ms);
    let transport = open_device(&context, locator, timeout)?;
    let policy = ReadPolicy {
        max_attempts: opt.retries,
    };
    let mut fram = Fram::with_policy(transport, policy);

    match (mode, source, &opt.image) {
        (Mode::Write, Some(data), _) => {
            info!("Writing {} bytes to FRAM", data.len());
            let written = fram.write_image(&data)?;
            println!("done writing {written} bytes.");
        }
        (Mode::Read, _, Some(path)) => {
            let mut sink = image::create(path)?;
            info!("Reading {FRAM_SIZE} bytes from FRAM to {}", path.display());
            fram.read_image(&mut sink)?;
            let (_, len, crc) = sink
                .finish()
                .with_context(|| format!("unable to write {}", path.display()))?;
            println!("done reading {len} bytes (CRC32 {crc:#010x}).");
        }
        (Mode::Verify, Some(data), _) => {
            info!("Verifying {} bytes of FRAM", data.len());
            let report = fram.verify_image(&data)?;
            for m in &report.mismatches {
                println!("mismatch at address {:#06x}", m.address);
                println!(" {:02x} != {:02x}", m.device, m.image);
            }
            println!("{} mismatches.", report.mismatch_count());
        }
        (Mode::Clear, _, _) => {
            info!("Clearing {FRAM_SIZE} bytes of FRAM");
            fram.clear()?;
            println!("FRAM cleared.");
        }
        (Mode::BlankCheck, _, _) => match fram.is_blank()? {
            true => println!("FRAM is empty."),
            false => println!("FRAM is not empty."),
        },
        (mode, _, _) => bail!("no image file given for {mode:?}"),
    }

    Ok(())
}
