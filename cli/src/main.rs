// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use itertools::Itertools;
use owo_colors::OwoColorize;
use std::fs::{self, File};
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use xdl::brom::{DaImage, DaPatch, MtkDevice, mtk_stage_da};
use xdl::bsl::{FdlImage, SpdBypass, SpdDevice, spd_stage_fdl};
use xdl::engine::{Engine, IspSession, Session};
use xdl::error::{Error, SecurityError, TransportError};
use xdl::fastboot::{
    FastbootDevice, fb_boot, fb_connect, fb_download, fb_flashing, fb_getvar, fb_reboot,
    fb_set_active,
};
use xdl::firehose::{
    firehose_configure, firehose_drain_logs, firehose_get_storage_info, firehose_peek,
    firehose_read, firehose_reset,
};
use xdl::parsers::firehose_parser_configure_response;
use xdl::sahara::{SaharaMode, sahara_run, sahara_send_hello_rsp, sahara_upload_loader};
use xdl::transport::{Backend, DeviceDescriptor, Transport, setup_transport};
use xdl::types::{
    FirehoseConfig, FirehoseResetMode, QcomDevice, StorageKind, default_sector_size,
};
use xdl::blockdev::BlockDevTransport;

mod flasher;
mod programfile;
mod util;

const USB_VID_QCOM: u16 = 0x05c6;
const USB_PID_QCOM_EDL: u16 = 0x9008;
const USB_VID_MTK: u16 = 0x0e8d;
const USB_VID_SPD: u16 = 0x1782;
const USB_PID_SPD_DL: u16 = 0x4d00;

#[derive(Args, Debug, Clone)]
struct CommonOpts {
    /// Transport backend (usb/serial/blockdev); each vendor has a default
    #[arg(long)]
    backend: Option<String>,

    /// USB "vid:pid" in hex, or a serial/block device path
    #[arg(short, long)]
    device: Option<String>,

    /// Match a specific USB serial number
    #[arg(long)]
    serial_no: Option<String>,

    /// Per-transfer timeout in seconds
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    /// Operation watchdog in seconds, 0 to disable
    #[arg(long, default_value = "300")]
    watchdog: u64,

    /// Draw transfer progress bars
    #[arg(long, default_value = "false")]
    progress: bool,
}

#[derive(Subcommand, Debug)]
enum QcomAction {
    /// Write an image to a named partition
    Flash {
        #[arg(short, long)]
        partition: String,

        #[arg(short, long, value_name = "FILE")]
        image: String,
    },

    /// Dump a named partition to a file
    Read {
        #[arg(short, long)]
        partition: String,

        #[arg(short, long, value_name = "FILE")]
        out: String,
    },

    /// Erase a named partition
    Erase {
        #[arg(short, long)]
        partition: String,
    },

    /// Print what the device told us about itself
    Info,

    /// Peek at device memory
    Peek {
        #[arg(value_parser = maybe_hex::<u64>)]
        base: u64,

        #[arg(default_value = "1", value_parser = maybe_hex::<u64>)]
        len: u64,
    },

    /// Dump every named partition from the GPT
    Dump {
        #[arg(short, default_value = "out/")]
        outdir: String,
    },

    /// Print the GPT table
    PrintGpt,

    /// Run vendor rawprogram/patch XML files
    Flasher {
        #[arg(short, long, num_args = 1..=128, value_name = "FILE")]
        program_file_paths: Vec<String>,

        #[arg(short = 'x', long, num_args = 0..=128, value_name = "FILE")]
        patch_file_paths: Vec<String>,
    },

    /// Restart the device
    Reset {
        #[arg(default_value = "system", value_name = "edl/off/system")]
        mode: String,
    },
}

#[derive(Subcommand, Debug)]
enum MtkAction {
    Flash {
        #[arg(short, long)]
        partition: String,

        #[arg(short, long, value_name = "FILE")]
        image: String,
    },

    Read {
        #[arg(short, long)]
        partition: String,

        #[arg(short, long, value_name = "FILE")]
        out: String,
    },

    Erase {
        #[arg(short, long)]
        partition: String,
    },

    Info,

    /// Leave download mode
    Reset,
}

#[derive(Subcommand, Debug)]
enum SpdAction {
    Flash {
        #[arg(short, long)]
        partition: String,

        #[arg(short, long, value_name = "FILE")]
        image: String,
    },

    Read {
        #[arg(short, long)]
        partition: String,

        #[arg(short, long, value_name = "FILE")]
        out: String,
    },

    Erase {
        #[arg(short, long)]
        partition: String,
    },

    Info,

    Reset,
}

#[derive(Subcommand, Debug)]
enum FastbootAction {
    Flash {
        #[arg(short, long)]
        partition: String,

        #[arg(short, long, value_name = "FILE")]
        image: String,
    },

    Erase {
        #[arg(short, long)]
        partition: String,
    },

    /// Download an image and boot it without flashing
    Boot {
        #[arg(short, long, value_name = "FILE")]
        image: String,
    },

    Getvar {
        #[arg()]
        name: String,
    },

    Unlock,

    Lock,

    SetActive {
        #[arg(value_name = "a/b")]
        slot: String,
    },

    Reboot,

    Info,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Qualcomm EDL (Sahara + Firehose)
    Qualcomm {
        #[command(flatten)]
        common: CommonOpts,

        /// Firehose programmer (MBN/ELF) fed over Sahara
        #[arg(short, long, value_name = "FILE")]
        loader: String,

        #[arg(short, long, value_name = "emmc/ufs/nvme/spinor/nand")]
        storage_type: String,

        #[arg(long)]
        sector_size: Option<usize>,

        /// Physical partition index (e.g. LUN for UFS)
        #[arg(short = 'L', long, default_value = "0")]
        phys_part_idx: u8,

        #[arg(long, default_value = "false", help = "Required for unprovisioned storage")]
        skip_storage_init: bool,

        #[arg(long, default_value = "false", help = "Read every write back. Slow.")]
        read_back_verify: bool,

        #[arg(
            short = 'A',
            long,
            default_value = "false",
            help = "Work around a HELLO packet another tool already consumed"
        )]
        skip_hello_wait: bool,

        #[command(subcommand)]
        action: QcomAction,
    },

    /// MediaTek BROM + Download Agent
    Mtk {
        #[command(flatten)]
        common: CommonOpts,

        #[arg(long, value_name = "FILE")]
        da1: String,

        #[arg(long, value_parser = maybe_hex::<u32>)]
        da1_addr: u32,

        #[arg(long, default_value = "0", value_parser = maybe_hex::<u32>)]
        da1_sig_len: u32,

        #[arg(long, value_name = "FILE")]
        da2: String,

        #[arg(long, value_parser = maybe_hex::<u32>)]
        da2_addr: u32,

        #[arg(long, default_value = "0", value_parser = maybe_hex::<u32>)]
        da2_sig_len: u32,

        /// Pre-load DA patch as <hex-offset>:<file>, repeatable
        #[arg(long, value_name = "OFF:FILE")]
        patch: Vec<String>,

        #[command(subcommand)]
        action: MtkAction,
    },

    /// Spreadtrum/Unisoc BSL (FDL1/FDL2), or ISP over a block device
    Spd {
        #[command(flatten)]
        common: CommonOpts,

        #[arg(long, value_name = "FILE")]
        fdl1: Option<String>,

        #[arg(long, value_parser = maybe_hex::<u32>)]
        fdl1_addr: Option<u32>,

        #[arg(long, value_name = "FILE")]
        fdl2: Option<String>,

        #[arg(long, value_parser = maybe_hex::<u32>)]
        fdl2_addr: Option<u32>,

        /// Signature-bypass payload for the T7xx family
        #[arg(long, value_name = "FILE")]
        bypass_payload: Option<String>,

        #[arg(long, value_parser = maybe_hex::<u32>)]
        bypass_addr: Option<u32>,

        #[command(subcommand)]
        action: SpdAction,
    },

    /// Android fastboot
    Fastboot {
        #[command(flatten)]
        common: CommonOpts,

        #[command(subcommand)]
        action: FastbootAction,
    },
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

fn parse_descriptor(common: &CommonOpts, default_vid: Option<u16>, default_pid: Option<u16>) -> DeviceDescriptor {
    let mut desc = DeviceDescriptor {
        vendor_id: default_vid,
        product_id: default_pid,
        serial: common.serial_no.clone(),
        ..DeviceDescriptor::default()
    };
    if let Some(device) = &common.device {
        if let Some((vid, pid)) = device
            .split_once(':')
            .and_then(|(v, p)| Some((u16::from_str_radix(v, 16).ok()?, u16::from_str_radix(p, 16).ok()?)))
        {
            desc.vendor_id = Some(vid);
            desc.product_id = Some(pid);
        } else {
            desc.path = Some(device.clone());
        }
    }
    desc
}

fn open_transport(
    common: &CommonOpts,
    default_backend: Backend,
    default_vid: Option<u16>,
    default_pid: Option<u16>,
) -> Result<Box<dyn xdl::Transport>> {
    let backend = match &common.backend {
        Some(b) => Backend::from_str(b)?,
        None => default_backend,
    };
    let desc = parse_descriptor(common, default_vid, default_pid);
    let mut rw = setup_transport(backend, &desc)?;
    rw.set_timeout(Duration::from_secs(common.timeout));
    Ok(rw)
}

fn into_session(common: &CommonOpts, engine: Engine) -> Session {
    let session = Session::new(engine);
    if common.watchdog > 0 {
        session.with_watchdog("transfer", Duration::from_secs(common.watchdog))
    } else {
        session
    }
}

fn print_info(session: &Session) {
    println!("{}", session.info().summary().bright_blue());
}

#[allow(clippy::too_many_arguments)]
fn run_qualcomm(
    common: CommonOpts,
    loader: String,
    storage_type: String,
    sector_size: Option<usize>,
    phys_part_idx: u8,
    skip_storage_init: bool,
    read_back_verify: bool,
    skip_hello_wait: bool,
    action: QcomAction,
) -> Result<()> {
    let loader = fs::read(&loader).with_context(|| format!("reading loader {loader}"))?;
    let storage = StorageKind::from_str(&storage_type)?;
    let sector_size = match sector_size {
        Some(n) => n,
        None => {
            let n = default_sector_size(storage);
            println!("{} {}", "Using a default sector size of".bright_black(), n);
            n
        }
    };

    let rw = open_transport(
        &common,
        Backend::Usb,
        Some(USB_VID_QCOM),
        Some(USB_PID_QCOM_EDL),
    )?;
    let mut dev = QcomDevice::new(
        rw,
        FirehoseConfig {
            storage_type: storage,
            storage_sector_size: sector_size,
            storage_slot: phys_part_idx,
            read_back_verify,
            skip_storage_init,
            show_progress: common.progress,
            ..FirehoseConfig::default()
        },
    );

    // Sahara hands the Firehose programmer over, then the loader greets
    // us and we negotiate buffers
    if skip_hello_wait {
        // Another tool ate the HELLO; appease the state machine upfront
        sahara_send_hello_rsp(&mut dev, SaharaMode::ImageTxPending)?;
        sahara_upload_loader(&mut dev, &loader)?;
    } else {
        sahara_run(&mut dev, &loader, true)?;
    }
    dev.reset_on_drop = true;
    firehose_drain_logs(&mut dev)?;
    firehose_configure(&mut dev, false)?;
    firehose_read(&mut dev, firehose_parser_configure_response)?;

    let mut session = into_session(&common, Engine::Qualcomm(dev));

    match action {
        QcomAction::Flash { partition, image } => {
            let mut file = File::open(&image).with_context(|| format!("opening {image}"))?;
            session.engine_mut()?.write_partition(&partition, &mut file)?;
            println!("{} {partition}", "Flashed".green());
        }
        QcomAction::Read { partition, out } => {
            let mut file = File::create(&out).with_context(|| format!("creating {out}"))?;
            session.engine_mut()?.read_partition(&partition, &mut file)?;
            println!("{} {partition} -> {out}", "Dumped".green());
        }
        QcomAction::Erase { partition } => {
            session.engine_mut()?.erase_partition(&partition)?;
            println!("{} {partition}", "Erased".green());
        }
        QcomAction::Info => {
            print_info(&session);
            if let Some(hash) = &session.info().pk_hash {
                println!("OEM Private Key hash: 0x{:02x}", hash.iter().format(""));
            }
            let Engine::Qualcomm(dev) = session.engine_mut()? else {
                unreachable!();
            };
            let info = firehose_get_storage_info(dev, phys_part_idx)?;
            if let (Some(sectors), Some(size)) = (info.total_sectors, info.sector_size) {
                println!(
                    "storage: {} sectors of {} bytes ({} MiB)",
                    sectors,
                    size,
                    sectors * size / (1024 * 1024)
                );
            }
            for line in info.raw {
                println!("  {line}");
            }
        }
        QcomAction::Peek { base, len } => {
            let Engine::Qualcomm(dev) = session.engine_mut()? else {
                unreachable!();
            };
            for line in firehose_peek(dev, base, len)? {
                println!("{line}");
            }
        }
        QcomAction::Dump { outdir } => util::dump_all_partitions(&mut session, &outdir)?,
        QcomAction::PrintGpt => util::print_partition_table(&mut session)?,
        QcomAction::Flasher {
            program_file_paths,
            patch_file_paths,
        } => {
            let Engine::Qualcomm(dev) = session.engine_mut()? else {
                unreachable!();
            };
            flasher::run_flash(dev, program_file_paths, patch_file_paths)?;
        }
        QcomAction::Reset { mode } => {
            let reset_mode = FirehoseResetMode::from_str(&mode)?;
            let Engine::Qualcomm(dev) = session.engine_mut()? else {
                unreachable!();
            };
            dev.reset_on_drop = false;
            firehose_reset(dev, reset_mode, 0)?;
            println!("{} {}", "Reset to".green(), mode.bright_yellow());
        }
    }

    // A clean run ends with the device released; reset-on-drop stays armed
    // only for the error paths above us
    if let Ok(Engine::Qualcomm(dev)) = session.engine_mut() {
        dev.reset_on_drop = false;
    }
    Ok(())
}

fn parse_patches(specs: &[String]) -> Result<Vec<DaPatch>> {
    let mut patches = Vec::new();
    for spec in specs {
        let Some((off, file)) = spec.split_once(':') else {
            bail!("--patch wants <hex-offset>:<file>, got '{spec}'");
        };
        let offset = usize::from_str_radix(off.trim_start_matches("0x"), 16)
            .with_context(|| format!("patch offset '{off}'"))?;
        let bytes = fs::read(file).with_context(|| format!("reading patch {file}"))?;
        patches.push(DaPatch { offset, bytes });
    }
    Ok(patches)
}

#[allow(clippy::too_many_arguments)]
fn run_mtk(
    common: CommonOpts,
    da1: String,
    da1_addr: u32,
    da1_sig_len: u32,
    da2: String,
    da2_addr: u32,
    da2_sig_len: u32,
    patch: Vec<String>,
    action: MtkAction,
) -> Result<()> {
    let da = DaImage {
        da1: fs::read(&da1).with_context(|| format!("reading {da1}"))?,
        da1_addr,
        da1_sig_len,
        da2: fs::read(&da2).with_context(|| format!("reading {da2}"))?,
        da2_addr,
        da2_sig_len,
    };
    let patches = parse_patches(&patch)?;

    let rw = open_transport(&common, Backend::Usb, Some(USB_VID_MTK), None)?;
    let mut dev = MtkDevice::new(rw);
    mtk_stage_da(&mut dev, &da, &patches)?;

    let mut session = into_session(&common, Engine::Mediatek(dev));

    match action {
        MtkAction::Flash { partition, image } => {
            let mut file = File::open(&image).with_context(|| format!("opening {image}"))?;
            session.engine_mut()?.write_partition(&partition, &mut file)?;
            println!("{} {partition}", "Flashed".green());
        }
        MtkAction::Read { partition, out } => {
            let mut file = File::create(&out).with_context(|| format!("creating {out}"))?;
            session.engine_mut()?.read_partition(&partition, &mut file)?;
            println!("{} {partition} -> {out}", "Dumped".green());
        }
        MtkAction::Erase { partition } => {
            session.engine_mut()?.erase_partition(&partition)?;
            println!("{} {partition}", "Erased".green());
        }
        MtkAction::Info => print_info(&session),
        MtkAction::Reset => session.engine_mut()?.reboot()?,
    }
    Ok(())
}

fn run_spd(
    common: CommonOpts,
    fdl1: Option<String>,
    fdl1_addr: Option<u32>,
    fdl2: Option<String>,
    fdl2_addr: Option<u32>,
    bypass_payload: Option<String>,
    bypass_addr: Option<u32>,
    action: SpdAction,
) -> Result<()> {
    let backend = match &common.backend {
        Some(b) => Backend::from_str(b)?,
        None => Backend::Serial,
    };

    // ISP: the device already shows its eMMC as a block device, BSL and
    // the FDL stages are out of the picture
    if backend == Backend::BlockDev {
        let desc = parse_descriptor(&common, None, None);
        let dev = BlockDevTransport::open(&desc)?;
        let mut session = into_session(&common, Engine::Isp(IspSession::new(dev)));
        return run_spd_action(&mut session, action);
    }

    let (Some(fdl1), Some(fdl1_addr), Some(fdl2), Some(fdl2_addr)) =
        (fdl1, fdl1_addr, fdl2, fdl2_addr)
    else {
        bail!("--fdl1/--fdl1-addr/--fdl2/--fdl2-addr are required outside ISP mode");
    };
    let fdl = FdlImage {
        fdl1: fs::read(&fdl1).with_context(|| format!("reading {fdl1}"))?,
        fdl1_addr,
        fdl2: fs::read(&fdl2).with_context(|| format!("reading {fdl2}"))?,
        fdl2_addr,
    };
    let bypass = match (bypass_payload, bypass_addr) {
        (Some(path), Some(addr)) => Some(SpdBypass {
            payload: fs::read(&path).with_context(|| format!("reading {path}"))?,
            addr,
        }),
        (None, None) => None,
        _ => bail!("--bypass-payload and --bypass-addr go together"),
    };

    let rw = open_transport(&common, backend, Some(USB_VID_SPD), Some(USB_PID_SPD_DL))?;
    let mut dev = SpdDevice::new(rw);
    spd_stage_fdl(&mut dev, &fdl, bypass.as_ref())?;

    let mut session = into_session(&common, Engine::Spreadtrum(dev));
    run_spd_action(&mut session, action)
}

fn run_spd_action(session: &mut Session, action: SpdAction) -> Result<()> {
    match action {
        SpdAction::Flash { partition, image } => {
            let mut file = File::open(&image).with_context(|| format!("opening {image}"))?;
            session.engine_mut()?.write_partition(&partition, &mut file)?;
            println!("{} {partition}", "Flashed".green());
        }
        SpdAction::Read { partition, out } => {
            let mut file = File::create(&out).with_context(|| format!("creating {out}"))?;
            session.engine_mut()?.read_partition(&partition, &mut file)?;
            println!("{} {partition} -> {out}", "Dumped".green());
        }
        SpdAction::Erase { partition } => {
            session.engine_mut()?.erase_partition(&partition)?;
            println!("{} {partition}", "Erased".green());
        }
        SpdAction::Info => print_info(session),
        SpdAction::Reset => session.engine_mut()?.reboot()?,
    }
    Ok(())
}

fn run_fastboot(common: CommonOpts, action: FastbootAction) -> Result<()> {
    let rw = open_transport(&common, Backend::Usb, None, None)?;
    let mut dev = FastbootDevice::new(rw);
    fb_connect(&mut dev)?;

    let mut session = into_session(&common, Engine::Fastboot(dev));

    match action {
        FastbootAction::Flash { partition, image } => {
            let mut file = File::open(&image).with_context(|| format!("opening {image}"))?;
            session.engine_mut()?.write_partition(&partition, &mut file)?;
            println!("{} {partition}", "Flashed".green());
        }
        FastbootAction::Erase { partition } => {
            session.engine_mut()?.erase_partition(&partition)?;
            println!("{} {partition}", "Erased".green());
        }
        FastbootAction::Boot { image } => {
            let data = fs::read(&image).with_context(|| format!("reading {image}"))?;
            let dev = fb_dev(&mut session)?;
            fb_download(dev, &data)?;
            fb_boot(dev)?;
            println!("{}", "Booted".green());
        }
        FastbootAction::Getvar { name } => {
            let value = fb_getvar(fb_dev(&mut session)?, &name)?;
            println!("{name}: {value}");
        }
        FastbootAction::Unlock => fb_flashing(fb_dev(&mut session)?, "unlock")?,
        FastbootAction::Lock => fb_flashing(fb_dev(&mut session)?, "lock")?,
        FastbootAction::SetActive { slot } => {
            fb_set_active(fb_dev(&mut session)?, &slot)?;
            println!("{} {slot}", "Active slot:".green());
        }
        FastbootAction::Reboot => fb_reboot(fb_dev(&mut session)?)?,
        FastbootAction::Info => print_info(&session),
    }
    Ok(())
}

fn fb_dev(session: &mut Session) -> Result<&mut FastbootDevice> {
    match session.engine_mut()? {
        Engine::Fastboot(dev) => Ok(dev),
        _ => unreachable!(),
    }
}

/// Exit codes are part of the surface: scripts and the GUI shell branch on
/// them.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    let Some(e) = err.downcast_ref::<Error>() else {
        return 4;
    };
    match e {
        Error::Transport(TransportError::NotFound | TransportError::Busy) => 2,
        Error::Transport(TransportError::Cancelled) => 5,
        Error::Transport(TransportError::AccessDenied) => 6,
        Error::Transport(_) => 4,
        Error::Frame(_) | Error::Protocol(_) => 3,
        Error::Image(_) => 4,
        Error::Security(
            SecurityError::LoaderRejected { .. }
            | SecurityError::SignatureRequired(_)
            | SecurityError::DeviceLocked(_),
        ) => 6,
        Error::InvalidArgument(_) | Error::NotConnected => 3,
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    println!(
        "{} {}",
        env!("CARGO_PKG_NAME").green(),
        env!("CARGO_PKG_VERSION").yellow()
    );

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Qualcomm {
            common,
            loader,
            storage_type,
            sector_size,
            phys_part_idx,
            skip_storage_init,
            read_back_verify,
            skip_hello_wait,
            action,
        } => run_qualcomm(
            common,
            loader,
            storage_type,
            sector_size,
            phys_part_idx,
            skip_storage_init,
            read_back_verify,
            skip_hello_wait,
            action,
        ),
        Command::Mtk {
            common,
            da1,
            da1_addr,
            da1_sig_len,
            da2,
            da2_addr,
            da2_sig_len,
            patch,
            action,
        } => run_mtk(
            common, da1, da1_addr, da1_sig_len, da2, da2_addr, da2_sig_len, patch, action,
        ),
        Command::Spd {
            common,
            fdl1,
            fdl1_addr,
            fdl2,
            fdl2_addr,
            bypass_payload,
            bypass_addr,
            action,
        } => run_spd(
            common,
            fdl1,
            fdl1_addr,
            fdl2,
            fdl2_addr,
            bypass_payload,
            bypass_addr,
            action,
        ),
        Command::Fastboot { common, action } => run_fastboot(common, action),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".bright_red());
            ExitCode::from(exit_code_for(&err))
        }
    }
}
