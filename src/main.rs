//! rdfu - USB DFU and ST DfuSe firmware tool
//!
//! Reads, converts, downloads and uploads firmware for devices running a
//! USB Device Firmware Upgrade bootloader.
//!
//! # Architecture
//!
//! All device commands run against a `DfuDevice` built on the
//! `DfuTransport` trait, so the same code path drives:
//! - **USB devices** through nusb (`--device VID:PID` or `key=value` options)
//! - **The dummy device**, an in-memory emulator of a DFU or DfuSe
//!   bootloader (`--device dummy`)

mod cli;
mod commands;
mod devices;

use clap::Parser;
use cli::{Cli, Commands};
use commands::{ConvertOptions, DownloadOptions};
use rdfu_core::transfer::TransferFlags;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    match cli.command {
        Commands::List { device } => {
            let config = devices::list_config(&device)?;
            commands::run_list(&config)
        }
        Commands::Dump { file, parse } => commands::run_dump(&file, parse.flags()),
        Commands::Convert {
            input,
            output,
            format,
            vid,
            pid,
            release,
            address,
            metadata,
            parse,
        } => {
            let options = ConvertOptions {
                format,
                vid,
                pid,
                release,
                address,
                metadata,
            };
            commands::run_convert(&input, &output, parse.flags(), &options)
        }
        Commands::Download {
            file,
            device,
            address,
            verify,
            force,
            finish,
            parse,
        } => {
            let firmware = commands::load_firmware(&file, parse.flags())?;
            let mut flags = finish.flags();
            flags.set(TransferFlags::VERIFY, verify);
            flags.set(
                TransferFlags::WILDCARD_VID | TransferFlags::WILDCARD_PID,
                force,
            );
            let options = DownloadOptions {
                alt: device.alt.clone(),
                address,
                flags,
            };
            devices::with_device(&device, |dev| {
                commands::run_download(dev, firmware, &options)
            })
        }
        Commands::Upload {
            file,
            device,
            size,
            format,
            finish,
        } => devices::with_device(&device, |dev| {
            commands::run_upload(
                dev,
                &file,
                device.alt.as_deref(),
                size,
                format,
                finish.flags(),
            )
        }),
        Commands::Detach { device } => {
            devices::with_device(&device, |dev| commands::run_detach(dev))
        }
        Commands::Attach { device } => {
            devices::with_device(&device, |dev| commands::run_attach(dev))
        }
    }
}
