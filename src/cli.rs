//! CLI argument parsing

use clap::{Parser, Subcommand};
use rdfu_core::firmware::{Format, ParseFlags};
use rdfu_core::transfer::TransferFlags;
use std::path::PathBuf;

fn strip_hex_prefix(s: &str) -> Option<&str> {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
}

/// Parse a string as a hex or decimal u32
pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = strip_hex_prefix(s) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse a string as a hex or decimal u16
pub fn parse_hex_u16(s: &str) -> Result<u16, String> {
    if let Some(hex) = strip_hex_prefix(s) {
        u16::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u16>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse `KEY=VALUE`
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("Expected KEY=VALUE, got '{}'", s))
}

#[derive(Parser)]
#[command(name = "rdfu")]
#[command(author, version, about = "USB DFU and ST DfuSe firmware tool", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Device selection shared across commands
#[derive(clap::Args, Debug, Clone, Default)]
pub struct DeviceArgs {
    /// Device to use: VID:PID, "dummy", "dummy:type=dfuse" or
    /// key=value options (vid, pid, serial, bus, address)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Alternate setting number or name
    #[arg(short, long)]
    pub alt: Option<String>,

    /// Override the transfer size from the functional descriptor
    #[arg(short, long, value_parser = parse_hex_u16)]
    pub transfer_size: Option<u16>,

    /// Control transfer timeout in milliseconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Firmware parsing options
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ParseArgs {
    /// Accept files with a bad footer CRC
    #[arg(long)]
    pub no_crc_test: bool,

    /// Accept files with an unknown bcdDFU version
    #[arg(long)]
    pub no_version_test: bool,

    /// Ignore the metadata table
    #[arg(long)]
    pub no_metadata: bool,
}

impl ParseArgs {
    pub fn flags(&self) -> ParseFlags {
        let mut flags = ParseFlags::empty();
        flags.set(ParseFlags::NO_CRC_TEST, self.no_crc_test);
        flags.set(ParseFlags::NO_VERSION_TEST, self.no_version_test);
        flags.set(ParseFlags::NO_METADATA, self.no_metadata);
        flags
    }
}

/// What to do once the transfer is done
#[derive(clap::Args, Debug, Clone, Default)]
pub struct FinishArgs {
    /// Leave DFU mode when done
    #[arg(short = 'R', long)]
    pub reset: bool,

    /// Leave DFU mode and wait for the runtime device to appear
    #[arg(long)]
    pub wait_runtime: bool,
}

impl FinishArgs {
    pub fn flags(&self) -> TransferFlags {
        let mut flags = TransferFlags::empty();
        flags.set(TransferFlags::ATTACH, self.reset);
        flags.set(TransferFlags::WAIT_RUNTIME, self.wait_runtime);
        flags
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// List connected DFU devices
    List {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Show the contents of a firmware file
    Dump {
        /// Firmware file
        file: PathBuf,

        #[command(flatten)]
        parse: ParseArgs,
    },

    /// Re-encode a firmware file
    Convert {
        /// Input file
        input: PathBuf,

        /// Output file
        output: PathBuf,

        /// Output format (raw, dfu, dfuse, ihex)
        #[arg(short, long)]
        format: Format,

        /// Set the vendor ID
        #[arg(long, value_parser = parse_hex_u16)]
        vid: Option<u16>,

        /// Set the product ID
        #[arg(long, value_parser = parse_hex_u16)]
        pid: Option<u16>,

        /// Set the release number
        #[arg(long, value_parser = parse_hex_u16)]
        release: Option<u16>,

        /// Set the load address of a single-element file
        #[arg(long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Add a metadata entry
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,

        #[command(flatten)]
        parse: ParseArgs,
    },

    /// Write a firmware file to the device
    Download {
        /// Firmware file
        file: PathBuf,

        #[command(flatten)]
        device: DeviceArgs,

        /// Load address for raw files on DfuSe targets
        #[arg(long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Read back and compare after writing
        #[arg(long)]
        verify: bool,

        /// Skip the vendor and product ID check
        #[arg(long)]
        force: bool,

        #[command(flatten)]
        finish: FinishArgs,

        #[command(flatten)]
        parse: ParseArgs,
    },

    /// Read the device into a firmware file
    Upload {
        /// Output file
        file: PathBuf,

        #[command(flatten)]
        device: DeviceArgs,

        /// Expected number of bytes
        #[arg(long, value_parser = parse_hex_u32)]
        size: Option<u32>,

        /// Output format, defaults to dfu or dfuse depending on the device
        #[arg(short, long)]
        format: Option<Format>,

        #[command(flatten)]
        finish: FinishArgs,
    },

    /// Switch a runtime device into DFU mode
    Detach {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Leave DFU mode
    Attach {
        #[command(flatten)]
        device: DeviceArgs,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex_u32("0x08000000"), Ok(0x0800_0000));
        assert_eq!(parse_hex_u32("1024"), Ok(1024));
        assert_eq!(parse_hex_u16("0xDF11"), Ok(0xdf11));
        assert!(parse_hex_u16("0x10000").is_err());
        assert!(parse_hex_u16("abc").is_err());
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("key=a=b"),
            Ok(("key".to_string(), "a=b".to_string()))
        );
        assert!(parse_key_value("key").is_err());
    }

    #[test]
    fn test_cli_download() {
        let cli = Cli::try_parse_from([
            "rdfu",
            "-vv",
            "download",
            "fw.dfu",
            "--device",
            "0483:df11",
            "--alt",
            "0",
            "--verify",
            "-R",
            "--no-crc-test",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Download {
                device,
                verify,
                finish,
                parse,
                ..
            } => {
                assert_eq!(device.device.as_deref(), Some("0483:df11"));
                assert_eq!(device.alt.as_deref(), Some("0"));
                assert!(verify);
                assert_eq!(finish.flags(), TransferFlags::ATTACH);
                assert_eq!(parse.flags(), ParseFlags::NO_CRC_TEST);
            }
            _ => panic!("expected download"),
        }
    }

    #[test]
    fn test_cli_convert_format() {
        let cli = Cli::try_parse_from([
            "rdfu", "convert", "in.bin", "out.dfu", "-f", "dfu", "--vid", "0x1234", "--meta",
            "Key=Value",
        ])
        .unwrap();
        match cli.command {
            Commands::Convert {
                format,
                vid,
                metadata,
                ..
            } => {
                assert_eq!(format, Format::Dfu1_0);
                assert_eq!(vid, Some(0x1234));
                assert_eq!(metadata, vec![("Key".to_string(), "Value".to_string())]);
            }
            _ => panic!("expected convert"),
        }
    }
}
