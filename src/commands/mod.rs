//! CLI command implementations
//!
//! File commands (`dump`, `convert`) only touch the firmware codec. Device
//! commands run against any [`rdfu_core::DfuTransport`], so they work the
//! same way on real hardware and on the dummy device.

mod file;
mod list;
mod progress;
mod transfer;

pub use file::{load_firmware, run_convert, run_dump, ConvertOptions};
pub use list::run_list;
pub use transfer::{run_attach, run_detach, run_download, run_upload, DownloadOptions};
