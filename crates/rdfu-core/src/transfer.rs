//! Download and upload engine
//!
//! Moves an [`Image`] to or from a [`DfuTarget`] in `wTransferSize` chunks.
//! On DfuSe targets the engine also walks the sector map: it erases each
//! eraseable sector the first time a chunk lands in it, keeps the address
//! pointer in sync and refuses to touch memory the map marks read-only.
//!
//! All requests are issued strictly in order from the calling thread.
//! Progress callbacks fire synchronously from within the call.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use crate::descriptor::Attributes;
use crate::error::{Error, Result};
use crate::firmware::{Element, Image};
use crate::protocol::DFUSE_BLOCK_OFFSET;
use crate::sector::{Sector, SectorCaps};
use crate::target::DfuTarget;
use crate::transport::DfuTransport;

/// How long to wait for the device to come back after leaving DFU mode
pub const REPLUG_TIMEOUT: Duration = Duration::from_millis(2000);

bitflags! {
    /// Options for a transfer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransferFlags: u16 {
        /// Read back and compare after downloading
        const VERIFY = 1 << 0;
        /// Leave DFU mode when done
        const ATTACH = 1 << 1;
        /// Leave DFU mode and wait for the runtime device to re-enumerate
        const WAIT_RUNTIME = 1 << 2;
        /// Accept firmware built for any vendor ID
        const WILDCARD_VID = 1 << 3;
        /// Accept firmware built for any product ID
        const WILDCARD_PID = 1 << 4;
    }
}

/// What the engine is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Action {
    /// Nothing in progress
    Idle,
    /// Writing to the device
    Write,
    /// Reading from the device
    Read,
    /// Comparing readback with the image
    Verify,
    /// Leaving DFU mode
    Attach,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Idle => "idle",
            Action::Write => "writing",
            Action::Read => "reading",
            Action::Verify => "verifying",
            Action::Attach => "attaching",
        };
        f.write_str(s)
    }
}

/// Callbacks for transfer progress and cancellation
pub trait TransferProgress {
    /// The engine moved on to a new action
    fn action_changed(&mut self, action: Action);

    /// Progress within the current action, 0 to 100
    fn percentage_changed(&mut self, percentage: u8);

    /// Polled before every request; returning true aborts the transfer
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A no-op progress reporter
pub struct NoProgress;

impl TransferProgress for NoProgress {
    fn action_changed(&mut self, _action: Action) {}
    fn percentage_changed(&mut self, _percentage: u8) {}
}

/// Filters progress so percentages only increase within an action
struct Reporter<'a, P: TransferProgress + ?Sized> {
    inner: &'a mut P,
    action: Action,
    percentage: Option<u8>,
}

impl<'a, P: TransferProgress + ?Sized> Reporter<'a, P> {
    fn new(inner: &'a mut P) -> Self {
        Self {
            inner,
            action: Action::Idle,
            percentage: None,
        }
    }

    fn action(&mut self, action: Action) {
        if action != self.action {
            self.action = action;
            self.percentage = None;
            self.inner.action_changed(action);
        }
    }

    fn progress(&mut self, done: usize, total: usize) {
        let pct = if total == 0 {
            100
        } else {
            ((done.min(total) as u64 * 100) / total as u64) as u8
        };
        if self.percentage.map_or(true, |last| pct > last) {
            self.percentage = Some(pct);
            self.inner.percentage_changed(pct);
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.inner.is_cancelled() {
            log::info!("transfer cancelled");
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Per-download bookkeeping, dropped when the download returns
#[derive(Default)]
struct DownloadSession {
    /// Indices into the sector map of sectors erased so far
    erased: HashSet<usize>,
}

/// Describe the first difference between two buffers
pub fn compare_verbose(got: &[u8], expected: &[u8]) -> Option<String> {
    if got.len() != expected.len() {
        return Some(format!(
            "got {} bytes, expected {}",
            got.len(),
            expected.len()
        ));
    }
    got.iter()
        .zip(expected)
        .position(|(a, b)| a != b)
        .map(|i| {
            format!(
                "got 0x{:02x}, expected 0x{:02x} @ 0x{:04x}",
                got[i], expected[i], i
            )
        })
}

/// Download every element of `image` to the target
///
/// A zero-length chunk terminates each element. With
/// [`TransferFlags::VERIFY`] each element is read back afterwards.
pub fn download<T, P>(
    transport: &mut T,
    target: &mut DfuTarget,
    image: &Image,
    flags: TransferFlags,
    progress: &mut P,
) -> Result<()>
where
    T: DfuTransport + ?Sized,
    P: TransferProgress + ?Sized,
{
    if !target.can(Attributes::CAN_DOWNLOAD) {
        return Err(Error::NotSupported("target cannot do downloading".into()));
    }
    if !target.is_open() {
        return Err(Error::Internal("target is not open".into()));
    }

    let mut reporter = Reporter::new(progress);
    let mut session = DownloadSession::default();
    let total = image.size();
    let mut written = 0;

    log::info!(
        "downloading {} bytes in {} element(s) to alt setting {}",
        total,
        image.elements().len(),
        target.alt_setting()
    );
    reporter.action(Action::Write);
    for element in image.elements() {
        download_element(
            transport,
            target,
            element,
            &mut session,
            &mut reporter,
            written,
            total,
        )?;
        written += element.len();
    }

    if flags.contains(TransferFlags::VERIFY) {
        reporter.action(Action::Verify);
        let mut verified = 0;
        for element in image.elements().iter().filter(|e| !e.is_empty()) {
            reporter.check_cancelled()?;
            let readback = read_region(
                transport,
                target,
                element.address(),
                element.len(),
                &mut reporter,
                None,
            )?;
            if let Some(diff) = compare_verbose(&readback, element.contents()) {
                return Err(Error::VerifyFailed(diff));
            }
            verified += element.len();
            reporter.progress(verified, total);
        }
        log::info!("verified {} bytes", total);
    }

    finish(transport, target, flags, &mut reporter)
}

fn download_element<T, P>(
    transport: &mut T,
    target: &mut DfuTarget,
    element: &Element,
    session: &mut DownloadSession,
    reporter: &mut Reporter<'_, P>,
    done_before: usize,
    total: usize,
) -> Result<()>
where
    T: DfuTransport + ?Sized,
    P: TransferProgress + ?Sized,
{
    let transfer_size = target.transfer_size() as usize;
    let data = element.contents();
    let chunk_count = data.len().div_ceil(transfer_size);
    let dfuse = target.is_dfuse();
    let block_offset = if dfuse { DFUSE_BLOCK_OFFSET } else { 0 };

    log::debug!(
        "element at 0x{:08x}: {} bytes in {} chunk(s) of {}",
        element.address(),
        data.len(),
        chunk_count,
        transfer_size
    );

    let mut pointer_set = false;
    let mut last_group: Option<(u16, u16)> = None;

    for i in 0..=chunk_count {
        reporter.check_cancelled()?;

        let block = u16::try_from(i)
            .ok()
            .and_then(|b| b.checked_add(block_offset))
            .ok_or_else(|| {
                Error::NotSupported(format!(
                    "element of {} bytes needs more blocks than wBlockNum can address",
                    data.len()
                ))
            })?;

        // final zero-length chunk marks the end of the element
        if i == chunk_count {
            target.download_chunk(transport, block, &[])?;
            if target.can(Attributes::MANIFEST_TOL) {
                target.check_status(transport)?;
            } else if let Err(e) = target.check_status(transport) {
                log::debug!("ignoring status after final chunk: {}", e);
            }
            break;
        }

        let offset = i * transfer_size;
        let chunk = &data[offset..data.len().min(offset + transfer_size)];
        let address = chunk_address(element, offset)?;

        if dfuse {
            let mut erased_now = false;
            let group = if target.sectors().is_empty() {
                None
            } else {
                let (group, erased) =
                    prepare_sectors(transport, target, session, reporter, address, chunk.len())?;
                erased_now = erased;
                Some(group)
            };
            if !pointer_set || erased_now || group != last_group {
                target.set_address(transport, element.address())?;
                pointer_set = true;
                last_group = group;
            }
        }

        target.download_chunk(transport, block, chunk)?;
        target.check_status(transport)?;
        reporter.progress(done_before + offset + chunk.len(), total);
    }
    Ok(())
}

/// Check and erase every sector a chunk touches
///
/// Returns the sector group owning the chunk's first byte and whether any
/// sector was erased.
fn prepare_sectors<T, P>(
    transport: &mut T,
    target: &mut DfuTarget,
    session: &mut DownloadSession,
    reporter: &mut Reporter<'_, P>,
    address: u32,
    len: usize,
) -> Result<((u16, u16), bool)>
where
    T: DfuTransport + ?Sized,
    P: TransferProgress + ?Sized,
{
    let (_, owner) = target
        .sectors()
        .sector_for_address(address)
        .ok_or(Error::NoSectorAtAddress(address))?;
    let group = (owner.zone, owner.number);

    let end = address as u64 + len as u64;
    let touched: Vec<(usize, Sector)> = target
        .sectors()
        .sectors()
        .iter()
        .enumerate()
        .filter(|(_, s)| overlaps(s, u64::from(address), end))
        .map(|(idx, s)| (idx, *s))
        .collect();

    let mut erased = false;
    for (idx, sector) in touched {
        if !sector.has_cap(SectorCaps::WRITEABLE) {
            return Err(Error::SectorNotWritable(address.max(sector.address)));
        }
        if !sector.has_cap(SectorCaps::ERASEABLE) || session.erased.contains(&idx) {
            continue;
        }
        reporter.check_cancelled()?;
        log::debug!("erasing {}", sector);
        target.erase_page(transport, sector.address)?;
        session.erased.insert(idx);
        erased = true;
    }
    Ok((group, erased))
}

fn overlaps(sector: &Sector, start: u64, end: u64) -> bool {
    let s_start = sector.address as u64;
    if sector.size == 0 {
        return end > s_start;
    }
    let s_end = s_start + sector.size as u64;
    start < s_end && end > s_start
}

fn chunk_address(element: &Element, offset: usize) -> Result<u32> {
    u32::try_from(offset)
        .ok()
        .and_then(|o| element.address().checked_add(o))
        .ok_or_else(|| {
            Error::NotSupported(format!(
                "element at 0x{:08x} extends past the 32-bit address space",
                element.address()
            ))
        })
}

/// Read `len` bytes starting at `address` back from the target
///
/// On plain DFU targets the address is ignored and the device's single
/// memory is read from the start.
pub fn upload_element<T, P>(
    transport: &mut T,
    target: &mut DfuTarget,
    address: u32,
    len: usize,
    progress: &mut P,
) -> Result<Vec<u8>>
where
    T: DfuTransport + ?Sized,
    P: TransferProgress + ?Sized,
{
    if !target.can(Attributes::CAN_UPLOAD) {
        return Err(Error::NotSupported("target cannot do uploading".into()));
    }
    let mut reporter = Reporter::new(progress);
    reporter.action(Action::Read);
    let data = read_region(transport, target, address, len, &mut reporter, Some(len))?;
    if data.len() != len {
        return Err(Error::SizeMismatch {
            expected: len,
            actual: data.len(),
        });
    }
    Ok(data)
}

/// Read from the device until a short chunk or `max` bytes
fn read_region<T, P>(
    transport: &mut T,
    target: &mut DfuTarget,
    address: u32,
    max: usize,
    reporter: &mut Reporter<'_, P>,
    report_total: Option<usize>,
) -> Result<Vec<u8>>
where
    T: DfuTransport + ?Sized,
    P: TransferProgress + ?Sized,
{
    let dfuse = target.is_dfuse();
    if dfuse {
        if !target.sectors().is_empty() {
            let (_, sector) = target
                .sectors()
                .sector_for_address(address)
                .ok_or(Error::NoSectorAtAddress(address))?;
            if !sector.has_cap(SectorCaps::READABLE) {
                return Err(Error::SectorNotReadable(address));
            }
        }
        target.set_address(transport, address)?;
        target.abort(transport)?;
    }

    let transfer_size = target.transfer_size();
    let mut block = if dfuse { DFUSE_BLOCK_OFFSET } else { 0 };
    let mut data = Vec::with_capacity(max);
    loop {
        reporter.check_cancelled()?;
        let chunk = target.upload_chunk(transport, block, transfer_size)?;
        let short = chunk.len() < transfer_size as usize;
        data.extend_from_slice(&chunk);
        if let Some(total) = report_total {
            reporter.progress(data.len(), total);
        }
        if short || (max > 0 && data.len() >= max) {
            break;
        }
        block = block
            .checked_add(1)
            .ok_or_else(|| Error::InvalidDevice("device never sent a short chunk".into()))?;
    }

    if dfuse {
        target.abort(transport)?;
    }
    if max > 0 {
        data.truncate(max);
    }
    Ok(data)
}

/// Upload the whole target into an image
///
/// DfuSe targets with a memory map yield one element per readable sector
/// group; everything else yields a single element. With a non-zero
/// `expected_size` reading stops after that many bytes and a short read is
/// an error.
pub fn upload<T, P>(
    transport: &mut T,
    target: &mut DfuTarget,
    expected_size: usize,
    flags: TransferFlags,
    progress: &mut P,
) -> Result<Image>
where
    T: DfuTransport + ?Sized,
    P: TransferProgress + ?Sized,
{
    if !target.can(Attributes::CAN_UPLOAD) {
        return Err(Error::NotSupported("target cannot do uploading".into()));
    }
    if !target.is_open() {
        return Err(Error::Internal("target is not open".into()));
    }

    let mut reporter = Reporter::new(progress);
    reporter.action(Action::Read);

    let mut image = Image::new();
    image.set_alt_setting(target.alt_setting());
    image.set_name(target.name());

    if target.is_dfuse() && !target.sectors().is_empty() {
        let groups: Vec<(Sector, u64)> = group_starts(target.sectors().sectors())
            .into_iter()
            .map(|s| (s, target.sectors().group_size(s.zone, s.number)))
            .collect();
        let readable_total: u64 = groups
            .iter()
            .filter(|(s, _)| s.has_cap(SectorCaps::READABLE))
            .map(|(_, size)| size)
            .sum();
        let total = if expected_size > 0 {
            expected_size
        } else {
            readable_total as usize
        };

        let mut read = 0usize;
        for (sector, size) in groups {
            if expected_size > 0 && read >= expected_size {
                break;
            }
            if !sector.has_cap(SectorCaps::READABLE) {
                log::debug!("skipping unreadable {}", sector);
                continue;
            }
            let mut max = size as usize;
            if expected_size > 0 {
                max = max.min(expected_size - read);
            }
            log::debug!("uploading 0x{:x} bytes from 0x{:08x}", max, sector.address);
            let data = read_region(transport, target, sector.address, max, &mut reporter, None)?;
            read += data.len();
            reporter.progress(read, total);
            image.add_element(Element::with_address(data, sector.address));
        }
    } else {
        let total = if expected_size > 0 {
            Some(expected_size)
        } else {
            None
        };
        let data = read_region(transport, target, 0, expected_size, &mut reporter, total)?;
        image.add_element(Element::new(data));
    }

    if expected_size > 0 && image.size() != expected_size {
        return Err(Error::SizeMismatch {
            expected: expected_size,
            actual: image.size(),
        });
    }
    log::info!(
        "uploaded {} bytes from alt setting {}",
        image.size(),
        target.alt_setting()
    );

    finish(transport, target, flags, &mut reporter)?;
    Ok(image)
}

/// First sector of each (zone, number) group, in map order
fn group_starts(sectors: &[Sector]) -> Vec<Sector> {
    let mut seen = HashSet::new();
    sectors
        .iter()
        .filter(|s| seen.insert((s.zone, s.number)))
        .copied()
        .collect()
}

fn finish<T, P>(
    transport: &mut T,
    target: &mut DfuTarget,
    flags: TransferFlags,
    reporter: &mut Reporter<'_, P>,
) -> Result<()>
where
    T: DfuTransport + ?Sized,
    P: TransferProgress + ?Sized,
{
    if flags.intersects(TransferFlags::ATTACH | TransferFlags::WAIT_RUNTIME) {
        reporter.check_cancelled()?;
        reporter.action(Action::Attach);
        target.attach(transport)?;
    }
    if flags.contains(TransferFlags::WAIT_RUNTIME) {
        log::info!("waiting for runtime device");
        transport
            .wait_for_replug(REPLUG_TIMEOUT)
            .map_err(|e| Error::transport("device did not come back", e))?;
    }
    reporter.action(Action::Idle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::SectorMap;

    #[test]
    fn test_compare_verbose() {
        assert_eq!(compare_verbose(b"abc", b"abc"), None);
        assert_eq!(
            compare_verbose(b"ab", b"abc").as_deref(),
            Some("got 2 bytes, expected 3")
        );
        assert_eq!(
            compare_verbose(&[0, 1, 2, 3], &[0, 1, 0xff, 3]).as_deref(),
            Some("got 0x02, expected 0xff @ 0x0002")
        );
    }

    #[test]
    fn test_group_starts() {
        let map = SectorMap::parse("@Flash/0x08000000/4*16Kg,1*64Kg/0x1fff0000/2*1Ka").unwrap();
        let starts = group_starts(map.sectors());
        let addrs: Vec<u32> = starts.iter().map(|s| s.address).collect();
        assert_eq!(addrs, vec![0x0800_0000, 0x0801_0000, 0x1fff_0000]);
    }

    #[test]
    fn test_overlaps() {
        let map = SectorMap::parse("@Flash/0x1000/2*1Kg").unwrap();
        let s = map.sectors();
        assert!(overlaps(&s[0], 0x1000, 0x1001));
        assert!(!overlaps(&s[1], 0x1000, 0x1400));
        assert!(overlaps(&s[1], 0x13ff, 0x1401));
    }

    struct Recorder {
        events: Vec<String>,
    }

    impl TransferProgress for Recorder {
        fn action_changed(&mut self, action: Action) {
            self.events.push(action.to_string());
        }
        fn percentage_changed(&mut self, percentage: u8) {
            self.events.push(percentage.to_string());
        }
    }

    #[test]
    fn test_reporter_is_monotonic() {
        let mut rec = Recorder { events: Vec::new() };
        {
            let mut r = Reporter::new(&mut rec);
            r.action(Action::Write);
            r.progress(10, 100);
            r.progress(5, 100);
            r.progress(10, 100);
            r.progress(100, 100);
            r.action(Action::Verify);
            r.progress(50, 100);
            r.action(Action::Verify);
        }
        assert_eq!(
            rec.events,
            vec!["writing", "10", "100", "verifying", "50"]
        );
    }
}
