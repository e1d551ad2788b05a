//! Multi-target DFU device
//!
//! A [`DfuDevice`] owns the transport and one [`DfuTarget`] per alternate
//! setting, and maps whole [`Firmware`] files onto them.

use crate::error::{Error, Result};
use crate::firmware::{CipherKind, Firmware, Format, ID_UNSET};
use crate::target::{DfuTarget, OpenFlags, TargetConfig};
use crate::transfer::{self, TransferFlags, TransferProgress, REPLUG_TIMEOUT};
use crate::transport::{DfuTransport, UsbIds};

/// A DFU-capable USB device and its alternate settings
pub struct DfuDevice<T: DfuTransport> {
    transport: T,
    ids: UsbIds,
    targets: Vec<DfuTarget>,
}

impl<T: DfuTransport> DfuDevice<T> {
    /// Build the target list from the transport's interface descriptors
    pub fn new(transport: T, config: TargetConfig) -> Result<Self> {
        let ids = transport.usb_ids();
        let interfaces = transport.interfaces();
        if interfaces.is_empty() {
            return Err(Error::NotFound(format!(
                "{:04x}:{:04x} has no DFU interface",
                ids.vid, ids.pid
            )));
        }

        let targets = interfaces
            .into_iter()
            .map(|iface| DfuTarget::new(iface, ids, config))
            .collect();
        Ok(Self {
            transport,
            ids,
            targets,
        })
    }

    /// Open every target
    pub fn open(&mut self, flags: OpenFlags) -> Result<()> {
        for target in &mut self.targets {
            target.open(&mut self.transport, flags)?;
        }
        Ok(())
    }

    /// USB identity
    pub fn usb_ids(&self) -> UsbIds {
        self.ids
    }

    /// Borrow the transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give back the transport
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// All targets in interface order
    pub fn targets(&self) -> &[DfuTarget] {
        &self.targets
    }

    /// Whether any target speaks DfuSe
    pub fn is_dfuse(&self) -> bool {
        self.targets.iter().any(DfuTarget::is_dfuse)
    }

    fn index_by_alt_setting(&self, alt_setting: u8) -> Result<usize> {
        self.targets
            .iter()
            .position(|t| t.alt_setting() == alt_setting)
            .ok_or_else(|| Error::NotFound(format!("no target with alt setting {}", alt_setting)))
    }

    fn index_by_name(&self, name: &str) -> Result<usize> {
        self.targets
            .iter()
            .position(|t| t.name() == Some(name) || t.display_name() == Some(name))
            .ok_or_else(|| Error::NotFound(format!("no target named '{}'", name)))
    }

    /// Find a target by alternate setting
    pub fn target_by_alt_setting(&self, alt_setting: u8) -> Result<&DfuTarget> {
        Ok(&self.targets[self.index_by_alt_setting(alt_setting)?])
    }

    /// Find a target by its full name or memory-map title
    ///
    /// Names are only known once the target has been opened.
    pub fn target_by_name(&self, name: &str) -> Result<&DfuTarget> {
        Ok(&self.targets[self.index_by_name(name)?])
    }

    /// Borrow the transport and one target at the same time
    pub fn split(&mut self, alt_setting: u8) -> Result<(&mut T, &mut DfuTarget)> {
        let idx = self.index_by_alt_setting(alt_setting)?;
        Ok((&mut self.transport, &mut self.targets[idx]))
    }

    /// Same as [`split`](Self::split), selecting the target by name
    pub fn split_by_name(&mut self, name: &str) -> Result<(&mut T, &mut DfuTarget)> {
        let idx = self.index_by_name(name)?;
        Ok((&mut self.transport, &mut self.targets[idx]))
    }

    fn check_ids(&self, firmware: &Firmware, flags: TransferFlags) -> Result<()> {
        if firmware.vid() != ID_UNSET
            && !flags.contains(TransferFlags::WILDCARD_VID)
            && firmware.vid() != self.ids.vid
        {
            return Err(Error::InvalidDevice(format!(
                "vendor ID incorrect, expected 0x{:04x} got 0x{:04x}",
                firmware.vid(),
                self.ids.vid
            )));
        }
        if firmware.pid() != ID_UNSET
            && !flags.contains(TransferFlags::WILDCARD_PID)
            && firmware.pid() != self.ids.pid
        {
            return Err(Error::InvalidDevice(format!(
                "product ID incorrect, expected 0x{:04x} got 0x{:04x}",
                firmware.pid(),
                self.ids.pid
            )));
        }
        Ok(())
    }

    /// Download every image of `firmware` to the target with the same
    /// alternate setting
    pub fn download<P>(
        &mut self,
        firmware: &Firmware,
        flags: TransferFlags,
        progress: &mut P,
    ) -> Result<()>
    where
        P: TransferProgress + ?Sized,
    {
        self.check_ids(firmware, flags)?;
        if firmware.images().is_empty() {
            return Err(Error::Internal("firmware has no images".into()));
        }

        let per_image = flags - (TransferFlags::ATTACH | TransferFlags::WAIT_RUNTIME);
        for image in firmware.images() {
            let idx = self.index_by_alt_setting(image.alt_setting())?;
            let target = &mut self.targets[idx];
            target.open(&mut self.transport, OpenFlags::empty())?;
            if firmware.cipher_kind() != target.cipher_kind() {
                log::warn!(
                    "firmware cipher {:?} does not match target cipher {:?}",
                    firmware.cipher_kind(),
                    target.cipher_kind()
                );
            }
            log::info!(
                "downloading image for alt setting {} ({})",
                image.alt_setting(),
                target.display_name().unwrap_or("unnamed")
            );
            transfer::download(&mut self.transport, target, image, per_image, progress)?;
        }

        self.finish(flags)
    }

    /// Upload every target into a firmware
    pub fn upload<P>(&mut self, flags: TransferFlags, progress: &mut P) -> Result<Firmware>
    where
        P: TransferProgress + ?Sized,
    {
        let format = if self.targets.len() > 1 || self.is_dfuse() {
            Format::DfuSe
        } else {
            Format::Dfu1_0
        };
        let mut firmware = Firmware::new();
        firmware.set_format(format);
        firmware.set_vid(self.ids.vid);
        firmware.set_pid(self.ids.pid);
        firmware.set_release(self.ids.release);

        let per_target = flags - (TransferFlags::ATTACH | TransferFlags::WAIT_RUNTIME);
        for target in &mut self.targets {
            target.open(&mut self.transport, OpenFlags::empty())?;
            if target.cipher_kind() != CipherKind::None {
                firmware.set_cipher_kind(target.cipher_kind());
            }
            let image = transfer::upload(&mut self.transport, target, 0, per_target, progress)?;
            firmware.add_image(image);
        }

        self.finish(flags)?;
        Ok(firmware)
    }

    /// Switch the device into DFU mode
    pub fn detach(&mut self) -> Result<()> {
        let target = self
            .targets
            .first_mut()
            .ok_or_else(|| Error::NotFound("no target".into()))?;
        target.open(&mut self.transport, OpenFlags::NO_AUTO_REFRESH)?;
        target.detach(&mut self.transport)
    }

    /// Leave DFU mode
    pub fn attach(&mut self) -> Result<()> {
        let target = self
            .targets
            .first_mut()
            .ok_or_else(|| Error::NotFound("no target".into()))?;
        target.open(&mut self.transport, OpenFlags::NO_AUTO_REFRESH)?;
        target.attach(&mut self.transport)
    }

    fn finish(&mut self, flags: TransferFlags) -> Result<()> {
        if flags.intersects(TransferFlags::ATTACH | TransferFlags::WAIT_RUNTIME) {
            self.attach()?;
        }
        if flags.contains(TransferFlags::WAIT_RUNTIME) {
            self.transport
                .wait_for_replug(REPLUG_TIMEOUT)
                .map_err(|e| Error::transport("device did not come back", e))?;
        }
        Ok(())
    }
}
