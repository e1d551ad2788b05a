//! Firmware file commands

use std::fs;
use std::path::Path;

use rdfu_core::firmware::{Firmware, Format, ParseFlags};

/// Read and decode a firmware file
pub fn load_firmware(path: &Path, flags: ParseFlags) -> Result<Firmware, Box<dyn std::error::Error>> {
    let data = fs::read(path)?;
    log::debug!("Read {} bytes from {:?}", data.len(), path);
    let firmware = Firmware::parse(&data, flags)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
    Ok(firmware)
}

/// Encode and write a firmware file
pub fn save_firmware(firmware: &Firmware, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let data = firmware.write()?;
    fs::write(path, &data)?;
    println!(
        "Wrote {} bytes to {:?} ({})",
        data.len(),
        path,
        firmware.format()
    );
    Ok(())
}

/// Set the load address of a firmware with a single element
pub fn set_load_address(firmware: &mut Firmware, address: u32) -> Result<(), Box<dyn std::error::Error>> {
    match firmware.images_mut().as_mut_slice() {
        [image] => match image.elements_mut() {
            [element] => {
                element.set_address(address);
                Ok(())
            }
            elements => Err(format!(
                "--address needs a single element, file has {}",
                elements.len()
            )
            .into()),
        },
        images => Err(format!("--address needs a single image, file has {}", images.len()).into()),
    }
}

/// Run the dump command
pub fn run_dump(path: &Path, flags: ParseFlags) -> Result<(), Box<dyn std::error::Error>> {
    let firmware = load_firmware(path, flags)?;
    println!("{}", path.display());
    print!("{}", firmware);
    println!("total size:  {} bytes", firmware.size());
    Ok(())
}

/// Header fields and metadata for `convert`
#[derive(Debug, Default)]
pub struct ConvertOptions {
    pub format: Format,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub release: Option<u16>,
    pub address: Option<u32>,
    pub metadata: Vec<(String, String)>,
}

/// Run the convert command
pub fn run_convert(
    input: &Path,
    output: &Path,
    flags: ParseFlags,
    options: &ConvertOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut firmware = load_firmware(input, flags)?;
    log::info!(
        "Converting {} firmware to {}",
        firmware.format(),
        options.format
    );

    firmware.set_format(options.format);
    if let Some(vid) = options.vid {
        firmware.set_vid(vid);
    }
    if let Some(pid) = options.pid {
        firmware.set_pid(pid);
    }
    if let Some(release) = options.release {
        firmware.set_release(release);
    }
    if let Some(address) = options.address {
        set_load_address(&mut firmware, address)?;
    }
    for (key, value) in &options.metadata {
        firmware.set_metadata(key.as_str(), value.as_str());
    }

    save_firmware(&firmware, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdfu_core::firmware::{Element, Image};

    #[test]
    fn test_set_load_address() {
        let mut firmware = Firmware::from_image(
            Image::from_element(Element::new(vec![1, 2, 3])),
            Format::Raw,
        );
        set_load_address(&mut firmware, 0x0800_0000).unwrap();
        assert_eq!(firmware.images()[0].elements()[0].address(), 0x0800_0000);

        firmware.images_mut()[0].add_element(Element::new(vec![4]));
        assert!(set_load_address(&mut firmware, 0).is_err());
    }

    #[test]
    fn test_convert_raw_to_dfu_and_back() {
        let dir = std::env::temp_dir().join(format!("rdfu-convert-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let raw = dir.join("fw.bin");
        let dfu = dir.join("fw.dfu");
        let back = dir.join("back.bin");
        fs::write(&raw, (0..=255u8).collect::<Vec<_>>()).unwrap();

        let options = ConvertOptions {
            format: Format::Dfu1_0,
            vid: Some(0x1234),
            pid: Some(0x5678),
            metadata: vec![("Key".into(), "Value".into())],
            ..Default::default()
        };
        run_convert(&raw, &dfu, ParseFlags::empty(), &options).unwrap();

        let firmware = load_firmware(&dfu, ParseFlags::empty()).unwrap();
        assert_eq!(firmware.format(), Format::Dfu1_0);
        assert_eq!(firmware.vid(), 0x1234);
        assert_eq!(firmware.pid(), 0x5678);
        assert_eq!(firmware.metadata_value("Key"), Some("Value"));

        let options = ConvertOptions {
            format: Format::Raw,
            ..Default::default()
        };
        run_convert(&dfu, &back, ParseFlags::empty(), &options).unwrap();
        assert_eq!(fs::read(&back).unwrap(), fs::read(&raw).unwrap());

        fs::remove_dir_all(&dir).unwrap();
    }
}
