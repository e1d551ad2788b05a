//! DfuSe memory map decoding (UM0424)
//!
//! ST DfuSe bootloaders describe each alternate setting's memory layout in
//! the interface string, e.g.
//!
//! ```text
//! @Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg
//! ```
//!
//! After an optional title come `/<address>/<sectors>` groups. Each sector
//! token is `<count>*<size><unit><type>` where the unit is `B`, `K` or `M`
//! and the type letter `a`..`g` encodes the read/erase/write capabilities.

use std::fmt;

use bitflags::bitflags;

use crate::error::SectorMapError;
use crate::firmware::CipherKind;

/// Largest sector count or size field accepted in a token
const MAX_TOKEN_FIELD: u32 = 999;

bitflags! {
    /// What a sector can do
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SectorCaps: u8 {
        /// Can be uploaded from
        const READABLE = 1 << 0;
        /// Needs an explicit erase before programming
        const ERASEABLE = 1 << 1;
        /// Can be downloaded to
        const WRITEABLE = 1 << 2;
    }
}

impl SectorCaps {
    /// Decode a UM0424 type letter
    pub fn from_type_letter(c: char) -> Option<Self> {
        let caps = match c {
            'a' => Self::READABLE,
            'b' => Self::ERASEABLE,
            'c' => Self::READABLE | Self::ERASEABLE,
            'd' => Self::WRITEABLE,
            'e' => Self::READABLE | Self::WRITEABLE,
            'f' => Self::ERASEABLE | Self::WRITEABLE,
            'g' => Self::READABLE | Self::ERASEABLE | Self::WRITEABLE,
            _ => return None,
        };
        Some(caps)
    }
}

impl fmt::Display for SectorCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |cap, c| if self.contains(cap) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Self::READABLE, 'R'),
            flag(Self::ERASEABLE, 'E'),
            flag(Self::WRITEABLE, 'W')
        )
    }
}

/// One contiguous region with uniform capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    /// First address
    pub address: u32,
    /// Size in bytes, 0 for an open-ended region
    pub size: u32,
    /// Bytes from this sector's start to the end of its zone
    pub size_left: u32,
    /// Index of the `/address/` group
    pub zone: u16,
    /// Index of the sector token within the zone
    pub number: u16,
    /// Capabilities
    pub caps: SectorCaps,
}

impl Sector {
    /// Whether `address` falls inside this sector
    ///
    /// A zero-sized sector covers everything from its start address up.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.address && (self.size == 0 || address - self.address < self.size)
    }

    /// Whether two sectors came from the same sector token
    pub fn same_group(&self, other: &Sector) -> bool {
        self.zone == other.zone && self.number == other.number
    }

    /// Check a capability
    pub fn has_cap(&self, cap: SectorCaps) -> bool {
        self.caps.contains(cap)
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "zone:{} sec#:{} addr:0x{:08x} size:0x{:04x} size_left:0x{:04x} caps:{}",
            self.zone, self.number, self.address, self.size, self.size_left, self.caps
        )
    }
}

/// Ordered list of sectors decoded from an alternate-setting name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectorMap {
    title: Option<String>,
    sectors: Vec<Sector>,
    cipher_kind: CipherKind,
}

impl SectorMap {
    /// Decode an alternate-setting name
    ///
    /// Names that are not in DfuSe form yield an empty map.
    pub fn parse(name: &str) -> Result<Self, SectorMapError> {
        let mut map = SectorMap::default();

        let name = if name.contains("|XTEA") {
            map.cipher_kind = CipherKind::Xtea;
            name.replace("|XTEA", "")
        } else {
            name.to_string()
        };

        // Openmoko style single RAM address
        if let Some(rest) = name.strip_prefix("RAM 0x") {
            let digits: String = rest.chars().take_while(char::is_ascii_hexdigit).collect();
            let address = u32::from_str_radix(&digits, 16)
                .map_err(|_| SectorMapError::InvalidNumber(rest.to_string()))?;
            log::debug!("RAM description at 0x{:08x}", address);
            map.sectors.push(Sector {
                address,
                size: 0,
                size_left: 0,
                zone: 0,
                number: 0,
                caps: SectorCaps::READABLE | SectorCaps::WRITEABLE,
            });
            return Ok(map);
        }

        let Some(body) = name.strip_prefix('@') else {
            return Ok(map);
        };

        let mut parts = body.split('/');
        map.title = parts
            .next()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        let mut zone: u16 = 0;
        while let Some(addr_str) = parts.next() {
            let addr_str = addr_str.trim();
            if addr_str.is_empty() {
                // tolerate a trailing '/'
                if parts.clone().all(|p| p.trim().is_empty()) {
                    break;
                }
                return Err(SectorMapError::InvalidNumber(String::new()));
            }
            let base = parse_address(addr_str)?;
            let list = parts.next().ok_or(SectorMapError::MissingSectors(base))?;
            if list.trim().is_empty() {
                return Err(SectorMapError::MissingSectors(base));
            }

            let zone_start = map.sectors.len();
            let mut addr = base;
            for (number, token) in list.split(',').enumerate() {
                let (count, size, caps) = parse_token(token)?;
                for _ in 0..count {
                    map.sectors.push(Sector {
                        address: addr,
                        size,
                        size_left: 0,
                        zone,
                        number: number as u16,
                        caps,
                    });
                    addr = addr.checked_add(size).ok_or(SectorMapError::Overflow(base))?;
                }
            }

            let zone_end = addr;
            for sector in &mut map.sectors[zone_start..] {
                sector.size_left = zone_end - sector.address;
            }
            zone += 1;
        }

        for sector in &map.sectors {
            log::trace!("{}", sector);
        }
        Ok(map)
    }

    /// Human-readable part of the name, without the leading `@`
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Cipher signalled by a `|XTEA` marker in the name
    pub fn cipher_kind(&self) -> CipherKind {
        self.cipher_kind
    }

    /// All sectors in order
    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    /// Whether the map holds no sectors
    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    /// First sector containing `address`, with its index in the map
    pub fn sector_for_address(&self, address: u32) -> Option<(usize, &Sector)> {
        self.sectors
            .iter()
            .enumerate()
            .find(|(_, s)| s.contains(address))
    }

    /// Total size of all sectors sharing a sector token
    pub fn group_size(&self, zone: u16, number: u16) -> u64 {
        self.sectors
            .iter()
            .filter(|s| s.zone == zone && s.number == number)
            .map(|s| s.size as u64)
            .sum()
    }
}

fn parse_address(s: &str) -> Result<u32, SectorMapError> {
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| SectorMapError::InvalidNumber(s.to_string()))?;
    u32::from_str_radix(hex, 16).map_err(|_| SectorMapError::InvalidNumber(s.to_string()))
}

fn parse_token(raw: &str) -> Result<(u32, u32, SectorCaps), SectorMapError> {
    let token = raw.trim_start();
    let (count_str, rest) = token
        .split_once('*')
        .ok_or_else(|| SectorMapError::MissingSuffix(token.to_string(), "'*'"))?;
    let count: u32 = count_str
        .trim()
        .parse()
        .map_err(|_| SectorMapError::InvalidNumber(count_str.to_string()))?;
    if count > MAX_TOKEN_FIELD {
        return Err(SectorMapError::OutOfRange(token.to_string(), "count"));
    }

    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let size: u32 = rest[..digits_end]
        .parse()
        .map_err(|_| SectorMapError::InvalidNumber(rest.to_string()))?;
    if size == 0 || size > MAX_TOKEN_FIELD {
        return Err(SectorMapError::OutOfRange(token.to_string(), "size"));
    }

    let mut suffix = rest[digits_end..].chars();
    let multiplier = match suffix.next() {
        // ST's reference bootloader uses a space for bytes
        Some('B') | Some(' ') => 1,
        Some('K') => 1024,
        Some('M') => 1024 * 1024,
        Some(c) => return Err(SectorMapError::UnknownSuffix(token.to_string(), "unit", c)),
        None => return Err(SectorMapError::MissingSuffix(token.to_string(), "unit")),
    };
    let caps = match suffix.next() {
        Some(c) => SectorCaps::from_type_letter(c)
            .ok_or_else(|| SectorMapError::UnknownSuffix(token.to_string(), "type", c))?,
        None => return Err(SectorMapError::MissingSuffix(token.to_string(), "type")),
    };

    let size = size
        .checked_mul(multiplier)
        .ok_or_else(|| SectorMapError::InvalidNumber(token.to_string()))?;
    Ok((count, size, caps))
}
