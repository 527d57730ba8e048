//! Amiga ROM image identification.
//!
//! ROM dumps are recognized by their leading signature bytes: a reset
//! vector stub of the form `$1111`/`$1114`/`$1116` followed by a `JMP`
//! into the ROM area. Buffers that match no known signature are rejected
//! before they get anywhere near the memory map.

use std::fmt;

pub const KB: usize = 1024;

/// Accepted Kickstart image sizes (256 KB and 512 KB).
pub const KICK_SIZES: [usize; 2] = [256 * KB, 512 * KB];

/// The A1000 boot ROM is 8 KB mirrored into a 64 KB window.
pub const BOOT_ROM_SIZE: usize = 64 * KB;

/// Leading bytes of the known boot ROM.
const BOOT_SIGNATURES: [[u8; 8]; 1] = [[0x11, 0x11, 0x4E, 0xF9, 0x00, 0xF8, 0x00, 0x8A]];

/// Leading bytes of known Kickstart builds (1.x through 3.x and AROS).
const KICK_SIGNATURES: [[u8; 7]; 4] = [
    [0x11, 0x14, 0x4E, 0xF9, 0x00, 0xF8, 0x00],
    [0x11, 0x14, 0x4E, 0xF9, 0x00, 0xFC, 0x00],
    [0x11, 0x16, 0x4E, 0xF9, 0x00, 0x20, 0x00],
    [0x11, 0x14, 0x4E, 0xF9, 0x00, 0x20, 0x00],
];

/// What a ROM buffer turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomKind {
    /// A1000 bootstrap ROM (loads Kickstart from disk into the WCS).
    Boot,
    /// Kickstart ROM.
    Kickstart,
    /// AROS open-source Kickstart replacement.
    Aros,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RomError {
    /// No known signature at the start of the buffer.
    UnknownSignature,
    /// Signature matched but the size is not a valid ROM size.
    BadSize(usize),
}

impl fmt::Display for RomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSignature => write!(f, "buffer does not look like an Amiga ROM"),
            Self::BadSize(size) => write!(f, "unsupported ROM size: {size} bytes"),
        }
    }
}

impl std::error::Error for RomError {}

/// A validated ROM image.
#[derive(Debug)]
pub struct RomFile {
    kind: RomKind,
    data: Vec<u8>,
}

impl RomFile {
    /// Classify and wrap a ROM dump. The buffer must begin with a known
    /// signature and have a plausible size for its kind.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, RomError> {
        let kind = classify(&data).ok_or(RomError::UnknownSignature)?;
        let size_ok = match kind {
            RomKind::Boot => data.len() == BOOT_ROM_SIZE || data.len() == 8 * KB,
            RomKind::Kickstart | RomKind::Aros => KICK_SIZES.contains(&data.len()),
        };
        if !size_ok {
            return Err(RomError::BadSize(data.len()));
        }
        Ok(Self { kind, data })
    }

    #[must_use]
    pub fn kind(&self) -> RomKind {
        self.kind
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn is_aros(&self) -> bool {
        self.kind == RomKind::Aros
    }
}

fn classify(data: &[u8]) -> Option<RomKind> {
    if BOOT_SIGNATURES.iter().any(|sig| data.starts_with(sig)) {
        return Some(RomKind::Boot);
    }
    if KICK_SIGNATURES.iter().any(|sig| data.starts_with(sig)) {
        // AROS builds carry their name in the ROM header area.
        let head = &data[..data.len().min(1024)];
        if head.windows(4).any(|w| w == b"AROS") {
            return Some(RomKind::Aros);
        }
        return Some(RomKind::Kickstart);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kick_image(sig: &[u8], size: usize) -> Vec<u8> {
        let mut data = vec![0u8; size];
        data[..sig.len()].copy_from_slice(sig);
        data
    }

    #[test]
    fn rejects_unknown_signature() {
        let err = RomFile::from_bytes(vec![0u8; 256 * KB]).unwrap_err();
        assert_eq!(err, RomError::UnknownSignature);
    }

    #[test]
    fn accepts_kickstart() {
        let rom = RomFile::from_bytes(kick_image(&KICK_SIGNATURES[0], 256 * KB)).unwrap();
        assert_eq!(rom.kind(), RomKind::Kickstart);
        assert!(!rom.is_aros());
    }

    #[test]
    fn rejects_bad_kick_size() {
        let err = RomFile::from_bytes(kick_image(&KICK_SIGNATURES[0], 100 * KB)).unwrap_err();
        assert_eq!(err, RomError::BadSize(100 * KB));
    }

    #[test]
    fn detects_aros_tag() {
        let mut image = kick_image(&KICK_SIGNATURES[0], 512 * KB);
        image[0x10..0x14].copy_from_slice(b"AROS");
        let rom = RomFile::from_bytes(image).unwrap();
        assert_eq!(rom.kind(), RomKind::Aros);
        assert!(rom.is_aros());
    }

    #[test]
    fn accepts_boot_rom() {
        let mut image = vec![0u8; BOOT_ROM_SIZE];
        image[..8].copy_from_slice(&BOOT_SIGNATURES[0]);
        let rom = RomFile::from_bytes(image).unwrap();
        assert_eq!(rom.kind(), RomKind::Boot);
    }
}
