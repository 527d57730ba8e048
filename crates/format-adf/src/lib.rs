//! Amiga Disk File (ADF) images.
//!
//! An ADF is a raw dump of the decoded sector payload: 80 cylinders x 2
//! heads x 11 sectors x 512 bytes = 901,120 bytes for a 3.5" DD disk.
//! The MFM bit stream the drive head actually sees is synthesized on
//! demand by [`Adf::encode_track`] and folded back by [`Adf::decode_track`]
//! when the emulated machine writes a track.

pub mod mfm;

use std::fmt;

pub const SECTOR_BYTES: usize = 512;
pub const SECTORS_PER_TRACK: usize = 11;
pub const CYLINDERS: usize = 80;
pub const HEADS: usize = 2;
pub const TRACKS: usize = CYLINDERS * HEADS;
pub const ADF_BYTES_DD: usize = TRACKS * SECTORS_PER_TRACK * SECTOR_BYTES;

/// Errors raised while mapping an ADF image.
#[derive(Debug, PartialEq, Eq)]
pub enum AdfError {
    /// The byte buffer is not a DD image.
    BadSize(usize),
    /// A track/sector address is outside the disk geometry.
    BadAddress { track: usize, sector: usize },
}

impl fmt::Display for AdfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSize(size) => {
                write!(f, "bad ADF size {size} (expected {ADF_BYTES_DD} for 3.5\" DD)")
            }
            Self::BadAddress { track, sector } => {
                write!(f, "sector address out of range: track {track}, sector {sector}")
            }
        }
    }
}

impl std::error::Error for AdfError {}

/// A 3.5" DD disk image.
pub struct Adf {
    data: Vec<u8>,
    /// Set when the machine has written to the image since loading.
    modified: bool,
}

impl Adf {
    /// Wrap a raw byte buffer. Only the standard DD geometry is accepted.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, AdfError> {
        if data.len() != ADF_BYTES_DD {
            return Err(AdfError::BadSize(data.len()));
        }
        Ok(Self {
            data,
            modified: false,
        })
    }

    /// A formatted-blank (all zero) disk.
    #[must_use]
    pub fn blank() -> Self {
        Self {
            data: vec![0; ADF_BYTES_DD],
            modified: false,
        }
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    fn sector_offset(track: usize, sector: usize) -> Result<usize, AdfError> {
        if track >= TRACKS || sector >= SECTORS_PER_TRACK {
            return Err(AdfError::BadAddress { track, sector });
        }
        Ok((track * SECTORS_PER_TRACK + sector) * SECTOR_BYTES)
    }

    /// Decoded payload of one sector.
    pub fn sector(&self, track: usize, sector: usize) -> Result<&[u8], AdfError> {
        let off = Self::sector_offset(track, sector)?;
        Ok(&self.data[off..off + SECTOR_BYTES])
    }

    /// Replace the payload of one sector.
    pub fn put_sector(
        &mut self,
        track: usize,
        sector: usize,
        bytes: &[u8],
    ) -> Result<(), AdfError> {
        let off = Self::sector_offset(track, sector)?;
        self.data[off..off + SECTOR_BYTES].copy_from_slice(&bytes[..SECTOR_BYTES]);
        self.modified = true;
        Ok(())
    }

    /// The MFM bit stream of one track, as the drive head sees it.
    /// `track = cylinder * 2 + head`.
    #[must_use]
    pub fn encode_track(&self, track: usize) -> Vec<u8> {
        let start = track * SECTORS_PER_TRACK * SECTOR_BYTES;
        let end = start + SECTORS_PER_TRACK * SECTOR_BYTES;
        mfm::encode_track(&self.data[start..end], track as u8)
    }

    /// Fold a written MFM track back into the decoded image. Sectors whose
    /// header does not verify are skipped; the number of recovered sectors
    /// is returned.
    pub fn decode_track(&mut self, track: usize, stream: &[u8]) -> usize {
        let mut recovered = 0;
        for sec in mfm::decode_track(stream) {
            if usize::from(sec.track) == track
                && self
                    .put_sector(track, usize::from(sec.sector), &sec.data)
                    .is_ok()
            {
                recovered += 1;
            }
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_odd_sizes() {
        assert!(matches!(
            Adf::from_bytes(vec![0; 1000]),
            Err(AdfError::BadSize(1000))
        ));
        assert!(Adf::from_bytes(vec![0; ADF_BYTES_DD]).is_ok());
    }

    #[test]
    fn sector_addressing() {
        let mut adf = Adf::blank();
        let payload = [0x5A; SECTOR_BYTES];
        adf.put_sector(3, 7, &payload).unwrap();
        assert_eq!(adf.sector(3, 7).unwrap(), &payload);
        assert!(adf.sector(160, 0).is_err());
        assert!(adf.sector(0, 11).is_err());
        assert!(adf.is_modified());
    }

    #[test]
    fn encode_decode_track_round_trip() {
        let mut adf = Adf::blank();
        for sector in 0..SECTORS_PER_TRACK {
            let fill = [(sector as u8) ^ 0xC3; SECTOR_BYTES];
            adf.put_sector(5, sector, &fill).unwrap();
        }
        let stream = adf.encode_track(5);

        let mut copy = Adf::blank();
        let recovered = copy.decode_track(5, &stream);
        assert_eq!(recovered, SECTORS_PER_TRACK);
        for sector in 0..SECTORS_PER_TRACK {
            assert_eq!(
                copy.sector(5, sector).unwrap(),
                adf.sector(5, sector).unwrap()
            );
        }
    }
}
