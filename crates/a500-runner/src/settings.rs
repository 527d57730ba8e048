//! Runner settings file (JSON).
//!
//! Everything has a default so a bare `--rom kick.rom` works; a settings
//! file fills in the rest:
//!
//! ```json
//! {
//!   "rom": "roms/kick13.rom",
//!   "df0": "disks/workbench.adf",
//!   "chip_ram_kb": 512,
//!   "slow_ram_kb": 512,
//!   "warp_boot": true
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub rom: Option<PathBuf>,
    pub df0: Option<PathBuf>,
    pub df1: Option<PathBuf>,
    pub chip_ram_kb: Option<usize>,
    pub slow_ram_kb: Option<usize>,
    pub fast_ram_kb: Option<usize>,
    /// Window scale factor.
    pub scale: Option<u32>,
    /// Run without host-timer throttling until the first disk access.
    pub warp_boot: bool,
    /// 0 = fast blits, 1 = cycle-exact.
    pub blitter_accuracy: Option<i64>,
    pub drive_speed: Option<i64>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| format!("bad settings file: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings: Settings = serde_json::from_str(r#"{ "chip_ram_kb": 1024 }"#).unwrap();
        assert_eq!(settings.chip_ram_kb, Some(1024));
        assert!(settings.rom.is_none());
        assert!(!settings.warp_boot);
    }
}
