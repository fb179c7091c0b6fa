//! Capture settings negotiated once per session

use serde::{Deserialize, Serialize};

use crate::{SyncError, SyncResult};

/// Largest sensor width supported by the fleet
pub const MAX_WIDTH: u32 = 4056;

/// Largest sensor height supported by the fleet
pub const MAX_HEIGHT: u32 = 3040;

/// Capture configuration broadcast identically to every agent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    /// Exposure time in microseconds
    pub exposure_micros: u32,
}

impl CaptureSettings {
    /// Build validated settings
    pub fn new(width: u32, height: u32, exposure_micros: u32) -> SyncResult<Self> {
        let settings = CaptureSettings {
            width,
            height,
            exposure_micros,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(SyncError::InvalidSettings(format!(
                "resolution {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.width > MAX_WIDTH || self.height > MAX_HEIGHT {
            return Err(SyncError::InvalidSettings(format!(
                "resolution {}x{} exceeds the maximum of {}x{}",
                self.width, self.height, MAX_WIDTH, MAX_HEIGHT
            )));
        }
        if self.exposure_micros == 0 {
            return Err(SyncError::InvalidSettings("exposure time must be positive".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        CaptureSettings {
            width: 1920,
            height: 1080,
            exposure_micros: 10_000,
        }
    }
}
