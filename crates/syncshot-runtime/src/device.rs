//! Camera interface and implementations
//!
//! Sensor control is opaque to the protocol: a camera is configured once
//! and then asked to capture at a deadline, reporting how long the capture
//! call took. Implementations block; the agent runs them on a blocking
//! thread right after the deadline spin-wait.

use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use syncshot_core::{CaptureSettings, SyncError, SyncResult, Timestamp};

use crate::external::render_template;

/// Image sensor control
pub trait Camera: Send {
    /// Apply the session's capture settings. Called once, before any capture.
    fn configure(&mut self, settings: &CaptureSettings) -> SyncResult<()>;

    /// Take one image for `round`, whose deadline has just been reached.
    ///
    /// Returns the duration of the capture call alone, excluding any
    /// scheduling wait before it.
    fn capture(&mut self, round: u32, deadline: Timestamp) -> SyncResult<Duration>;
}

/// Runs a templated still-capture command per round.
///
/// Placeholders: `{width}`, `{height}`, `{exposure}`, `{round}`, `{dir}`.
/// The default targets `rpicam-still`.
pub struct CommandCamera {
    template: String,
    output_dir: PathBuf,
    settings: Option<CaptureSettings>,
}

impl CommandCamera {
    pub const DEFAULT_TEMPLATE: &'static str = "rpicam-still -n --immediate -t 1 \
        --width {width} --height {height} --shutter {exposure} \
        --gain 1.0 --awbgains 1.0,1.0 -o {dir}/img_{round}.jpg";

    pub fn new(template: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            output_dir: output_dir.into(),
            settings: None,
        }
    }

    fn command_for(&self, settings: &CaptureSettings, round: u32) -> String {
        let dir = self.output_dir.to_string_lossy();
        render_template(
            &self.template,
            &[
                ("width", &settings.width.to_string()),
                ("height", &settings.height.to_string()),
                ("exposure", &settings.exposure_micros.to_string()),
                ("round", &round.to_string()),
                ("dir", dir.as_ref()),
            ],
        )
    }
}

impl Camera for CommandCamera {
    fn configure(&mut self, settings: &CaptureSettings) -> SyncResult<()> {
        settings.validate()?;
        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            SyncError::CaptureFailure(format!("{}: {}", self.output_dir.display(), e))
        })?;
        self.settings = Some(*settings);
        Ok(())
    }

    fn capture(&mut self, round: u32, _deadline: Timestamp) -> SyncResult<Duration> {
        let settings = self
            .settings
            .ok_or_else(|| SyncError::CaptureFailure("camera not configured".into()))?;
        let command = self.command_for(&settings, round);

        let start = Instant::now();
        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .map_err(|e| SyncError::CaptureFailure(e.to_string()))?;
        let elapsed = start.elapsed();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::CaptureFailure(format!(
                "round {}: {}: {}",
                round,
                output.status,
                stderr.trim()
            )));
        }
        Ok(elapsed)
    }
}

/// Camera without hardware, for dry runs of the fleet protocol.
///
/// Reports a fixed capture duration, optionally sleeping for it so the
/// round cadence matches real hardware.
#[derive(Clone, Debug)]
pub struct SimulatedCamera {
    elapsed: Duration,
    sleep: bool,
    settings: Option<CaptureSettings>,
}

impl SimulatedCamera {
    pub fn new(elapsed: Duration) -> Self {
        Self {
            elapsed,
            sleep: false,
            settings: None,
        }
    }

    pub fn sleeping(mut self) -> Self {
        self.sleep = true;
        self
    }
}

impl Camera for SimulatedCamera {
    fn configure(&mut self, settings: &CaptureSettings) -> SyncResult<()> {
        settings.validate()?;
        self.settings = Some(*settings);
        Ok(())
    }

    fn capture(&mut self, _round: u32, _deadline: Timestamp) -> SyncResult<Duration> {
        if self.settings.is_none() {
            return Err(SyncError::CaptureFailure("camera not configured".into()));
        }
        if self.sleep {
            std::thread::sleep(self.elapsed);
        }
        Ok(self.elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_camera_requires_configuration() {
        let mut camera = SimulatedCamera::new(Duration::from_millis(50));
        assert!(camera.capture(1, Timestamp::ZERO).is_err());

        camera.configure(&CaptureSettings::default()).unwrap();
        assert_eq!(
            camera.capture(1, Timestamp::ZERO).unwrap(),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_command_camera_template() {
        let camera = CommandCamera::new(CommandCamera::DEFAULT_TEMPLATE, "/mnt/ram_images");
        let command = camera.command_for(&CaptureSettings::default(), 7);

        assert!(command.contains("--width 1920 --height 1080 --shutter 10000"));
        assert!(command.ends_with("-o /mnt/ram_images/img_7.jpg"));
    }

    #[test]
    fn test_command_camera_runs_and_times() {
        let dir = std::env::temp_dir().join(format!("syncshot-camera-{}", std::process::id()));
        let mut camera = CommandCamera::new("touch {dir}/img_{round}.raw", &dir);
        camera.configure(&CaptureSettings::default()).unwrap();

        let elapsed = camera.capture(2, Timestamp::ZERO).unwrap();
        assert!(elapsed > Duration::ZERO);
        assert!(dir.join("img_2.raw").exists());

        let mut failing = CommandCamera::new("exit 1", &dir);
        failing.configure(&CaptureSettings::default()).unwrap();
        assert!(matches!(
            failing.capture(3, Timestamp::ZERO),
            Err(SyncError::CaptureFailure(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
