//! Resource pressure probe

use std::path::{Path, PathBuf};

use sysinfo::{Disks, System};

/// Memory and storage usage, in percent
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResourceUsage {
    pub memory_percent: f32,
    pub storage_percent: f32,
}

impl ResourceUsage {
    /// True when either figure is strictly above its threshold
    pub fn exceeds(&self, memory_threshold: f32, storage_threshold: f32) -> bool {
        self.memory_percent > memory_threshold || self.storage_percent > storage_threshold
    }
}

/// Samples resource pressure before each capture
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> ResourceUsage;
}

/// System memory plus the disk holding the capture directory
pub struct SysinfoProbe {
    system: System,
    disks: Disks,
    capture_dir: PathBuf,
    warned_no_disk: bool,
}

impl SysinfoProbe {
    /// The directory may not exist yet; the camera creates it on SETTINGS.
    pub fn new(capture_dir: impl Into<PathBuf>) -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            capture_dir: absolute_dir(capture_dir.into()),
            warned_no_disk: false,
        }
    }

    fn memory_percent(&mut self) -> f32 {
        self.system.refresh_memory();
        percent(self.system.used_memory(), self.system.total_memory())
    }

    fn storage_percent(&mut self) -> f32 {
        self.disks.refresh();
        // The most specific mount point containing the directory
        let disk = self
            .disks
            .iter()
            .filter(|d| self.capture_dir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());

        match disk {
            Some(disk) => {
                let total = disk.total_space();
                percent(total.saturating_sub(disk.available_space()), total)
            }
            None => {
                if !self.warned_no_disk {
                    tracing::warn!(
                        dir = %self.capture_dir.display(),
                        "no disk found for capture dir, storage pressure is not monitored"
                    );
                    self.warned_no_disk = true;
                }
                0.0
            }
        }
    }

    pub fn capture_dir(&self) -> &Path {
        &self.capture_dir
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> ResourceUsage {
        ResourceUsage {
            memory_percent: self.memory_percent(),
            storage_percent: self.storage_percent(),
        }
    }
}

/// Anchor a relative directory at the working directory and resolve links
/// through its deepest existing ancestor. Mount points are absolute.
fn absolute_dir(dir: PathBuf) -> PathBuf {
    let dir = if dir.is_absolute() {
        dir
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(dir),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), "cannot resolve working directory: {}", e);
                dir
            }
        }
    };

    for ancestor in dir.ancestors() {
        let Ok(resolved) = std::fs::canonicalize(ancestor) else {
            continue;
        };
        return match dir.strip_prefix(ancestor) {
            Ok(rest) if !rest.as_os_str().is_empty() => resolved.join(rest),
            _ => resolved,
        };
    }
    dir
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0) as f32
}

/// Probe that always reports the same usage
#[derive(Clone, Copy, Debug)]
pub struct FixedProbe(pub ResourceUsage);

impl FixedProbe {
    pub fn idle() -> Self {
        FixedProbe(ResourceUsage {
            memory_percent: 10.0,
            storage_percent: 10.0,
        })
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&mut self) -> ResourceUsage {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_strict() {
        let usage = ResourceUsage {
            memory_percent: 90.0,
            storage_percent: 40.0,
        };
        assert!(!usage.exceeds(90.0, 90.0));
        assert!(usage.exceeds(89.9, 90.0));

        let disk_full = ResourceUsage {
            memory_percent: 10.0,
            storage_percent: 95.0,
        };
        assert!(disk_full.exceeds(90.0, 90.0));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(45, 50), 90.0);
    }

    #[test]
    fn test_sysinfo_probe_reports_percentages() {
        let mut probe = SysinfoProbe::new(std::env::temp_dir());
        let usage = probe.sample();

        assert!((0.0..=100.0).contains(&usage.memory_percent));
        assert!((0.0..=100.0).contains(&usage.storage_percent));
    }

    #[test]
    fn test_relative_capture_dir_not_yet_created() {
        let cwd = std::env::current_dir().unwrap();
        let dir = "capture_dir_not_created_yet";
        assert!(!cwd.join(dir).exists());

        let mut relative = SysinfoProbe::new(dir);
        assert!(relative.capture_dir().is_absolute());
        assert!(relative.capture_dir().ends_with(dir));

        // Same disk as the working directory, whatever the host reports for it
        let mut anchored = SysinfoProbe::new(&cwd);
        let expected = anchored.sample().storage_percent > 0.0;
        assert_eq!(relative.sample().storage_percent > 0.0, expected);
    }

    #[test]
    fn test_absolute_dir_resolves_existing_ancestor() {
        let tmp = std::env::temp_dir();
        let resolved = absolute_dir(tmp.join("syncshot-missing").join("captures"));

        assert_eq!(
            resolved,
            std::fs::canonicalize(&tmp).unwrap().join("syncshot-missing/captures")
        );
        assert_eq!(absolute_dir(tmp.clone()), std::fs::canonicalize(&tmp).unwrap());
    }
}
