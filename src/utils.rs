use std::fs;
use std::thread;

use crate::{PixelFormat, SourceError};

/// Auto-detect best capture device, returning its node path
#[cfg(feature = "v4l2")]
pub fn auto_detect_device() -> Result<String, SourceError> {
    use std::path::Path;
    use tracing::info;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // Check for capture capability
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        // Accept the first node offering MJPEG or a YUV layout
        let fourccs: Vec<FourCC> = formats.iter().map(|fmt| fmt.fourcc).collect();
        if fourccs.contains(&FourCC::new(b"MJPG")) {
            info!("Found MJPEG device: {} - {}", path, caps.card);
            return Ok(path);
        }
        if fourccs.contains(&FourCC::new(b"YU12")) || fourccs.contains(&FourCC::new(b"YUYV")) {
            info!("Found YUV device: {} - {}", path, caps.card);
            return Ok(path);
        }
    }

    Err(SourceError::Unavailable(
        "No suitable capture device found".into(),
    ))
}

#[cfg(not(feature = "v4l2"))]
pub fn auto_detect_device() -> Result<String, SourceError> {
    Err(SourceError::Unavailable(
        "device detection needs the v4l2 feature".into(),
    ))
}

/// Host resources considered when picking a capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemResources {
    pub cpu_cores: usize,
    /// `MemAvailable` in KiB, when the kernel reports it
    pub available_memory_kb: Option<u64>,
}

impl SystemResources {
    pub fn detect() -> Self {
        let cpu_cores = thread::available_parallelism().map_or(1, |n| n.get());
        let available_memory_kb = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| parse_mem_available(&meminfo));
        Self {
            cpu_cores,
            available_memory_kb,
        }
    }
}

/// `MemAvailable:` value from `/proc/meminfo` text, in KiB
pub fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Cheapest format unless the host clearly has room for mjpeg
pub fn select_optimal_format(resources: &SystemResources) -> PixelFormat {
    const LOW_MEMORY_KB: u64 = 500 * 1024;
    const ROOMY_MEMORY_KB: u64 = 1024 * 1024;

    match resources.available_memory_kb {
        Some(kb) if kb < LOW_MEMORY_KB => PixelFormat::Yuv420,
        Some(kb) if resources.cpu_cores >= 4 && kb > ROOMY_MEMORY_KB => PixelFormat::Mjpeg,
        _ => PixelFormat::Yuv420,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mem_available() {
        let meminfo = "MemTotal:        8000000 kB\nMemFree:  100 kB\nMemAvailable:    2048000 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(2_048_000));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn format_follows_resources() {
        let roomy = SystemResources {
            cpu_cores: 4,
            available_memory_kb: Some(2 * 1024 * 1024),
        };
        assert_eq!(select_optimal_format(&roomy), PixelFormat::Mjpeg);

        let starved = SystemResources {
            cpu_cores: 8,
            available_memory_kb: Some(256 * 1024),
        };
        assert_eq!(select_optimal_format(&starved), PixelFormat::Yuv420);

        let few_cores = SystemResources {
            cpu_cores: 2,
            available_memory_kb: Some(4 * 1024 * 1024),
        };
        assert_eq!(select_optimal_format(&few_cores), PixelFormat::Yuv420);

        let unknown = SystemResources {
            cpu_cores: 4,
            available_memory_kb: None,
        };
        assert_eq!(select_optimal_format(&unknown), PixelFormat::Yuv420);
    }
}
