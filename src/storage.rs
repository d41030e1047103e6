//! Writes captured frames and encoded images to disk

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::{Frame, PixelFormat, StorageConfig, StorageError};

pub struct FileStorage {
    config: StorageConfig,
    sequence: AtomicU32,
}

impl FileStorage {
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        let storage = Self {
            config,
            sequence: AtomicU32::new(0),
        };
        if storage.config.create_directories {
            storage.create_directory_structure()?;
        }
        Ok(storage)
    }

    pub fn base_directory(&self) -> &Path {
        Path::new(&self.config.base_directory)
    }

    pub fn create_directory_structure(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.base_directory())?;
        info!("Storage directory ready: {}", self.config.base_directory);
        Ok(())
    }

    /// Next `{prefix}_{unix_seconds}_{seq:03}.{extension}` path in the base directory
    pub fn generate_filename(&self, extension: &str) -> PathBuf {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let extension = extension.trim_start_matches('.');
        self.base_directory().join(format!(
            "{}_{}_{:03}.{}",
            self.config.prefix, seconds, seq, extension
        ))
    }

    /// Save an encoded image, naming it when `path` is `None`
    pub fn save_jpeg(&self, jpeg: &[u8], path: Option<&Path>) -> Result<PathBuf, StorageError> {
        let path = path.map_or_else(|| self.generate_filename("jpg"), Path::to_path_buf);
        self.save_raw(jpeg, &path)?;
        Ok(path)
    }

    /// Save a frame's payload as captured
    pub fn save_frame(&self, frame: &Frame, path: Option<&Path>) -> Result<PathBuf, StorageError> {
        let path = path.map_or_else(
            || self.generate_filename(extension(frame.format)),
            Path::to_path_buf,
        );
        self.save_raw(&frame.data, &path)?;
        Ok(path)
    }

    pub fn save_raw(&self, data: &[u8], path: &Path) -> Result<(), StorageError> {
        let size = data.len() as u64;
        if size > self.config.max_file_size {
            return Err(StorageError::TooLarge {
                size,
                limit: self.config.max_file_size,
            });
        }
        fs::write(path, data)?;
        debug!("Saved file: {} ({} bytes)", path.display(), size);
        Ok(())
    }
}

fn extension(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Yuv420 => "yuv",
        PixelFormat::Mjpeg => "jpg",
        PixelFormat::Rgb => "rgb",
        PixelFormat::Raw => "raw",
    }
}
