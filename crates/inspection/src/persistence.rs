//! On-disk record of inspection cycles.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::Local;
use clap::ValueEnum;
use thiserror::Error;
use tracing::debug;
use video_ingest::Frame;

use crate::annotation::encode_jpeg;

const COUNTER_FILE: &str = "counter.txt";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum NamingScheme {
    /// `product_YYYYmmdd-HHMMSS.jpg`, suffixed `_1`, `_2`, ... within the same second.
    #[default]
    Timestamp,
    /// `image_<n>.jpg` with the next `n` kept in `counter.txt`.
    Counter,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("counter file {path} holds {content:?}, expected a number")]
    Counter { path: PathBuf, content: String },
    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// Writes cycle images into one directory with collision-free names.
#[derive(Clone, Debug)]
pub struct CycleRecorder {
    dir: PathBuf,
    naming: NamingScheme,
    jpeg_quality: u8,
}

impl CycleRecorder {
    pub fn new(dir: impl Into<PathBuf>, naming: NamingScheme) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| PersistError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            naming,
            jpeg_quality: 90,
        })
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store already encoded JPEG bytes under the next free name.
    pub fn save_jpeg(&self, jpeg: &[u8]) -> Result<PathBuf, PersistError> {
        let path = self.next_path()?;
        fs::write(&path, jpeg).map_err(|source| PersistError::Write {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), bytes = jpeg.len(), "cycle image saved");
        Ok(path)
    }

    /// Encode and store a raw frame, without annotations.
    pub fn save_frame(&self, frame: &Frame) -> Result<PathBuf, PersistError> {
        let image = frame
            .to_rgb_image()
            .map_err(|err| PersistError::Encode(err.to_string()))?;
        let jpeg = encode_jpeg(&image, self.jpeg_quality)
            .map_err(|err| PersistError::Encode(err.to_string()))?;
        self.save_jpeg(&jpeg)
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    fn next_path(&self) -> Result<PathBuf, PersistError> {
        match self.naming {
            NamingScheme::Timestamp => Ok(self.next_timestamp_path()),
            NamingScheme::Counter => self.next_counter_path(),
        }
    }

    fn next_timestamp_path(&self) -> PathBuf {
        let stem = format!("product_{}", Local::now().format("%Y%m%d-%H%M%S"));
        let mut path = self.dir.join(format!("{stem}.jpg"));
        let mut suffix = 1u32;
        while path.exists() {
            path = self.dir.join(format!("{stem}_{suffix}.jpg"));
            suffix += 1;
        }
        path
    }

    fn next_counter_path(&self) -> Result<PathBuf, PersistError> {
        let counter_path = self.dir.join(COUNTER_FILE);
        let current = match fs::read_to_string(&counter_path) {
            Ok(content) => {
                content
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| PersistError::Counter {
                        path: counter_path.clone(),
                        content: content.clone(),
                    })?
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(source) => {
                return Err(PersistError::Write {
                    path: counter_path,
                    source,
                });
            }
        };
        fs::write(&counter_path, (current + 1).to_string()).map_err(|source| {
            PersistError::Write {
                path: counter_path.clone(),
                source,
            }
        })?;
        Ok(self.dir.join(format!("image_{current}.jpg")))
    }
}
