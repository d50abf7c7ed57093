//! Replays still images from disk as if they came from a camera.
//!
//! Used for bench runs without a camera and for one-shot inspections of a
//! saved picture.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::anyhow;

use crate::{
    FrameSource,
    types::{CaptureError, Frame},
};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Cycles through image files in name order, forever.
pub struct ImageReplaySource {
    label: String,
    files: Vec<PathBuf>,
    next: usize,
}

impl ImageReplaySource {
    /// Open a directory of images, or a single image file.
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let label = path.display().to_string();
        let files = if path.is_dir() {
            let mut files = fs::read_dir(path)
                .map_err(|_| CaptureError::Open {
                    uri: label.clone(),
                })?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| is_image_path(path))
                .collect::<Vec<_>>();
            files.sort();
            files
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            Vec::new()
        };

        if files.is_empty() {
            return Err(CaptureError::Open { uri: label });
        }
        Ok(Self {
            label,
            files,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageReplaySource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let path = &self.files[self.next % self.files.len()];
        self.next = self.next.wrapping_add(1);
        let image = image::open(path)
            .map_err(|err| CaptureError::Other(anyhow!("{}: {err}", path.display())))?;
        Frame::from_rgb_image(image.to_rgb8())
    }

    fn describe(&self) -> String {
        format!("replay {} ({} image(s))", self.label, self.files.len())
    }
}

pub(crate) fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
