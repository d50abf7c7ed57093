use image::{codecs::jpeg::JpegEncoder, imageops::FilterType};
use video_ingest::Frame;

use crate::error::DetectError;

/// Resize a frame to the detector input resolution and encode it as JPEG.
pub fn encode_for_detector(
    frame: &Frame,
    input_size: (u32, u32),
    jpeg_quality: u8,
) -> Result<Vec<u8>, DetectError> {
    let rgb = frame.to_rgb_image()?;
    let (in_w, in_h) = input_size;
    let resized = if rgb.dimensions() == (in_w, in_h) {
        rgb
    } else {
        image::imageops::resize(&rgb, in_w, in_h, FilterType::Triangle)
    };

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, jpeg_quality.clamp(1, 100))
        .encode_image(&resized)
        .map_err(|err| DetectError::Encode(err.to_string()))?;
    Ok(buffer)
}
