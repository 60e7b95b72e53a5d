//! Output encoders for recording sessions.

use crate::error::RecordError;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Parameters fixed for the lifetime of one recording file.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingSettings {
    pub path: PathBuf,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Stamped onto every frame.
    pub label: String,
}

pub trait FrameWriter: Send {
    fn write(&mut self, image: &RgbImage) -> Result<(), RecordError>;

    /// Flush and close the output. Called exactly once, after the last `write`.
    fn finish(&mut self) -> Result<(), RecordError>;
}

pub trait WriterFactory: Send + Sync {
    /// File extension of the files this factory produces, without the dot.
    fn extension(&self) -> &str;

    fn create(&self, settings: &RecordingSettings) -> Result<Box<dyn FrameWriter>, RecordError>;
}

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingFormat {
    /// Concatenated JPEG frames, playable by ffplay and VLC.
    Mjpeg,
    /// MPEG-4 in an mp4 container, encoded by libav.
    #[cfg(feature = "ffmpeg")]
    Mpeg4,
}

impl Default for RecordingFormat {
    fn default() -> RecordingFormat {
        RecordingFormat::Mjpeg
    }
}

impl WriterFactory for RecordingFormat {
    fn extension(&self) -> &str {
        match self {
            RecordingFormat::Mjpeg => "mjpeg",
            #[cfg(feature = "ffmpeg")]
            RecordingFormat::Mpeg4 => "mp4",
        }
    }

    fn create(&self, settings: &RecordingSettings) -> Result<Box<dyn FrameWriter>, RecordError> {
        match self {
            RecordingFormat::Mjpeg => Ok(Box::new(MjpegWriter::create(&settings.path)?)),
            #[cfg(feature = "ffmpeg")]
            RecordingFormat::Mpeg4 => Ok(Box::new(crate::mpeg_encoder::Encoder::new(settings)?)),
        }
    }
}

const JPEG_QUALITY: u8 = 90;

/// Writes each frame as a baseline JPEG, back to back.
pub struct MjpegWriter {
    out: Option<BufWriter<File>>,
    scratch: Vec<u8>,
    frames: u64,
}

impl MjpegWriter {
    pub fn create(path: &Path) -> Result<MjpegWriter, RecordError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(MjpegWriter {
            out: Some(BufWriter::new(File::create(path)?)),
            scratch: Vec::new(),
            frames: 0,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl FrameWriter for MjpegWriter {
    fn write(&mut self, image: &RgbImage) -> Result<(), RecordError> {
        let out = self.out.as_mut()
            .ok_or_else(|| RecordError::Encoder("write after finish".to_owned()))?;

        self.scratch.clear();
        JpegEncoder::new_with_quality(&mut self.scratch, JPEG_QUALITY)
            .encode(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)?;

        out.write_all(&self.scratch)?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), RecordError> {
        if let Some(out) = self.out.take() {
            let file = out.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Splits an MJPEG file back into frames.
pub fn read_mjpeg(path: &Path) -> Result<Vec<RgbImage>, RecordError> {
    let data = fs::read(path)?;
    let mut frames = Vec::new();
    let mut rest = &data[..];

    while let Some(start) = find_marker(rest, 0xD8) {
        let end = match find_marker(&rest[start..], 0xD9) {
            Some(end) => start + end + 2,
            None => break,
        };

        let image = image::load_from_memory_with_format(&rest[start..end], ImageFormat::Jpeg)?;
        frames.push(image.into_rgb8());
        rest = &rest[end..];
    }

    Ok(frames)
}

fn find_marker(data: &[u8], marker: u8) -> Option<usize> {
    data.windows(2).position(|w| w[0] == 0xFF && w[1] == marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn mjpeg_round_trips_frame_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("clip.mjpeg");

        let mut writer = MjpegWriter::create(&path).unwrap();
        for shade in [0u8, 100, 200].iter() {
            writer.write(&RgbImage::from_pixel(24, 16, Rgb([*shade, *shade, *shade]))).unwrap();
        }
        writer.finish().unwrap();
        assert_eq!(writer.frames(), 3);

        let frames = read_mjpeg(&path).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].dimensions(), (24, 16));
        assert!(frames[2].get_pixel(5, 5)[0] > 180);
    }

    #[test]
    fn write_after_finish_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = MjpegWriter::create(&dir.path().join("a.mjpeg")).unwrap();
        writer.finish().unwrap();
        writer.finish().unwrap();
        assert!(writer.write(&RgbImage::new(4, 4)).is_err());
    }

    #[test]
    fn default_format_is_mjpeg() {
        assert_eq!(RecordingFormat::default().extension(), "mjpeg");
    }
}
