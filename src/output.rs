//! Output encoding and sequential naming.
//!
//! Files are written as `img_<idx>.<ext>` where the index continues from
//! whatever is already in the output directory, so repeated runs never
//! clobber earlier results.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 3] = [OutputFormat::Jpeg, OutputFormat::Png, OutputFormat::Webp];

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::Webp),
            other => Err(Error::InvalidOptions(format!(
                "unknown output format '{other}', expected jpg, png or webp"
            ))),
        }
    }
}

/// Next free index in `dir`, scanning existing `img_<idx>.<ext>` files.
pub fn next_index(dir: &Path) -> Result<u32> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut max: Option<u32> = None;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(idx) = parse_index(name) else {
            continue;
        };
        max = Some(max.map_or(idx, |m| m.max(idx)));
    }
    Ok(max.map_or(0, |m| m + 1))
}

fn parse_index(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("img_")?;
    let (idx, ext) = rest.split_once('.')?;
    if !matches!(ext, "jpg" | "jpeg" | "png" | "webp") {
        return None;
    }
    idx.parse().ok()
}

pub fn indexed_filename(dir: &Path, idx: u32, format: OutputFormat) -> PathBuf {
    dir.join(format!("img_{idx}.{}", format.extension()))
}

/// Encodes and writes `image` at `path`. `quality` applies to the lossy
/// formats and is ignored for png.
pub fn save_image(
    image: &DynamicImage,
    path: &Path,
    format: OutputFormat,
    quality: u8,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match format {
        OutputFormat::Png => image.save_with_format(path, ImageFormat::Png)?,
        OutputFormat::Jpeg => {
            let file = BufWriter::new(File::create(path)?);
            let encoder = JpegEncoder::new_with_quality(file, quality);
            image.write_with_encoder(encoder)?;
        }
        OutputFormat::Webp => {
            let rgb = image.to_rgb8();
            let encoder = webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height());
            let encoded = encoder.encode(f32::from(quality));
            fs::write(path, &*encoded)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_accepts_aliases() {
        assert_eq!("jpg".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("JPEG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("png".parse::<OutputFormat>().unwrap(), OutputFormat::Png);
        assert_eq!("webp".parse::<OutputFormat>().unwrap(), OutputFormat::Webp);
        assert!("bmp".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn index_scan_skips_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_index(dir.path()).unwrap(), 0);
        for name in ["img_0.png", "img_7.jpg", "img_3.webp", "notes.txt", "img_9.bmp", "img_x.png"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(next_index(dir.path()).unwrap(), 8);
    }

    #[test]
    fn missing_directory_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("not-yet");
        assert_eq!(next_index(&gone).unwrap(), 0);
    }

    #[test]
    fn saved_images_round_trip_through_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let image = DynamicImage::ImageRgb8(image::RgbImage::new(32, 32));
        for expected in 0..2 {
            let idx = next_index(dir.path()).unwrap();
            assert_eq!(idx, expected);
            let path = indexed_filename(dir.path(), idx, OutputFormat::Jpeg);
            save_image(&image, &path, OutputFormat::Jpeg, 90).unwrap();
            assert!(path.is_file());
        }
    }
}
