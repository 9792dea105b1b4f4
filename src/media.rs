//! Derived images: resized uploads and rasterized PDF pages.
//!
//! Both entry points are synchronous and CPU bound; request handlers run them
//! through `tokio::task::spawn_blocking`.

use std::{
    fs,
    io::Cursor,
    panic,
    path::{Path, PathBuf},
};

use chrono::Utc;
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, ImageFormat, ImageReader};
use pdfium_render::prelude::*;
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::relative_key;

pub const RESIZE_MAX_WIDTH: u32 = 800;
pub const RESIZE_JPEG_QUALITY: u8 = 70;

pub const CONVERT_DIR: &str = "images-convert";
const PAGE_TARGET_WIDTH: i32 = 800;
const PAGE_MAX_HEIGHT: i32 = 1000;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("source file {0} does not exist")]
    SourceMissing(String),
    #[error("convert PDF failed: {0}")]
    ConvertPdf(String),
}

/// Writes a width-capped JPEG of `bytes` to `destination`.
///
/// Failures are logged and swallowed: `None` means nothing usable was written.
pub fn resize_image(bytes: &[u8], destination: &Path) -> Option<PathBuf> {
    match encode_resized_jpeg(bytes).and_then(|jpeg| write_output(destination, &jpeg)) {
        Ok(()) => Some(destination.to_path_buf()),
        Err(err) => {
            warn!(destination = %destination.display(), error = %err, "image resize failed");
            None
        }
    }
}

fn encode_resized_jpeg(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| err.to_string())?;
    let image = reader.decode().map_err(|err| err.to_string())?;

    let image = if image.width() > RESIZE_MAX_WIDTH {
        let height = (u64::from(image.height()) * u64::from(RESIZE_MAX_WIDTH)
            / u64::from(image.width()))
        .max(1) as u32;
        image.resize_exact(RESIZE_MAX_WIDTH, height, FilterType::Lanczos3)
    } else {
        image
    };

    let rgb = image::DynamicImage::ImageRgb8(image.to_rgb8());
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, RESIZE_JPEG_QUALITY);
    rgb.write_with_encoder(encoder).map_err(|err| err.to_string())?;
    Ok(buffer)
}

fn write_output(destination: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    fs::write(destination, bytes).map_err(|err| err.to_string())
}

/// Name of the image produced for 1-based `page` of a conversion started at
/// `timestamp` (milliseconds since the epoch).
pub fn page_file_name(timestamp: i64, page: usize) -> String {
    format!("{timestamp}_page{page}.png")
}

/// Rasterizes every page of `pdf_path` into `public_root/images-convert` and
/// returns the page images as keys relative to `public_root`, in page order.
///
/// The first failing page aborts the batch; images already written by the
/// batch are removed before the error is returned.
pub fn convert_pdf_to_images(
    pdf_path: &Path,
    public_root: &Path,
) -> Result<Vec<String>, MediaError> {
    if !pdf_path.is_file() {
        return Err(MediaError::SourceMissing(pdf_path.display().to_string()));
    }

    let output_dir = public_root.join(CONVERT_DIR);
    fs::create_dir_all(&output_dir)
        .map_err(|err| MediaError::ConvertPdf(format!("create output directory: {err}")))?;

    let loaded = panic::catch_unwind(Pdfium::default)
        .map_err(|_| "failed to initialize PDFium".to_string())
        .and_then(|pdfium| {
            let document = pdfium
                .load_pdf_from_file(pdf_path, None)
                .map_err(|err| format!("load pdf: {err}"))?;
            let page_count = usize::from(document.pages().len());
            let render_config = PdfRenderConfig::new()
                .set_target_width(PAGE_TARGET_WIDTH)
                .set_maximum_height(PAGE_MAX_HEIGHT)
                .render_form_data(true);

            write_page_images(public_root, page_count, |index| {
                let number = index + 1;
                let page_index = PdfPageIndex::try_from(index)
                    .map_err(|_| format!("page {number} is out of range"))?;
                let page = document
                    .pages()
                    .get(page_index)
                    .map_err(|err| format!("load page {number}: {err}"))?;
                let bitmap = page
                    .render_with_config(&render_config)
                    .map_err(|err| format!("render page {number}: {err}"))?;
                Ok(image::DynamicImage::ImageRgb8(bitmap.as_image().to_rgb8()))
            })
        });

    match loaded {
        Ok(keys) => {
            info!(source = %pdf_path.display(), pages = keys.len(), "pdf conversion completed");
            Ok(keys)
        }
        Err(err) => {
            warn!(source = %pdf_path.display(), error = %err, "pdf conversion failed");
            Err(MediaError::ConvertPdf(err))
        }
    }
}

/// Writes `page_count` images produced by `render` (called with 0-based page
/// indexes) as `images-convert/{ts}_page{n}.png` under `public_root`.
///
/// Each page goes to a `temp.*` file first and is renamed into place. On the
/// first failure every page written so far is removed.
pub fn write_page_images<F>(
    public_root: &Path,
    page_count: usize,
    mut render: F,
) -> Result<Vec<String>, String>
where
    F: FnMut(usize) -> Result<image::DynamicImage, String>,
{
    let output_dir = public_root.join(CONVERT_DIR);
    fs::create_dir_all(&output_dir).map_err(|err| format!("create output directory: {err}"))?;

    let timestamp = Utc::now().timestamp_millis();
    let mut written = Vec::with_capacity(page_count);

    let outcome = (0..page_count)
        .try_for_each(|index| {
            let path = write_page(&output_dir, timestamp, index + 1, render(index)?)?;
            written.push(path);
            Ok::<(), String>(())
        })
        .and_then(|()| {
            written
                .iter()
                .map(|path| relative_key(public_root, path).map_err(|err| err.to_string()))
                .collect::<Result<Vec<_>, String>>()
        });

    if outcome.is_err() {
        for path in &written {
            if let Err(err) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %err, "failed to remove partial page image");
            }
        }
    }
    outcome
}

fn write_page(
    output_dir: &Path,
    timestamp: i64,
    number: usize,
    rendered: image::DynamicImage,
) -> Result<PathBuf, String> {
    let temp_path = output_dir.join(format!("temp.{timestamp}.{number}.png"));
    if let Err(err) = rendered.save_with_format(&temp_path, ImageFormat::Png) {
        let _ = fs::remove_file(&temp_path);
        return Err(format!("write page {number}: {err}"));
    }

    let final_path = output_dir.join(page_file_name(timestamp, number));
    if let Err(err) = fs::rename(&temp_path, &final_path) {
        let _ = fs::remove_file(&temp_path);
        return Err(format!("rename page {number}: {err}"));
    }
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, RgbImage};
    use tempfile::TempDir;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = image::DynamicImage::ImageRgb8(RgbImage::new(width, height));
        let mut cursor = Cursor::new(Vec::new());
        image.write_to(&mut cursor, ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn wide_images_are_capped_and_reencoded_as_jpeg() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("images").join("board.jpg");

        let written = resize_image(&png_bytes(1600, 900), &destination);
        assert_eq!(written.as_deref(), Some(destination.as_path()));

        let bytes = fs::read(&destination).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (800, 450));
    }

    #[test]
    fn narrow_images_are_not_upscaled() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("small.jpg");

        resize_image(&png_bytes(320, 200), &destination).unwrap();
        let decoded = image::open(&destination).unwrap();
        assert_eq!(decoded.dimensions(), (320, 200));
    }

    #[test]
    fn undecodable_bytes_are_swallowed() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("broken.jpg");

        assert!(resize_image(b"definitely not an image", &destination).is_none());
        assert!(!destination.exists());
    }

    #[test]
    fn page_names_share_the_timestamp_prefix() {
        assert_eq!(page_file_name(1700000000000, 1), "1700000000000_page1.png");
        assert_eq!(page_file_name(1700000000000, 12), "1700000000000_page12.png");
    }

    #[test]
    fn missing_pdf_is_reported_before_touching_pdfium() {
        let dir = TempDir::new().unwrap();
        let err = convert_pdf_to_images(&dir.path().join("absent.pdf"), dir.path()).unwrap_err();
        assert!(matches!(err, MediaError::SourceMissing(_)));
        assert!(!dir.path().join(CONVERT_DIR).exists());
    }

    #[test]
    fn unreadable_pdf_fails_without_leaving_pages() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("broken.pdf");
        fs::write(&source, b"this is not a pdf").unwrap();

        let err = convert_pdf_to_images(&source, dir.path()).unwrap_err();
        assert!(matches!(err, MediaError::ConvertPdf(_)));
        assert!(err.to_string().starts_with("convert PDF failed"));
        let leftovers = fs::read_dir(dir.path().join(CONVERT_DIR)).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    fn blank_page(index: usize) -> Result<image::DynamicImage, String> {
        Ok(image::DynamicImage::ImageRgb8(RgbImage::new(
            40 + index as u32,
            60,
        )))
    }

    fn convert_dir_entries(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root.join(CONVERT_DIR))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn rendered_pages_are_numbered_from_one_under_one_prefix() {
        let dir = TempDir::new().unwrap();

        let keys = write_page_images(dir.path(), 3, blank_page).unwrap();
        assert_eq!(keys.len(), 3);

        let prefix = keys[0]
            .trim_start_matches("images-convert/")
            .split("_page")
            .next()
            .unwrap()
            .to_string();
        for (index, key) in keys.iter().enumerate() {
            assert_eq!(key, &format!("images-convert/{prefix}_page{}.png", index + 1));
            let decoded = image::open(dir.path().join(key)).unwrap();
            assert_eq!(decoded.dimensions(), (40 + index as u32, 60));
        }
        assert!(convert_dir_entries(dir.path())
            .iter()
            .all(|name| !name.starts_with("temp.")));
    }

    #[test]
    fn failing_page_removes_the_pages_before_it() {
        let dir = TempDir::new().unwrap();
        let mut calls = Vec::new();

        let err = write_page_images(dir.path(), 3, |index| {
            calls.push(index);
            if index == 1 {
                Err("render page 2: corrupt stream".to_string())
            } else {
                blank_page(index)
            }
        })
        .unwrap_err();

        assert_eq!(err, "render page 2: corrupt stream");
        assert_eq!(calls, vec![0, 1]);
        assert!(convert_dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn empty_documents_produce_no_pages() {
        let dir = TempDir::new().unwrap();
        let keys = write_page_images(dir.path(), 0, blank_page).unwrap();
        assert!(keys.is_empty());
        assert!(convert_dir_entries(dir.path()).is_empty());
    }

    #[test]
    #[ignore = "requires the PDFium shared library"]
    fn converts_every_page_in_order() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("worksheet.pdf");
        {
            let pdfium = Pdfium::default();
            let mut document = pdfium.create_new_pdf().unwrap();
            for _ in 0..3 {
                document
                    .pages_mut()
                    .create_page_at_end(PdfPagePaperSize::a4())
                    .unwrap();
            }
            document.save_to_file(&source).unwrap();
        }

        let keys = convert_pdf_to_images(&source, dir.path()).unwrap();
        assert_eq!(keys.len(), 3);

        let prefix = keys[0]
            .trim_start_matches("images-convert/")
            .split("_page")
            .next()
            .unwrap()
            .to_string();
        for (index, key) in keys.iter().enumerate() {
            assert_eq!(key, &format!("images-convert/{prefix}_page{}.png", index + 1));
            assert!(dir.path().join(key).is_file());
        }
    }
}
