//! PDF flattening: rasterize every page with poppler's `pdftoppm` and stack
//! the pages into a single tall PNG.

use super::{ProviderError, ProviderResult};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbImage, imageops};
use std::{
    io::Cursor,
    path::{Path, PathBuf},
};
use tokio::{fs, process::Command};
use tracing::debug;

#[async_trait]
pub trait PdfRasterizer: Send + Sync {
    /// Render the PDF at `pdf` into one PNG image.
    async fn flatten(&self, pdf: &Path) -> ProviderResult<Vec<u8>>;
}

#[derive(Clone, Debug)]
pub struct PdftoppmRasterizer {
    program: PathBuf,
    dpi: u32,
}

impl PdftoppmRasterizer {
    pub fn new(program: impl Into<PathBuf>, dpi: u32) -> Self {
        Self {
            program: program.into(),
            dpi,
        }
    }
}

#[async_trait]
impl PdfRasterizer for PdftoppmRasterizer {
    async fn flatten(&self, pdf: &Path) -> ProviderResult<Vec<u8>> {
        let out_dir = tempfile::tempdir().map_err(io_failure)?;
        let prefix = out_dir.path().join("page");

        let output = Command::new(&self.program)
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-png")
            .arg(pdf)
            .arg(&prefix)
            // a timed-out call drops this future; take the child with it
            .kill_on_drop(true)
            .output()
            .await
            .map_err(io_failure)?;
        if !output.status.success() {
            return Err(ProviderError::Application(format!(
                "pdftoppm failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut page_paths = Vec::new();
        let mut entries = fs::read_dir(out_dir.path()).await.map_err(io_failure)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_failure)? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "png") {
                page_paths.push(path);
            }
        }
        // pdftoppm zero-pads page numbers, so lexical order is page order.
        page_paths.sort();
        debug!(pages = page_paths.len(), "rasterized {}", pdf.display());

        let mut pages = Vec::with_capacity(page_paths.len());
        for path in &page_paths {
            pages.push(fs::read(path).await.map_err(io_failure)?);
        }

        tokio::task::spawn_blocking(move || stack_pages(&pages))
            .await
            .map_err(|err| ProviderError::Transport(format!("page stacking panicked: {err}")))?
    }
}

/// Decode PNG pages and stack them top to bottom into one PNG.
pub fn stack_pages(pages: &[Vec<u8>]) -> ProviderResult<Vec<u8>> {
    if pages.is_empty() {
        return Err(ProviderError::Application(
            "no images extracted from PDF".into(),
        ));
    }

    let decoded = pages
        .iter()
        .map(|bytes| image::load_from_memory_with_format(bytes, ImageFormat::Png))
        .collect::<Result<Vec<DynamicImage>, _>>()
        .map_err(|err| ProviderError::Application(format!("unreadable page image: {err}")))?;

    let width = decoded.iter().map(|img| img.width()).max().unwrap_or(0);
    let height = decoded.iter().map(|img| img.height()).sum::<u32>();
    let mut merged = RgbImage::new(width, height);

    let mut y_offset: i64 = 0;
    for page in &decoded {
        imageops::replace(&mut merged, &page.to_rgb8(), 0, y_offset);
        y_offset += i64::from(page.height());
    }

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(merged)
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|err| ProviderError::Application(format!("cannot encode PNG: {err}")))?;
    Ok(out.into_inner())
}

fn io_failure(err: std::io::Error) -> ProviderError {
    ProviderError::Transport(format!("rasterizer I/O: {err}"))
}
