//! Local filesystem content extractor
//!
//! Plain text and markdown are read as-is. PDFs are only classified, never
//! parsed: a bad header is corrupted, an `/Encrypt` dictionary is encrypted,
//! and anything else is treated as image-only. Figures live next to the
//! document in `<stem>_figures/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::audit::page_from_name;
use super::sources::{ContentExtractor, ExtractedImage, Extraction};
use crate::types::{ExtractionErrorKind, Result};

const PDF_MAGIC: &[u8] = b"%PDF-";
const ENCRYPT_MARKER: &[u8] = b"/Encrypt";

fn image_mime(ext: &str) -> Option<&'static str> {
    match ext {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn lower_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Classify raw document bytes
pub fn classify(path: &Path, bytes: &[u8]) -> Extraction {
    match lower_extension(path).as_str() {
        "pdf" => {
            if !bytes.starts_with(PDF_MAGIC) {
                Extraction::failed(ExtractionErrorKind::Corrupted)
            } else if contains(bytes, ENCRYPT_MARKER) {
                Extraction::failed(ExtractionErrorKind::Encrypted)
            } else {
                Extraction::failed(ExtractionErrorKind::ImageOnly)
            }
        }
        "txt" | "md" | "markdown" => Extraction::text(String::from_utf8_lossy(bytes)),
        _ => match std::str::from_utf8(bytes) {
            Ok(text) => Extraction::text(text),
            Err(_) => Extraction::failed(ExtractionErrorKind::Corrupted),
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct FsContentExtractor;

impl FsContentExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn figures_dir(content_ref: &Path) -> Option<PathBuf> {
        let stem = content_ref.file_stem()?.to_str()?;
        Some(content_ref.with_file_name(format!("{}_figures", stem)))
    }
}

#[async_trait]
impl ContentExtractor for FsContentExtractor {
    async fn extract_text(&self, content_ref: &Path) -> Result<Extraction> {
        let bytes = tokio::fs::read(content_ref).await?;
        let extraction = classify(content_ref, &bytes);
        debug!(
            path = %content_ref.display(),
            bytes = bytes.len(),
            error = ?extraction.error,
            "Extracted text"
        );
        Ok(extraction)
    }

    async fn extract_images(&self, content_ref: &Path) -> Result<Vec<ExtractedImage>> {
        let Some(dir) = Self::figures_dir(content_ref) else {
            return Ok(Vec::new());
        };
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if image_mime(&lower_extension(&path)).is_some() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut images = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let mime = image_mime(&lower_extension(&path)).unwrap_or("application/octet-stream");
            let bytes = tokio::fs::read(&path).await?;
            images.push(ExtractedImage {
                page: page_from_name(&id),
                id,
                mime: mime.to_string(),
                bytes: Arc::from(bytes),
                path,
            });
        }
        debug!(dir = %dir.display(), images = images.len(), "Listed figures");
        Ok(images)
    }
}
