//! Listing photos posted as multipart form data and stored on local disk.

use axum::body::Bytes;
use axum::extract::Multipart;
use chrono::Utc;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub const FIELD_NAME: &str = "images";
pub const MAX_FILES: usize = 5;
pub const MAX_FILE_BYTES: usize = 2 * 1024 * 1024;
/// Request body cap for the upload route: every file at its limit plus room
/// for multipart framing.
pub const MAX_BODY_BYTES: usize = MAX_FILES * MAX_FILE_BYTES + 64 * 1024;
pub const PUBLIC_PREFIX: &str = "/uploads";

const ALLOWED_TYPES: &[&str] = &["image/png", "image/jpg", "image/jpeg", "image/webp"];

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub dir: PathBuf,
}

impl UploadConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }
}

/// One file part pulled out of the form.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

pub fn is_allowed_type(content_type: &str) -> bool {
    ALLOWED_TYPES.contains(&content_type.trim().to_ascii_lowercase().as_str())
}

/// Checks the leading bytes against the PNG, JPEG and WebP signatures.
pub fn looks_like_image(bytes: &[u8]) -> bool {
    let png = bytes.starts_with(&[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n']);
    let jpeg = bytes.starts_with(&[0xff, 0xd8, 0xff]);
    let webp = bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP";
    png || jpeg || webp
}

/// Lowercases the name and replaces anything but ASCII letters, digits and
/// dots with `_`.
pub fn sanitize_file_name(original: &str) -> String {
    let base = original.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches(['.', '_']).is_empty() {
        "image".to_string()
    } else {
        cleaned
    }
}

pub fn stored_name(original: &str) -> String {
    let unique = Uuid::new_v4().simple().to_string();
    format!(
        "agri-{}-{}-{}",
        Utc::now().timestamp_millis(),
        &unique[..8],
        sanitize_file_name(original)
    )
}

/// Drains the `images` parts of a multipart form, enforcing count and size
/// limits as it reads.
pub async fn collect_images(mut multipart: Multipart) -> AppResult<Vec<ImageUpload>> {
    let mut images = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(FIELD_NAME, e.body_text()))?
    {
        if field.name() != Some(FIELD_NAME) {
            continue;
        }
        if images.len() == MAX_FILES {
            return Err(AppError::validation(
                FIELD_NAME,
                format!("at most {} images per upload", MAX_FILES),
            ));
        }
        let file_name = field.file_name().unwrap_or("image").to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::validation(FIELD_NAME, e.body_text()))?;
        images.push(ImageUpload {
            file_name,
            content_type,
            bytes,
        });
    }
    Ok(images)
}

/// Validates every file before writing any of them, then returns the public
/// URLs in upload order.
pub async fn store_images(config: &UploadConfig, images: Vec<ImageUpload>) -> AppResult<Vec<String>> {
    if images.is_empty() {
        return Err(AppError::validation(FIELD_NAME, "no image found in the request"));
    }
    if images.len() > MAX_FILES {
        return Err(AppError::validation(
            FIELD_NAME,
            format!("at most {} images per upload", MAX_FILES),
        ));
    }
    for image in &images {
        if !is_allowed_type(&image.content_type) {
            return Err(AppError::validation(
                FIELD_NAME,
                format!("{}: only PNG, JPG or WebP images are accepted", image.file_name),
            ));
        }
        if image.bytes.len() > MAX_FILE_BYTES {
            return Err(AppError::validation(
                FIELD_NAME,
                format!("{}: larger than 2 MB", image.file_name),
            ));
        }
        if !looks_like_image(&image.bytes) {
            return Err(AppError::validation(
                FIELD_NAME,
                format!("{}: content is not a PNG, JPG or WebP image", image.file_name),
            ));
        }
    }

    config
        .ensure_dir()
        .await
        .map_err(|e| AppError::Internal(e.into()))?;
    let mut urls = Vec::with_capacity(images.len());
    for image in images {
        let name = stored_name(&image.file_name);
        tokio::fs::write(config.dir.join(&name), &image.bytes)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;
        urls.push(format!("{}/{}", PUBLIC_PREFIX, name));
    }

    info!("Stored {} uploaded image(s)", urls.len());
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n', 0, 0, 0, 13];
    const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0, 16, b'J', b'F', b'I', b'F'];

    fn image(name: &str, content_type: &str, bytes: &[u8]) -> ImageUpload {
        ImageUpload {
            file_name: name.to_string(),
            content_type: content_type.to_string(),
            bytes: Bytes::copy_from_slice(bytes),
        }
    }

    #[rstest]
    #[case("Tomates Fraîches.JPG", "tomates_fra_ches.jpg")]
    #[case("../../etc/passwd", "passwd")]
    #[case("C:\\photos\\mais.png", "mais.png")]
    #[case("???", "image")]
    fn sanitizes_names(#[case] original: &str, #[case] expected: &str) {
        assert_eq!(sanitize_file_name(original), expected);
    }

    #[test]
    fn stored_names_are_unique_and_prefixed() {
        let first = stored_name("photo.png");
        let second = stored_name("photo.png");
        assert!(first.starts_with("agri-"));
        assert!(first.ends_with("-photo.png"));
        assert_ne!(first, second);
    }

    #[rstest]
    #[case("image/png", true)]
    #[case("IMAGE/JPEG", true)]
    #[case("image/jpg", true)]
    #[case("image/webp", true)]
    #[case("image/gif", false)]
    #[case("application/pdf", false)]
    fn allowed_types(#[case] content_type: &str, #[case] expected: bool) {
        assert_eq!(is_allowed_type(content_type), expected);
    }

    #[test]
    fn sniffs_signatures() {
        assert!(looks_like_image(PNG));
        assert!(looks_like_image(JPEG));
        assert!(looks_like_image(b"RIFF\x00\x00\x00\x00WEBPVP8 "));
        assert!(!looks_like_image(b"GIF89a"));
        assert!(!looks_like_image(b""));
    }

    #[tokio::test]
    async fn stores_files_and_returns_urls() {
        let dir = tempfile::tempdir().unwrap();
        let config = UploadConfig::new(dir.path().join("uploads"));
        let urls = store_images(
            &config,
            vec![image("a.png", "image/png", PNG), image("b.jpg", "image/jpeg", JPEG)],
        )
        .await
        .unwrap();

        assert_eq!(urls.len(), 2);
        for url in &urls {
            let name = url.strip_prefix("/uploads/").unwrap();
            assert!(config.dir.join(name).exists());
        }
        assert!(urls[0].ends_with("-a.png"));
        assert!(urls[1].ends_with("-b.jpg"));
    }

    #[tokio::test]
    async fn rejects_disguised_files_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let config = UploadConfig::new(dir.path());
        let result = store_images(
            &config,
            vec![
                image("ok.png", "image/png", PNG),
                image("fake.png", "image/png", b"MZ\x90\x00not an image"),
            ],
        )
        .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn rejects_empty_oversized_and_too_many() {
        let dir = tempfile::tempdir().unwrap();
        let config = UploadConfig::new(dir.path());

        assert!(store_images(&config, vec![]).await.is_err());

        let mut big = PNG.to_vec();
        big.resize(MAX_FILE_BYTES + 1, 0);
        assert!(store_images(&config, vec![image("big.png", "image/png", &big)])
            .await
            .is_err());

        let six = (0..6).map(|i| image(&format!("{i}.png"), "image/png", PNG)).collect();
        assert!(store_images(&config, six).await.is_err());

        let gif = vec![image("anim.gif", "image/gif", b"GIF89a")];
        assert!(store_images(&config, gif).await.is_err());
    }
}
