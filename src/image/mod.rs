// src/image/mod.rs

//! Template image cache.

pub mod convert;

use std::path::{Path, PathBuf};

use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub use convert::{ConvertFault, ImageConverter, QemuImg};

/// A template image published at a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTemplate {
    pub url: String,

    /// Hex digest of the image content, MD5 or SHA-256
    pub checksum: String,
}

impl ImageTemplate {
    pub fn new(url: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            checksum: checksum.into(),
        }
    }

    /// Basename of the URL path
    pub fn file_name(&self) -> Result<String> {
        let path = match url::Url::parse(&self.url) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => self.url.split(|c: char| c == '?' || c == '#').next().unwrap_or_default().to_string(),
        };
        match path.rsplit('/').next() {
            Some(name) if !name.is_empty() && name != "." && name != ".." => Ok(name.to_string()),
            _ => Err(Error::Transport {
                operation: "resolve template".to_string(),
                entity: self.url.clone(),
                message: "URL has no file name".to_string(),
            }),
        }
    }
}

/// Downloads template images into a local directory, keyed by file name
pub struct ImageCache {
    directory: PathBuf,
    client: reqwest::Client,
}

impl ImageCache {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::with_client(directory, reqwest::Client::new())
    }

    pub fn with_client(directory: impl Into<PathBuf>, client: reqwest::Client) -> Self {
        Self {
            directory: directory.into(),
            client,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Location of a template inside the cache
    pub fn cache_path(&self, template: &ImageTemplate) -> Result<PathBuf> {
        Ok(self.directory.join(template.file_name()?))
    }

    /// Returns a local path whose content matches the template checksum.
    ///
    /// A cached file with a matching checksum is returned as is; otherwise
    /// the template is downloaded over it. A failed download leaves the
    /// partial file in place.
    pub async fn resolve(&self, template: &ImageTemplate) -> Result<PathBuf> {
        let path = self.cache_path(template)?;
        let expected = template.checksum.trim().to_ascii_lowercase();
        let algorithm = ChecksumAlgorithm::for_digest(&expected);

        if fs::try_exists(&path).await.map_err(|e| Error::io(&path, e))? {
            let actual = file_checksum(&path, algorithm).await?;
            if actual == expected {
                metrics::increment_counter!("virtance_agent_image_cache_hits_total");
                debug!(path = %path.display(), "Template cache hit");
                return Ok(path);
            }
            warn!(
                path = %path.display(),
                %expected,
                %actual,
                "Cached template is stale, downloading again"
            );
        }
        metrics::increment_counter!("virtance_agent_image_cache_misses_total");

        self.download(&template.url, &path).await?;
        let actual = file_checksum(&path, algorithm).await?;
        if actual != expected {
            return Err(Error::Integrity {
                operation: "resolve template".to_string(),
                entity: template.url.clone(),
                expected,
                actual,
            });
        }
        info!(url = %template.url, path = %path.display(), "Template downloaded");
        Ok(path)
    }

    async fn download(&self, url: &str, path: &Path) -> Result<()> {
        fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| Error::io(&self.directory, e))?;

        let transport = |message: String| Error::Transport {
            operation: "download template".to_string(),
            entity: url.to_string(),
            message,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport(e.to_string()))?;

        let mut file = fs::File::create(path)
            .await
            .map_err(|e| Error::io(path, e))?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| transport(e.to_string()))? {
            file.write_all(&chunk).await.map_err(|e| Error::io(path, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| Error::io(path, e))?;

        metrics::increment_counter!("virtance_agent_image_downloads_total");
        debug!(%url, bytes = written, "Download complete");
        Ok(())
    }
}

/// Digest used to verify a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    /// MD5 for 32-character digests, SHA-256 for anything else
    pub fn for_digest(digest: &str) -> Self {
        if digest.trim().len() == 32 {
            ChecksumAlgorithm::Md5
        } else {
            ChecksumAlgorithm::Sha256
        }
    }
}

/// Lowercase hex digest of a file
pub async fn file_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    match algorithm {
        ChecksumAlgorithm::Md5 => hash_file::<Md5>(path).await,
        ChecksumAlgorithm::Sha256 => hash_file::<Sha256>(path).await,
    }
}

async fn hash_file<D: Digest>(path: &Path) -> Result<String>
where
    sha2::digest::Output<D>: std::fmt::LowerHex,
{
    let mut file = fs::File::open(path).await.map_err(|e| Error::io(path, e))?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sha256_hex(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    async fn serve(body: &'static [u8], status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images/t.img"))
            .respond_with(ResponseTemplate::new(status).set_body_bytes(body))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_file_name_from_url() {
        let t = ImageTemplate::new("https://images.example.com/debian/12/t.img?sig=1", "x");
        assert_eq!(t.file_name().unwrap(), "t.img");
        assert_eq!(ImageTemplate::new("t.img", "x").file_name().unwrap(), "t.img");
        assert!(ImageTemplate::new("https://images.example.com/", "x")
            .file_name()
            .is_err());
    }

    #[tokio::test]
    async fn test_download_then_cache_hit() {
        let server = serve(b"template-bytes", 200).await;
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path().join("cache"));
        let template = ImageTemplate::new(
            format!("{}/images/t.img", server.uri()),
            sha256_hex(b"template-bytes"),
        );

        let first = cache.resolve(&template).await.unwrap();
        assert_eq!(first, dir.path().join("cache").join("t.img"));
        assert_eq!(std::fs::read(&first).unwrap(), b"template-bytes");

        let second = cache.resolve(&template).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_cached_file_is_downloaded_again() {
        let server = serve(b"fresh", 200).await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t.img"), b"stale").unwrap();
        let cache = ImageCache::new(dir.path());
        let template = ImageTemplate::new(format!("{}/images/t.img", server.uri()), sha256_hex(b"fresh"));

        let path = cache.resolve(&template).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_after_download() {
        let server = serve(b"unexpected", 200).await;
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        let template = ImageTemplate::new(format!("{}/images/t.img", server.uri()), "abc123");

        let err = cache.resolve(&template).await.unwrap_err();
        assert!(matches!(err, Error::Integrity { ref expected, .. } if expected == "abc123"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_http_error_is_transport() {
        let server = serve(b"", 404).await;
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        let template = ImageTemplate::new(format!("{}/images/t.img", server.uri()), "abc123");

        let err = cache.resolve(&template).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_algorithm_follows_digest_length() {
        assert_eq!(
            ChecksumAlgorithm::for_digest("5d41402abc4b2a76b9719d911017c592"),
            ChecksumAlgorithm::Md5
        );
        assert_eq!(ChecksumAlgorithm::for_digest(&sha256_hex(b"x")), ChecksumAlgorithm::Sha256);
        assert_eq!(ChecksumAlgorithm::for_digest("abc123"), ChecksumAlgorithm::Sha256);
    }

    #[tokio::test]
    async fn test_md5_checksum_resolves_and_hits_cache() {
        let server = serve(b"hello", 200).await;
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        let template = ImageTemplate::new(
            format!("{}/images/t.img", server.uri()),
            "5d41402abc4b2a76b9719d911017c592",
        );

        let path = cache.resolve(&template).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        cache.resolve(&template).await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_uppercase_checksum_accepted() {
        let server = serve(b"bytes", 200).await;
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path());
        let template = ImageTemplate::new(
            format!("{}/images/t.img", server.uri()),
            sha256_hex(b"bytes").to_uppercase(),
        );
        assert!(cache.resolve(&template).await.is_ok());
    }
}
