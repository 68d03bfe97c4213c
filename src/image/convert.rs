// src/image/convert.rs

//! Disk image format conversion.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::host;
use crate::vm::spec::VolumeFormat;

/// Failure reported by the image converter
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ConvertFault(pub String);

/// Converts disk images between formats
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageConverter: Send + Sync {
    /// Writes `source` into `target` in `target_format`, replacing its content
    async fn convert(
        &self,
        source: &Path,
        source_format: VolumeFormat,
        target: &Path,
        target_format: VolumeFormat,
        compress: bool,
    ) -> Result<(), ConvertFault>;
}

/// Converter backed by `qemu-img convert`
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub fn new() -> Self {
        Self::with_binary("qemu-img")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn convert_args(
        source: &Path,
        source_format: VolumeFormat,
        target: &Path,
        target_format: VolumeFormat,
        compress: bool,
    ) -> Vec<String> {
        let mut args = host::args([
            "convert",
            "-f",
            source_format.as_str(),
            "-O",
            target_format.as_str(),
        ]);
        if compress {
            args.push("-c".to_string());
        }
        args.push(source.display().to_string());
        args.push(target.display().to_string());
        args
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageConverter for QemuImg {
    async fn convert(
        &self,
        source: &Path,
        source_format: VolumeFormat,
        target: &Path,
        target_format: VolumeFormat,
        compress: bool,
    ) -> Result<(), ConvertFault> {
        let args = Self::convert_args(source, source_format, target, target_format, compress);
        let program = self.binary.display().to_string();
        debug!(?args, "Converting image");
        let output = host::run(&program, &args)
            .await
            .map_err(|e| ConvertFault(format!("{}: {}", program, e)))?;
        if !output.success() {
            return Err(ConvertFault(output.failure_message(&program)));
        }
        Ok(())
    }
}
