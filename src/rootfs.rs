use flate2::read::GzDecoder;
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{ContainerError, ContainerResult};

const REQUIRED_DIRS: [&str; 4] = ["bin", "lib", "etc", "usr"];

/// Where a root filesystem archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Local(PathBuf),
    Remote(String),
}

impl ImageSource {
    /// `http://` and `https://` values are fetched, anything else is a local path.
    pub fn parse(value: &str) -> Self {
        if value.starts_with("http://") || value.starts_with("https://") {
            ImageSource::Remote(value.to_string())
        } else {
            ImageSource::Local(PathBuf::from(value))
        }
    }

    fn is_gzipped(&self) -> bool {
        let name = match self {
            ImageSource::Local(path) => path.to_string_lossy().into_owned(),
            ImageSource::Remote(url) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
        };
        name.ends_with(".gz") || name.ends_with(".tgz")
    }

    fn open(&self) -> ContainerResult<Box<dyn Read>> {
        match self {
            ImageSource::Local(path) => {
                let file = File::open(path).map_err(|e| {
                    ContainerError::filesystem_setup(format!("Failed to open image {path:?}: {e}"))
                })?;
                Ok(Box::new(file))
            }
            ImageSource::Remote(url) => {
                log::info!("Downloading root filesystem from {url}");
                let response = reqwest::blocking::get(url).map_err(|e| {
                    ContainerError::filesystem_setup(format!("Failed to download {url}: {e}"))
                })?;
                if !response.status().is_success() {
                    return Err(ContainerError::filesystem_setup(format!(
                        "HTTP {} downloading {url}",
                        response.status()
                    )));
                }
                Ok(Box::new(response))
            }
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Local(path) => write!(f, "{}", path.display()),
            ImageSource::Remote(url) => f.write_str(url),
        }
    }
}

/// Makes sure a container root directory is populated before the child pivots into it.
#[derive(Debug, Clone)]
pub struct RootfsProvider {
    image: Option<ImageSource>,
}

impl RootfsProvider {
    pub fn new(image: Option<ImageSource>) -> Self {
        Self { image }
    }

    pub fn ensure(&self, rootfs: &Path) -> ContainerResult<()> {
        if is_populated(rootfs) {
            log::debug!("Rootfs {rootfs:?} already populated");
            return Ok(());
        }
        let Some(image) = &self.image else {
            return Err(ContainerError::filesystem_setup(format!(
                "Rootfs {rootfs:?} is missing or incomplete and no image archive is configured"
            )));
        };
        log::info!("Populating rootfs {rootfs:?} from {image}");
        fs::create_dir_all(rootfs).map_err(|e| {
            ContainerError::filesystem_setup(format!("Failed to create {rootfs:?}: {e}"))
        })?;
        unpack(image, rootfs)?;
        if !is_populated(rootfs) {
            return Err(ContainerError::filesystem_setup(format!(
                "Image {image} does not contain a usable root filesystem"
            )));
        }
        log::info!("Rootfs setup complete");
        Ok(())
    }
}

/// A root is usable when the usual top-level directories and `/bin/sh` are there.
pub fn is_populated(rootfs: &Path) -> bool {
    REQUIRED_DIRS.iter().all(|dir| rootfs.join(dir).is_dir()) && rootfs.join("bin/sh").exists()
}

fn unpack(image: &ImageSource, target: &Path) -> ContainerResult<()> {
    let raw = image.open()?;
    let reader: Box<dyn Read> = if image.is_gzipped() {
        Box::new(GzDecoder::new(raw))
    } else {
        raw
    };
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(target).map_err(|e| {
        ContainerError::filesystem_setup(format!("Failed to extract {image}: {e}"))
    })?;
    Ok(())
}
