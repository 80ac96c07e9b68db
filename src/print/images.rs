//! Layer image discovery.
//!
//! Slicers number layer images (`SEC_1.PNG`, `SEC_2.PNG`, ... `SEC_10.PNG`), so
//! the directory listing is ordered by the embedded number, not by name.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::{AppResult, SlaError};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "bmp", "jpg", "jpeg"];

/// Last run of digits in a file stem.
#[allow(clippy::unwrap_used)]
static LAYER_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\D*$").unwrap());

/// Layer number embedded in an image file name, if any.
pub fn layer_index(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    LAYER_NUMBER
        .captures(stem)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Order two image paths by embedded layer number.
///
/// Names without a number sort after numbered ones; ties fall back to the
/// file name.
pub fn natural_cmp(a: &Path, b: &Path) -> Ordering {
    let key = |p: &Path| {
        let number = layer_index(p).map_or((1, 0), |n| (0, n));
        (number, p.file_name().map(|name| name.to_os_string()))
    };
    key(a).cmp(&key(b))
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}

/// Image files in `dir`, ordered by layer number.
pub fn list_images(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let filesystem = |source| SlaError::Filesystem {
        path: dir.to_path_buf(),
        source,
    };

    let mut images = Vec::new();
    for entry in fs::read_dir(dir).map_err(filesystem)? {
        let entry = entry.map_err(filesystem)?;
        let path = entry.path();
        if entry.file_type().map_err(filesystem)?.is_file() && is_image(&path) {
            images.push(path);
        }
    }

    images.sort_by(|a, b| natural_cmp(a, b));
    debug!(dir = %dir.display(), count = images.len(), "found layer images");
    Ok(images)
}
