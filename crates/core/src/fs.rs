//! Async file helpers.
//!
//! Writes go through a sibling `.tmp` file and a rename so a reader never
//! observes a half-written document.

use std::io::ErrorKind;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

use crate::error::Error;
use crate::result::Result;

/// Read a whole file as UTF-8.
///
/// # Errors
///
/// Returns `Error::FileReadFailed` if the file cannot be read.
pub async fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .await
        .map_err(|e| Error::file_read_failed(path, e.to_string()))
}

/// Parse a TOML document.
///
/// # Errors
///
/// Returns `Error::TomlParseFailed` if the document does not match `T`.
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content).map_err(|e| Error::toml_parse_failed(e.to_string()))
}

/// Read and parse a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub async fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = read_to_string(path).await?;
    parse_toml(&content)
}

/// Read and parse a JSON file, returning `None` when it does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub async fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::json_parse_failed(path, e.to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::file_read_failed(path, e.to_string())),
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
///
/// # Errors
///
/// Returns an error if encoding, the parent directory creation, the temp
/// write or the rename fails.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|e| Error::json_encode_failed(e.to_string()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::directory_creation_failed(parent, e.to_string()))?;
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, &bytes)
        .await
        .map_err(|e| Error::file_write_failed(&tmp_path, e.to_string()))?;
    fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::file_write_failed(path, e.to_string()))
}
