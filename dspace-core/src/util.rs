//! Contains a collection of useful utility functions.

use std::fs::read;
use std::path::Path;

use crate::error::{Error, Result};

/// Create a static deser object from given path using serde. The format is
/// picked based on the file extension.
pub fn deser_struct_from_path<T>(file_path: &Path) -> Result<T>
where
    for<'de> T: serde::Deserialize<'de>,
{
    let bytes = read(file_path)?;
    let ext = file_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let d: T = match ext {
        "toml" => toml::from_slice(&bytes)?,
        #[cfg(feature = "yaml")]
        "yaml" | "yml" => serde_yaml::from_slice(&bytes)?,
        _ => {
            return Err(Error::ConfigError(format!(
                "unsupported file extension: {}",
                file_path.to_string_lossy()
            )))
        }
    };
    Ok(d)
}
