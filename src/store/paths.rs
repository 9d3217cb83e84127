//! Log file naming and collision avoidance.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::{PidError, PidResult};

/// Output files for one session's temperature and command logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    /// Temperature log CSV
    pub temperature: PathBuf,
    /// Command log CSV
    pub commands: PathBuf,
}

impl LogPaths {
    /// Derive both log paths from a base path such as `data/gefran`.
    ///
    /// The files are named `"{name} temp log - {stamp}.csv"` and
    /// `"{name} command log - {stamp}.csv"` next to the base path. If the
    /// command log already exists the name is suffixed with `_copy_1`,
    /// `_copy_2`, ... until it is free. Missing parent directories are created.
    pub fn resolve(base: &Path, now: DateTime<Local>) -> PidResult<Self> {
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                PidError::Configuration(format!(
                    "Invalid save path '{}': no file name",
                    base.display()
                ))
            })?;
        let dir = match base.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stamp = now.format("%Y%m%d %H%M%S").to_string();

        let mut paths = Self::named(&dir, &name, &stamp);
        let mut index = 1;
        while paths.commands.exists() {
            paths = Self::named(&dir, &format!("{name}_copy_{index}"), &stamp);
            index += 1;
        }

        std::fs::create_dir_all(&dir).map_err(|e| {
            PidError::Configuration(format!(
                "Invalid save path '{}': {}",
                base.display(),
                e
            ))
        })?;
        Ok(paths)
    }

    fn named(dir: &Path, name: &str, stamp: &str) -> Self {
        Self {
            temperature: dir.join(format!("{name} temp log - {stamp}.csv")),
            commands: dir.join(format!("{name} command log - {stamp}.csv")),
        }
    }
}
