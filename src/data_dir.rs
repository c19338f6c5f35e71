use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "BRIEFMATCH_DATA_DIR";

const CONFIG_DB: &str = "config.redb";
const ARTIFACTS_DB: &str = "artifacts.redb";

/// Where persisted settings and the built artifact bundle live.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// `--data-dir` wins over `BRIEFMATCH_DATA_DIR`, which wins over
    /// `$XDG_DATA_HOME/briefmatch`. The directory is created if missing.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(DATA_DIR_ENV_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        match explicit.map(Path::to_path_buf).or(from_env) {
            Some(root) => Self::create(root),
            None => Self::create(xdg_data_home()?),
        }
    }

    fn create(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join(CONFIG_DB)
    }

    pub fn artifacts_db(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DB)
    }

    /// Whether `briefmatch build` has produced a bundle here.
    pub fn has_artifacts(&self) -> bool {
        self.artifacts_db().is_file()
    }
}

fn xdg_data_home() -> Result<PathBuf> {
    xdg::BaseDirectories::with_prefix("briefmatch")
        .get_data_home()
        .ok_or_else(|| {
            Error::Config("could not determine XDG data home directory".into())
        })
}
