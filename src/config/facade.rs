//! Configuration loader: the single entry point for reading layered configuration.

use crate::config::merge::merge_policy;
use crate::config::sources::{global_file, workspace_file};
use crate::config::CoursegenConfig;
use config::{Config, ConfigError, File};
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load defaults, the global file, workspace files and env overrides, in that order.
    pub fn load(workspace_root: &Path) -> Result<CoursegenConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = merge_policy::with_env_overrides(builder);
        builder.build()?.try_deserialize()
    }

    /// Load a single explicit file on top of defaults (no env overrides).
    pub fn load_from_file(path: &Path) -> Result<CoursegenConfig, ConfigError> {
        Config::builder()
            .add_source(File::from(path.to_path_buf()))
            .build()?
            .try_deserialize()
    }

    pub fn global_config_path() -> Option<PathBuf> {
        global_file::global_config_path()
    }
}
