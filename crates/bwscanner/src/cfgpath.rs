//! Paths in configuration files, with variables expanded.

use std::path::{Path, PathBuf};

use directories::{BaseDirs, ProjectDirs};
use once_cell::sync::Lazy;
use serde::Deserialize;

/// A path in a configuration file.
///
/// A leading `~` is the user's home directory.  These variables are
/// expanded:
///   * `APP_CACHE`: our cache directory.
///   * `APP_CONFIG`: our configuration directory.
///   * `APP_LOCAL_DATA`: our directory in the user's "local data" space.
///   * `USER_HOME`: the user's home directory.
#[derive(Clone, Debug, Deserialize)]
#[serde(transparent)]
pub(crate) struct CfgPath(String);

/// An error from expanding a path.
#[derive(thiserror::Error, Debug, Clone)]
pub(crate) enum Error {
    /// The path used a variable we don't know.
    #[error("unrecognized variable")]
    UnknownVar,
    /// We couldn't find our project directories.
    #[error("can't construct project directories")]
    NoProjectDirs,
    /// We couldn't find the user's directories.
    #[error("can't construct base directories")]
    NoBaseDirs,
    /// A directory's name isn't UTF-8.
    #[error("can't convert to UTF-8")]
    BadUtf8,
}

impl CfgPath {
    /// Make a configuration path from `s`.
    #[cfg(test)]
    pub(crate) fn new(s: &str) -> Self {
        CfgPath(s.to_string())
    }

    /// Return the path on disk designated by this path.
    pub(crate) fn path(&self) -> Result<PathBuf, shellexpand::LookupError<Error>> {
        Ok(shellexpand::full_with_context(&self.0, get_home, get_env)?
            .into_owned()
            .into())
    }
}

impl std::fmt::Display for CfgPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Return the user's home directory, if we know it.
fn get_home() -> Option<&'static Path> {
    base_dirs().ok().map(BaseDirs::home_dir)
}

/// Expand the variable `var`.  Unknown variables are an error.
fn get_env(var: &str) -> Result<Option<&'static str>, Error> {
    let path = match var {
        "APP_CACHE" => project_dirs()?.cache_dir(),
        "APP_CONFIG" => project_dirs()?.config_dir(),
        "APP_LOCAL_DATA" => project_dirs()?.data_local_dir(),
        "USER_HOME" => base_dirs()?.home_dir(),
        _ => return Err(Error::UnknownVar),
    };
    path.to_str().map(Some).ok_or(Error::BadUtf8)
}

/// Return our project directories.
pub(crate) fn project_dirs() -> Result<&'static ProjectDirs, Error> {
    /// Computed on first use.
    static PROJECT_DIRS: Lazy<Option<ProjectDirs>> =
        Lazy::new(|| ProjectDirs::from("org", "torproject", "bwscanner"));

    PROJECT_DIRS.as_ref().ok_or(Error::NoProjectDirs)
}

/// Return the current user's directories.
fn base_dirs() -> Result<&'static BaseDirs, Error> {
    /// Computed on first use.
    static BASE_DIRS: Lazy<Option<BaseDirs>> = Lazy::new(BaseDirs::new);

    BASE_DIRS.as_ref().ok_or(Error::NoBaseDirs)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn expand() {
        let p = CfgPath::new("/var/lib/bwscanner/state");
        assert_eq!(p.path().unwrap(), PathBuf::from("/var/lib/bwscanner/state"));

        let p = CfgPath::new("${NO_SUCH_THING}/x");
        assert!(p.path().is_err());

        if let Ok(dirs) = project_dirs() {
            let p = CfgPath::new("${APP_CACHE}/cached-consensus");
            assert_eq!(p.path().unwrap(), dirs.cache_dir().join("cached-consensus"));
        }
    }
}
