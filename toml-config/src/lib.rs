#![deny(clippy::unwrap_used, clippy::allow_attributes_without_reason)]
#![warn(clippy::perf, clippy::complexity, clippy::pedantic, clippy::suspicious)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    reason = "We're not going to write comprehensive docs"
)]

use serde::de::DeserializeOwned;
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Refusing to load {0}, file extension isn't .toml")]
    FileExtension(PathBuf),
    #[error("Failed to read config file {path}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("No config file found, tried {0:?}")]
    NotFound(Vec<PathBuf>),
}

pub trait TomlConfig<F: DeserializeOwned>: Sized + From<F> {
    /// Loads a .toml file from the filesystem, parses it, and initializes a [`Self`].
    fn load_toml_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if path.extension() != Some(OsStr::new("toml")) {
            return Err(Error::FileExtension(path.to_path_buf()));
        }
        let toml = std::fs::read_to_string(path).map_err(|e| Error::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse_toml(path, &toml)
    }

    /// Loads the first candidate that exists.
    ///
    /// A candidate that exists but fails to parse is an error, the remaining candidates
    /// are not tried.
    fn load_first_toml_file<P: AsRef<Path>>(candidates: &[P]) -> Result<Self, Error> {
        for path in candidates {
            match Self::load_toml_file(path) {
                Err(Error::ReadFile { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound => {}
                result => return result,
            }
        }
        Err(Error::NotFound(
            candidates.iter().map(|p| p.as_ref().to_path_buf()).collect(),
        ))
    }

    /// Parses TOML text, `path` is only used for error reporting.
    fn parse_toml(path: &Path, toml: &str) -> Result<Self, Error> {
        let conf: F = toml::from_str(toml).map_err(|e| Error::ParseFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(conf.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Unwrap is ok in test code")]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct File {
        port: u16,
    }

    struct Conf {
        port: u16,
    }

    impl From<File> for Conf {
        fn from(File { port }: File) -> Self {
            Self { port }
        }
    }

    impl TomlConfig<File> for Conf {}

    #[test]
    fn rejects_other_extensions() {
        let result = Conf::load_toml_file("config.json");
        assert!(matches!(result, Err(Error::FileExtension(_))));
    }

    #[test]
    fn reports_parse_errors_with_path() {
        let result = Conf::parse_toml(Path::new("server.toml"), "port = \"eighty\"");
        match result {
            Err(Error::ParseFile { path, .. }) => assert_eq!(path, Path::new("server.toml")),
            _ => panic!("expected parse error"),
        }
    }

    #[test]
    fn first_existing_candidate_wins() {
        let dir = std::env::temp_dir().join(format!("toml-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let present = dir.join("present.toml");
        std::fs::write(&present, "port = 10001\n").unwrap();

        let conf = Conf::load_first_toml_file(&[dir.join("missing.toml"), present]).unwrap();
        assert_eq!(conf.port, 10001);

        let result = Conf::load_first_toml_file(&[dir.join("missing.toml")]);
        assert!(matches!(result, Err(Error::NotFound(paths)) if paths.len() == 1));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
