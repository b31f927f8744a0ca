use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// path to an existing `.torrent` file, checked when the cli is parsed.
#[derive(Debug, Clone)]
pub struct MetainfoFilePath(PathBuf);

impl MetainfoFilePath {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, anyhow::Error> {
        let path: PathBuf = path.into();

        if !path.is_file() {
            anyhow::bail!("could not find file at {}", path.display());
        }

        let extension_is_torrent = path
            .extension()
            .is_some_and(|ext| ext == OsStr::new("torrent"));
        if !extension_is_torrent {
            anyhow::bail!("torrent files must have a .torrent extension");
        }

        Ok(MetainfoFilePath(path))
    }
}

impl FromStr for MetainfoFilePath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<Path> for MetainfoFilePath {
    fn as_ref(&self) -> &Path {
        self.0.as_ref()
    }
}
