use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::simulation::error::IoError;

pub mod network;
pub mod routes;

/// Resolves `path` against the directory of the config file it was read from. Absolute paths
/// and paths starting with `./` are taken as they are.
pub fn resolve_path(context: &Option<PathBuf>, path: &Path) -> PathBuf {
    if path.is_absolute() || path.starts_with("./") {
        return path.to_path_buf();
    }
    match context.as_ref().and_then(|c| c.parent()) {
        Some(dir) => dir.join(path),
        None => path.to_path_buf(),
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, IoError> {
    let file = File::open(path).map_err(|source| IoError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| IoError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use crate::simulation::io::resolve_path;

    #[test]
    fn relative_to_config() {
        let context = Some(PathBuf::from("/scenarios/city/config.yml"));
        assert_eq!(
            PathBuf::from("/scenarios/city/network.json"),
            resolve_path(&context, Path::new("network.json"))
        );
        assert_eq!(
            PathBuf::from("./network.json"),
            resolve_path(&context, Path::new("./network.json"))
        );
        assert_eq!(
            PathBuf::from("/tmp/out"),
            resolve_path(&context, Path::new("/tmp/out"))
        );
        assert_eq!(PathBuf::from("out"), resolve_path(&None, Path::new("out")));
    }
}
