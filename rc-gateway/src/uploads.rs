use std::{
    fmt,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use base64::Engine;

#[derive(Debug)]
pub enum StoreError {
    InvalidName(String),
    Decode(base64::DecodeError),
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidName(raw) => write!(f, "invalid file name: {raw:?}"),
            StoreError::Decode(err) => write!(f, "invalid base64 payload: {err}"),
            StoreError::Io { path, source } => write!(f, "{}: {source}", path.display()),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::InvalidName(_) => None,
            StoreError::Decode(err) => Some(err),
            StoreError::Io { source, .. } => Some(source),
        }
    }
}

/// Named blobs kept flat in a single directory. Uploaded programs and
/// recorded trajectories share it, so a recording can be replayed by name.
#[derive(Clone, Debug)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(sanitize_name(name)?))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|path| path.is_file()).unwrap_or(false)
    }

    pub fn save(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.path_for(name)?;
        self.ensure_root()?;

        let mut temp_name = path.as_os_str().to_os_string();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        fs::write(&temp_path, bytes).map_err(|source| StoreError::Io {
            path: temp_path.clone(),
            source,
        })?;

        if let Err(source) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Io { path, source });
        }
        Ok(path)
    }

    /// Decodes a standard-alphabet base64 payload and saves it. Nothing is
    /// written when decoding fails.
    pub fn save_base64(&self, name: &str, encoded: &str) -> Result<PathBuf, StoreError> {
        sanitize_name(name)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(StoreError::Decode)?;
        self.save(name, &bytes)
    }

    pub fn read_lines(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let path = self.path_for(name)?;
        let bytes = fs::read(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .map(ToOwned::to_owned)
            .collect())
    }

    /// Opens `name` for writing, truncating anything already stored under it.
    pub fn create_for_write(&self, name: &str) -> Result<(PathBuf, File), StoreError> {
        let path = self.path_for(name)?;
        self.ensure_root()?;
        let file = File::create(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok((path, file))
    }

    fn ensure_root(&self) -> Result<(), StoreError> {
        if self.root.as_os_str().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })
    }
}

/// Strips every directory component, accepting either separator.
pub fn sanitize_name(raw: &str) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    let base = trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(StoreError::InvalidName(raw.to_string()));
    }
    Ok(base.to_string())
}
