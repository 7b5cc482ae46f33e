//! Library roots exposed to clients
//!
//! Each root is a named directory on the server. Clients browse roots by name
//! and request streams with paths of the form `/<root>/<relative path>`; the
//! real filesystem path never leaves the server.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("Not found")]
    NotFound,
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One item in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryEntry {
    pub name: String,
    pub dir: bool,
    pub size: u64,
}

#[derive(Debug)]
pub enum BrowseResult {
    Directory(Vec<LibraryEntry>),
    /// A regular file; its contents are sent as plain text.
    File(PathBuf),
}

pub struct LibraryService {
    roots: BTreeMap<String, PathBuf>,
    /// Lowercase, with leading dot
    extensions: HashSet<String>,
}

impl LibraryService {
    pub fn new<R, E>(roots: R, extensions: E) -> Self
    where
        R: IntoIterator<Item = (String, PathBuf)>,
        E: IntoIterator<Item = String>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| {
                let ext = ext.trim().to_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                }
            })
            .collect();
        Self {
            roots: roots.into_iter().collect(),
            extensions,
        }
    }

    /// Root names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.roots.keys().cloned().collect()
    }

    pub fn root(&self, name: &str) -> Option<&Path> {
        self.roots.get(name).map(PathBuf::as_path)
    }

    /// Whether a file name has one of the configured media extensions.
    pub fn is_media_file(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .map(|ext| {
                self.extensions
                    .contains(&format!(".{}", ext.to_string_lossy().to_lowercase()))
            })
            .unwrap_or(false)
    }

    /// Join a client-supplied relative path onto a root.
    ///
    /// Only plain path components are accepted, so the result always stays
    /// below the root.
    pub fn join(&self, name: &str, relative: &str) -> Result<PathBuf, LibraryError> {
        let root = self.root(name).ok_or(LibraryError::NotFound)?;
        let mut path = root.to_path_buf();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(LibraryError::BadRequest(format!(
                        "invalid path: {}",
                        relative
                    )));
                }
            }
        }
        Ok(path)
    }

    /// Map a stream request path (`/<root>/<rest>`) to the source file path.
    pub fn resolve_request(&self, request_path: &str) -> Result<PathBuf, LibraryError> {
        let trimmed = request_path.strip_prefix('/').unwrap_or(request_path);
        let (name, rest) = trimmed
            .split_once('/')
            .filter(|(name, rest)| !name.is_empty() && !rest.is_empty())
            .ok_or_else(|| LibraryError::BadRequest(format!("invalid path: {}", request_path)))?;
        if self.root(name).is_none() {
            return Err(LibraryError::BadRequest(format!("unknown library: {}", name)));
        }
        self.join(name, rest)
    }

    /// List a directory below a root, or identify a file.
    ///
    /// Listings contain subdirectories and media files only, directories
    /// first. Hidden entries are skipped.
    pub async fn browse(&self, name: &str, relative: &str) -> Result<BrowseResult, LibraryError> {
        let path = self.join(name, relative)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|_| LibraryError::NotFound)?;
        if !metadata.is_dir() {
            return Ok(BrowseResult::File(path));
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let metadata = match fs::metadata(entry.path()).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.is_dir() {
                entries.push(LibraryEntry {
                    name,
                    dir: true,
                    size: 0,
                });
            } else if metadata.is_file() && self.is_media_file(&name) {
                entries.push(LibraryEntry {
                    name,
                    dir: false,
                    size: metadata.len(),
                });
            }
        }

        entries.sort_by(|a, b| match (a.dir, b.dir) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });
        Ok(BrowseResult::Directory(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn library(root: &Path) -> LibraryService {
        LibraryService::new(
            [("movies".to_string(), root.to_path_buf())],
            [".mkv".to_string(), "MP4".to_string()],
        )
    }

    #[test]
    fn test_resolve_request() {
        let lib = library(Path::new("/mnt/movies"));
        assert_eq!(
            lib.resolve_request("/movies/Heat (1995)/Heat.mkv").unwrap(),
            PathBuf::from("/mnt/movies/Heat (1995)/Heat.mkv")
        );
        assert_matches!(
            lib.resolve_request("/tv/show.mkv"),
            Err(LibraryError::BadRequest(_))
        );
        assert_matches!(lib.resolve_request("/movies"), Err(LibraryError::BadRequest(_)));
        assert_matches!(lib.resolve_request(""), Err(LibraryError::BadRequest(_)));
        assert_matches!(
            lib.resolve_request("/movies/../../etc/passwd"),
            Err(LibraryError::BadRequest(_))
        );
    }

    #[test]
    fn test_join_unknown_root() {
        let lib = library(Path::new("/mnt/movies"));
        assert_matches!(lib.join("music", ""), Err(LibraryError::NotFound));
        assert_eq!(lib.join("movies", "").unwrap(), PathBuf::from("/mnt/movies"));
    }

    #[test]
    fn test_media_extensions_are_case_insensitive() {
        let lib = library(Path::new("/mnt/movies"));
        assert!(lib.is_media_file("a.MKV"));
        assert!(lib.is_media_file("b.mp4"));
        assert!(!lib.is_media_file("notes.txt"));
        assert!(!lib.is_media_file("README"));
    }

    #[tokio::test]
    async fn test_browse_lists_dirs_and_media() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("Season 1")).unwrap();
        std::fs::create_dir(root.path().join(".hidden")).unwrap();
        std::fs::write(root.path().join("b.mkv"), b"12345").unwrap();
        std::fs::write(root.path().join("A.mp4"), b"1").unwrap();
        std::fs::write(root.path().join("notes.txt"), b"skip").unwrap();

        let lib = library(root.path());
        let listing = lib.browse("movies", "").await.unwrap();
        let BrowseResult::Directory(entries) = listing else {
            panic!("expected a directory listing");
        };
        assert_eq!(
            entries,
            vec![
                LibraryEntry { name: "Season 1".into(), dir: true, size: 0 },
                LibraryEntry { name: "A.mp4".into(), dir: false, size: 1 },
                LibraryEntry { name: "b.mkv".into(), dir: false, size: 5 },
            ]
        );

        assert_matches!(
            lib.browse("movies", "notes.txt").await,
            Ok(BrowseResult::File(_))
        );
        assert_matches!(
            lib.browse("movies", "missing").await,
            Err(LibraryError::NotFound)
        );
    }
}
