use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

const APP_NAME: &str = "annodex";

/// Get the application data directory (config file and default index location)
pub fn get_app_data_dir() -> Result<PathBuf> {
    let base = if cfg!(target_os = "macos") {
        dirs::home_dir().map(|h| h.join("Library").join("Application Support"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
    } else {
        // Linux/Unix: use XDG_DATA_HOME or ~/.local/share
        dirs::data_dir()
    };

    let base = base.context("Could not determine app data directory")?;
    let app_dir = base.join(APP_NAME);

    fs::create_dir_all(&app_dir)?;
    Ok(app_dir)
}

/// Default base directory holding the indexes of all corpora
pub fn default_index_root() -> Result<PathBuf> {
    Ok(get_app_data_dir()?.join("indexes"))
}

/// Index directory for a corpus directory loaded by the CLI
pub fn get_corpus_index_dir(index_root: &Path, corpus_root: &Path) -> PathBuf {
    index_root.join(hash_path(corpus_root))
}

/// Remove the index of a corpus
pub fn remove_corpus_index(index_root: &Path, corpus_root: &Path) -> Result<bool> {
    let dir = get_corpus_index_dir(index_root, corpus_root);
    if dir.exists() {
        fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to remove {}", dir.display()))?;
        return Ok(true);
    }
    Ok(false)
}

/// Hash a path to create a unique folder name
/// Format: first 16 chars of dir name + hash
fn hash_path(path: &Path) -> String {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let path_str = canonical.to_string_lossy();

    let dir_name = canonical
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");

    let sanitized: String = dir_name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(16)
        .collect();

    let mut hasher = DefaultHasher::new();
    path_str.hash(&mut hasher);
    let hash = hasher.finish();

    format!("{}-{:016x}", sanitized, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_path() {
        let hash1 = hash_path(Path::new("/home/user/corpus"));
        let hash2 = hash_path(Path::new("/home/user/corpus"));
        let hash3 = hash_path(Path::new("/home/user/other"));

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert!(hash1.starts_with("corpus-"));
    }

    #[test]
    fn test_remove_missing_index() {
        let root = tempfile::tempdir().unwrap();
        let removed = remove_corpus_index(root.path(), Path::new("/no/such/corpus")).unwrap();
        assert!(!removed);
    }
}
