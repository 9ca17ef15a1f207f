//! Persisted slug history.
//!
//! A flat JSON array of strings on disk, loaded once at startup and rewritten
//! atomically (temp file + rename) after each mutation. This is the only
//! state that survives a restart.

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;

use parking_lot::Mutex;

/// The set of room slugs ever used, persisted across restarts.
pub struct SlugStore {
    path: PathBuf,
    slugs: Mutex<BTreeSet<String>>,
}

impl SlugStore {
    /// Loads the store, treating a missing file as empty. A corrupt file is
    /// logged and replaced on the next write.
    pub fn load(path: PathBuf) -> Self {
        let slugs = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                Ok(list) => list.into_iter().collect(),
                Err(e) => {
                    log::warn!(
                        "[SlugStore] Ignoring corrupt history at {}: {}",
                        path.display(),
                        e
                    );
                    BTreeSet::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                log::warn!("[SlugStore] Failed to read {}: {}", path.display(), e);
                BTreeSet::new()
            }
        };
        log::info!("[SlugStore] Loaded {} slug(s)", slugs.len());
        Self {
            path,
            slugs: Mutex::new(slugs),
        }
    }

    /// Records a slug. Returns `true` when it was new.
    pub fn add(&self, slug: &str) -> bool {
        let mut slugs = self.slugs.lock();
        let inserted = slugs.insert(slug.to_string());
        if inserted {
            self.persist(&slugs);
        }
        inserted
    }

    /// Removes a slug. Returns `true` when it existed.
    pub fn remove(&self, slug: &str) -> bool {
        let mut slugs = self.slugs.lock();
        let removed = slugs.remove(slug);
        if removed {
            self.persist(&slugs);
        }
        removed
    }

    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.slugs.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, slug: &str) -> bool {
        self.slugs.lock().contains(slug)
    }

    /// Rewrites the file atomically: write a sibling temp file, then rename
    /// over the target. Failures are logged, never propagated; slug history
    /// is best-effort bookkeeping.
    fn persist(&self, slugs: &BTreeSet<String>) {
        let list: Vec<&String> = slugs.iter().collect();
        let json = match serde_json::to_vec_pretty(&list) {
            Ok(j) => j,
            Err(e) => {
                log::warn!("[SlugStore] Failed to serialize history: {}", e);
                return;
            }
        };
        let tmp = self.path.with_extension("json.tmp");
        let result = std::fs::write(&tmp, &json).and_then(|()| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            log::warn!("[SlugStore] Failed to persist {}: {}", self.path.display(), e);
        }
    }
}

/// Validates a caller-supplied room slug.
///
/// Accepted: 1, or 3–40, chars of `[a-z0-9-]`, starting and ending
/// alphanumeric, no consecutive hyphens. Length 2 cannot satisfy the
/// shape (a single middle char would have to be both start and end).
#[must_use]
pub fn is_valid_slug(slug: &str) -> bool {
    let bytes = slug.as_bytes();
    if bytes.is_empty() || bytes.len() == 2 || bytes.len() > 40 {
        return false;
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    let mut prev_hyphen = false;
    for &b in bytes {
        match b {
            b'-' => {
                if prev_hyphen {
                    return false;
                }
                prev_hyphen = true;
            }
            b if alnum(b) => prev_hyphen = false,
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn slug_validation_boundaries() {
        // The optional tail group makes valid lengths exactly 1 and 3..=40.
        assert!(is_valid_slug("a"));
        assert!(is_valid_slug("0"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("-"));
        assert!(!is_valid_slug("ab"));
        assert!(is_valid_slug("abc"));
        assert!(!is_valid_slug("a--b"));
        assert!(is_valid_slug("a-b"));
        assert!(!is_valid_slug("-ab"));
        assert!(!is_valid_slug("ab-"));
        assert!(!is_valid_slug("A"));
        assert!(!is_valid_slug("aBc"));
        assert!(is_valid_slug(&"a".repeat(40)));
        assert!(!is_valid_slug(&"a".repeat(41)));
        assert!(!is_valid_slug("ab_c"));
    }

    #[test]
    fn add_remove_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slugs.json");

        let store = SlugStore::load(path.clone());
        assert!(store.add("friday-show"));
        assert!(!store.add("friday-show"));
        assert!(store.add("late-night"));

        // Fresh load sees the persisted state.
        let reloaded = SlugStore::load(path.clone());
        assert_eq!(reloaded.list(), vec!["friday-show", "late-night"]);

        assert!(reloaded.remove("friday-show"));
        assert!(!reloaded.remove("friday-show"));
        let reloaded = SlugStore::load(path);
        assert_eq!(reloaded.list(), vec!["late-night"]);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = SlugStore::load(dir.path().join("nope.json"));
        assert!(store.list().is_empty());
    }
}
