use super::BuildArtifact;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct CachedArtifact {
    artifact: Arc<BuildArtifact>,
    last_used: AtomicU64,
}

/// Built bundles keyed by artifact id. An entry is only served while its
/// fingerprint matches the current source, so edits force a rebuild.
pub struct ArtifactCache {
    entries: DashMap<String, CachedArtifact>,
    clock: AtomicU64,
    disk_dir: Option<PathBuf>,
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ArtifactCache {
    /// `disk_dir` mirrors successful bundles on disk so a restart can reuse them.
    pub fn new(disk_dir: Option<PathBuf>) -> Self {
        Self {
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
            disk_dir,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self, artifact_id: &str, fingerprint: &str) -> Option<Arc<BuildArtifact>> {
        if let Some(entry) = self.entries.get(artifact_id) {
            if entry.artifact.fingerprint == fingerprint {
                entry.last_used.store(self.tick(), Ordering::SeqCst);
                return Some(Arc::clone(&entry.artifact));
            }
        }
        let artifact = self.load_from_disk(artifact_id, fingerprint)?;
        tracing::debug!(artifact_id, "artifact restored from disk cache");
        let artifact = Arc::new(artifact);
        self.store(artifact_id, Arc::clone(&artifact));
        Some(artifact)
    }

    /// Cache a successful build. Fallback bundles are never cached.
    pub fn insert(&self, artifact_id: &str, artifact: Arc<BuildArtifact>) {
        if artifact.fallback {
            return;
        }
        self.write_to_disk(artifact_id, &artifact);
        self.store(artifact_id, artifact);
    }

    fn store(&self, artifact_id: &str, artifact: Arc<BuildArtifact>) {
        self.entries.insert(
            artifact_id.to_string(),
            CachedArtifact {
                artifact,
                last_used: AtomicU64::new(self.tick()),
            },
        );
    }

    pub fn remove(&self, artifact_id: &str) -> bool {
        self.entries.remove(artifact_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict least recently used entries until at most `max_entries` remain.
    pub fn prune(&self, max_entries: usize) -> usize {
        let mut usage: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.last_used.load(Ordering::SeqCst)))
            .collect();
        if usage.len() <= max_entries {
            return 0;
        }
        usage.sort_by_key(|(_, last_used)| *last_used);
        let excess = usage.len() - max_entries;
        let mut removed = 0;
        for (key, _) in usage.into_iter().take(excess) {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    fn disk_path(&self, artifact_id: &str, fingerprint: &str) -> Option<PathBuf> {
        let dir = self.disk_dir.as_ref()?;
        let safe_id: String = artifact_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Some(dir.join(format!("{}-{}.js", safe_id, fingerprint)))
    }

    fn load_from_disk(&self, artifact_id: &str, fingerprint: &str) -> Option<BuildArtifact> {
        let path = self.disk_path(artifact_id, fingerprint)?;
        let bytes = std::fs::read(path).ok()?;
        Some(BuildArtifact {
            bytes,
            fingerprint: fingerprint.to_string(),
            fallback: false,
            build_log: String::new(),
        })
    }

    fn write_to_disk(&self, artifact_id: &str, artifact: &BuildArtifact) {
        let Some(path) = self.disk_path(artifact_id, &artifact.fingerprint) else {
            return;
        };
        let result = path
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| std::fs::write(&path, &artifact.bytes));
        if let Err(err) = result {
            tracing::warn!(artifact_id, error = %err, "failed to persist artifact");
        }
    }
}
