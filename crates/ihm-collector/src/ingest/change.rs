//! Change detection for listed files
//!
//! Two layers decide whether a listed file needs work:
//!
//! 1. the done set, a cheap skip for files already fully ingested
//! 2. a fingerprint cache (size, plus hash when the transport has one)
//!    recorded when a file reaches done
//!
//! Both start empty. The orchestrator seeds a file it has never seen from the
//! row store, so a restart does not re-ingest everything.
//!
//! FTP listings carry no hash, so a size match counts as unchanged. A file
//! rewritten in place with the same size is not detected until its size
//! moves. The watermark still guards against duplicate rows when a file is
//! processed again.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::models::RemoteFileRef;

/// What the listing implies for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    /// Marked done and unchanged since
    Done,
    /// Matches the cached fingerprint
    Unchanged,
    /// Was done, but the listing no longer matches the cache
    Reopened,
    /// Never completed, or changed since last seen
    Changed,
}

impl ChangeStatus {
    pub fn needs_work(self) -> bool {
        matches!(self, ChangeStatus::Reopened | ChangeStatus::Changed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    size: u64,
    remote_hash: Option<String>,
    content_hash: Option<String>,
}

impl Fingerprint {
    fn matches(&self, file: &RemoteFileRef) -> bool {
        if self.size != file.size {
            return false;
        }
        match (&self.remote_hash, &file.hash) {
            (Some(cached), Some(listed)) => cached == listed,
            _ => true,
        }
    }
}

/// Done set plus fingerprint cache, owned by the orchestrator
#[derive(Debug, Default)]
pub struct ChangeDetector {
    done: HashSet<String>,
    cache: HashMap<String, Fingerprint>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, file: &RemoteFileRef) -> ChangeStatus {
        let cached = self.cache.get(&file.name);
        let unchanged = cached.is_some_and(|fp| fp.matches(file));

        if self.done.contains(&file.name) {
            if unchanged || cached.is_none() {
                return ChangeStatus::Done;
            }
            debug!(file = %file.name, size = file.size, "Done file changed, reopening");
            self.done.remove(&file.name);
            return ChangeStatus::Reopened;
        }

        if unchanged {
            ChangeStatus::Unchanged
        } else {
            ChangeStatus::Changed
        }
    }

    /// True when downloaded content hashes to the value cached at done time
    pub fn content_unchanged(&self, name: &str, content_hash: &str) -> bool {
        self.cache
            .get(name)
            .and_then(|fp| fp.content_hash.as_deref())
            .is_some_and(|cached| cached == content_hash)
    }

    /// Record a file as fully ingested and refresh its fingerprint
    pub fn mark_done(&mut self, file: &RemoteFileRef, content_hash: Option<String>) {
        self.cache.insert(
            file.name.clone(),
            Fingerprint {
                size: file.size,
                remote_hash: file.hash.clone(),
                content_hash,
            },
        );
        self.done.insert(file.name.clone());
    }

    /// True once a file has been marked done at least once
    pub fn knows(&self, name: &str) -> bool {
        self.done.contains(name) || self.cache.contains_key(name)
    }

    pub fn is_done(&self, name: &str) -> bool {
        self.done.contains(name)
    }

    pub fn done_count(&self) -> usize {
        self.done.len()
    }
}
