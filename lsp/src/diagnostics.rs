//! Diagnostics cache fed by `textDocument/publishDiagnostics`.
//!
//! Readers load an immutable snapshot of the whole map; writers publish a new
//! map through `rcu`. Only the dispatcher writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::types::{Diagnostic, DiagnosticSet, DiagnosticStamp};

type DiagnosticsMap = HashMap<String, DiagnosticSet>;

#[derive(Debug)]
pub struct DiagnosticsCache {
    map: ArcSwap<DiagnosticsMap>,
    /// Sequence of the most recently applied push.
    applied: watch::Sender<u64>,
}

impl Default for DiagnosticsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsCache {
    #[must_use]
    pub fn new() -> Self {
        let (applied, _rx) = watch::channel(0);
        Self {
            map: ArcSwap::from_pointee(HashMap::new()),
            applied,
        }
    }

    /// Replace the set for `uri` unless `stamp` is older than the stored one.
    ///
    /// Returns whether the push was applied. An empty `diagnostics` list is
    /// stored (it clears the file) so its stamp still guards against stale
    /// pushes.
    pub fn update(&self, uri: &str, diagnostics: Vec<Diagnostic>, stamp: DiagnosticStamp) -> bool {
        let mut applied = false;
        self.map.rcu(|current| {
            if current
                .get(uri)
                .is_some_and(|existing| stamp.is_older_than(&existing.stamp()))
            {
                applied = false;
                return Arc::clone(current);
            }
            applied = true;
            let mut next = DiagnosticsMap::clone(current);
            next.insert(
                uri.to_string(),
                DiagnosticSet::new(uri.to_string(), diagnostics.clone(), stamp),
            );
            Arc::new(next)
        });

        if applied {
            self.applied.send_modify(|seq| *seq = (*seq).max(stamp.sequence));
        } else {
            tracing::debug!(
                uri = %uri,
                sequence = stamp.sequence,
                version = ?stamp.version,
                "Discarding stale diagnostics"
            );
        }
        applied
    }

    /// Drop the document version from the stored stamp for `uri`.
    ///
    /// Called when the document is closed: a reopen restarts versions at 1,
    /// so later pushes must be ordered by arrival rather than compared with
    /// the old version.
    pub fn forget_version(&self, uri: &str) {
        self.map.rcu(|current| {
            let Some(existing) = current.get(uri) else {
                return Arc::clone(current);
            };
            if existing.stamp().version.is_none() {
                return Arc::clone(current);
            }
            let stamp = DiagnosticStamp {
                version: None,
                ..existing.stamp()
            };
            let mut next = DiagnosticsMap::clone(current);
            next.insert(
                uri.to_string(),
                DiagnosticSet::new(uri.to_string(), existing.diagnostics().to_vec(), stamp),
            );
            Arc::new(next)
        });
    }

    /// The latest set for `uri`, or an empty set.
    #[must_use]
    pub fn snapshot(&self, uri: &str) -> DiagnosticSet {
        self.map
            .load()
            .get(uri)
            .cloned()
            .unwrap_or_else(|| DiagnosticSet::empty(uri.to_string()))
    }

    /// Every non-empty set, files with errors first, then by URI.
    #[must_use]
    pub fn all(&self) -> Vec<DiagnosticSet> {
        let mut sets: Vec<DiagnosticSet> = self
            .map
            .load()
            .values()
            .filter(|set| !set.is_empty())
            .cloned()
            .collect();
        sets.sort_by(|a, b| {
            let a_has_errors = a.error_count() > 0;
            let b_has_errors = b.error_count() > 0;
            b_has_errors
                .cmp(&a_has_errors)
                .then_with(|| a.uri().cmp(b.uri()))
        });
        sets
    }

    /// Error-severity diagnostics for `uris`, skipping clean files.
    #[must_use]
    pub fn errors_for(&self, uris: &[String]) -> Vec<(String, Vec<Diagnostic>)> {
        let map = self.map.load();
        uris.iter()
            .filter_map(|uri| {
                let errors = map.get(uri)?.errors();
                (!errors.is_empty()).then(|| (uri.clone(), errors))
            })
            .collect()
    }

    /// Sequence of the last push applied for `uri` (0 if none).
    #[must_use]
    pub fn sequence_for(&self, uri: &str) -> u64 {
        self.map.load().get(uri).map_or(0, |set| set.stamp().sequence)
    }

    /// Wait until a push newer than `after_sequence` has been applied for
    /// `uri`. Returns `None` on timeout.
    pub async fn wait_for(
        &self,
        uri: &str,
        after_sequence: u64,
        timeout: Duration,
    ) -> Option<DiagnosticSet> {
        let mut rx = self.applied.subscribe();
        let arrived = tokio::time::timeout(timeout, async {
            loop {
                if self.sequence_for(uri) > after_sequence {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        arrived.ok().map(|()| self.snapshot(uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiagnosticSeverity, Position, Range};

    fn make_diag(severity: DiagnosticSeverity, msg: &str, line: u32) -> Diagnostic {
        Diagnostic::new(
            severity,
            Range::new(Position::new(line, 1), Position::new(line, 2)),
            msg.to_string(),
            None,
            "test".to_string(),
        )
    }

    fn stamp(version: Option<i32>, sequence: u64) -> DiagnosticStamp {
        DiagnosticStamp { version, sequence }
    }

    #[test]
    fn test_unknown_uri_is_empty() {
        let cache = DiagnosticsCache::new();
        let snap = cache.snapshot("file:///nope.rs");
        assert!(snap.is_empty());
        assert_eq!(snap.uri(), "file:///nope.rs");
        assert!(cache.all().is_empty());
    }

    #[test]
    fn test_update_and_snapshot() {
        let cache = DiagnosticsCache::new();
        assert!(cache.update(
            "file:///a.rs",
            vec![make_diag(DiagnosticSeverity::Error, "bad", 1)],
            stamp(Some(1), 1),
        ));
        let snap = cache.snapshot("file:///a.rs");
        assert_eq!(snap.error_count(), 1);
        assert_eq!(snap.stamp().sequence, 1);
    }

    #[test]
    fn test_stale_push_is_discarded() {
        let cache = DiagnosticsCache::new();
        cache.update(
            "file:///a.rs",
            vec![make_diag(DiagnosticSeverity::Error, "new", 1)],
            stamp(Some(3), 2),
        );
        // Arrives later but describes an older document version.
        assert!(!cache.update(
            "file:///a.rs",
            vec![make_diag(DiagnosticSeverity::Warning, "old", 1)],
            stamp(Some(2), 3),
        ));
        assert_eq!(cache.snapshot("file:///a.rs").diagnostics()[0].message(), "new");

        // Unversioned pushes are ordered by arrival.
        assert!(cache.update("file:///b.rs", vec![], stamp(None, 5)));
        assert!(!cache.update(
            "file:///b.rs",
            vec![make_diag(DiagnosticSeverity::Error, "older", 1)],
            stamp(None, 4),
        ));
        assert!(cache.snapshot("file:///b.rs").is_empty());
    }

    #[test]
    fn test_forget_version_orders_by_arrival() {
        let cache = DiagnosticsCache::new();
        cache.update(
            "file:///a.rs",
            vec![make_diag(DiagnosticSeverity::Error, "old", 1)],
            stamp(Some(4), 1),
        );
        assert!(!cache.update("file:///a.rs", vec![], stamp(Some(1), 2)));

        cache.forget_version("file:///a.rs");
        let kept = cache.snapshot("file:///a.rs");
        assert_eq!(kept.stamp(), stamp(None, 1));
        assert_eq!(kept.diagnostics().len(), 1);

        assert!(cache.update("file:///a.rs", vec![], stamp(Some(1), 3)));
        assert!(cache.snapshot("file:///a.rs").is_empty());
        // Pushes that arrived before the reopen stay discarded.
        assert!(!cache.update("file:///a.rs", vec![], stamp(None, 2)));
        cache.forget_version("file:///missing.rs");
        assert!(cache.all().is_empty());
    }

    #[test]
    fn test_empty_push_clears_file() {
        let cache = DiagnosticsCache::new();
        cache.update(
            "file:///a.rs",
            vec![make_diag(DiagnosticSeverity::Error, "e", 1)],
            stamp(None, 1),
        );
        assert!(cache.update("file:///a.rs", vec![], stamp(None, 2)));
        assert!(cache.snapshot("file:///a.rs").is_empty());
        assert!(cache.all().is_empty());
    }

    #[test]
    fn test_all_sorts_errors_first() {
        let cache = DiagnosticsCache::new();
        cache.update(
            "file:///a.rs",
            vec![make_diag(DiagnosticSeverity::Warning, "w", 1)],
            stamp(None, 1),
        );
        cache.update(
            "file:///z.rs",
            vec![make_diag(DiagnosticSeverity::Error, "e", 1)],
            stamp(None, 2),
        );
        let all = cache.all();
        assert_eq!(all[0].uri(), "file:///z.rs");
        assert_eq!(all[1].uri(), "file:///a.rs");
    }

    #[test]
    fn test_errors_for() {
        let cache = DiagnosticsCache::new();
        cache.update(
            "file:///a.rs",
            vec![
                make_diag(DiagnosticSeverity::Error, "e1", 1),
                make_diag(DiagnosticSeverity::Warning, "w1", 2),
            ],
            stamp(None, 1),
        );
        cache.update(
            "file:///b.rs",
            vec![make_diag(DiagnosticSeverity::Warning, "w2", 1)],
            stamp(None, 2),
        );
        let errors = cache.errors_for(&[
            "file:///a.rs".to_string(),
            "file:///b.rs".to_string(),
            "file:///c.rs".to_string(),
        ]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "file:///a.rs");
        assert_eq!(errors[0].1.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_push() {
        let cache = Arc::new(DiagnosticsCache::new());
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .wait_for("file:///a.rs", 0, Duration::from_secs(2))
                    .await
            })
        };
        tokio::task::yield_now().await;
        cache.update(
            "file:///a.rs",
            vec![make_diag(DiagnosticSeverity::Error, "e", 1)],
            stamp(None, 1),
        );
        let set = waiter.await.unwrap().expect("push observed");
        assert_eq!(set.error_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let cache = DiagnosticsCache::new();
        assert!(
            cache
                .wait_for("file:///a.rs", 0, Duration::from_millis(20))
                .await
                .is_none()
        );
    }
}
