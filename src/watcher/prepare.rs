//! Preemptive build preparation
//!
//! As change events arrive, the affected downstream packages and a rough
//! worker/time estimate are computed and cached per path, so turning a
//! batch into a build request later is a lookup. Best-effort only.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::impact::ImpactTier;
use super::ChangeBatch;
use crate::config::PackageConfig;
use crate::scheduler::graph::DependencyGraph;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preparation {
    pub path: PathBuf,
    pub impact: ImpactTier,
    pub affected_packages: Vec<String>,
    pub estimated_workers: u32,
    pub estimated_time_ms: u64,
    pub prepared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub struct Preparer {
    graph: DependencyGraph,
    /// (package dir, package name), longest dir first
    package_dirs: Vec<(PathBuf, String)>,
    cache: DashMap<PathBuf, Preparation>,
    hits: AtomicU64,
    misses: AtomicU64,
    idle_workers: AtomicU32,
}

impl Preparer {
    pub fn new(packages: &[PackageConfig]) -> Self {
        let mut package_dirs: Vec<(PathBuf, String)> = packages
            .iter()
            .map(|p| (p.path.clone(), p.name.clone()))
            .collect();
        package_dirs.sort_by(|a, b| b.0.components().count().cmp(&a.0.components().count()));

        Self {
            graph: DependencyGraph::from_packages(packages),
            package_dirs,
            cache: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            idle_workers: AtomicU32::new(1),
        }
    }

    /// Workers currently idle, used for the worker estimate
    pub fn set_idle_workers(&self, count: u32) {
        self.idle_workers.store(count, Ordering::Relaxed);
    }

    pub fn owning_package(&self, path: &Path) -> Option<&str> {
        self.package_dirs
            .iter()
            .find(|(dir, _)| path.starts_with(dir))
            .map(|(_, name)| name.as_str())
    }

    /// Packages a change at `path` forces to rebuild
    pub fn affected_packages(&self, path: &Path, impact: ImpactTier) -> BTreeSet<String> {
        match impact {
            ImpactTier::Ignored => BTreeSet::new(),
            ImpactTier::FullRebuild => self.graph.names().cloned().collect(),
            ImpactTier::PackageRebuild => match self.owning_package(path) {
                Some(owner) => self.graph.with_dependents(owner),
                // Shared code outside any package touches everything
                None => self.graph.names().cloned().collect(),
            },
            ImpactTier::Incremental | ImpactTier::AssetOnly => self
                .owning_package(path)
                .map(|owner| self.graph.with_dependents(owner))
                .unwrap_or_default(),
        }
    }

    /// Compute and cache the preparation for one path
    pub fn prepare(&self, path: &Path, impact: ImpactTier) -> Preparation {
        let affected = self.affected_packages(path, impact);
        let total_ms: u64 = affected
            .iter()
            .filter_map(|name| self.graph.package(name))
            .map(|p| p.estimated_time_ms)
            .sum();
        let workers = if affected.is_empty() {
            0
        } else {
            (affected.len() as u32).min(self.idle_workers.load(Ordering::Relaxed).max(1))
        };
        let preparation = Preparation {
            path: path.to_path_buf(),
            impact,
            affected_packages: affected.into_iter().collect(),
            estimated_workers: workers,
            estimated_time_ms: if workers == 0 { 0 } else { total_ms / workers as u64 },
            prepared_at: Utc::now(),
        };
        self.cache.insert(path.to_path_buf(), preparation.clone());
        preparation
    }

    /// Cached preparation, counting the hit or miss
    pub fn lookup(&self, path: &Path, impact: ImpactTier) -> Option<Preparation> {
        match self.cache.get(path) {
            Some(prep) if prep.impact == impact => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(prep.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Union of affected packages for every path in a batch
    pub fn affected_for_batch(&self, batch: &ChangeBatch) -> Vec<String> {
        if batch.impact == ImpactTier::FullRebuild {
            return self.graph.names().cloned().collect();
        }
        let mut affected = BTreeSet::new();
        for (path, impact) in &batch.classified {
            let prep = self
                .lookup(path, *impact)
                .unwrap_or_else(|| self.prepare(path, *impact));
            affected.extend(prep.affected_packages);
        }
        affected.into_iter().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.cache.len(),
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    /// Drop cached preparations and reset counters; returns entries removed
    pub fn clear(&self) -> usize {
        let removed = self.cache.len();
        self.cache.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, path: &str, deps: &[&str]) -> PackageConfig {
        PackageConfig {
            name: name.into(),
            path: PathBuf::from(path),
            entry: "src/index.ts".into(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            estimated_size_kb: 0,
            estimated_time_ms: 1000,
            priority: 0,
            output_dir: "dist".into(),
        }
    }

    fn preparer() -> Preparer {
        Preparer::new(&[
            pkg("shared", "packages/shared", &[]),
            pkg("app", "packages/app", &["shared"]),
            pkg("admin", "packages/app/admin", &["shared"]),
            pkg("site", "site", &[]),
        ])
    }

    #[test]
    fn test_owning_package_prefers_deepest() {
        let p = preparer();
        assert_eq!(p.owning_package(Path::new("packages/app/admin/src/a.ts")), Some("admin"));
        assert_eq!(p.owning_package(Path::new("packages/app/src/a.ts")), Some("app"));
        assert_eq!(p.owning_package(Path::new("scripts/x.ts")), None);
    }

    #[test]
    fn test_affected_includes_dependents() {
        let p = preparer();
        let affected = p.affected_packages(Path::new("packages/shared/src/a.ts"), ImpactTier::PackageRebuild);
        assert_eq!(
            affected.into_iter().collect::<Vec<_>>(),
            vec!["admin", "app", "shared"]
        );
        assert!(p
            .affected_packages(Path::new("README.md"), ImpactTier::Ignored)
            .is_empty());
        assert_eq!(
            p.affected_packages(Path::new("package.json"), ImpactTier::FullRebuild).len(),
            4
        );
    }

    #[test]
    fn test_estimates_use_idle_workers() {
        let p = preparer();
        p.set_idle_workers(2);
        let prep = p.prepare(Path::new("packages/shared/x.ts"), ImpactTier::Incremental);
        assert_eq!(prep.estimated_workers, 2);
        assert_eq!(prep.estimated_time_ms, 1500);
    }

    #[test]
    fn test_cache_hits_and_clear() {
        let p = preparer();
        let path = Path::new("site/index.ts");
        assert!(p.lookup(path, ImpactTier::Incremental).is_none());
        p.prepare(path, ImpactTier::Incremental);
        assert!(p.lookup(path, ImpactTier::Incremental).is_some());
        let stats = p.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert_eq!(p.clear(), 1);
        assert_eq!(p.stats().entries, 0);
    }
}
