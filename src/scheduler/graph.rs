//! Package dependency graph

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::config::PackageConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("unknown package '{0}'")]
    UnknownPackage(String),

    #[error("dependency cycle among: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    packages: BTreeMap<String, PackageConfig>,
    /// package → packages that depend on it
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn from_packages(packages: &[PackageConfig]) -> Self {
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for pkg in packages {
            for dep in &pkg.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(pkg.name.clone());
            }
        }
        Self {
            packages: packages
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
            dependents,
        }
    }

    pub fn package(&self, name: &str) -> Option<&PackageConfig> {
        self.packages.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.packages.keys()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Targets plus everything they transitively depend on
    pub fn with_dependencies(&self, targets: &[String]) -> Result<BTreeSet<String>, GraphError> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        for target in targets {
            if !self.packages.contains_key(target) {
                return Err(GraphError::UnknownPackage(target.clone()));
            }
            queue.push_back(target);
        }
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.to_string()) {
                continue;
            }
            let pkg = self
                .packages
                .get(name)
                .ok_or_else(|| GraphError::UnknownPackage(name.to_string()))?;
            for dep in &pkg.dependencies {
                queue.push_back(dep);
            }
        }
        Ok(seen)
    }

    /// A package plus everything that transitively depends on it
    pub fn with_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !self.packages.contains_key(&current) || !seen.insert(current.clone()) {
                continue;
            }
            if let Some(children) = self.dependents.get(&current) {
                queue.extend(children.iter().cloned());
            }
        }
        seen
    }

    /// Kahn's algorithm over all packages
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let all: BTreeSet<String> = self.packages.keys().cloned().collect();
        self.topological_subset(&all)
    }

    /// Order a dependency-closed subset so dependencies come first
    pub fn topological_subset(&self, subset: &BTreeSet<String>) -> Result<Vec<String>, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for name in subset {
            let pkg = self
                .packages
                .get(name)
                .ok_or_else(|| GraphError::UnknownPackage(name.clone()))?;
            let deps = pkg
                .dependencies
                .iter()
                .filter(|d| subset.contains(*d))
                .count();
            in_degree.insert(name.as_str(), deps);
        }

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(subset.len());

        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            if let Some(children) = self.dependents.get(name) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push_back(child.as_str());
                        }
                    }
                }
            }
        }

        if order.len() != subset.len() {
            let stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Longest chain through `subset` by estimated time.
    ///
    /// Returns the chain (dependencies first) and its total duration.
    pub fn critical_path<F>(
        &self,
        subset: &BTreeSet<String>,
        estimate: F,
    ) -> Result<(Vec<String>, u64), GraphError>
    where
        F: Fn(&str) -> u64,
    {
        let order = self.topological_subset(subset)?;
        // finish time and predecessor on the longest path
        let mut finish: BTreeMap<&str, (u64, Option<&str>)> = BTreeMap::new();

        for name in &order {
            let pkg = &self.packages[name];
            let (start, via) = pkg
                .dependencies
                .iter()
                .filter(|d| subset.contains(*d))
                .filter_map(|d| finish.get(d.as_str()).map(|(t, _)| (*t, d.as_str())))
                .max_by_key(|(t, _)| *t)
                .map(|(t, d)| (t, Some(d)))
                .unwrap_or((0, None));
            finish.insert(name.as_str(), (start + estimate(name), via));
        }

        let Some((&end, &(total, _))) = finish.iter().max_by_key(|(_, (t, _))| *t) else {
            return Ok((Vec::new(), 0));
        };

        let mut path = vec![end.to_string()];
        let mut cursor = end;
        while let Some((_, Some(prev))) = finish.get(cursor) {
            path.push(prev.to_string());
            cursor = *prev;
        }
        path.reverse();
        Ok((path, total))
    }
}
