//! Change impact classification

use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// How much rebuild work a change implies. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImpactTier {
    Ignored,
    AssetOnly,
    Incremental,
    PackageRebuild,
    FullRebuild,
}

impl std::fmt::Display for ImpactTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ignored => "IGNORED",
            Self::AssetOnly => "ASSET_ONLY",
            Self::Incremental => "INCREMENTAL",
            Self::PackageRebuild => "PACKAGE_REBUILD",
            Self::FullRebuild => "FULL_REBUILD",
        };
        f.write_str(s)
    }
}

const LOCKFILES: &[&str] = &[
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "bun.lockb",
    "Cargo.lock",
];

const BUILD_CONFIGS: &[&str] = &["package.json", "Cargo.toml", "buildnet.toml", ".babelrc"];

/// `<stem>.config.<ext>` build tool configs
const CONFIG_STEMS: &[&str] = &[
    "vite", "esbuild", "webpack", "rspack", "rollup", "babel", "tsup",
];

const SOURCE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "rs", "vue", "svelte",
];

const ASSET_EXTENSIONS: &[&str] = &[
    "css", "scss", "sass", "less", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff",
    "woff2", "ttf", "eot",
];

const DOC_EXTENSIONS: &[&str] = &["md", "mdx", "txt", "rst"];

const TEST_DIRS: &[&str] = &["__tests__", "tests", "test", "__mocks__"];

const DOC_DIRS: &[&str] = &["docs", "doc"];

#[derive(Debug, Clone, Default)]
pub struct ImpactClassifier {
    shared_paths: Vec<String>,
}

impl ImpactClassifier {
    pub fn new(shared_paths: &[String]) -> Self {
        Self {
            shared_paths: shared_paths
                .iter()
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Classify a path relative to the project root
    pub fn classify(&self, path: &Path) -> ImpactTier {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if is_build_config(file_name) {
            return ImpactTier::FullRebuild;
        }
        if is_test(path, file_name) || is_doc(path, &extension) {
            return ImpactTier::Ignored;
        }
        if self.is_shared(path) {
            return ImpactTier::PackageRebuild;
        }
        if SOURCE_EXTENSIONS.contains(&extension.as_str()) {
            return ImpactTier::Incremental;
        }
        if ASSET_EXTENSIONS.contains(&extension.as_str()) {
            return ImpactTier::AssetOnly;
        }
        ImpactTier::Incremental
    }

    fn is_shared(&self, path: &Path) -> bool {
        self.shared_paths
            .iter()
            .any(|shared| path.starts_with(Path::new(shared)))
    }
}

fn is_build_config(file_name: &str) -> bool {
    if LOCKFILES.contains(&file_name) || BUILD_CONFIGS.contains(&file_name) {
        return true;
    }
    if file_name.starts_with("tsconfig") && file_name.ends_with(".json") {
        return true;
    }
    CONFIG_STEMS
        .iter()
        .any(|stem| file_name.starts_with(&format!("{}.config.", stem)))
}

fn is_test(path: &Path, file_name: &str) -> bool {
    file_name.contains(".test.")
        || file_name.contains(".spec.")
        || dir_components(path).any(|c| TEST_DIRS.contains(&c))
}

fn is_doc(path: &Path, extension: &str) -> bool {
    DOC_EXTENSIONS.contains(&extension) || dir_components(path).any(|c| DOC_DIRS.contains(&c))
}

/// Directory names of a path, excluding the file name
fn dir_components(path: &Path) -> impl Iterator<Item = &str> {
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    parent.components().filter_map(|c| match c {
        Component::Normal(s) => s.to_str(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(path: &str) -> ImpactTier {
        ImpactClassifier::new(&["packages/shared".to_string()]).classify(Path::new(path))
    }

    #[test]
    fn test_ordering() {
        assert!(ImpactTier::FullRebuild > ImpactTier::PackageRebuild);
        assert!(ImpactTier::PackageRebuild > ImpactTier::Incremental);
        assert!(ImpactTier::Incremental > ImpactTier::AssetOnly);
        assert!(ImpactTier::AssetOnly > ImpactTier::Ignored);
    }

    #[test]
    fn test_build_configs_and_lockfiles() {
        assert_eq!(classify("package.json"), ImpactTier::FullRebuild);
        assert_eq!(classify("packages/app/package.json"), ImpactTier::FullRebuild);
        assert_eq!(classify("pnpm-lock.yaml"), ImpactTier::FullRebuild);
        assert_eq!(classify("tsconfig.base.json"), ImpactTier::FullRebuild);
        assert_eq!(classify("apps/web/vite.config.ts"), ImpactTier::FullRebuild);
    }

    #[test]
    fn test_shared_path() {
        assert_eq!(classify("packages/shared/src/util.ts"), ImpactTier::PackageRebuild);
        assert_eq!(classify("packages/shared/theme.css"), ImpactTier::PackageRebuild);
    }

    #[test]
    fn test_sources_and_assets() {
        assert_eq!(classify("packages/app/src/main.tsx"), ImpactTier::Incremental);
        assert_eq!(classify("crates/core/src/lib.rs"), ImpactTier::Incremental);
        assert_eq!(classify("packages/app/src/app.scss"), ImpactTier::AssetOnly);
        assert_eq!(classify("public/logo.PNG"), ImpactTier::AssetOnly);
    }

    #[test]
    fn test_tests_and_docs_ignored() {
        assert_eq!(classify("README.md"), ImpactTier::Ignored);
        assert_eq!(classify("packages/app/src/main.test.ts"), ImpactTier::Ignored);
        assert_eq!(classify("packages/app/__tests__/main.ts"), ImpactTier::Ignored);
        assert_eq!(classify("docs/guide/setup.html"), ImpactTier::Ignored);
        assert_eq!(classify("packages/shared/README.md"), ImpactTier::Ignored);
    }

    #[test]
    fn test_unknown_defaults_to_incremental() {
        assert_eq!(classify("packages/app/data.json"), ImpactTier::Incremental);
    }
}
