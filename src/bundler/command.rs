//! Adapters that shell out to a bundler binary

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::adapter::{
    AdapterKind, BuildContext, BuildFailure, BuildOutput, BundlerAdapter, OnChange, WatchEvent,
    WatchHandle,
};
use super::diagnostics::{self, ADAPTER_UNAVAILABLE, TIMEOUT};
use crate::error::BuildError;
use crate::model::BuildMode;

/// Runs one of the known bundler CLIs (or a shell command) as a child process
pub struct CommandAdapter {
    kind: AdapterKind,
    /// Binary name or path; ignored by the shell adapter
    program: String,
    /// Template for the shell adapter
    shell_command: Option<String>,
}

impl CommandAdapter {
    pub fn new(kind: AdapterKind) -> Self {
        Self {
            kind,
            program: kind.name().to_string(),
            shell_command: None,
        }
    }

    /// Override the binary (e.g. a pinned path)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            kind: AdapterKind::Shell,
            program: "sh".to_string(),
            shell_command: Some(command.into()),
        }
    }

    /// Prefer the project's local install over one on PATH
    fn resolve_program(&self, project_root: &Path) -> Option<PathBuf> {
        let local = project_root.join("node_modules").join(".bin").join(&self.program);
        if local.is_file() {
            return Some(local);
        }
        which::which(&self.program).ok()
    }

    fn build_args(&self, ctx: &BuildContext) -> Vec<String> {
        let out = ctx.output_dir.to_string_lossy().into_owned();
        let mode = match ctx.mode {
            BuildMode::Development => "development",
            BuildMode::Production => "production",
        };
        match self.kind {
            AdapterKind::Vite => vec![
                "build".into(),
                "--outDir".into(),
                out,
                "--mode".into(),
                mode.into(),
            ],
            AdapterKind::Esbuild => {
                let mut args = vec![
                    ctx.entry.clone(),
                    "--bundle".into(),
                    format!("--outdir={}", out),
                ];
                if ctx.mode == BuildMode::Production {
                    args.push("--minify".into());
                }
                args
            }
            AdapterKind::Rspack => vec![
                "build".into(),
                "--mode".into(),
                mode.into(),
                "--output-path".into(),
                out,
            ],
            AdapterKind::Webpack => vec![
                "--mode".into(),
                mode.into(),
                "--output-path".into(),
                out,
            ],
            AdapterKind::Shell => vec!["-c".into(), self.render_shell(ctx)],
        }
    }

    fn watch_args(&self, ctx: &BuildContext) -> Option<Vec<String>> {
        let mut args = self.build_args(ctx);
        match self.kind {
            AdapterKind::Vite | AdapterKind::Rspack | AdapterKind::Webpack => {
                args.push("--watch".into())
            }
            AdapterKind::Esbuild => args.push("--watch=forever".into()),
            AdapterKind::Shell => return None,
        }
        Some(args)
    }

    fn render_shell(&self, ctx: &BuildContext) -> String {
        self.shell_command
            .as_deref()
            .unwrap_or_default()
            .replace("{package}", &ctx.package)
            .replace("{path}", &ctx.package_dir.to_string_lossy())
            .replace("{entry}", &ctx.entry)
            .replace("{out}", &ctx.output_dir.to_string_lossy())
    }

    fn command(&self, program: &Path, args: &[String], ctx: &BuildContext) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&ctx.package_dir)
            .env(
                "NODE_ENV",
                match ctx.mode {
                    BuildMode::Development => "development",
                    BuildMode::Production => "production",
                },
            )
            .env("BUILDNET_PACKAGE", &ctx.package)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl BundlerAdapter for CommandAdapter {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    async fn is_available(&self, project_root: &Path) -> bool {
        if self.kind == AdapterKind::Shell && self.shell_command.is_none() {
            return false;
        }
        self.resolve_program(project_root).is_some()
    }

    async fn build(&self, ctx: &BuildContext) -> Result<BuildOutput, BuildFailure> {
        let started = Instant::now();
        let elapsed = |s: Instant| s.elapsed().as_millis() as u64;

        let Some(program) = self.resolve_program(&ctx.project_root) else {
            return Err(BuildFailure::single(
                BuildError::new(
                    ADAPTER_UNAVAILABLE,
                    format!("{} not found in node_modules/.bin or PATH", self.program),
                ),
                0,
            ));
        };

        let args = self.build_args(ctx);
        debug!(adapter = %self.kind, package = %ctx.package, ?args, "Running bundler");

        let child = self.command(&program, &args, ctx).spawn().map_err(|e| {
            BuildFailure::single(
                BuildError::new(
                    ADAPTER_UNAVAILABLE,
                    format!("failed to spawn {}: {}", program.display(), e),
                ),
                elapsed(started),
            )
        })?;

        let output = match tokio::time::timeout(ctx.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(BuildFailure::single(
                    BuildError::new(diagnostics::BUILD_FAILED, format!("bundler I/O error: {}", e)),
                    elapsed(started),
                ))
            }
            Err(_) => {
                warn!(adapter = %self.kind, package = %ctx.package, timeout = ?ctx.timeout, "Build timed out");
                return Err(BuildFailure::single(
                    BuildError::new(
                        TIMEOUT,
                        format!("build exceeded {}s", ctx.timeout.as_secs()),
                    ),
                    elapsed(started),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let duration_ms = elapsed(started);

        if !output.status.success() {
            return Err(BuildFailure {
                errors: diagnostics::parse_failure(&stdout, &stderr, output.status.code()),
                duration_ms,
            });
        }

        let warnings = stderr
            .lines()
            .chain(stdout.lines())
            .filter(|l| l.contains("[WARNING]") || l.starts_with("WARNING in"))
            .map(|l| l.trim().to_string())
            .collect();

        let out_dir = ctx.output_dir.clone();
        let output_hash = tokio::task::spawn_blocking(move || hash_tree(&out_dir))
            .await
            .ok()
            .flatten();

        info!(adapter = %self.kind, package = %ctx.package, duration_ms, "Bundle built");
        Ok(BuildOutput {
            adapter: self.kind.name().to_string(),
            duration_ms,
            output_hash,
            warnings,
        })
    }

    async fn watch(&self, ctx: &BuildContext, on_change: OnChange) -> Result<WatchHandle, BuildError> {
        let args = self.watch_args(ctx).ok_or_else(|| {
            BuildError::new(
                "WATCH_UNSUPPORTED",
                format!("{} adapter has no watch mode", self.kind),
            )
        })?;
        let program = self.resolve_program(&ctx.project_root).ok_or_else(|| {
            BuildError::new(ADAPTER_UNAVAILABLE, format!("{} not found", self.program))
        })?;

        let mut child = self
            .command(&program, &args, ctx)
            .spawn()
            .map_err(|e| BuildError::new(ADAPTER_UNAVAILABLE, e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BuildError::new(ADAPTER_UNAVAILABLE, "watch process has no stdout"))?;

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let package = ctx.package.clone();
        let kind = self.kind;

        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => on_change(classify_watch_line(&line)),
                        Ok(None) | Err(_) => break,
                    },
                    _ = &mut stop_rx => break,
                }
            }
            let _ = child.kill().await;
            debug!(adapter = %kind, package = %package, "Watch session ended");
        });

        Ok(WatchHandle::new(stop_tx, task))
    }
}

fn classify_watch_line(line: &str) -> WatchEvent {
    let errors = diagnostics::parse_errors(line);
    if !errors.is_empty() {
        return WatchEvent::Failed { errors };
    }
    let lower = line.to_ascii_lowercase();
    if lower.contains("built in") || lower.contains("compiled successfully") || lower.contains("build finished") {
        let duration_ms = lower
            .split_whitespace()
            .find_map(|w| w.strip_suffix("ms").and_then(|n| n.parse::<f64>().ok()))
            .map(|ms| ms as u64);
        return WatchEvent::Rebuilt { duration_ms };
    }
    WatchEvent::Output(line.to_string())
}

/// Stable digest of every file under `root` (relative path + contents)
pub fn hash_tree(root: &Path) -> Option<String> {
    hash_tree_excluding(root, |_| false)
}

/// Like [`hash_tree`], without descending into directories `skip` accepts
pub fn hash_tree_excluding(root: &Path, skip: impl Fn(&Path) -> bool) -> Option<String> {
    if !root.is_dir() {
        return None;
    }
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).ok()?.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(t) if t.is_dir() && !skip(&path) => stack.push(path),
                Ok(t) if t.is_file() => files.push(path),
                _ => {}
            }
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    for file in files {
        let rel = file.strip_prefix(root).unwrap_or(&file);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(std::fs::read(&file).ok()?);
        hasher.update([0u8]);
    }
    Some(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx(dir: &Path) -> BuildContext {
        BuildContext {
            package: "ui".into(),
            project_root: dir.to_path_buf(),
            package_dir: dir.to_path_buf(),
            entry: "src/index.ts".into(),
            output_dir: dir.join("dist"),
            mode: BuildMode::Production,
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_esbuild_args() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = CommandAdapter::new(AdapterKind::Esbuild);
        let args = adapter.build_args(&ctx(dir.path()));
        assert_eq!(args[0], "src/index.ts");
        assert!(args.contains(&"--bundle".to_string()));
        assert!(args.contains(&"--minify".to_string()));
    }

    #[test]
    fn test_shell_template() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = CommandAdapter::shell("make {package} ENTRY={entry}");
        let args = adapter.build_args(&ctx(dir.path()));
        assert_eq!(args, vec!["-c".to_string(), "make ui ENTRY=src/index.ts".to_string()]);
        assert!(adapter.watch_args(&ctx(dir.path())).is_none());
    }

    #[test]
    fn test_hash_tree_stable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/x.js"), b"x").unwrap();
        std::fs::write(dir.path().join("y.js"), b"y").unwrap();

        let first = hash_tree(dir.path()).unwrap();
        assert_eq!(first, hash_tree(dir.path()).unwrap());

        std::fs::write(dir.path().join("y.js"), b"z").unwrap();
        assert_ne!(first, hash_tree(dir.path()).unwrap());
        assert!(hash_tree(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_classify_watch_line() {
        assert_eq!(
            classify_watch_line("✓ built in 812ms"),
            WatchEvent::Rebuilt { duration_ms: Some(812) }
        );
        assert!(matches!(
            classify_watch_line("✘ [ERROR] nope"),
            WatchEvent::Failed { .. }
        ));
        assert!(matches!(classify_watch_line("hello"), WatchEvent::Output(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_build_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ok = CommandAdapter::shell("mkdir -p {out} && echo built > {out}/{package}.txt");
        let output = ok.build(&ctx(dir.path())).await.unwrap();
        assert_eq!(output.adapter, "shell");
        assert!(output.output_hash.is_some());

        let bad = CommandAdapter::shell("echo 'src/a.ts:4:2: error: broken' >&2; exit 3");
        let failure = bad.build(&ctx(dir.path())).await.unwrap_err();
        assert_eq!(failure.errors.len(), 1);
        assert_eq!(failure.errors[0].file.as_deref(), Some("src/a.ts"));
        assert_eq!(failure.errors[0].message, "broken");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_build_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let slow = CommandAdapter::shell("sleep 5");
        let mut c = ctx(dir.path());
        c.timeout = Duration::from_millis(100);
        let failure = slow.build(&c).await.unwrap_err();
        assert_eq!(failure.errors[0].code, TIMEOUT);
    }

    #[tokio::test]
    async fn test_shell_has_no_watch_mode() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = CommandAdapter::shell("true");
        let on_change: OnChange = std::sync::Arc::new(|_| {});
        match adapter.watch(&ctx(dir.path()), on_change).await {
            Err(e) => assert_eq!(e.code, "WATCH_UNSUPPORTED"),
            Ok(_) => panic!("shell adapter should not watch"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watch_reports_rebuilds() {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::{Arc, Mutex};

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("node_modules/.bin");
        std::fs::create_dir_all(&bin).unwrap();
        let script = bin.join("esbuild");
        std::fs::write(&script, "#!/bin/sh\necho 'build finished in 12ms'\nsleep 5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let on_change: OnChange = Arc::new(move |event| sink.lock().unwrap().push(event));
        let handle = CommandAdapter::new(AdapterKind::Esbuild)
            .watch(&ctx(dir.path()), on_change)
            .await
            .unwrap();

        for _ in 0..100 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.stop().await;
        assert_eq!(
            seen.lock().unwrap().first(),
            Some(&WatchEvent::Rebuilt { duration_ms: Some(12) })
        );
    }
}
