//! Where the text to review comes from
//!
//! Each mode turns its input (a git diff, a project tree, one file) into a
//! densely indexed chunk list. Rebuilding with the same inputs and chunk
//! size always yields the same indices, which is what resume relies on.

use crate::chunk::{Chunk, ChunkSequence};
use crate::config::Config;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::{DirEntry, WalkDir};

const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules", "vendor"];
const FALLBACK_LANGUAGE: &str = "go";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Working-tree changes not yet committed
    #[default]
    DiffUncommitted,
    /// Changes on HEAD since it forked from --base
    DiffBranch,
    /// Every configured-language file under --dir
    ReviewProject,
    /// A single file given with --file
    ReviewFile,
}

impl Mode {
    pub fn is_diff(&self) -> bool {
        matches!(self, Mode::DiffUncommitted | Mode::DiffBranch)
    }
}

/// Inputs shared by all modes.
#[derive(Debug, Clone)]
pub struct Target<'a> {
    pub dir: &'a Path,
    pub file: Option<&'a Path>,
    pub base: &'a str,
}

/// `git diff --unified=3` of uncommitted changes under `dir`.
pub fn uncommitted_diff(dir: &Path) -> Result<String> {
    git_diff(dir, &["diff", "--unified=3", "--", "."])
}

/// `git diff <base>...HEAD --unified=3` under `dir`.
pub fn branch_diff(dir: &Path, base: &str) -> Result<String> {
    let range = format!("{}...HEAD", base);
    git_diff(dir, &["diff", range.as_str(), "--unified=3", "--", "."])
}

fn git_diff(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .context("Failed to execute git diff")?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(anyhow!(
            "git diff failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Pick the language of a diff.
///
/// Looks at the `+++ b/<path>` headers first, then for any configured
/// extension anywhere in the text, then falls back to Go if it is configured.
pub fn detect_language_in_diff(diff: &str, config: &Config) -> Option<String> {
    let from_headers = diff
        .lines()
        .filter_map(|line| line.strip_prefix("+++ b/"))
        .find_map(|path| config.language_for_path(Path::new(path.trim())));
    if let Some(language) = from_headers {
        return Some(language.to_string());
    }

    let from_text = config
        .languages
        .iter()
        .find(|(_, lang)| diff.contains(lang.extension.as_str()))
        .map(|(name, _)| name.clone());
    if from_text.is_some() {
        return from_text;
    }

    config
        .language(FALLBACK_LANGUAGE)
        .map(|_| FALLBACK_LANGUAGE.to_string())
}

fn is_ignored(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| IGNORED_DIRS.contains(&name))
            .unwrap_or(false)
}

/// Files under `dir` grouped by configured language, each list sorted.
pub fn project_files(dir: &Path, config: &Config) -> BTreeMap<String, Vec<PathBuf>> {
    let mut files: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_ignored(e))
    {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(language) = config.language_for_path(entry.path()) {
            files
                .entry(language.to_string())
                .or_default()
                .push(entry.into_path());
        }
    }

    for paths in files.values_mut() {
        paths.sort();
    }
    files
}

fn push_file(
    seq: &mut ChunkSequence,
    path: &Path,
    root: &Path,
    language: &str,
    size: usize,
) -> Result<()> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let origin = path.strip_prefix(root).unwrap_or(path);
    seq.push_unit(&content, size, language, Some(origin));
    Ok(())
}

/// Chunks of a single file; the language comes from its extension.
pub fn file_chunks(path: &Path, config: &Config) -> Result<Vec<Chunk>> {
    let language = config.language_for_path(path).ok_or_else(|| {
        anyhow!(
            "Unsupported file type: {} (configured: {})",
            path.display(),
            config.language_names().join(", ")
        )
    })?;
    let mut seq = ChunkSequence::new();
    let root = path.parent().unwrap_or(path);
    push_file(&mut seq, path, root, language, config.chunk_size)?;
    Ok(seq.into_vec())
}

fn diff_chunks(diff: &str, config: &Config) -> Result<Vec<Chunk>> {
    if diff.trim().is_empty() {
        return Ok(Vec::new());
    }
    let language = detect_language_in_diff(diff, config)
        .ok_or_else(|| anyhow!("Could not detect a configured language in the diff"))?;
    let mut seq = ChunkSequence::new();
    seq.push_unit(diff, config.chunk_size, &language, None);
    Ok(seq.into_vec())
}

fn project_chunks(dir: &Path, config: &Config) -> Result<Vec<Chunk>> {
    let files = project_files(dir, config);
    if files.is_empty() {
        bail!(
            "No files with a configured extension found under {}",
            dir.display()
        );
    }

    let mut seq = ChunkSequence::new();
    for (language, paths) in &files {
        tracing::info!(language = %language, files = paths.len(), "collected project files");
        for path in paths {
            push_file(&mut seq, path, dir, language, config.chunk_size)?;
        }
    }
    Ok(seq.into_vec())
}

/// Build the full chunk list for a mode.
///
/// An empty diff gives an empty list; the caller reports "no changes".
pub fn build_work_list(mode: Mode, target: &Target<'_>, config: &Config) -> Result<Vec<Chunk>> {
    match mode {
        Mode::DiffUncommitted => diff_chunks(&uncommitted_diff(target.dir)?, config),
        Mode::DiffBranch => diff_chunks(&branch_diff(target.dir, target.base)?, config),
        Mode::ReviewProject => project_chunks(target.dir, config),
        Mode::ReviewFile => {
            let Some(file) = target.file else {
                bail!("--file is required for review-file mode");
            };
            file_chunks(file, config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::parse(
            r#"
chunk_size = 2

[languages.go]
extension = ".go"

[languages.python]
extension = ".py"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_detect_language_from_headers() {
        let diff = "diff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1 +1 @@\n-x\n+y\n";
        assert_eq!(detect_language_in_diff(diff, &config()).as_deref(), Some("python"));
    }

    #[test]
    fn test_detect_language_falls_back_to_go() {
        let diff = "+++ b/README.md\n+hello\n";
        assert_eq!(detect_language_in_diff(diff, &config()).as_deref(), Some("go"));

        let no_go = Config::parse("[languages.php]\nextension = \".php\"\n").unwrap();
        assert_eq!(detect_language_in_diff(diff, &no_go), None);
    }

    #[test]
    fn test_project_files_skip_ignored_and_sort() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for rel in [
            "b.go",
            "a.go",
            "pkg/c.py",
            "vendor/lib.go",
            "node_modules/x.py",
            "target/gen.go",
            "notes.txt",
        ] {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "x\n").unwrap();
        }

        let files = project_files(root, &config());
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["go", "python"]);
        assert_eq!(files["go"], vec![root.join("a.go"), root.join("b.go")]);
        assert_eq!(files["python"], vec![root.join("pkg/c.py")]);
    }

    #[test]
    fn test_project_chunks_are_dense_and_per_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.go"), "1\n2\n3\n").unwrap();
        fs::write(dir.path().join("b.py"), "x\n").unwrap();

        let target = Target {
            dir: dir.path(),
            file: None,
            base: "master",
        };
        let chunks = build_work_list(Mode::ReviewProject, &target, &config()).unwrap();
        let summary: Vec<(usize, &str, &str)> = chunks
            .iter()
            .map(|c| (c.index, c.language.as_str(), c.text.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![(0, "go", "1\n2\n"), (1, "go", "3\n"), (2, "python", "x\n")]
        );
        assert_eq!(chunks[1].location(), "a.go:3");
    }

    #[test]
    fn test_empty_project_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = Target {
            dir: dir.path(),
            file: None,
            base: "master",
        };
        assert!(build_work_list(Mode::ReviewProject, &target, &config()).is_err());
    }

    #[test]
    fn test_review_file_requires_path_and_known_extension() {
        let dir = tempfile::tempdir().unwrap();
        let target = Target {
            dir: dir.path(),
            file: None,
            base: "master",
        };
        let err = build_work_list(Mode::ReviewFile, &target, &config()).unwrap_err();
        assert!(err.to_string().contains("--file"));

        let readme = dir.path().join("README.md");
        fs::write(&readme, "hi\n").unwrap();
        assert!(file_chunks(&readme, &config()).is_err());

        let main = dir.path().join("main.go");
        fs::write(&main, "package main\n").unwrap();
        let chunks = file_chunks(&main, &config()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].origin.as_deref(), Some(Path::new("main.go")));
    }

    #[test]
    fn test_empty_diff_yields_no_chunks() {
        assert!(diff_chunks("  \n", &config()).unwrap().is_empty());
    }

    #[test]
    fn test_uncommitted_diff_in_git_repo() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let git = |args: &[&str]| {
            let ok = Command::new("git")
                .current_dir(root)
                .args(args)
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            assert!(ok, "git {:?} failed", args);
        };
        git(&["init", "-q"]);
        git(&["config", "user.email", "test@example.com"]);
        git(&["config", "user.name", "Test"]);
        fs::write(root.join("main.go"), "package main\n").unwrap();
        git(&["add", "."]);
        git(&["commit", "-q", "-m", "init"]);
        fs::write(root.join("main.go"), "package main\n\nfunc main() {}\n").unwrap();

        let target = Target {
            dir: root,
            file: None,
            base: "master",
        };
        let chunks = build_work_list(Mode::DiffUncommitted, &target, &config()).unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.language == "go" && c.origin.is_none()));
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert!(joined.contains("+func main() {}"));
    }
}
