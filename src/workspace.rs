//! # Workspace Store
//!
//! Maps a project name to a directory under the workspace root and owns all
//! file I/O inside it. Writes to the same file are serialized through a
//! per-path async lock; different paths never contend.
//!
//! ```text
//! <workspace root>/
//!   demo/
//!     package.json
//!     public/index.html
//!     src/index.js
//!     src/App.jsx
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::template;

const MANIFEST: &str = "package.json";
const MAX_NAME_LEN: usize = 64;

/// Node in the `/files` tree listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileNode {
    Directory {
        name: String,
        path: String,
        children: Vec<FileNode>,
    },
    File {
        name: String,
        path: String,
    },
}

/// Everything `initialize` needs to lay down a project.
#[derive(Debug, Clone, Default)]
pub struct ProjectSeed {
    pub entry_code: String,
    pub entry_file: Option<String>,
    pub dependencies: BTreeMap<String, String>,
}

pub struct WorkspaceStore {
    root: PathBuf,
    path_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

/// Project names double as directory names: keep them boring.
pub fn validate_name(name: &str) -> AppResult<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AppError::bad_request(
            "Invalid project name. Use 1-64 letters, numbers, '-' or '_'.",
        ))
    }
}

/// Lexically normalize a client supplied relative path.
///
/// Leading separators are dropped and `..` may not climb above the project root.
pub fn normalize_relative(relative: &str) -> AppResult<PathBuf> {
    let cleaned = relative.trim().replace('\\', "/");
    let cleaned = cleaned.trim_start_matches('/');
    if cleaned.is_empty() {
        return Err(AppError::bad_request("Invalid relativePath"));
    }

    let mut out = PathBuf::new();
    for component in Path::new(cleaned).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(AppError::bad_request("Path traversal detected"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::bad_request("Path traversal detected"));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(AppError::bad_request("Invalid relativePath"));
    }
    Ok(out)
}

/// Forward-slash form of a relative path, as the UI expects.
pub fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            path_locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, name: &str) -> AppResult<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// A project exists once its directory holds a dependency manifest.
    pub fn exists(&self, name: &str) -> bool {
        self.project_dir(name)
            .map(|dir| dir.join(MANIFEST).is_file())
            .unwrap_or(false)
    }

    /// Names of every project currently on disk.
    pub fn list_projects(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().join(MANIFEST).is_file())
                    .filter_map(|e| e.file_name().to_str().map(str::to_string))
                    .filter(|n| validate_name(n).is_ok())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Destroy any existing directory for `name` and lay down a fresh project.
    pub async fn create(&self, name: &str, seed: &ProjectSeed) -> AppResult<PathBuf> {
        let dir = self.project_dir(name)?;
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            info!(project = name, "Removing existing project directory before re-init");
            tokio::fs::remove_dir_all(&dir).await?;
        }

        tokio::fs::create_dir_all(dir.join("src")).await?;
        tokio::fs::create_dir_all(dir.join("public")).await?;

        let manifest = template::package_json(name, &seed.dependencies);
        tokio::fs::write(dir.join(MANIFEST), serde_json::to_string_pretty(&manifest)?).await?;

        let entry = template::entry_file_name(seed.entry_file.as_deref());
        tokio::fs::write(dir.join("src").join(entry), &seed.entry_code).await?;
        tokio::fs::write(dir.join("src").join("index.js"), template::INDEX_JS).await?;
        tokio::fs::write(dir.join("public").join("index.html"), template::INDEX_HTML).await?;

        if template::is_typescript(entry) {
            self.ensure_tsconfig(name).await?;
        }

        info!(project = name, dir = %dir.display(), "Project scaffold written");
        Ok(dir)
    }

    /// Remove a project's directory. Missing directories are not an error.
    pub async fn destroy(&self, name: &str) -> AppResult<()> {
        let dir = self.project_dir(name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(project = name, "Project directory removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a relative path inside a project, rejecting traversal.
    pub fn resolve(&self, name: &str, relative: &str) -> AppResult<PathBuf> {
        let dir = self.project_dir(name)?;
        Ok(dir.join(normalize_relative(relative)?))
    }

    pub fn file_exists(&self, name: &str, relative: &str) -> bool {
        self.resolve(name, relative)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    pub async fn read_file(&self, name: &str, relative: &str) -> AppResult<String> {
        if !self.exists(name) {
            return Err(AppError::not_found(format!("Project '{}' not found", name)));
        }
        let path = self.resolve(name, relative)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::not_found("File not found"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a file, creating parent directories. Returns the normalized relative path.
    pub async fn write_file(&self, name: &str, relative: &str, content: &str) -> AppResult<String> {
        if !self.exists(name) {
            return Err(AppError::precondition(format!(
                "Project '{}' is not initialized",
                name
            )));
        }
        let rel = normalize_relative(relative)?;
        let path = self.project_dir(name)?.join(&rel);

        let lock = self
            .path_locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        {
            let _guard = lock.lock().await;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
        }
        drop(lock);
        self.path_locks
            .remove_if(&path, |_, l| Arc::strong_count(l) == 1);

        debug!(project = name, path = %rel.display(), bytes = content.len(), "File written");
        Ok(slash_path(&rel))
    }

    /// Nested listing of a project: directories first, then files, `node_modules` skipped.
    pub async fn file_tree(&self, name: &str) -> AppResult<Vec<FileNode>> {
        let dir = self.project_dir(name)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        tokio::task::spawn_blocking(move || build_tree(&dir, Path::new("")))
            .await
            .map_err(|e| AppError::internal(format!("file tree task failed: {}", e)))?
            .map_err(AppError::from)
    }

    /// Relative paths (forward slashes) of every source file under `src/`.
    pub fn source_files(&self, name: &str) -> Vec<String> {
        let Ok(dir) = self.project_dir(name) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        collect_sources(&dir, &dir.join("src"), &mut out);
        out.sort();
        out
    }

    pub fn uses_typescript(&self, name: &str) -> bool {
        self.source_files(name)
            .iter()
            .any(|p| template::is_typescript(p))
    }

    /// Write `tsconfig.json` if the project has none yet.
    pub async fn ensure_tsconfig(&self, name: &str) -> AppResult<()> {
        let path = self.project_dir(name)?.join("tsconfig.json");
        if !path.exists() {
            let body = serde_json::to_string_pretty(&template::tsconfig_json())?;
            tokio::fs::write(&path, body).await?;
            debug!(project = name, "tsconfig.json written");
        }
        Ok(())
    }
}

fn build_tree(dir: &Path, rel: &Path) -> std::io::Result<Vec<FileNode>> {
    let mut entries: Vec<(bool, String, PathBuf)> = fs::read_dir(dir)?
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            let is_dir = e.file_type().ok()?.is_dir();
            Some((is_dir, name, e.path()))
        })
        .filter(|(is_dir, name, _)| !(*is_dir && name == "node_modules"))
        .collect();

    entries.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| a.1.to_lowercase().cmp(&b.1.to_lowercase()))
    });

    let mut nodes = Vec::with_capacity(entries.len());
    for (is_dir, name, path) in entries {
        let child_rel = rel.join(&name);
        if is_dir {
            nodes.push(FileNode::Directory {
                children: build_tree(&path, &child_rel)?,
                name,
                path: slash_path(&child_rel),
            });
        } else {
            nodes.push(FileNode::File {
                name,
                path: slash_path(&child_rel),
            });
        }
    }
    Ok(nodes)
}

fn collect_sources(base: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if entry.file_name() != "node_modules" {
                collect_sources(base, &path, out);
            }
            continue;
        }
        let is_source = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| matches!(e, "js" | "jsx" | "ts" | "tsx"));
        if is_source {
            if let Ok(rel) = path.strip_prefix(base) {
                out.push(slash_path(rel));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(code: &str) -> ProjectSeed {
        ProjectSeed {
            entry_code: code.to_string(),
            ..ProjectSeed::default()
        }
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("demo").is_ok());
        assert!(validate_name("my_app-2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../evil").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("src/App.tsx").unwrap(), PathBuf::from("src/App.tsx"));
        assert_eq!(normalize_relative("/src/./App.tsx").unwrap(), PathBuf::from("src/App.tsx"));
        assert_eq!(normalize_relative("src/pages/../App.tsx").unwrap(), PathBuf::from("src/App.tsx"));
        assert!(normalize_relative("../outside.txt").is_err());
        assert!(normalize_relative("src/../../outside.txt").is_err());
        assert!(normalize_relative("").is_err());
        assert!(normalize_relative(".").is_err());
    }

    #[tokio::test]
    async fn test_create_writes_scaffold() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(tmp.path()).unwrap();

        let dir = store.create("demo", &seed("export default () => null;")).await.unwrap();
        assert!(dir.join("package.json").is_file());
        assert!(dir.join("public/index.html").is_file());
        assert_eq!(
            fs::read_to_string(dir.join("src/App.jsx")).unwrap(),
            "export default () => null;"
        );
        assert!(store.exists("demo"));
        assert_eq!(store.list_projects(), vec!["demo".to_string()]);
    }

    #[tokio::test]
    async fn test_create_replaces_existing_project() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(tmp.path()).unwrap();

        store.create("demo", &seed("v1")).await.unwrap();
        store.write_file("demo", "src/Stale.jsx", "old").await.unwrap();

        store.create("demo", &seed("v2")).await.unwrap();
        assert!(!store.file_exists("demo", "src/Stale.jsx"));
        assert_eq!(store.read_file("demo", "src/App.jsx").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_typescript_entry_gets_tsconfig() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(tmp.path()).unwrap();
        let seed = ProjectSeed {
            entry_code: "export default function App() { return null; }".into(),
            entry_file: Some("App.tsx".into()),
            ..ProjectSeed::default()
        };
        let dir = store.create("ts", &seed).await.unwrap();
        assert!(dir.join("tsconfig.json").is_file());
        assert!(store.uses_typescript("ts"));
    }

    #[tokio::test]
    async fn test_write_and_read_roundtrip_through_nested_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(tmp.path()).unwrap();
        store.create("demo", &seed("x")).await.unwrap();

        let rel = store
            .write_file("demo", "./src/components/ui/Button.tsx", "button")
            .await
            .unwrap();
        assert_eq!(rel, "src/components/ui/Button.tsx");
        assert_eq!(store.read_file("demo", &rel).await.unwrap(), "button");
        assert!(store.path_locks.is_empty());
    }

    #[tokio::test]
    async fn test_write_rejects_traversal_and_missing_project() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(tmp.path()).unwrap();

        let err = store.write_file("ghost", "a.txt", "x").await.unwrap_err();
        assert_eq!(err.kind(), "precondition");

        store.create("demo", &seed("x")).await.unwrap();
        let err = store.write_file("demo", "../escape.txt", "x").await.unwrap_err();
        assert_eq!(err.kind(), "bad_request");
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(tmp.path()).unwrap();
        store.create("demo", &seed("x")).await.unwrap();

        let err = store.read_file("demo", "src/Nope.tsx").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_file_tree_ordering_and_node_modules_skip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(tmp.path()).unwrap();
        let dir = store.create("demo", &seed("x")).await.unwrap();
        fs::create_dir_all(dir.join("node_modules/react")).unwrap();
        fs::write(dir.join("README.md"), "hi").unwrap();

        let tree = store.file_tree("demo").await.unwrap();
        let names: Vec<&str> = tree
            .iter()
            .map(|n| match n {
                FileNode::Directory { name, .. } | FileNode::File { name, .. } => name.as_str(),
            })
            .collect();
        assert_eq!(names, vec!["public", "src", "package.json", "README.md"]);

        let src = tree
            .iter()
            .find_map(|n| match n {
                FileNode::Directory { name, children, .. } if name == "src" => Some(children),
                _ => None,
            })
            .unwrap();
        assert!(src.contains(&FileNode::File {
            name: "App.jsx".into(),
            path: "src/App.jsx".into()
        }));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(tmp.path()).unwrap();
        store.create("demo", &seed("x")).await.unwrap();

        store.destroy("demo").await.unwrap();
        store.destroy("demo").await.unwrap();
        assert!(!store.exists("demo"));
    }
}
