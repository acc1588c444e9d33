//! Functions the dev server exposes to connected tools.
//!
//! Everything that touches the filesystem is confined to the project root
//! the server was started with.

use anyhow::{anyhow, bail, Context, Result};
use devrpc_core::FunctionRegistry;
use serde_json::{json, Map, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Characters returned by `getTextAssetContent` when no limit is given.
pub const DEFAULT_TEXT_PREVIEW_LIMIT: usize = 300;

/// Dependency sections of `package.json`, in the order they are read. A
/// package listed in several sections reports the last one.
const DEPENDENCY_TYPES: [&str; 4] = [
    "dependencies",
    "devDependencies",
    "optionalDependencies",
    "peerDependencies",
];

/// Build the registry served to every tool.
pub fn registry(root: PathBuf) -> Arc<FunctionRegistry> {
    let root = Arc::new(root);

    let packages_root = root.clone();
    let text_root = root.clone();
    let dir_root = root.clone();

    FunctionRegistry::builder()
        .register("ping", |_| async move { Ok(json!("pong")) })
        .register("echo", |args| async move { Ok(Value::Array(args)) })
        .register("root", move |_| {
            let root = root.clone();
            async move { Ok(json!(root.display().to_string())) }
        })
        .register("getPackages", move |_| {
            let root = packages_root.clone();
            async move { get_packages(&root).await }
        })
        .register("getTextAssetContent", move |args| {
            let root = text_root.clone();
            async move {
                let path = require_str_arg(&args, 0, "path")?;
                let limit = get_u64_arg(&args, 1)
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_TEXT_PREVIEW_LIMIT);
                get_text_asset_content(&root, &path, limit).await
            }
        })
        .register("listDir", move |args| {
            let root = dir_root.clone();
            async move {
                let path = get_str_arg(&args, 0).unwrap_or(".");
                list_dir(&root, path).await
            }
        })
        .build()
}

/// Extract an optional string argument at `index`.
fn get_str_arg(args: &[Value], index: usize) -> Option<&str> {
    args.get(index).and_then(|v| v.as_str())
}

/// Extract a required string argument or return an error.
fn require_str_arg(args: &[Value], index: usize, name: &str) -> Result<String> {
    get_str_arg(args, index)
        .map(String::from)
        .ok_or_else(|| anyhow!("Missing required argument: {}", name))
}

/// Extract an optional non-negative integer argument at `index`.
fn get_u64_arg(args: &[Value], index: usize) -> Option<u64> {
    args.get(index).and_then(|v| v.as_u64())
}

/// Resolve `path` against `root`, refusing anything that leaves it.
pub(crate) fn resolve_under_root(root: &Path, path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        bail!("Path may not contain '..': {}", path);
    }
    let resolved = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    if !resolved.starts_with(root) {
        bail!("Path is outside the project root: {}", path);
    }
    Ok(resolved)
}

/// Categorized dependencies of `<root>/package.json`.
///
/// A missing file reads as `{}`; a file that is not JSON is an error.
pub async fn get_packages(root: &Path) -> Result<Value> {
    let manifest = root.join("package.json");
    let text = match tokio::fs::read_to_string(&manifest).await {
        Ok(text) => text,
        Err(e) => {
            debug!("No package.json at {}: {}", manifest.display(), e);
            "{}".to_string()
        }
    };
    let data: Value = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", manifest.display()))?;

    let mut packages = Map::new();
    for dep_type in DEPENDENCY_TYPES {
        let Some(section) = data.get(dep_type).and_then(|v| v.as_object()) else {
            continue;
        };
        for (name, version) in section {
            packages.insert(
                name.clone(),
                json!({ "version": version, "type": dep_type }),
            );
        }
    }

    Ok(json!({ "packages": packages }))
}

/// The first `limit` characters of a text file, or `null` if it can't be read.
pub async fn get_text_asset_content(root: &Path, path: &str, limit: usize) -> Result<Value> {
    let file = resolve_under_root(root, path)?;
    match tokio::fs::read_to_string(&file).await {
        Ok(content) => Ok(Value::String(content.chars().take(limit).collect())),
        Err(e) => {
            warn!("Could not read text asset {}: {}", file.display(), e);
            Ok(Value::Null)
        }
    }
}

/// Entries of a directory under root, sorted by name.
pub async fn list_dir(root: &Path, path: &str) -> Result<Value> {
    let dir = resolve_under_root(root, path)?;
    let mut reader = tokio::fs::read_dir(&dir)
        .await
        .with_context(|| format!("Failed to read directory {}", dir.display()))?;

    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let is_dir = entry.file_type().await?.is_dir();
        entries.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
    }
    entries.sort();

    Ok(Value::Array(
        entries
            .into_iter()
            .map(|(name, is_dir)| json!({ "name": name, "isDir": is_dir }))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_get_packages_categorizes_dependencies() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("package.json"),
            r#"{
                "name": "demo",
                "dependencies": { "vue": "^3.3.0" },
                "devDependencies": { "vite": "^4.0.0", "typescript": "^5.0.0" },
                "peerDependencies": { "vue": ">=3" }
            }"#,
        )
        .unwrap();

        let result = get_packages(temp_dir.path()).await.unwrap();
        let packages = &result["packages"];

        assert_eq!(packages["vite"], json!({"version": "^4.0.0", "type": "devDependencies"}));
        assert_eq!(packages["typescript"]["type"], "devDependencies");
        // Later sections win.
        assert_eq!(packages["vue"], json!({"version": ">=3", "type": "peerDependencies"}));
        assert_eq!(packages.as_object().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_get_packages_without_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let result = get_packages(temp_dir.path()).await.unwrap();
        assert_eq!(result, json!({"packages": {}}));
    }

    #[tokio::test]
    async fn test_get_packages_rejects_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("package.json"), "not json").unwrap();
        assert!(get_packages(temp_dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_text_asset_preview_is_truncated() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "é".repeat(500)).unwrap();

        let default = get_text_asset_content(temp_dir.path(), "notes.txt", DEFAULT_TEXT_PREVIEW_LIMIT)
            .await
            .unwrap();
        assert_eq!(default.as_str().unwrap().chars().count(), 300);

        let short = get_text_asset_content(temp_dir.path(), "notes.txt", 4)
            .await
            .unwrap();
        assert_eq!(short, json!("éééé"));

        let missing = get_text_asset_content(temp_dir.path(), "missing.txt", 10)
            .await
            .unwrap();
        assert_eq!(missing, Value::Null);
    }

    #[tokio::test]
    async fn test_list_dir_sorted() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("src")).unwrap();
        std::fs::write(temp_dir.path().join("b.txt"), "").unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), "").unwrap();

        let entries = list_dir(temp_dir.path(), ".").await.unwrap();
        assert_eq!(
            entries,
            json!([
                {"name": "a.txt", "isDir": false},
                {"name": "b.txt", "isDir": false},
                {"name": "src", "isDir": true}
            ])
        );
    }

    #[test]
    fn test_paths_stay_under_root() {
        let root = Path::new("/project");
        assert_eq!(
            resolve_under_root(root, "src/App.vue").unwrap(),
            PathBuf::from("/project/src/App.vue")
        );
        assert!(resolve_under_root(root, "/project/public/logo.svg").is_ok());
        assert!(resolve_under_root(root, "../etc/passwd").is_err());
        assert!(resolve_under_root(root, "/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn test_registry_functions() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("readme.md"), "hello world").unwrap();
        let registry = registry(temp_dir.path().to_path_buf());

        assert_eq!(
            registry.method_names(),
            vec!["echo", "getPackages", "getTextAssetContent", "listDir", "ping", "root"]
        );
        let ping = registry.get("ping").unwrap().call(vec![]).await.unwrap();
        assert_eq!(ping, json!("pong"));

        let preview = registry
            .get("getTextAssetContent")
            .unwrap()
            .call(vec![json!("readme.md"), json!(5)])
            .await
            .unwrap();
        assert_eq!(preview, json!("hello"));

        let err = registry
            .get("getTextAssetContent")
            .unwrap()
            .call(vec![])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Missing required argument: path"));
    }
}
