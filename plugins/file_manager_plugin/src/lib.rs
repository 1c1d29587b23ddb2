//! File listing and search plugin.
//!
//! * `file_search` / `list_files`: recursive, case-insensitive name search
//!   under the plugin root. Recent searches are remembered for an hour and
//!   every search is announced on `files.searched`.
//! * `file_management` / `describe`: directory listing or file details.
//! * `file_history` / `recent_searches`: the remembered searches.
//!
//! All handlers require `file_read`.

use assistant_core::{
    HandlerError, HandlerOutput, HandlerRequest, HandlerSpec, Plugin, PluginContext,
    PluginDescriptor,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PLUGIN_NAME: &str = "file-manager";
pub const SEARCHED_TOPIC: &str = "files.searched";

const RECENT_KEY: &str = "recent_searches";
const RECENT_TTL: Duration = Duration::from_secs(3600);
const RECENT_LIMIT: usize = 10;
const MAX_DEPTH: usize = 4;
const MAX_RESULTS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMatch {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecentSearch {
    pattern: String,
    matches: usize,
}

/// Words that describe the request rather than name the file
const FILLER: &[&str] = &[
    "find", "search", "for", "locate", "files", "file", "named", "called", "me", "my", "the",
    "a", "all", "list", "please",
];

fn search_pattern(request: &HandlerRequest) -> Option<String> {
    if let Some(pattern) = request.param_str("pattern") {
        return Some(pattern.to_string());
    }
    if let Some(Value::Array(paths)) = request.param("file_paths") {
        if let Some(first) = paths.first().and_then(Value::as_str) {
            return Some(first.to_string());
        }
    }
    request.text().and_then(|text| {
        text.split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '.' && c != '_' && c != '-'))
            .filter(|w| !w.is_empty() && !FILLER.contains(&w.to_lowercase().as_str()))
            .last()
            .map(str::to_string)
    })
}

fn search(root: &Path, pattern: &str) -> Vec<FileMatch> {
    search_limited(root, pattern, MAX_RESULTS)
}

/// Depth- and count-bounded walk; unreadable directories are skipped.
/// Results are sorted by path, truncated or not.
fn search_limited(root: &Path, pattern: &str, limit: usize) -> Vec<FileMatch> {
    let needle = pattern.to_lowercase();
    let mut found = Vec::new();
    let mut stack = vec![(root.to_path_buf(), 0usize)];

    'walk: while let Some((dir, depth)) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Skipping {:?}: {}", dir, e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if name.contains(&needle) {
                found.push(FileMatch {
                    path: path
                        .strip_prefix(root)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .into_owned(),
                    size: meta.len(),
                    is_dir: meta.is_dir(),
                });
                if found.len() >= limit {
                    debug!("Search for '{}' truncated at {} results", pattern, limit);
                    break 'walk;
                }
            }
            if meta.is_dir() && depth + 1 < MAX_DEPTH {
                stack.push((path, depth + 1));
            }
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    found
}

/// Resolve `relative` under `root`, refusing anything that escapes it.
fn confine(root: &Path, relative: &str) -> Result<PathBuf, HandlerError> {
    let candidate = root.join(relative.trim_start_matches('/'));
    let resolved = candidate
        .canonicalize()
        .map_err(|e| HandlerError::invalid_input(format!("{relative}: {e}")))?;
    let root = root
        .canonicalize()
        .map_err(|e| HandlerError::failed(format!("plugin root unavailable: {e}")))?;
    if !resolved.starts_with(&root) {
        return Err(HandlerError::invalid_input(format!("{relative} is outside the managed root")));
    }
    Ok(resolved)
}

fn remember(ctx: &PluginContext, pattern: &str, matches: usize) -> Result<(), HandlerError> {
    let mut recent: Vec<RecentSearch> = ctx.storage().get_as(RECENT_KEY)?.unwrap_or_default();
    recent.retain(|r| r.pattern != pattern);
    recent.insert(
        0,
        RecentSearch {
            pattern: pattern.to_string(),
            matches,
        },
    );
    recent.truncate(RECENT_LIMIT);
    let value = serde_json::to_value(&recent).map_err(|e| HandlerError::failed(e.to_string()))?;
    ctx.storage().set(RECENT_KEY, value, Some(RECENT_TTL))?;
    Ok(())
}

async fn list_files(
    root: Arc<PathBuf>,
    request: HandlerRequest,
    ctx: PluginContext,
) -> Result<HandlerOutput, HandlerError> {
    let pattern = search_pattern(&request)
        .ok_or_else(|| HandlerError::invalid_input("what should I search for?"))?;

    let walk_root = root.clone();
    let needle = pattern.clone();
    let found = tokio::task::spawn_blocking(move || search(&walk_root, &needle))
        .await
        .map_err(|e| HandlerError::failed(format!("search task failed: {e}")))?;

    remember(&ctx, &pattern, found.len())?;
    if let Err(e) = ctx.publish(
        SEARCHED_TOPIC,
        json!({ "pattern": pattern, "matches": found.len() }),
    ) {
        warn!("Could not announce search: {}", e);
    }

    let message = match found.len() {
        0 => format!("No files matching '{pattern}'."),
        n => format!("Found {n} item(s) matching '{pattern}'."),
    };
    Ok(HandlerOutput::new(json!({ "pattern": pattern, "files": found })).with_message(message))
}

async fn describe(
    root: Arc<PathBuf>,
    request: HandlerRequest,
) -> Result<HandlerOutput, HandlerError> {
    let relative = request
        .param_str("path")
        .map(str::to_string)
        .or_else(|| {
            request
                .param("file_paths")
                .and_then(|p| p.get(0))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| ".".to_string());
    let target = confine(&root, &relative)?;

    let meta = std::fs::metadata(&target)
        .map_err(|e| HandlerError::invalid_input(format!("{relative}: {e}")))?;
    if !meta.is_dir() {
        return Ok(HandlerOutput::new(json!({ "path": relative, "size": meta.len(), "is_dir": false }))
            .with_message(format!("{relative} is {} bytes.", meta.len())));
    }

    let mut entries: Vec<FileMatch> = std::fs::read_dir(&target)
        .map_err(|e| HandlerError::failed(format!("{relative}: {e}")))?
        .flatten()
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            Some(FileMatch {
                path: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                is_dir: meta.is_dir(),
            })
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(HandlerOutput::new(json!({ "path": relative, "is_dir": true, "entries": entries }))
        .with_message(format!("{relative} contains {} item(s).", entries.len())))
}

async fn recent_searches(ctx: PluginContext) -> Result<HandlerOutput, HandlerError> {
    let recent: Vec<RecentSearch> = ctx.storage().get_as(RECENT_KEY)?.unwrap_or_default();
    let patterns: Vec<&str> = recent.iter().map(|r| r.pattern.as_str()).collect();
    let message = if patterns.is_empty() {
        "No recent searches.".to_string()
    } else {
        format!("Recent searches: {}", patterns.join(", "))
    };
    Ok(HandlerOutput::new(serde_json::to_value(&recent).unwrap_or_default()).with_message(message))
}

pub struct FileManagerPlugin {
    root: Arc<PathBuf>,
}

impl FileManagerPlugin {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for FileManagerPlugin {
    /// Rooted at `ASSISTANT_FILES_ROOT`, or the working directory.
    fn default() -> Self {
        let root = std::env::var_os("ASSISTANT_FILES_ROOT")
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(root)
    }
}

#[async_trait]
impl Plugin for FileManagerPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn descriptor(&self) -> PluginDescriptor {
        let search_root = self.root.clone();
        let describe_root = self.root.clone();

        PluginDescriptor::new(PLUGIN_NAME, env!("CARGO_PKG_VERSION"))
            .description(env!("CARGO_PKG_DESCRIPTION"))
            .author("assistant core")
            .requires("file_read")
            .handler(
                HandlerSpec::new("list_files", "file_search", move |r: HandlerRequest, c: PluginContext| {
                    list_files(search_root.clone(), r, c)
                })
                .priority(5),
            )
            .handler(HandlerSpec::new(
                "describe",
                "file_management",
                move |r: HandlerRequest, _c: PluginContext| describe(describe_root.clone(), r),
            ))
            .handler(HandlerSpec::new(
                "recent_searches",
                "file_history",
                |_r: HandlerRequest, c: PluginContext| recent_searches(c),
            ))
    }

    async fn initialize(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        if !self.root.is_dir() {
            anyhow::bail!("file root {:?} is not a directory", self.root);
        }
        info!("File manager plugin initialized at {:?}", self.root);
        Ok(())
    }
}

/// Mandatory C-ABI entry-point so the platform can `dlopen` this plugin.
#[no_mangle]
#[allow(improper_ctypes_definitions)]
pub extern "C" fn create_plugin() -> *mut dyn Plugin {
    Box::into_raw(Box::new(FileManagerPlugin::default()))
}
