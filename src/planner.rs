//! Batch planning
//!
//! Splits a file plan into five strictly ordered batches:
//! `config → foundation → priority → content → readme`. Classification is by path and
//! extension only, so the same plan always yields the same batches.
//!
//! The foundation batch holds the entry page together with every stylesheet and script and is
//! generated by one combined call, so markup, class names and selectors come from a single
//! response.

use crate::job::FilePlanEntry;
use crate::workspace::canonical_plan_path;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

/// Keywords that mark an HTML page as complex enough to generate before plain content pages.
pub const DEFAULT_COMPLEXITY_KEYWORDS: &[&str] = &[
    "dashboard",
    "auth",
    "login",
    "signup",
    "register",
    "account",
    "admin",
    "api",
    "checkout",
    "cart",
    "profile",
    "settings",
    "search",
];

const ENTRY_POINT_MARKERS: &[&str] = &["index", "landing"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    HtmlPage,
    Css,
    Javascript,
    Config,
    Asset,
    Readme,
    Default,
}

impl FileKind {
    pub fn classify(path: &str) -> Self {
        let normalized = path.replace('\\', "/").to_ascii_lowercase();
        let file_name = normalized.rsplit('/').next().unwrap_or(&normalized);

        if file_name.starts_with("readme") {
            return FileKind::Readme;
        }

        let extension = match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext,
            // Dotfiles such as `.env` or `.gitignore`
            Some(_) => return FileKind::Config,
            None => return FileKind::Default,
        };

        match extension {
            "html" | "htm" => FileKind::HtmlPage,
            "css" | "scss" | "sass" | "less" => FileKind::Css,
            "js" | "mjs" | "cjs" | "jsx" | "ts" | "tsx" => FileKind::Javascript,
            "json" | "toml" | "yaml" | "yml" | "ini" | "env" | "xml" | "txt" | "webmanifest"
            | "lock" | "cfg" | "conf" => FileKind::Config,
            "png" | "jpg" | "jpeg" | "gif" | "svg" | "ico" | "webp" | "avif" | "woff"
            | "woff2" | "ttf" | "otf" | "eot" | "mp3" | "mp4" | "webm" | "pdf" => {
                FileKind::Asset
            }
            _ => FileKind::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    Config,
    Foundation,
    Priority,
    Content,
    Readme,
}

impl BatchType {
    pub const ORDER: [BatchType; 5] = [
        BatchType::Config,
        BatchType::Foundation,
        BatchType::Priority,
        BatchType::Content,
        BatchType::Readme,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BatchType::Config => "config",
            BatchType::Foundation => "foundation",
            BatchType::Priority => "priority",
            BatchType::Content => "content",
            BatchType::Readme => "readme",
        }
    }

    /// Whether the batch is generated by one combined call instead of per-file fan-out.
    pub fn is_combined(self) -> bool {
        self == BatchType::Foundation
    }
}

impl fmt::Display for BatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_type: BatchType,
    pub entries: Vec<FilePlanEntry>,
}

impl Batch {
    fn empty(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.path.as_str()).collect()
    }
}

/// A planned entry left out of every batch because its path cannot live in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedEntry {
    pub path: String,
    pub reason: String,
}

/// Always five batches, in execution order. Empty batches are kept so positions are stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedEntry>,
}

impl BatchPlan {
    pub fn batch_types(&self) -> Vec<BatchType> {
        self.batches.iter().map(|batch| batch.batch_type).collect()
    }

    pub fn batch(&self, batch_type: BatchType) -> Option<&Batch> {
        self.batches
            .iter()
            .find(|batch| batch.batch_type == batch_type)
    }

    pub fn non_empty(&self) -> impl Iterator<Item = &Batch> {
        self.batches.iter().filter(|batch| !batch.is_empty())
    }

    pub fn total_files(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }
}

#[derive(Debug, Clone)]
pub struct BatchPlanner {
    complexity_keywords: Vec<String>,
}

impl Default for BatchPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLEXITY_KEYWORDS.iter().map(|k| k.to_string()))
    }
}

impl BatchPlanner {
    pub fn new(keywords: impl IntoIterator<Item = String>) -> Self {
        Self {
            complexity_keywords: keywords
                .into_iter()
                .map(|k| k.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn plan(&self, file_plan: &[FilePlanEntry]) -> BatchPlan {
        let mut config = Batch::empty(BatchType::Config);
        let mut foundation = Batch::empty(BatchType::Foundation);
        let mut priority = Batch::empty(BatchType::Priority);
        let mut content = Batch::empty(BatchType::Content);
        let mut readme = Batch::empty(BatchType::Readme);

        let mut seen = HashSet::new();
        let mut rejected = Vec::new();
        let mut pages = Vec::new();
        let mut styles_and_scripts = Vec::new();

        for entry in file_plan {
            let path = match canonical_plan_path(&entry.path) {
                Ok(path) => path,
                Err(err) => {
                    warn!(path = %entry.path, error = %err, "Rejecting planned path");
                    rejected.push(RejectedEntry {
                        path: entry.path.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if !seen.insert(path.clone()) {
                warn!(path = %path, "Duplicate path in file plan; keeping first entry");
                continue;
            }
            let entry = FilePlanEntry {
                path,
                ..entry.clone()
            };
            match FileKind::classify(&entry.path) {
                FileKind::Config | FileKind::Asset | FileKind::Default => {
                    config.entries.push(entry)
                }
                FileKind::HtmlPage => pages.push(entry),
                FileKind::Css | FileKind::Javascript => styles_and_scripts.push(entry),
                FileKind::Readme => readme.entries.push(entry),
            }
        }

        let (entry_pages, mut remaining): (Vec<FilePlanEntry>, Vec<FilePlanEntry>) =
            pages.into_iter().partition(|entry| is_entry_point(&entry.path));
        if entry_pages.is_empty() && !remaining.is_empty() {
            // No index/landing page: the first planned page acts as the entry point.
            foundation.entries.push(remaining.remove(0));
        } else {
            foundation.entries.extend(entry_pages);
        }
        foundation.entries.extend(styles_and_scripts);

        let (complex, plain): (Vec<FilePlanEntry>, Vec<FilePlanEntry>) = remaining
            .into_iter()
            .partition(|entry| self.is_complex(entry));
        if complex.is_empty() {
            // Nothing matched a complexity keyword: promote the first page so the second
            // page of the site still gets generated right after the foundation.
            let mut plain = plain.into_iter();
            if let Some(first) = plain.next() {
                priority.entries.push(first);
            }
            content.entries.extend(plain);
        } else {
            priority.entries.extend(complex);
            content.entries.extend(plain);
        }

        let plan = BatchPlan {
            batches: vec![config, foundation, priority, content, readme],
            rejected,
        };
        debug!(
            files = plan.total_files(),
            config = plan.batches[0].len(),
            foundation = plan.batches[1].len(),
            priority = plan.batches[2].len(),
            content = plan.batches[3].len(),
            readme = plan.batches[4].len(),
            rejected = plan.rejected.len(),
            "Planned batches"
        );
        plan
    }

    pub fn is_complex(&self, entry: &FilePlanEntry) -> bool {
        let haystack = format!("{} {}", entry.path, entry.purpose).to_ascii_lowercase();
        self.complexity_keywords
            .iter()
            .any(|keyword| haystack.contains(keyword.as_str()))
    }
}

fn is_entry_point(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    ENTRY_POINT_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}
