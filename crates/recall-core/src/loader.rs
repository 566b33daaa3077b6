//! Directory walker that turns note files into [`Document`]s.
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::Document;

#[derive(Debug, Clone)]
pub struct DocumentLoader {
    extensions: Vec<String>,
    limit: Option<usize>,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self { extensions: vec!["txt".to_string(), "md".to_string()], limit: None }
    }
}

impl DocumentLoader {
    pub fn new() -> Self { Self::default() }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Only load the first `limit` files (sorted by path).
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Load every matching file under `root`. `source_id` is the path relative
    /// to `root`. Files that cannot be read are logged and skipped.
    pub fn load_dir(&self, root: &Path) -> Result<Vec<Document>> {
        let mut files = self.list_files(root);
        if files.is_empty() {
            info!(root = %root.display(), "no note files found");
            return Ok(vec![]);
        }
        if let Some(limit) = self.limit {
            if files.len() > limit {
                files.truncate(limit);
                info!(limit, "limited to first files");
            }
        }
        Ok(self.load_files(root, &files))
    }

    /// Read `files` (found under `root`), skipping any that fail.
    pub fn load_files(&self, root: &Path, files: &[PathBuf]) -> Vec<Document> {
        let mut docs = Vec::with_capacity(files.len());
        for file_path in files {
            match self.load_file(root, file_path) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    warn!(path = %file_path.display(), error = %e, "skipping unreadable file");
                }
            }
        }
        let skipped = files.len() - docs.len();
        info!(files = docs.len(), skipped, root = %root.display(), "loaded documents");
        docs
    }

    pub fn load_file(&self, root: &Path, file_path: &Path) -> Result<Document> {
        let text = read_file_content(file_path)?;
        let modified: DateTime<Utc> = fs::metadata(file_path)?
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let source_id = source_id_for(root, file_path);
        debug!(source_id = %source_id, chars = text.chars().count(), "read document");
        Ok(Document::new(source_id, text, modified))
    }

    pub fn list_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let entries = walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok());
        for entry in entries.filter(|e| e.file_type().is_file()) {
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
            if matches { files.push(path.to_path_buf()); }
        }
        files.sort();
        files
    }
}

fn read_file_content(file_path: &Path) -> Result<String> {
    match fs::read_to_string(file_path) {
        Ok(content) => Ok(content),
        Err(_) => Ok(String::from_utf8_lossy(&fs::read(file_path)?).to_string()),
    }
}

/// Relative path with `/` separators, so ids are stable across platforms.
fn source_id_for(root: &Path, file_path: &Path) -> String {
    let relative = file_path.strip_prefix(root).unwrap_or(file_path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
