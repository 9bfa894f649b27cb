use crate::cli::Args;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// On-disk layout: uploads, the output root, and the project holding runs.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub upload_dir: PathBuf,
    pub output_root: PathBuf,
    pub project_dir: PathBuf,
    pub run_name: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct RunSummary {
    pub name: String,
    pub files: Vec<String>,
    pub modified: Option<DateTime<Utc>>,
}

/// Reduce a client-supplied file name to its final component.
/// Browsers on Windows may send full `C:\...` paths.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}

impl Workspace {
    pub fn from_args(args: &Args) -> Self {
        Self {
            upload_dir: args.upload_dir.clone(),
            output_root: args.output_root.clone(),
            project_dir: args.project_dir(),
            run_name: args.run_name.clone(),
        }
    }

    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.upload_dir)?;
        fs::create_dir_all(&self.output_root)?;
        fs::create_dir_all(&self.project_dir)?;
        Ok(())
    }

    pub fn run_dir(&self) -> PathBuf {
        self.project_dir.join(&self.run_name)
    }

    /// Store an upload under its own name, replacing any earlier file.
    pub fn save_upload(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let name = sanitize_file_name(file_name)
            .ok_or_else(|| anyhow!("Invalid upload file name: {:?}", file_name))?;
        fs::create_dir_all(&self.upload_dir)?;
        let path = self.upload_dir.join(name);
        fs::write(&path, bytes)?;
        tracing::info!("Saved upload {} ({} bytes)", path.display(), bytes.len());
        Ok(path)
    }

    /// `path` relative to the output root with `/` separators, for URLs.
    pub fn output_relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.output_root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    /// Map a relative artifact path back to a file under the output root.
    /// Anything that would escape the root is refused.
    pub fn resolve_download(&self, rel: &str) -> Option<PathBuf> {
        let rel = Path::new(rel);
        if rel.as_os_str().is_empty() {
            return None;
        }
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        let path = self.output_root.join(rel);
        path.is_file().then_some(path)
    }

    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut runs = Vec::new();
        if !self.project_dir.exists() {
            return Ok(runs);
        }

        for entry in WalkDir::new(&self.project_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            let files: Vec<String> = WalkDir::new(entry.path())
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect();
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);

            runs.push(RunSummary {
                name: entry.file_name().to_string_lossy().into_owned(),
                files,
                modified,
            });
        }

        Ok(runs)
    }
}
