//! Append-only audit trail of relayed messages.
//!
//! One plain-text line per relayed message:
//! `[timestamp] [guild] [channel] [author] content`. The file is rotated by
//! size so a long-running relay does not grow it without bound.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::time_utils::format_iso8601;

const DEFAULT_AUDIT_ROTATION_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_AUDIT_ROTATION_MAX_FILES: usize = 5;

/// Size-based rotation settings for the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for AuditRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_AUDIT_ROTATION_MAX_BYTES,
            max_files: DEFAULT_AUDIT_ROTATION_MAX_FILES,
        }
    }
}

impl AuditRotationPolicy {
    /// Reads `RIFT_AUDIT_ROTATION_MAX_BYTES` / `RIFT_AUDIT_ROTATION_MAX_FILES`,
    /// keeping the default for anything missing, unparsable or zero.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_bytes: positive_env("RIFT_AUDIT_ROTATION_MAX_BYTES").unwrap_or(defaults.max_bytes),
            max_files: positive_env("RIFT_AUDIT_ROTATION_MAX_FILES").unwrap_or(defaults.max_files),
        }
    }

    fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }
}

fn positive_env<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let value = std::env::var(name).ok()?.trim().parse::<T>().ok()?;
    (value > T::default()).then_some(value)
}

/// Renders one audit line. Newlines inside the content are kept so the
/// record stays byte-faithful to what was relayed.
pub fn format_audit_line(
    created_at: DateTime<Utc>,
    guild_name: &str,
    channel_name: &str,
    author: &str,
    content: &str,
) -> String {
    format!(
        "[{}] [{}] [{}] [{}] {}",
        format_iso8601(created_at),
        guild_name,
        channel_name,
        author,
        content
    )
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    policy: AuditRotationPolicy,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>, policy: AuditRotationPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a single line, rotating first when the line would push the
    /// active file past `max_bytes`.
    pub fn append_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if self.needs_rotation(line)? {
            self.rotate()?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        file.write_all(record.as_bytes())
            .with_context(|| format!("failed to append to audit log {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush audit log {}", self.path.display()))
    }

    fn needs_rotation(&self, line: &str) -> Result<bool> {
        if !self.policy.is_enabled() {
            return Ok(false);
        }
        let current = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata.len(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to stat audit log {}", self.path.display()))
            }
        };
        let incoming = u64::try_from(line.len()).unwrap_or(u64::MAX).saturating_add(1);
        Ok(current > 0 && current.saturating_add(incoming) > self.policy.max_bytes)
    }

    /// Shifts `path.N` to `path.N+1` from the oldest down, dropping whatever
    /// would exceed `max_files`, then moves the active file to `path.1`.
    fn rotate(&self) -> Result<()> {
        let keep = self.policy.max_files.saturating_sub(1);
        if keep == 0 {
            return std::fs::remove_file(&self.path)
                .with_context(|| format!("failed to truncate audit log {}", self.path.display()));
        }

        remove_if_present(&backup_path(&self.path, keep))?;
        for index in (1..keep).rev() {
            let from = backup_path(&self.path, index);
            if from.exists() {
                let to = backup_path(&self.path, index + 1);
                std::fs::rename(&from, &to).with_context(|| {
                    format!("failed to shift {} to {}", from.display(), to.display())
                })?;
            }
        }
        let first = backup_path(&self.path, 1);
        std::fs::rename(&self.path, &first).with_context(|| {
            format!("failed to rotate {} to {}", self.path.display(), first.display())
        })
    }
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => {
            Err(error).with_context(|| format!("failed to drop oldest backup {}", path.display()))
        }
    }
}
