//! Web-server rewrite rules that serve page snapshots without reaching the
//! application.
//!
//! The generated Apache `mod_rewrite` block lives between two sentinel lines
//! in the rules file. Installing replaces any previous block, so installing
//! twice leaves the file byte-identical to installing once.

use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::RulesConfig;
use super::device::MOBILE_USER_AGENT_PATTERN;
use super::drivers::edge::{GLOBAL_TAG, TAG_HEADER};
use super::gateway::{AUTH_COOKIE_PATTERN, SNAPSHOT_CACHE_CONTROL};
use super::snapshot::make_world_readable;

pub const BEGIN_MARKER: &str = "# BEGIN Tierguard";
pub const END_MARKER: &str = "# END Tierguard";

const HIT_ENV: &str = "TIERGUARD_HIT";

#[derive(Debug, Error)]
pub enum RuleFileError {
    #[error("failed to access rules file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("rules file `{0}` is not writable")]
    ReadOnly(PathBuf),
    #[error("rules file `{0}` has a begin marker without a matching end marker")]
    Unbalanced(PathBuf),
}

impl RuleFileError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub struct RewriteRuleGenerator {
    config: RulesConfig,
}

impl RewriteRuleGenerator {
    pub fn new(config: RulesConfig) -> Self {
        Self { config }
    }

    pub fn rules_file(&self) -> &Path {
        &self.config.rules_file
    }

    /// The complete block, sentinels included, ending in a newline.
    ///
    /// Conditions are evaluated top to bottom; a request that fails any of the
    /// shared preconditions falls through to the application. The desktop
    /// rule carries the negated user-agent condition so a mobile visitor
    /// without a mobile snapshot is never handed the desktop file.
    pub fn render_block(&self) -> String {
        let prefix = self.config.cache_prefix.trim_end_matches('/');
        let page_base = format!("{prefix}/html/%{{HTTP_HOST}}%{{REQUEST_URI}}");

        let mut lines: Vec<String> = vec![
            BEGIN_MARKER.to_string(),
            "<IfModule mod_rewrite.c>".to_string(),
            "RewriteEngine On".to_string(),
            "RewriteBase /".to_string(),
        ];

        // The pattern contains spaces, so it is quoted; `!` goes inside the quotes.
        for (file_name, negate) in [("index-mobile.html", ""), ("index.html", "!")] {
            lines.extend([
                "RewriteCond %{REQUEST_METHOD} =GET".to_string(),
                "RewriteCond %{QUERY_STRING} ^$".to_string(),
                format!("RewriteCond %{{HTTP:Cookie}} !{AUTH_COOKIE_PATTERN} [NC]"),
                format!(
                    "RewriteCond %{{HTTP_USER_AGENT}} \"{negate}{MOBILE_USER_AGENT_PATTERN}\" [NC]"
                ),
                format!("RewriteCond %{{DOCUMENT_ROOT}}{page_base}/{file_name} -f"),
                format!(
                    "RewriteRule ^ \"{page_base}/{file_name}\" [L,T=text/html,E={HIT_ENV}:1]"
                ),
            ]);
        }

        lines.extend([
            "</IfModule>".to_string(),
            "<IfModule mod_headers.c>".to_string(),
            format!(
                "Header set Cache-Control \"{SNAPSHOT_CACHE_CONTROL}\" env=REDIRECT_{HIT_ENV}"
            ),
            format!("Header set X-Cache-Status \"HIT\" env=REDIRECT_{HIT_ENV}"),
            format!(
                "Header set {} \"{GLOBAL_TAG}\" env=REDIRECT_{HIT_ENV}",
                TAG_HEADER.as_str()
            ),
            "</IfModule>".to_string(),
            END_MARKER.to_string(),
        ]);

        let mut block = lines.join("\n");
        block.push('\n');
        block
    }

    /// Write the block to the rules file. Failures are logged and reported as
    /// `false`.
    pub fn install(&self) -> bool {
        let path = self.rules_file();
        match self.try_install() {
            Ok(()) => {
                info!(path = %path.display(), "rewrite rules installed");
                true
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "rewrite rules not installed");
                false
            }
        }
    }

    /// Strip the block from the rules file. Failures are logged and reported
    /// as `false`.
    pub fn remove(&self) -> bool {
        let path = self.rules_file();
        match self.try_remove() {
            Ok(()) => {
                info!(path = %path.display(), "rewrite rules removed");
                true
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "rewrite rules not removed");
                false
            }
        }
    }

    pub fn try_install(&self) -> Result<(), RuleFileError> {
        let path = self.rules_file();
        let existing = read_existing(path)?;
        let updated = apply_block(&existing, &self.render_block())
            .ok_or_else(|| RuleFileError::Unbalanced(path.to_path_buf()))?;
        write_if_changed(path, &existing, &updated)
    }

    pub fn try_remove(&self) -> Result<(), RuleFileError> {
        let path = self.rules_file();
        let existing = read_existing(path)?;
        let updated =
            strip_block(&existing).ok_or_else(|| RuleFileError::Unbalanced(path.to_path_buf()))?;
        write_if_changed(path, &existing, &updated)
    }

    pub fn is_installed(&self) -> Result<bool, RuleFileError> {
        let existing = read_existing(self.rules_file())?;
        Ok(existing.contains(&self.render_block()))
    }
}

/// `existing` with every sentinel block removed, along with the blank line
/// that follows each block. `None` when a block is left open.
pub fn strip_block(existing: &str) -> Option<String> {
    let mut stripped = String::with_capacity(existing.len());
    let mut inside = false;
    let mut after_block = false;

    for line in existing.split_inclusive('\n') {
        let trimmed = line.trim();
        if inside {
            if trimmed == END_MARKER {
                inside = false;
                after_block = true;
            }
            continue;
        }
        if trimmed == BEGIN_MARKER {
            inside = true;
            continue;
        }
        if after_block {
            after_block = false;
            if trimmed.is_empty() {
                continue;
            }
        }
        stripped.push_str(line);
    }

    (!inside).then_some(stripped)
}

/// `block` placed at the top of `existing`, replacing any previous block.
pub fn apply_block(existing: &str, block: &str) -> Option<String> {
    let rest = strip_block(existing)?;
    if rest.is_empty() {
        return Some(block.to_string());
    }
    Some(format!("{block}\n{rest}"))
}

fn read_existing(path: &Path) -> Result<String, RuleFileError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(RuleFileError::io(path, err)),
    }
}

/// Parent directory to stage in, plus the permissions to keep.
fn ensure_writable(path: &Path) -> Result<(PathBuf, Option<Permissions>), RuleFileError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let permissions = match fs::metadata(path) {
        Ok(metadata) if metadata.permissions().readonly() => {
            return Err(RuleFileError::ReadOnly(path.to_path_buf()));
        }
        Ok(metadata) => Some(metadata.permissions()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(RuleFileError::io(path, err)),
    };

    let parent_metadata = fs::metadata(&parent).map_err(|err| RuleFileError::io(&parent, err))?;
    if parent_metadata.permissions().readonly() {
        return Err(RuleFileError::ReadOnly(path.to_path_buf()));
    }
    Ok((parent, permissions))
}

fn write_if_changed(path: &Path, existing: &str, updated: &str) -> Result<(), RuleFileError> {
    if existing == updated {
        debug!(path = %path.display(), "rules file already up to date");
        return Ok(());
    }

    let (parent, permissions) = ensure_writable(path)?;
    let io_err = |err: io::Error| RuleFileError::io(path, err);
    let mut staged = NamedTempFile::new_in(&parent).map_err(io_err)?;
    staged.write_all(updated.as_bytes()).map_err(io_err)?;
    let permissions = match permissions {
        Some(permissions) => staged.as_file().set_permissions(permissions),
        None => make_world_readable(staged.as_file()),
    };
    permissions.map_err(io_err)?;
    staged
        .persist(path)
        .map_err(|err| RuleFileError::io(path, err.error))?;
    Ok(())
}
