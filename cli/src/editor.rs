// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Release-Notes Editor Bridge (component I, `spec.md` §4.I).
//!
//! Lives outside `apkrepo-core` per the scope note in §1: interactive editor
//! invocation reuses core contracts (the [`ReleaseNotesPrompt`] trait) but
//! adds no new hard engineering of its own.

use apkrepo_core::orchestrator::ReleaseNotesPrompt;
use apkrepo_core::printer::Printer;
use apkrepo_core::types::{PackageName, Timestamp, VersionCode};
use apkrepo_core::Result;
use std::process::Command;
use std::sync::Arc;

const SENTINEL_PREFIX: &str = "<!-- ";
const SENTINEL_SUFFIX: &str = " -->";

pub struct EditorPrompt {
    printer: Arc<Printer>,
}

impl EditorPrompt {
    pub fn new(printer: Arc<Printer>) -> Self {
        Self { printer }
    }
}

impl ReleaseNotesPrompt for EditorPrompt {
    fn prompt(
        &self,
        package: &PackageName,
        version: VersionCode,
        existing_notes: Option<&str>,
        last_edit: Timestamp,
    ) -> Result<Option<String>> {
        self.printer
            .hold_blocking(|| run_editor(package, version, existing_notes, last_edit))
    }
}

fn run_editor(
    package: &PackageName,
    version: VersionCode,
    existing_notes: Option<&str>,
    last_edit: Timestamp,
) -> Result<Option<String>> {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("apkrepo-notes-{package}-{version}.md"));

    let mut buffer = String::new();
    buffer.push_str(existing_notes.unwrap_or(""));
    if !buffer.ends_with('\n') && !buffer.is_empty() {
        buffer.push('\n');
    }
    buffer.push_str(&sentinel_line(&format!("package: {package}")));
    buffer.push_str(&sentinel_line(&format!("version: {}", version.get())));
    buffer.push_str(&sentinel_line(&format!("last edit: {}", last_edit.millis())));

    std::fs::write(&path, &buffer)?;

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = Command::new(&editor)
        .arg(&path)
        .status()
        .map_err(|e| format!("failed to launch {editor}: {e}"))
        .and_then(|s| if s.success() { Ok(s) } else { Err(format!("{editor} exited with {s}")) });

    let status_ok = match status {
        Ok(_) => true,
        Err(reason) => {
            let _ = std::fs::remove_file(&path);
            eprintln!("warning: release-notes editor failed: {reason}");
            false
        }
    };
    if !status_ok {
        return Ok(None);
    }

    let saved = std::fs::read_to_string(&path).unwrap_or_default();
    let _ = std::fs::remove_file(&path);

    let filtered: String = saved
        .lines()
        .filter(|line| !is_sentinel_line(line))
        .collect::<Vec<_>>()
        .join("\n");
    let trimmed = filtered.trim_end_matches('\n').trim();

    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

fn sentinel_line(text: &str) -> String {
    let mut line = String::with_capacity(SENTINEL_PREFIX.len() + text.len() + SENTINEL_SUFFIX.len() + 1);
    line.push_str(SENTINEL_PREFIX);
    line.push_str(text);
    line.push_str(SENTINEL_SUFFIX);
    line.push('\n');
    line
}

fn is_sentinel_line(line: &str) -> bool {
    let trimmed = line.trim_end();
    trimmed.starts_with(SENTINEL_PREFIX) && trimmed.ends_with(SENTINEL_SUFFIX)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sentinel_lines_are_recognized_and_stripped() {
        let line = sentinel_line("package: com.example.app");
        assert!(is_sentinel_line(line.trim_end_matches('\n')));
        assert!(!is_sentinel_line("this is real content"));
    }
}
