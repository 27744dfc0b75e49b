//! Export of analysis results and practice transcripts
//!
//! Results are lightweight Markdown (`## ` headings and `**bold**`); they are
//! written either as plain text or as an HTML document Word can open.

use chrono::Local;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

const HEADING_RULE: &str = "==============================";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Nothing to export")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    /// Plain text with underlined headings
    Txt,
    /// HTML saved with a .doc extension
    Doc,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Txt => "txt",
            ExportFormat::Doc => "doc",
        }
    }

    pub fn render(&self, markdown: &str, title: &str) -> String {
        match self {
            ExportFormat::Txt => to_plain_text(markdown),
            ExportFormat::Doc => to_word_html(markdown, title),
        }
    }
}

/// Replace every `**x**` pair using `wrap`. An unmatched `**` is kept as is.
fn replace_bold(text: &str, wrap: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("**") {
        let after = &rest[start + 2..];
        match after.find("**") {
            Some(end) => {
                out.push_str(&rest[..start]);
                out.push_str(&wrap(&after[..end]));
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('<') {
        match rest[start..].find('>') {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &rest[start + end + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// Markdown to plain text: headings underlined, emphasis and tags dropped
pub fn to_plain_text(markdown: &str) -> String {
    let lines: Vec<String> = markdown
        .lines()
        .map(|line| match line.strip_prefix("## ") {
            Some(heading) => format!("{}\n{}\n", heading, HEADING_RULE),
            None => line.to_string(),
        })
        .collect();
    strip_tags(&replace_bold(&lines.join("\n"), |s| s.to_string()))
}

/// Markdown to a minimal HTML document
pub fn to_word_html(markdown: &str, title: &str) -> String {
    let lines: Vec<String> = markdown
        .lines()
        .map(|line| match line.strip_prefix("## ") {
            Some(heading) => format!("<h2>{}</h2>", heading),
            None => line.to_string(),
        })
        .collect();
    let body = replace_bold(&lines.join("\n"), |s| format!("<strong>{}</strong>", s)).replace('\n', "<br />");

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n<title>{}</title>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        title, body
    )
}

/// Write `content` under `dir` as `<stem>-<timestamp>.<ext>`
pub fn save(dir: &Path, stem: &str, extension: &str, content: &str) -> Result<PathBuf, ExportError> {
    if content.trim().is_empty() {
        return Err(ExportError::Empty);
    }
    std::fs::create_dir_all(dir)?;
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("{}-{}.{}", stem, timestamp, extension));
    std::fs::write(&path, content)?;
    info!("Exported {}", path.display());
    Ok(path)
}

/// Render `markdown` in `format` and save it
pub fn export(dir: &Path, stem: &str, title: &str, markdown: &str, format: ExportFormat) -> Result<PathBuf, ExportError> {
    if markdown.trim().is_empty() {
        return Err(ExportError::Empty);
    }
    save(dir, stem, format.extension(), &format.render(markdown, title))
}
