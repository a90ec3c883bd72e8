//! Output name templates.
//!
//! Placeholders: `{name}` (sanitized VM display name), `{id}`, `{timestamp}` or
//! `{timestamp:<strftime>}`, `{ext}` (extension of the output format, with
//! the leading dot).

use crate::{BackupError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDateTime;
use std::fmt::Write;

pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Name,
    Id,
    Timestamp(String),
    Ext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTemplate {
    parts: Vec<Part>,
}

impl NameTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                BackupError::Config(format!("unclosed placeholder in name template \"{}\"", template))
            })?;
            parts.push(Self::placeholder(&after[..close], template)?);
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        if parts.is_empty() {
            return Err(BackupError::Config("name template is empty".to_string()));
        }
        Ok(Self { parts })
    }

    fn placeholder(spec: &str, template: &str) -> Result<Part> {
        let (key, format) = match spec.split_once(':') {
            Some((key, format)) => (key, Some(format)),
            None => (spec, None),
        };

        match (key, format) {
            ("name", None) => Ok(Part::Name),
            ("id", None) => Ok(Part::Id),
            ("ext", None) => Ok(Part::Ext),
            ("timestamp", None) => Ok(Part::Timestamp(DEFAULT_TIMESTAMP_FORMAT.to_string())),
            ("timestamp", Some(format)) => {
                if format.is_empty()
                    || StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
                {
                    return Err(BackupError::Config(format!(
                        "invalid timestamp format \"{}\" in name template",
                        format
                    )));
                }
                Ok(Part::Timestamp(format.to_string()))
            }
            _ => Err(BackupError::Config(format!(
                "unknown placeholder {{{}}} in name template \"{}\"",
                spec, template
            ))),
        }
    }

    /// Render the output name of one component.
    pub fn render(&self, name: &str, id: &str, at: NaiveDateTime, ext: &str) -> Result<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Name => out.push_str(&sanitize(name)),
                Part::Id => out.push_str(&sanitize(id)),
                Part::Ext => out.push_str(ext),
                Part::Timestamp(format) => write!(out, "{}", at.format(format)).map_err(|_| {
                    BackupError::Config(format!("cannot format timestamp with \"{}\"", format))
                })?,
            }
        }
        Ok(out)
    }
}

/// Replace characters that cannot appear in a file name.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
