//! Template rendering.
//!
//! The engine only needs bytes out of a template and a context; [`Renderer`]
//! is the seam. [`PlaceholderRenderer`] is the built-in implementation and
//! understands `{{ dotted.key }}` substitutions and nothing else.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, ErrorKind, Result};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("placeholder regex is valid"));

static KEY_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*(\.[A-Za-z_][A-Za-z0-9_-]*)*$")
        .expect("key regex is valid")
});

/// Values visible to a template: node attributes with per-resource variables on top.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderContext {
    values: toml::Table,
}

impl RenderContext {
    pub fn new(node: &toml::Table, variables: &toml::Table) -> Self {
        let mut values = node.clone();
        overlay(&mut values, variables);
        Self { values }
    }

    pub fn from_table(values: toml::Table) -> Self {
        Self { values }
    }

    pub fn get(&self, key_path: &str) -> Option<&toml::Value> {
        let mut parts = key_path.split('.');
        let mut cur = self.values.get(parts.next()?)?;
        for part in parts {
            cur = cur.as_table()?.get(part)?;
        }
        Some(cur)
    }
}

// Tables merge key by key; any other value replaces what was there.
fn overlay(dst: &mut toml::Table, src: &toml::Table) {
    for (k, v) in src {
        match (dst.get_mut(k), v) {
            (Some(toml::Value::Table(d)), toml::Value::Table(s)) => overlay(d, s),
            _ => {
                dst.insert(k.clone(), v.clone());
            }
        }
    }
}

pub trait Renderer: Send + Sync {
    /// Render the template at `source`. Fails with `RenderError` on malformed
    /// templates or missing context values.
    fn render(&self, source: &Path, ctx: &RenderContext) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl PlaceholderRenderer {
    pub fn render_str(&self, template: &str, ctx: &RenderContext) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            check_literal(template, last, whole.start())?;
            out.push_str(&template[last..whole.start()]);

            let key = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            if !KEY_PATH.is_match(key) {
                return Err(render_err(format!(
                    "invalid placeholder '{{{{{}}}}}' at line {}",
                    key,
                    line_of(template, whole.start())
                )));
            }
            let value = ctx.get(key).ok_or_else(|| {
                render_err(format!(
                    "undefined variable '{}' at line {}",
                    key,
                    line_of(template, whole.start())
                ))
            })?;
            out.push_str(&scalar_text(key, value)?);
            last = whole.end();
        }
        check_literal(template, last, template.len())?;
        out.push_str(&template[last..]);
        Ok(out)
    }
}

impl Renderer for PlaceholderRenderer {
    fn render(&self, source: &Path, ctx: &RenderContext) -> Result<Vec<u8>> {
        let raw = fs::read(source).map_err(|e| {
            let kind = if e.kind() == io::ErrorKind::NotFound {
                ErrorKind::SourceNotFound
            } else {
                ErrorKind::IoFailure
            };
            Error::new(
                kind,
                format!("failed to read template {}: {e}", source.display()),
            )
        })?;
        let text = String::from_utf8(raw).map_err(|_| {
            render_err(format!("template {} is not valid UTF-8", source.display()))
        })?;
        let rendered = self
            .render_str(&text, ctx)
            .map_err(|e| render_err(format!("{}: {e}", source.display())))?;
        Ok(rendered.into_bytes())
    }
}

fn check_literal(template: &str, start: usize, end: usize) -> Result<()> {
    if let Some(pos) = template[start..end].find("{{") {
        return Err(render_err(format!(
            "unterminated '{{{{' at line {}",
            line_of(template, start + pos)
        )));
    }
    Ok(())
}

fn scalar_text(key: &str, value: &toml::Value) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Datetime(dt) => Ok(dt.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => Err(render_err(format!(
            "variable '{}' is a {} and cannot be rendered as text",
            key,
            value.type_str()
        ))),
    }
}

fn line_of(text: &str, byte: usize) -> usize {
    text[..byte].matches('\n').count() + 1
}

fn render_err(msg: String) -> Error {
    Error::new(ErrorKind::RenderError, msg)
}
