//! Render buffer and the status view handed to `on_render`
//!
//! One [`RenderContext`] is built per scheduler tick and shared by every
//! extension in registration order. Extensions reach it through a
//! [`StatusContext`], which is bound only while `on_render` runs; every
//! other hook gets an unbound one that fails fast.

use crate::error::StatusUnavailable;
use glint_ext_api::DefaultStatus;

/// Ordered text lines of one status message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderContext {
    lines: Vec<String>,
    default_status: Option<DefaultStatus>,
}

impl RenderContext {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            default_status: None,
        }
    }

    /// Attach the host-composed status facts
    pub fn with_default_status(mut self, status: DefaultStatus) -> Self {
        self.default_status = Some(status);
        self
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn default_status(&self) -> Option<&DefaultStatus> {
        self.default_status.as_ref()
    }

    /// Append a line; empty text is ignored
    pub fn add_line(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.lines.push(text);
        }
    }

    /// Append a blank separator, the title, then the non-empty lines
    pub fn add_section<I, S>(&mut self, title: impl Into<String>, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines.push(String::new());
        self.lines.push(title.into());
        self.extend(lines);
    }

    /// Append every non-empty line
    pub fn extend<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for line in lines {
            self.add_line(line);
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Replace the body of the section titled `title`
    ///
    /// The body runs from the line after the first exact title match up to
    /// the next whitespace-only line (or the end). A missing section is
    /// appended with [`RenderContext::add_section`]. An empty title does
    /// nothing.
    pub fn replace_section<I, S>(&mut self, title: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if title.is_empty() {
            return;
        }

        let Some(start) = self.lines.iter().position(|line| line == title) else {
            self.add_section(title, lines);
            return;
        };

        let body = start + 1;
        let end = self.lines[body..]
            .iter()
            .position(|line| line.trim().is_empty())
            .map_or(self.lines.len(), |offset| body + offset);

        let replacement: Vec<String> = lines
            .into_iter()
            .map(Into::into)
            .filter(|line: &String| !line.is_empty())
            .collect();
        self.lines.splice(body..end, replacement);
    }

    /// Composed message text
    pub fn into_text(self) -> String {
        self.lines.join("\n")
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// Call-scoped status view
///
/// Bound to the shared [`RenderContext`] only during `on_render`.
#[derive(Debug)]
pub struct StatusContext<'a> {
    mode: &'a str,
    render: Option<&'a mut RenderContext>,
}

/// Mode reported by unbound status contexts
pub const DEFAULT_MODE: &str = "status";

impl<'a> StatusContext<'a> {
    pub fn bound(render: &'a mut RenderContext, mode: &'a str) -> Self {
        Self {
            mode,
            render: Some(render),
        }
    }

    pub fn unbound() -> Self {
        Self {
            mode: DEFAULT_MODE,
            render: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.render.is_some()
    }

    /// Render mode requested by the host
    pub fn mode(&self) -> &str {
        self.mode
    }

    fn target(&mut self) -> Result<&mut RenderContext, StatusUnavailable> {
        self.render.as_deref_mut().ok_or(StatusUnavailable)
    }

    pub fn clear(&mut self) -> Result<(), StatusUnavailable> {
        self.target()?.clear();
        Ok(())
    }

    pub fn add_line(&mut self, text: impl Into<String>) -> Result<(), StatusUnavailable> {
        self.target()?.add_line(text);
        Ok(())
    }

    /// Same as [`StatusContext::add_line`]
    pub fn append(&mut self, text: impl Into<String>) -> Result<(), StatusUnavailable> {
        self.add_line(text)
    }

    pub fn extend<I, S>(&mut self, lines: I) -> Result<(), StatusUnavailable>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target()?.extend(lines);
        Ok(())
    }

    pub fn replace_section<I, S>(&mut self, title: &str, lines: I) -> Result<(), StatusUnavailable>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target()?.replace_section(title, lines);
        Ok(())
    }

    pub fn lines(&self) -> Result<&[String], StatusUnavailable> {
        self.render
            .as_deref()
            .map(RenderContext::lines)
            .ok_or(StatusUnavailable)
    }

    pub fn default_status(&self) -> Result<Option<&DefaultStatus>, StatusUnavailable> {
        self.render
            .as_deref()
            .map(RenderContext::default_status)
            .ok_or(StatusUnavailable)
    }

    /// Move the buffer out, leaving an empty one behind
    pub(crate) fn take_render(&mut self) -> Option<RenderContext> {
        self.render.as_deref_mut().map(std::mem::take)
    }

    /// Put back a buffer taken with [`StatusContext::take_render`]
    pub(crate) fn restore_render(&mut self, render: RenderContext) {
        if let Some(target) = self.render.as_deref_mut() {
            *target = render;
        }
    }
}
