//! FAT volume labels.
//!
//! A [`VolumeLabel`] can only be built through [`VolumeLabel::sanitize`] or the
//! strict [`VolumeLabel::parse`], so any label that reaches `mkfs.fat` is at most
//! eleven characters drawn from `[A-Z0-9_- ]`, with no leading, trailing or
//! repeated spaces.
use std::fmt;
use thiserror::Error;

/// Used when nothing usable is left after sanitizing.
pub const DEFAULT_LABEL: &str = "MICROPYTHON";

/// FAT short volume labels hold eleven bytes.
pub const MAX_LABEL_LEN: usize = 11;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VolumeLabel(String);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid volume label {input:?}: {reason}")]
pub struct InvalidLabel {
    pub input: String,
    pub reason: &'static str,
}

impl VolumeLabel {
    /// Folds `input` into a valid label.
    ///
    /// Lowercase letters are uppercased, control whitespace becomes a space,
    /// anything outside the allowed set is dropped, runs of spaces collapse to
    /// one, and the result is trimmed and cut to [`MAX_LABEL_LEN`]. An empty
    /// result falls back to [`DEFAULT_LABEL`].
    pub fn sanitize(input: &str) -> Self {
        let mut out = String::with_capacity(MAX_LABEL_LEN);
        let mut pending_space = false;

        for c in input.chars() {
            let c = match c {
                '\n' | '\r' | '\t' => ' ',
                other => other.to_ascii_uppercase(),
            };
            if !is_label_char(c) {
                continue;
            }
            if c == ' ' {
                pending_space = !out.is_empty();
                continue;
            }
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }

        out.truncate(MAX_LABEL_LEN);
        let trimmed = out.trim_end();

        if trimmed.is_empty() {
            VolumeLabel(DEFAULT_LABEL.to_string())
        } else {
            VolumeLabel(trimmed.to_string())
        }
    }

    /// Accepts `input` only if it is already a valid label.
    pub fn parse(input: &str) -> Result<Self, InvalidLabel> {
        let invalid = |reason| InvalidLabel {
            input: input.to_string(),
            reason,
        };

        if input.is_empty() {
            return Err(invalid("label is empty"));
        }
        if input.len() > MAX_LABEL_LEN {
            return Err(invalid("label is longer than 11 characters"));
        }
        if !input.chars().all(is_label_char) {
            return Err(invalid("only A-Z, 0-9, '_', '-' and space are allowed"));
        }
        if input.starts_with(' ') || input.ends_with(' ') || input.contains("  ") {
            return Err(invalid("spaces must be single and inside the label"));
        }
        Ok(VolumeLabel(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for VolumeLabel {
    fn default() -> Self {
        VolumeLabel(DEFAULT_LABEL.to_string())
    }
}

impl fmt::Display for VolumeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VolumeLabel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | ' ')
}
