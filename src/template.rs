//! Proto-job templates
//!
//! A template is an opaque job script with named placeholders written as
//! `%(name)s`. `%%` renders a single `%`; any other `%` is copied through
//! (shell scripts use `date +%s` and friends). A `%(` that does not close
//! as `%(name)s` is rejected, as is a name outside [`PLACEHOLDERS`], so a
//! bad template fails before any job file is written.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex_lite::Regex;
use sha2::{Digest, Sha256};

/// Placeholder names a template may use
pub const PLACEHOLDERS: &[&str] = &[
    "job_name",
    "out_file",
    "err_file",
    "log_file",
    "walltime",
    "num_cpu",
    "mem",
    "seeds",
    "job_number",
    "cwd",
    "jobs_dir",
    "scan1_start",
    "scan1_end",
    "scan2_start",
    "scan2_end",
    "aux_param",
];

/// Errors from parsing or rendering a template
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown placeholder '%({name})s' at line {line}")]
    UnknownPlaceholder { name: String, line: usize },

    #[error("malformed placeholder at line {line}: '{snippet}'")]
    Malformed { line: usize, snippet: String },

    #[error("no value supplied for placeholder '{0}'")]
    MissingValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(&'static str),
}

/// A parsed, validated template
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
    digest: String,
}

fn token_re() -> &'static Regex {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    TOKEN_RE.get_or_init(|| {
        // Alternation is leftmost-first: `%%` before a complete token before a stray `%(`.
        Regex::new(r"%%|%\(([A-Za-z_][A-Za-z0-9_]*)\)s|%\(").expect("valid token pattern")
    })
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

impl Template {
    /// Parse and validate template text.
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut last = 0;

        for caps in token_re().captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            literal.push_str(&text[last..whole.start()]);
            last = whole.end();

            if whole.as_str() == "%%" {
                literal.push('%');
                continue;
            }

            let Some(name) = caps.get(1) else {
                let snippet = text[whole.start()..]
                    .chars()
                    .take_while(|c| *c != '\n')
                    .take(24)
                    .collect();
                return Err(TemplateError::Malformed {
                    line: line_of(text, whole.start()),
                    snippet,
                });
            };

            let known = PLACEHOLDERS
                .iter()
                .find(|p| **p == name.as_str())
                .ok_or_else(|| TemplateError::UnknownPlaceholder {
                    name: name.as_str().to_string(),
                    line: line_of(text, whole.start()),
                })?;

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Placeholder(*known));
        }

        literal.push_str(&text[last..]);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            segments,
            digest: hex::encode(Sha256::digest(text.as_bytes())),
        })
    }

    /// Read and parse a template file.
    pub fn from_file(path: &Path) -> Result<Self, TemplateError> {
        let text = fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Placeholder names used, in order of first appearance.
    pub fn placeholders(&self) -> Vec<&'static str> {
        let mut seen = Vec::new();
        for segment in &self.segments {
            if let Segment::Placeholder(name) = segment {
                if !seen.contains(name) {
                    seen.push(*name);
                }
            }
        }
        seen
    }

    /// SHA-256 of the template source, hex encoded
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Substitute values. Values are inserted verbatim and never re-scanned.
    pub fn render(&self, values: &BTreeMap<&'static str, String>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = values
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingValue(name.to_string()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&'static str, &str)]) -> BTreeMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let template = Template::parse("run --seed=%(seeds)s --out=%(job_number)s").unwrap();
        let out = template
            .render(&values(&[("seeds", "1 3"), ("job_number", "0")]))
            .unwrap();
        assert_eq!(out, "run --seed=1 3 --out=0");
        assert_eq!(template.placeholders(), vec!["seeds", "job_number"]);
    }

    #[test]
    fn test_percent_handling() {
        let template = Template::parse("echo 100%% done at `date +%s` #PBS -N %(job_name)s").unwrap();
        let out = template.render(&values(&[("job_name", "toy_1")])).unwrap();
        assert_eq!(out, "echo 100% done at `date +%s` #PBS -N toy_1");
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = Template::parse("#!/bin/sh\necho %(walltime)s\necho %(queue_name)s\n").unwrap_err();
        match err {
            TemplateError::UnknownPlaceholder { name, line } => {
                assert_eq!(name, "queue_name");
                assert_eq!(line, 3);
            }
            other => panic!("expected UnknownPlaceholder, got {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_placeholder_rejected() {
        for text in ["cd %(cwd)", "cd %(cwd", "cd %(cwd)d", "cd %()s"] {
            assert!(
                matches!(Template::parse(text), Err(TemplateError::Malformed { line: 1, .. })),
                "{} should be malformed",
                text
            );
        }
    }

    #[test]
    fn test_values_not_rescanned() {
        let template = Template::parse("cd %(cwd)s").unwrap();
        let out = template.render(&values(&[("cwd", "/data/%(seeds)s")])).unwrap();
        assert_eq!(out, "cd /data/%(seeds)s");
    }

    #[test]
    fn test_missing_value() {
        let template = Template::parse("%(mem)smb").unwrap();
        assert!(matches!(
            template.render(&BTreeMap::new()),
            Err(TemplateError::MissingValue(name)) if name == "mem"
        ));
    }

    #[test]
    fn test_digest_is_stable() {
        let a = Template::parse("echo %(seeds)s").unwrap();
        let b = Template::parse("echo %(seeds)s").unwrap();
        let c = Template::parse("echo  %(seeds)s").unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
