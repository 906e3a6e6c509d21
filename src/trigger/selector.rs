//! Document selector matching for document-open triggers

use regex::Regex;
use serde::{Deserialize, Serialize};
use tower_lsp::lsp_types::Url;

/// One entry of the configured document selector. Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    /// Glob over the URI path: `*`, `**`, `?` and `{a,b}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone)]
struct CompiledFilter {
    language: Option<String>,
    scheme: Option<String>,
    pattern: Option<Regex>,
}

/// Compiled document selector; an empty selector matches every document
#[derive(Debug, Clone, Default)]
pub struct DocumentSelector {
    filters: Vec<CompiledFilter>,
}

impl DocumentSelector {
    pub fn compile(filters: &[DocumentFilter]) -> Result<Self, regex::Error> {
        let filters = filters
            .iter()
            .map(|filter| {
                let pattern = filter
                    .pattern
                    .as_deref()
                    .map(|glob| Regex::new(&glob_to_regex(glob)))
                    .transpose()?;
                Ok(CompiledFilter {
                    language: filter.language.clone(),
                    scheme: filter.scheme.clone(),
                    pattern,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self { filters })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn matches(&self, uri: &str, language_id: &str) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        let parsed = Url::parse(uri).ok();
        self.filters
            .iter()
            .any(|filter| filter.matches(parsed.as_ref(), language_id))
    }
}

impl CompiledFilter {
    fn matches(&self, uri: Option<&Url>, language_id: &str) -> bool {
        if let Some(language) = &self.language {
            if language != language_id {
                return false;
            }
        }
        if let Some(scheme) = &self.scheme {
            if uri.is_none_or(|uri| uri.scheme() != scheme) {
                return false;
            }
        }
        if let Some(pattern) = &self.pattern {
            if uri.is_none_or(|uri| !pattern.is_match(uri.path())) {
                return false;
            }
        }
        true
    }
}

/// Translates a glob into an anchored regex.
/// `**/` also matches no directory at all; an unclosed `{` fails to compile.
fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::from("^");
    let mut chars = glob.chars().peekable();
    let mut in_group = false;

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    regex.push_str("(?:.*/)?");
                } else {
                    regex.push_str(".*");
                }
            }
            '*' => regex.push_str("[^/]*"),
            '?' => regex.push_str("[^/]"),
            '{' if !in_group => {
                in_group = true;
                regex.push_str("(?:");
            }
            '}' if in_group => {
                in_group = false;
                regex.push(')');
            }
            ',' if in_group => regex.push('|'),
            c => {
                let mut buf = [0u8; 4];
                regex.push_str(&regex::escape(c.encode_utf8(&mut buf)));
            }
        }
    }

    if in_group {
        regex.push('(');
    }
    regex.push('$');
    regex
}
