//! Canonicalization rule files.
//!
//! Each line holds three whitespace-separated fields:
//!
//! ```text
//! # METHOD   PRINCIPAL                         CANONICALIZATION
//! KERBEROS   /^([^\/@]+)(\/[^@]+)?@EXAMPLE\.ORG$/  \1@example.org
//! SSL        "/CN=Alice Smith/O=Example"        alice@example.org
//! GSI        /\/CN=([a-z]+)$/i                  \1@grid.example.org
//! @include   mapfile.d
//! ```
//!
//! A field may be `"quoted"` (with `\"` escapes). A principal written as
//! `/regex/` may carry the flags `i` (case-insensitive) and `U` (ungreedy).
//! Plain principals are exact-match keys; with `assume_hash` disabled they
//! are regexes too. Within one method the first matching rule in file order
//! wins. The canonicalization may refer to match groups as `\0` to `\9`.
//!
//! `@include <path>` pulls in a file, or every file in a directory sorted by
//! name. Includes are only honoured at the top level. Lines that do not
//! parse are logged and skipped.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};

use crate::config::resolve_relative;
use crate::error::{AuthError, AuthResult};

/// How a rule matches principals.
#[derive(Debug, Clone)]
pub enum MapRule {
    /// Exact principal lookups, coalesced from consecutive literal lines.
    Literal(HashMap<String, String>),
    /// One regex rule.
    Pattern {
        /// Compiled principal pattern.
        regex: Regex,
        /// Canonicalization template.
        template: String,
    },
}

/// A parsed rule file.
#[derive(Debug, Clone, Default)]
pub struct MapFile {
    methods: HashMap<String, Vec<MapRule>>,
    rules: usize,
    skipped: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum FieldKind {
    Plain,
    Quoted,
    Regex { caseless: bool, ungreedy: bool },
}

#[derive(Debug)]
struct Field {
    text: String,
    kind: FieldKind,
}

/// Splits the next field off `input`, returning it and the rest.
fn next_field(input: &str, allow_regex: bool) -> Option<(Field, &str)> {
    let s = input.trim_start();
    let mut chars = s.char_indices().peekable();
    let (_, first) = chars.next()?;

    if first == '"' || (allow_regex && first == '/') {
        let mut text = String::new();
        let mut end = None;
        while let Some((i, c)) = chars.next() {
            if c == '\\' {
                if let Some(&(_, next)) = chars.peek() {
                    if next == first {
                        text.push(next);
                        chars.next();
                        continue;
                    }
                }
                text.push(c);
            } else if c == first {
                end = Some(i + c.len_utf8());
                break;
            } else {
                text.push(c);
            }
        }
        let end = end?;
        let mut rest = &s[end..];
        let kind = if first == '"' {
            FieldKind::Quoted
        } else {
            let flags_len = rest
                .find(char::is_whitespace)
                .unwrap_or(rest.len());
            let flags = &rest[..flags_len];
            if flags.chars().any(|c| c != 'i' && c != 'U') {
                return None;
            }
            rest = &rest[flags_len..];
            FieldKind::Regex {
                caseless: flags.contains('i'),
                ungreedy: flags.contains('U'),
            }
        };
        return Some((Field { text, kind }, rest));
    }

    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((
        Field {
            text: s[..end].to_owned(),
            kind: FieldKind::Plain,
        },
        &s[end..],
    ))
}

/// Expands `\0`..`\9` in `template` with `groups`.
///
/// A reference to a group the pattern does not have, and any other
/// backslash, is copied through literally.
#[must_use]
pub fn substitute(template: &str, groups: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some(d @ '0'..='9') => {
                let idx = (d as usize) - ('0' as usize);
                if let Some(group) = groups.get(idx) {
                    out.push_str(group);
                    chars.next();
                } else {
                    out.push('\\');
                }
            }
            _ => out.push('\\'),
        }
    }
    out
}

impl MapFile {
    /// Parses rules from text. `origin` resolves relative includes.
    #[must_use]
    pub fn parse_str(text: &str, assume_hash: bool, origin: Option<&Path>) -> Self {
        let mut map = Self::default();
        map.parse_into(text, assume_hash, origin, true);
        map
    }

    /// Reads and parses a rule file.
    pub fn load(path: &Path, assume_hash: bool) -> AuthResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| AuthError::config(format!("cannot read {}: {e}", path.display())))?;
        let map = Self::parse_str(&text, assume_hash, Some(path));
        tracing::info!(
            path = %path.display(),
            rules = map.rules,
            skipped = map.skipped,
            "loaded canonicalization map"
        );
        Ok(map)
    }

    fn parse_into(&mut self, text: &str, assume_hash: bool, origin: Option<&Path>, top: bool) {
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(target) = line.strip_prefix("@include") {
                self.include(target.trim(), assume_hash, origin, top, lineno + 1);
                continue;
            }
            if let Err(reason) = self.parse_rule(line, assume_hash) {
                self.skipped += 1;
                tracing::warn!(
                    file = ?origin.map(Path::display).map(|d| d.to_string()),
                    line = lineno + 1,
                    %reason,
                    "skipping invalid map line"
                );
            }
        }
    }

    fn include(
        &mut self,
        target: &str,
        assume_hash: bool,
        origin: Option<&Path>,
        top: bool,
        lineno: usize,
    ) {
        if !top {
            tracing::warn!(line = lineno, "nested @include ignored");
            self.skipped += 1;
            return;
        }
        if target.is_empty() {
            tracing::warn!(line = lineno, "@include without a path");
            self.skipped += 1;
            return;
        }
        let path = origin.map_or_else(
            || PathBuf::from(target),
            |o| resolve_relative(o, Path::new(target)),
        );
        let files = if path.is_dir() {
            match fs::read_dir(&path) {
                Ok(entries) => {
                    let mut files: Vec<PathBuf> = entries
                        .filter_map(Result::ok)
                        .map(|e| e.path())
                        .filter(|p| p.is_file())
                        .filter(|p| {
                            p.file_name()
                                .and_then(|n| n.to_str())
                                .is_some_and(|n| !n.starts_with('.') && !n.ends_with('~'))
                        })
                        .collect();
                    files.sort();
                    files
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot list include dir");
                    return;
                }
            }
        } else {
            vec![path]
        };
        for file in files {
            match fs::read_to_string(&file) {
                Ok(text) => self.parse_into(&text, assume_hash, Some(&file), false),
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "cannot read include");
                }
            }
        }
    }

    fn parse_rule(&mut self, line: &str, assume_hash: bool) -> Result<(), String> {
        let (method, rest) = next_field(line, false).ok_or("missing method")?;
        let (principal, rest) = next_field(rest, true).ok_or("missing or unterminated principal")?;
        let (canon, _) = next_field(rest, false).ok_or("missing canonicalization")?;

        let method = method.text.to_ascii_uppercase();
        let rules = self.methods.entry(method).or_default();

        let regex_flags = match principal.kind {
            FieldKind::Regex { caseless, ungreedy } => Some((caseless, ungreedy)),
            FieldKind::Plain | FieldKind::Quoted if !assume_hash => Some((false, false)),
            FieldKind::Plain | FieldKind::Quoted => None,
        };

        match regex_flags {
            Some((caseless, ungreedy)) => {
                let regex = RegexBuilder::new(&principal.text)
                    .case_insensitive(caseless)
                    .swap_greed(ungreedy)
                    .build()
                    .map_err(|e| format!("bad regex {:?}: {e}", principal.text))?;
                rules.push(MapRule::Pattern {
                    regex,
                    template: canon.text,
                });
            }
            None => {
                if let Some(MapRule::Literal(table)) = rules.last_mut() {
                    table.entry(principal.text).or_insert(canon.text);
                } else {
                    let mut table = HashMap::new();
                    table.insert(principal.text, canon.text);
                    rules.push(MapRule::Literal(table));
                }
            }
        }
        self.rules += 1;
        Ok(())
    }

    /// Maps `principal` under `method`, first matching rule wins.
    #[must_use]
    pub fn map(&self, method: &str, principal: &str) -> Option<String> {
        let rules = self.methods.get(&method.to_ascii_uppercase())?;
        for rule in rules {
            match rule {
                MapRule::Literal(table) => {
                    if let Some(template) = table.get(principal) {
                        return Some(substitute(template, &[principal]));
                    }
                }
                MapRule::Pattern { regex, template } => {
                    if let Some(caps) = regex.captures(principal) {
                        let groups: Vec<&str> = caps
                            .iter()
                            .map(|m| m.map_or("", |m| m.as_str()))
                            .collect();
                        return Some(substitute(template, &groups));
                    }
                }
            }
        }
        None
    }

    /// Number of rules accepted.
    #[must_use]
    pub const fn rule_count(&self) -> usize {
        self.rules
    }

    /// Number of lines skipped as invalid.
    #[must_use]
    pub const fn skipped_count(&self) -> usize {
        self.skipped
    }

    /// Returns `true` if some rule exists for `method`.
    #[must_use]
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(&method.to_ascii_uppercase())
    }
}
