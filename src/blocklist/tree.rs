use rustc_hash::FxHashMap;
use std::borrow::Cow;
use std::io::{self, BufRead};

/// Normalizes a domain name: trims whitespace, lower-cases ASCII and strips
/// the root-label dot. Returns `None` for names with empty labels or inner
/// whitespace.
pub fn normalize(domain: &str) -> Option<Cow<'_, str>> {
    let trimmed = domain.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);

    if trimmed.is_empty()
        || trimmed.contains(char::is_whitespace)
        || trimmed.split('.').any(str::is_empty)
    {
        return None;
    }

    if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
        Some(Cow::Owned(trimmed.to_ascii_lowercase()))
    } else {
        Some(Cow::Borrowed(trimmed))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Line<'a> {
    Ignored,
    Domain(Cow<'a, str>),
    Malformed,
}

pub fn parse_line(line: &str) -> Line<'_> {
    let line = line.trim();
    // Skip comments and empty lines
    if line.is_empty() || line.starts_with('#') {
        return Line::Ignored;
    }
    match normalize(line) {
        Some(domain) => Line::Domain(domain),
        None => Line::Malformed,
    }
}

#[derive(Debug, Default)]
struct Node {
    children: FxHashMap<Box<str>, Node>,
    terminal: bool,
}

/// Blocklist keyed by reversed label sequence ("www.example.com" is stored
/// as com -> example -> www). Never mutated once published.
#[derive(Debug, Default)]
pub struct LabelTree {
    root: Node,
    len: usize,
}

impl LabelTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a tree from newline-delimited entries, returning it together
    /// with the number of malformed lines. Lines that are not valid UTF-8
    /// count as malformed.
    pub fn from_reader<R: BufRead>(reader: R) -> io::Result<(Self, usize)> {
        let mut tree = Self::new();
        let mut skipped = 0;

        for line in reader.split(b'\n') {
            let line = line?;
            let Ok(line) = std::str::from_utf8(&line) else {
                skipped += 1;
                continue;
            };
            match parse_line(line) {
                Line::Ignored => {}
                Line::Domain(domain) => {
                    tree.insert_normalized(&domain);
                }
                Line::Malformed => skipped += 1,
            }
        }

        Ok((tree, skipped))
    }

    /// Inserts a domain, normalizing it first. Returns false for malformed
    /// names and for names already present.
    pub fn insert(&mut self, domain: &str) -> bool {
        match normalize(domain) {
            Some(domain) => self.insert_normalized(&domain),
            None => false,
        }
    }

    fn insert_normalized(&mut self, domain: &str) -> bool {
        let mut node = &mut self.root;
        for label in domain.rsplit('.') {
            node = node.children.entry(label.into()).or_default();
        }
        if node.terminal {
            return false;
        }
        node.terminal = true;
        self.len += 1;
        true
    }

    /// True if `domain` or any of its parent domains is in the tree.
    pub fn contains(&self, domain: &str) -> bool {
        let Some(domain) = normalize(domain) else {
            return false;
        };

        let mut node = &self.root;
        for label in domain.rsplit('.') {
            match node.children.get(label) {
                Some(next) if next.terminal => return true,
                Some(next) => node = next,
                None => return false,
            }
        }
        false
    }

    /// Number of distinct domains.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
