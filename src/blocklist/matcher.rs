use super::tree::LabelTree;
use arc_swap::ArcSwap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
}

/// Published blocklist. Loads build a complete tree off to the side and
/// swap it in with a single pointer store, so readers never see a partial
/// tree.
#[derive(Debug)]
pub struct DomainMatcher {
    tree: ArcSwap<LabelTree>,
}

impl DomainMatcher {
    pub fn new() -> Self {
        Self {
            tree: ArcSwap::from_pointee(LabelTree::new()),
        }
    }

    /// Replaces the published tree with the contents of `path`. On error the
    /// previous tree stays published.
    pub fn load_file(&self, path: impl AsRef<Path>) -> io::Result<LoadReport> {
        let file = File::open(path)?;
        self.load_reader(BufReader::new(file))
    }

    pub fn load_reader<R: BufRead>(&self, reader: R) -> io::Result<LoadReport> {
        let (tree, skipped) = LabelTree::from_reader(reader)?;
        let report = LoadReport {
            loaded: tree.len(),
            skipped,
        };
        self.tree.store(Arc::new(tree));
        Ok(report)
    }

    pub fn has(&self, domain: &str) -> bool {
        self.tree.load().contains(domain)
    }

    pub fn count(&self) -> usize {
        self.tree.load().len()
    }

    /// The currently published tree.
    pub fn snapshot(&self) -> Arc<LabelTree> {
        self.tree.load_full()
    }
}

impl Default for DomainMatcher {
    fn default() -> Self {
        Self::new()
    }
}
