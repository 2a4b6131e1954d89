//! Selective-sync filter.
//!
//! A tree's sync list is a set of paths forming a prefix trie. A path is
//! in scope iff it is an entry itself, a descendant of an entry, or an
//! ancestor of one (ancestors must be walked so the entries underneath
//! them can be reached).

use std::collections::HashMap;

/// How a path relates to the sync list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    /// The path is an entry.
    Current,
    /// The path is an ancestor of at least one entry.
    Parent,
    /// The path lies underneath an entry.
    Child,
    /// The path is unrelated to every entry.
    Stranger,
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    terminal: bool,
}

/// Prefix trie over database-fixed paths.
#[derive(Default)]
pub struct SyncListTrie {
    root: Node,
    len: usize,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl SyncListTrie {
    /// Build from the stored entries of one tree.
    pub fn new(paths: &[String]) -> Self {
        let mut trie = Self::default();
        for path in paths {
            trie.add(path);
        }
        trie
    }

    /// An empty list means no filter: everything is in scope.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add an entry.
    pub fn add(&mut self, path: &str) {
        let mut node = &mut self.root;
        for seg in segments(path) {
            node = node.children.entry(seg.to_string()).or_default();
        }
        if !node.terminal {
            node.terminal = true;
            self.len += 1;
        }
    }

    /// Classify a path against the entries.
    pub fn find(&self, path: &str) -> PathType {
        if self.root.terminal {
            // "/" in the list puts everything in scope.
            return if path == "/" {
                PathType::Current
            } else {
                PathType::Child
            };
        }
        let mut node = &self.root;
        let mut iter = segments(path).peekable();
        while let Some(seg) = iter.next() {
            match node.children.get(seg) {
                Some(next) => {
                    node = next;
                    if node.terminal {
                        return if iter.peek().is_none() {
                            PathType::Current
                        } else {
                            PathType::Child
                        };
                    }
                }
                None => return PathType::Stranger,
            }
        }
        // All segments consumed without reaching an entry.
        if node.children.is_empty() {
            PathType::Stranger
        } else {
            PathType::Parent
        }
    }

    /// Whether a path must be synchronized (in scope).
    pub fn need_sync(&self, path: &str) -> bool {
        self.is_empty() || self.find(path) != PathType::Stranger
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie(paths: &[&str]) -> SyncListTrie {
        SyncListTrie::new(&paths.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn empty_list_syncs_everything() {
        let t = trie(&[]);
        assert!(t.need_sync("/anything/at/all"));
    }

    #[test]
    fn classification() {
        let t = trie(&["/photos/2024"]);
        assert_eq!(t.find("/photos/2024"), PathType::Current);
        assert_eq!(t.find("/photos/2024/jan/pic.jpg"), PathType::Child);
        assert_eq!(t.find("/photos"), PathType::Parent);
        assert_eq!(t.find("/photos/2025"), PathType::Stranger);
        assert_eq!(t.find("/docs"), PathType::Stranger);
    }

    #[test]
    fn need_sync_matches_scope() {
        let t = trie(&["/photos/2024", "/docs"]);
        assert!(t.need_sync("/photos"));
        assert!(t.need_sync("/photos/2024/x"));
        assert!(t.need_sync("/docs/readme.md"));
        assert!(!t.need_sync("/photos/2025/x"));
        assert!(!t.need_sync("/music"));
    }

    #[test]
    fn root_entry_covers_all() {
        let mut t = SyncListTrie::default();
        t.add("/");
        assert_eq!(t.find("/"), PathType::Current);
        assert_eq!(t.find("/any"), PathType::Child);
        assert!(t.need_sync("/any/depth"));
    }
}
