//! Filesystem access behind a trait so the whole engine can run against an
//! in-memory tree in tests.
//!
//! All paths are source-root-relative, forward-slash strings. Globs support
//! `*` within one path segment and `**` across segments.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &str) -> io::Result<String>;
    fn exists(&self, path: &str) -> bool;
    /// Files matching the pattern, sorted.
    fn glob_files(&self, pattern: &str) -> Vec<String>;
    /// Directories matching the pattern, sorted.
    fn glob_dirs(&self, pattern: &str) -> Vec<String>;
}

/// Matches a glob pattern against a relative path, segment by segment.
pub(crate) fn glob_match(pattern: &str, path: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let segs: Vec<&str> = path.split('/').collect();
    match_segments(&pat, &segs)
}

fn match_segments(pat: &[&str], segs: &[&str]) -> bool {
    match pat.first() {
        None => segs.is_empty(),
        Some(&"**") => {
            // `**` may consume zero or more whole segments.
            (0..=segs.len()).any(|n| match_segments(&pat[1..], &segs[n..]))
        }
        Some(p) => match segs.first() {
            Some(s) if match_one(p, s) => match_segments(&pat[1..], &segs[1..]),
            _ => false,
        },
    }
}

/// `*` within one segment matches any run of non-separator characters.
fn match_one(pat: &str, seg: &str) -> bool {
    let pat: Vec<char> = pat.chars().collect();
    let seg: Vec<char> = seg.chars().collect();
    fn rec(pat: &[char], seg: &[char]) -> bool {
        match pat.first() {
            None => seg.is_empty(),
            Some('*') => (0..=seg.len()).any(|n| rec(&pat[1..], &seg[n..])),
            Some(c) => seg.first() == Some(c) && rec(&pat[1..], &seg[1..]),
        }
    }
    rec(&pat, &seg)
}

pub(crate) fn has_glob(pattern: &str) -> bool {
    pattern.contains('*')
}

/// The real filesystem, rooted at the source directory.
pub struct RealFs {
    root: PathBuf,
}

impl RealFs {
    pub fn new(root: impl Into<PathBuf>) -> RealFs {
        RealFs { root: root.into() }
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn rel(&self, abs: &Path) -> Option<String> {
        abs.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }

    fn walk_matching(&self, pattern: &str, want_dirs: bool) -> Vec<String> {
        // Descend only from the longest glob-free prefix.
        let prefix: Vec<&str> =
            pattern.split('/').take_while(|seg| !has_glob(seg) && *seg != "**").collect();
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.root.join(prefix.join("/"))
        };
        let mut out: Vec<String> = WalkDir::new(start)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| if want_dirs { e.file_type().is_dir() } else { e.file_type().is_file() })
            .filter_map(|e| self.rel(e.path()))
            .filter(|rel| !rel.is_empty() && glob_match(pattern, rel))
            .collect();
        out.sort();
        out
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &str) -> io::Result<String> {
        std::fs::read_to_string(self.abs(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.abs(path).is_file()
    }

    fn glob_files(&self, pattern: &str) -> Vec<String> {
        if !has_glob(pattern) {
            return if self.exists(pattern) { vec![pattern.to_string()] } else { vec![] };
        }
        self.walk_matching(pattern, false)
    }

    fn glob_dirs(&self, pattern: &str) -> Vec<String> {
        if !has_glob(pattern) {
            return if self.abs(pattern).is_dir() { vec![pattern.to_string()] } else { vec![] };
        }
        self.walk_matching(pattern, true)
    }
}

/// An in-memory tree for tests. Directories exist implicitly wherever a file
/// path implies them.
#[derive(Default)]
pub struct MockFs {
    files: RwLock<BTreeMap<String, String>>,
}

impl MockFs {
    pub fn new() -> MockFs {
        MockFs::default()
    }

    pub fn with_files<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> MockFs {
        let fs = MockFs::new();
        for (path, contents) in entries {
            fs.add(path, contents);
        }
        fs
    }

    pub fn add(&self, path: &str, contents: &str) {
        self.files.write().insert(path.to_string(), contents.to_string());
    }

    fn dirs(&self) -> Vec<String> {
        let mut dirs = std::collections::BTreeSet::new();
        for path in self.files.read().keys() {
            let mut dir = path.as_str();
            while let Some(idx) = dir.rfind('/') {
                dir = &dir[..idx];
                dirs.insert(dir.to_string());
            }
        }
        dirs.into_iter().collect()
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &str) -> io::Result<String> {
        self.files.read().get(path).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no such file: {}", path))
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.files.read().contains_key(path)
    }

    fn glob_files(&self, pattern: &str) -> Vec<String> {
        self.files.read().keys().filter(|p| glob_match(pattern, p)).cloned().collect()
    }

    fn glob_dirs(&self, pattern: &str) -> Vec<String> {
        self.dirs().into_iter().filter(|d| glob_match(pattern, d)).collect()
    }
}

/// The directory part of a relative path, `""` for top-level files.
pub(crate) fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}
