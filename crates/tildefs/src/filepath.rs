//! Normalized, sanitized store paths.
//!
//! A [`Filepath`] is a sequence of components rooted at the filesystem root.
//! There is no notion of a working directory and no component may step
//! upwards: `.` and `..` (or any other all-dot name) are rejected at
//! construction rather than resolved. Separators may be `/` or `\`, and
//! repeated separators collapse.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;

use crate::error::{FilestoreError, FilestoreResult};

/// Name of the child that holds a node's own value.
pub const RESERVED_COMPONENT: &str = "~";

static COMPONENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9!@_][-A-Za-z0-9!@._ ]*$").expect("component pattern compiles")
});

#[cfg(windows)]
static DRIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]:$").expect("drive pattern compiles"));

/// An immutable store path.
///
/// Cloning is cheap (one `Arc` bump). Equality, hashing and containment work
/// on components, never on the rendered string.
#[derive(Clone)]
pub struct Filepath {
    inner: Arc<Inner>,
}

struct Inner {
    /// Drive prefix (`C:`) on Windows, `None` elsewhere.
    prefix: Option<String>,
    cmps: Vec<String>,
    resolved: OnceCell<PathBuf>,
}

fn validate(cmp: &str) -> FilestoreResult<()> {
    if cmp == RESERVED_COMPONENT {
        return Ok(());
    }
    if cmp.chars().all(|c| c == '.') || !COMPONENT.is_match(cmp) {
        return Err(FilestoreError::invalid_component(cmp));
    }
    Ok(())
}

/// Split on either separator, dropping empty pieces. Nothing is validated.
fn split_raw<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .flat_map(|part| {
            part.as_ref()
                .split(['/', '\\'])
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn split_parts<I, S>(parts: I) -> FilestoreResult<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let cmps = split_raw(parts);
    for cmp in &cmps {
        validate(cmp)?;
    }
    Ok(cmps)
}

impl Filepath {
    fn from_parts(prefix: Option<String>, cmps: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                prefix,
                cmps,
                resolved: OnceCell::new(),
            }),
        }
    }

    /// The filesystem root.
    pub fn root() -> Self {
        Self::from_parts(None, Vec::new())
    }

    /// Build a path from one or more strings, each of which may itself
    /// contain separators.
    ///
    /// ```
    /// # use tildefs::Filepath;
    /// let a = Filepath::new(["srv//store", "users\\amy"]).unwrap();
    /// let b: Filepath = "/srv/store/users/amy".parse().unwrap();
    /// assert_eq!(a, b);
    /// ```
    pub fn new<I, S>(parts: I) -> FilestoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        #[allow(unused_mut)]
        let mut cmps = split_raw(parts);
        #[allow(unused_mut)]
        let mut prefix = None;

        #[cfg(windows)]
        if cmps.first().is_some_and(|c| DRIVE.is_match(c)) {
            prefix = Some(cmps.remove(0));
        }

        for cmp in &cmps {
            validate(cmp)?;
        }
        Ok(Self::from_parts(prefix, cmps))
    }

    /// Build a path from an absolute real-filesystem path, for use as a
    /// store root.
    ///
    /// The component character rules govern names inside a store, not the
    /// directory it lives in, so components here are taken as they are
    /// (`.local`, `+`, non-ASCII). Relative paths, `.`/`..` and non-UTF-8
    /// names are still rejected.
    pub fn from_real(path: impl AsRef<Path>) -> FilestoreResult<Self> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(FilestoreError::invalid_component(path.display().to_string()));
        }

        let mut prefix = None;
        let mut cmps = Vec::new();
        for component in path.components() {
            match component {
                Component::Prefix(p) => {
                    prefix = Some(p.as_os_str().to_string_lossy().into_owned());
                }
                Component::RootDir => {}
                Component::Normal(os) => {
                    let cmp = os.to_str().ok_or_else(|| {
                        FilestoreError::invalid_component(os.to_string_lossy().into_owned())
                    })?;
                    cmps.push(cmp.to_string());
                }
                Component::CurDir | Component::ParentDir => {
                    let os = component.as_os_str().to_string_lossy().into_owned();
                    return Err(FilestoreError::invalid_component(os));
                }
            }
        }

        Ok(Self::from_parts(prefix, cmps))
    }

    /// Components, outermost first.
    pub fn components(&self) -> &[String] {
        &self.inner.cmps
    }

    /// Number of components below the root.
    pub fn depth(&self) -> usize {
        self.inner.cmps.len()
    }

    /// Final component, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.inner.cmps.last().map(String::as_str)
    }

    /// Whether any component is the reserved `~` value holder.
    pub fn has_reserved(&self) -> bool {
        self.inner.cmps.iter().any(|c| c == RESERVED_COMPONENT)
    }

    /// Append components.
    pub fn kid<I, S>(&self, parts: I) -> FilestoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extra = split_parts(parts)?;
        let mut cmps = self.inner.cmps.clone();
        cmps.extend(extra);
        Ok(Self::from_parts(self.inner.prefix.clone(), cmps))
    }

    /// Replace the final component.
    pub fn sib(&self, part: impl AsRef<str>) -> FilestoreResult<Self> {
        self.par(1).kid([part])
    }

    /// Drop `n` trailing components, stopping at the root.
    pub fn par(&self, n: usize) -> Self {
        self.truncated(self.depth().saturating_sub(n))
    }

    fn truncated(&self, depth: usize) -> Self {
        Self::from_parts(
            self.inner.prefix.clone(),
            self.inner.cmps[..depth.min(self.depth())].to_vec(),
        )
    }

    /// Whether `other` is this path or one of its descendants.
    pub fn contains(&self, other: &Filepath) -> bool {
        self.inner.prefix == other.inner.prefix && other.inner.cmps.starts_with(&self.inner.cmps)
    }

    /// Every ancestor of `to` strictly between `self` and `to`, outermost
    /// first. Empty when `to` is not a strict descendant.
    pub fn lineage(&self, to: &Filepath) -> Lineage {
        let (next, end) = if self.contains(to) {
            (self.depth() + 1, to.depth())
        } else {
            (0, 0)
        };
        Lineage {
            to: to.clone(),
            next,
            end,
        }
    }

    /// Absolute real-filesystem location. Computed once per instance.
    pub fn resolve(&self) -> &Path {
        self.inner.resolved.get_or_init(|| {
            let mut buf = PathBuf::new();
            match &self.inner.prefix {
                Some(prefix) => buf.push(format!("{prefix}{}", std::path::MAIN_SEPARATOR)),
                None => buf.push(std::path::MAIN_SEPARATOR_STR),
            }
            for cmp in &self.inner.cmps {
                buf.push(cmp);
            }
            debug_assert!(buf.has_root(), "resolved path lacks a root: {}", buf.display());
            buf
        })
    }
}

/// Lazy ancestor sequence produced by [`Filepath::lineage`].
#[derive(Debug, Clone)]
pub struct Lineage {
    to: Filepath,
    next: usize,
    end: usize,
}

impl Iterator for Lineage {
    type Item = Filepath;

    fn next(&mut self) -> Option<Filepath> {
        if self.next >= self.end {
            return None;
        }
        let path = self.to.truncated(self.next);
        self.next += 1;
        Some(path)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.end.saturating_sub(self.next);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Lineage {}

impl PartialEq for Filepath {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.prefix == other.inner.prefix && self.inner.cmps == other.inner.cmps)
    }
}

impl Eq for Filepath {}

impl std::hash::Hash for Filepath {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.prefix.hash(state);
        self.inner.cmps.hash(state);
    }
}

impl fmt::Display for Filepath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.inner.prefix {
            f.write_str(prefix)?;
        }
        if self.inner.cmps.is_empty() {
            return f.write_str("/");
        }
        for cmp in &self.inner.cmps {
            write!(f, "/{cmp}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Filepath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filepath({self})")
    }
}

impl FromStr for Filepath {
    type Err = FilestoreError;

    fn from_str(s: &str) -> FilestoreResult<Self> {
        Self::new([s])
    }
}
