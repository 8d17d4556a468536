//! PATH resolution and candidate trial

use std::env;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Component, Path, PathBuf};

use tracing::trace;

/// The POSIX default search path, used when `PATH` is unset
#[cfg(target_vendor = "apple")]
pub const POSIX_DEFAULT_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";
#[cfg(not(target_vendor = "apple"))]
pub const POSIX_DEFAULT_PATH: &str = "/usr/bin:/bin";

/// Where the directory list for PATH search comes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CustomPath {
    /// The inherited `PATH` variable, or the POSIX default when it is unset
    #[default]
    Inherit,
    /// The POSIX default path
    PosixDefault,
    /// These directories, verbatim; an empty entry is the current directory
    Explicit(Vec<PathBuf>),
}

/// An ordered directory list for PATH search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    pub directories: Vec<PathBuf>,
    /// Whether `directories` is the POSIX default
    pub is_posix_default: bool,
}

impl SearchPath {
    /// Resolve against the current environment
    pub fn resolve(use_path: bool, custom: &CustomPath) -> Self {
        let env_path = env::var_os("PATH");
        Self::resolve_with(use_path, custom, env_path.as_deref())
    }

    pub fn resolve_with(use_path: bool, custom: &CustomPath, env_path: Option<&OsStr>) -> Self {
        if !use_path {
            return Self {
                directories: Vec::new(),
                is_posix_default: false,
            };
        }
        match (custom, env_path) {
            (CustomPath::Explicit(dirs), _) => Self {
                directories: dirs.clone(),
                is_posix_default: false,
            },
            (CustomPath::Inherit, Some(path)) => Self {
                directories: split_path_list(path),
                is_posix_default: false,
            },
            (CustomPath::Inherit, None) | (CustomPath::PosixDefault, _) => Self::posix_default(),
        }
    }

    pub fn posix_default() -> Self {
        Self {
            directories: split_path_list(OsStr::new(POSIX_DEFAULT_PATH)),
            is_posix_default: true,
        }
    }

    /// Value for the relay's `--path` option
    ///
    /// `None` when the POSIX default is in effect, the relay falls back to it
    /// on its own. Entries are made absolute against `cwd` and entries
    /// containing `:` are dropped.
    pub fn relay_argument(&self, cwd: &Path) -> Option<OsString> {
        if self.is_posix_default {
            return None;
        }
        let mut joined = OsString::new();
        let usable = self
            .directories
            .iter()
            .map(|dir| absolutize(dir, cwd))
            .filter(|dir| !dir.as_os_str().as_bytes().contains(&b':'));
        for (i, dir) in usable.enumerate() {
            if i > 0 {
                joined.push(":");
            }
            joined.push(dir.as_os_str());
        }
        Some(joined)
    }

    /// Parse a `--path` value produced by [`SearchPath::relay_argument`]
    pub fn from_relay_argument(value: Option<&OsStr>) -> Self {
        match value {
            None => Self::posix_default(),
            Some(value) if value.is_empty() => Self {
                directories: Vec::new(),
                is_posix_default: false,
            },
            Some(value) => Self {
                directories: split_path_list(value),
                is_posix_default: false,
            },
        }
    }

    /// Paths to try for `executable`, in order
    ///
    /// A bare single component is looked up in every directory. Anything else,
    /// or an empty directory list, yields the executable alone.
    pub fn candidates(&self, executable: &Path) -> Vec<PathBuf> {
        if !is_searchable(executable) || self.directories.is_empty() {
            return vec![executable.to_path_buf()];
        }
        self.directories
            .iter()
            .map(|dir| candidate(dir, executable))
            .collect()
    }
}

/// Split a colon-separated list, keeping empty entries
pub fn split_path_list(list: &OsStr) -> Vec<PathBuf> {
    list.as_bytes()
        .split(|b| *b == b':')
        .map(|entry| PathBuf::from(OsString::from_vec(entry.to_vec())))
        .collect()
}

/// A relative path made of exactly one normal component
pub fn is_searchable(executable: &Path) -> bool {
    let bytes = executable.as_os_str().as_bytes();
    if bytes.is_empty() || bytes.contains(&b'/') {
        return false;
    }
    matches!(executable.components().next(), Some(Component::Normal(_)))
}

fn candidate(dir: &Path, component: &Path) -> PathBuf {
    if dir.as_os_str().is_empty() {
        Path::new(".").join(component)
    } else {
        dir.join(component)
    }
}

pub(crate) fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else if path.as_os_str().is_empty() {
        cwd.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Run `attempt` on each candidate until one does not fail with `ENOENT`
pub fn try_candidates<T, F>(candidates: &[PathBuf], mut attempt: F) -> io::Result<T>
where
    F: FnMut(&Path) -> io::Result<T>,
{
    let mut last = None;
    for path in candidates {
        match attempt(path) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                trace!(path = %path.display(), "Candidate not found");
                last = Some(e);
            }
            result => return result,
        }
    }
    Err(last.unwrap_or_else(|| io::Error::from_raw_os_error(libc::ENOENT)))
}
