//! Local filesystem helpers built on capability handles.

use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is unset the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use vigil::fs::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.ssh/id_ed25519"), format!("{home}/.ssh/id_ed25519"));
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Reads a UTF-8 file.
///
/// # Errors
///
/// Returns the underlying I/O error when the directory or file cannot be
/// opened or the content is not valid UTF-8.
pub fn read_to_string(path: &Utf8Path) -> io::Result<String> {
    let (dir, name) = open_parent(path)?;
    dir.read_to_string(name)
}

/// Reads a file as raw bytes.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be read.
pub fn read(path: &Utf8Path) -> io::Result<Vec<u8>> {
    let (dir, name) = open_parent(path)?;
    dir.read(name)
}

/// Creates or truncates `path` and writes `contents` to it.
///
/// # Errors
///
/// Returns the underlying I/O error when the parent directory cannot be
/// opened or the write fails.
pub fn write(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    let (dir, name) = open_parent(path)?;
    dir.write(name, contents)
}

/// Removes a file.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be removed.
pub fn remove_file(path: &Utf8Path) -> io::Result<()> {
    let (dir, name) = open_parent(path)?;
    dir.remove_file(name)
}

fn open_parent(path: &Utf8Path) -> io::Result<(Dir, &Utf8Path)> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no file name: {path}"),
        )
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok((dir, Utf8Path::new(name)))
}
