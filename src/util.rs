use std::io;
use std::path::Path;

const INVALID_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
const MAX_FILENAME_LEN: usize = 100;

/// Find a free name next to `path`: `a.txt` becomes `a (1).txt`, a folder
/// `a` becomes `a (1)`. Returns the file name only, unchanged when nothing
/// is in the way.
pub fn check_duplicate_and_rename(path: &Path) -> io::Result<String> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match path.try_exists() {
        Ok(false) => return Ok(name),
        Ok(true) => {}
        Err(e) => return Err(e),
    }

    let (stem, ext) = split_extension(&name);
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let mut i = 1u32;
    loop {
        let candidate = format!("{} ({}){}", stem, i, ext);
        if !dir.join(&candidate).try_exists()? {
            return Ok(candidate);
        }
        i += 1;
    }
}

/// Remove a file, treating "already gone" as success.
pub fn safe_remove(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Replace characters that are not allowed in file names and cap the
/// length, keeping the extension.
pub fn safe_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if INVALID_FILENAME_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    if cleaned.len() <= MAX_FILENAME_LEN {
        return cleaned;
    }

    let (stem, ext) = split_extension(&cleaned);
    let ext = if ext.len() < 20 { ext } else { "" };
    let stem = if ext.is_empty() { cleaned.as_str() } else { stem };
    let mut budget = MAX_FILENAME_LEN.saturating_sub(ext.len()).max(1);
    while !stem.is_char_boundary(budget.min(stem.len())) {
        budget -= 1;
    }
    format!("{}{}", &stem[..budget.min(stem.len())], ext)
}

// Dotfiles such as `.gitignore` have no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => name.split_at(idx),
    }
}
