//! Resolution of declared input and output specs against the filesystem.
//!
//! A spec is one of:
//!
//! * a literal path, e.g. `Cargo.toml`, which resolves to itself if it exists;
//! * a directory marker, e.g. `assets/`, which resolves to the directory
//!   itself (not its contents) if it exists;
//! * a pattern, e.g. `input/*.txt` or `**/res/*.txt`, where `*` matches
//!   entities directly inside a directory and a `**` component descends into
//!   subdirectories.
//!
//! Nothing that fails to exist is an error, it simply resolves to nothing.

use std::collections::BTreeSet;
use std::fs;
use std::io;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn is_pattern(component: &str) -> bool {
    component.contains(['*', '?', '['])
}

fn is_missing(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

fn is_dir_marker(spec: &str) -> bool {
    spec.ends_with('/') || spec.ends_with(std::path::MAIN_SEPARATOR)
}

/// Joins `path` onto `root` without prefixing paths with `./` or leaving a
/// trailing separator behind.
fn anchor(root: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if root.as_str().is_empty() || root == "." {
        path.to_path_buf()
    } else if path.as_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Resolves a single spec relative to `root`.
pub fn resolve(spec: &str, root: &Utf8Path) -> io::Result<BTreeSet<Utf8PathBuf>> {
    let mut found = BTreeSet::new();

    if spec.is_empty() {
        return Ok(found);
    }

    let dirs_only = is_dir_marker(spec);
    let path = Utf8Path::new(spec);

    // Split path into static root and dynamic suffix (containing wildcards)
    let components: Vec<_> = path
        .components()
        .filter(|c| !matches!(c, Utf8Component::CurDir))
        .collect();
    let split_idx = components
        .iter()
        .position(|c| is_pattern(c.as_str()))
        .unwrap_or(components.len());

    let base: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix: Vec<&str> = components
        .iter()
        .skip(split_idx)
        .map(Utf8Component::as_str)
        .collect();

    let base = anchor(root, &base);

    if suffix.is_empty() {
        let exists = match fs::metadata(&base) {
            Ok(meta) => !dirs_only || meta.is_dir(),
            Err(e) if is_missing(&e) => false,
            Err(e) => return Err(e),
        };

        if exists {
            found.insert(base);
        }

        return Ok(found);
    }

    let pattern = Pattern::new(&suffix.join("/"))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{spec}: {e}")))?;

    let depth = if suffix.contains(&"**") {
        None
    } else {
        Some(suffix.len())
    };

    walk(&base, &pattern, depth, dirs_only, &mut found)?;

    Ok(found)
}

/// Resolves every spec and returns the union of the results.
pub fn resolve_all<I, S>(specs: I, root: &Utf8Path) -> io::Result<BTreeSet<Utf8PathBuf>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut found = BTreeSet::new();
    for spec in specs {
        found.append(&mut resolve(spec.as_ref(), root)?);
    }
    Ok(found)
}

/// Walks `base` down to `depth` levels (unbounded for `None`) and collects
/// every entity whose path relative to `base` matches `pattern`.
///
/// Symbolic links are followed; links back to an ancestor are skipped, so
/// loops terminate.
fn walk(
    base: &Utf8Path,
    pattern: &Pattern,
    depth: Option<usize>,
    dirs_only: bool,
    found: &mut BTreeSet<Utf8PathBuf>,
) -> io::Result<()> {
    let dir = if base.as_str().is_empty() {
        Utf8Path::new(".")
    } else {
        base
    };

    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(()),
        Err(e) if is_missing(&e) => return Ok(()),
        Err(e) => return Err(e),
    }

    let mut walker = WalkDir::new(dir).min_depth(1).follow_links(true);
    if let Some(depth) = depth {
        walker = walker.max_depth(depth);
    }

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.loop_ancestor().is_some() => {
                tracing::debug!("skipping symbolic link loop at {:?}", e.path());
                continue;
            }
            // Dangling links and entities removed while walking.
            Err(e) if e.io_error().is_some_and(is_missing) => continue,
            Err(e) => return Err(e.into()),
        };

        let Some(relative) = entry
            .path()
            .strip_prefix(dir)
            .ok()
            .and_then(Utf8Path::from_path)
        else {
            tracing::debug!("skipping non UTF-8 path {:?}", entry.path());
            continue;
        };

        let is_dir = entry.file_type().is_dir();

        if pattern.matches_path_with(relative.as_std_path(), MATCH_OPTIONS) && (is_dir || !dirs_only) {
            found.insert(anchor(base, relative));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        fs::create_dir_all(root.join("res/nested/deep")).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("b.md"), "b").unwrap();
        fs::write(root.join("res/c.txt"), "c").unwrap();
        fs::write(root.join("res/d.png"), "d").unwrap();
        fs::write(root.join("res/nested/e.txt"), "e").unwrap();
        fs::write(root.join("res/nested/deep/f.txt"), "f").unwrap();

        (dir, root)
    }

    fn names(root: &Utf8Path, set: BTreeSet<Utf8PathBuf>) -> Vec<String> {
        set.into_iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_literal_file() {
        let (_guard, root) = setup();
        assert_eq!(names(&root, resolve("a.txt", &root).unwrap()), ["a.txt"]);
    }

    #[test]
    fn test_missing_literal_is_empty() {
        let (_guard, root) = setup();
        assert!(resolve("missing.txt", &root).unwrap().is_empty());
        assert!(resolve("missing/", &root).unwrap().is_empty());
        assert!(resolve("missing/*.txt", &root).unwrap().is_empty());
    }

    #[test]
    fn test_directory_marker_is_the_directory_itself() {
        let (_guard, root) = setup();
        assert_eq!(names(&root, resolve("res/", &root).unwrap()), ["res"]);
        // a file is not a directory
        assert!(resolve("a.txt/", &root).unwrap().is_empty());
    }

    #[test]
    fn test_single_level_wildcard() {
        let (_guard, root) = setup();
        assert_eq!(names(&root, resolve("*.txt", &root).unwrap()), ["a.txt"]);
        assert_eq!(
            names(&root, resolve("res/*", &root).unwrap()),
            ["res/c.txt", "res/d.png", "res/nested"]
        );
    }

    #[test]
    fn test_recursive_wildcard() {
        let (_guard, root) = setup();
        assert_eq!(
            names(&root, resolve("res/**/*.txt", &root).unwrap()),
            ["res/c.txt", "res/nested/deep/f.txt", "res/nested/e.txt"]
        );
        assert_eq!(
            names(&root, resolve("**/nested/*.txt", &root).unwrap()),
            ["res/nested/e.txt"]
        );
    }

    #[test]
    fn test_resolve_all_unions() {
        let (_guard, root) = setup();
        let found = resolve_all(["*.md", "res/*.txt", "a.txt", "*.txt"], &root).unwrap();
        assert_eq!(names(&root, found), ["a.txt", "b.md", "res/c.txt"]);
    }

    #[test]
    fn test_invalid_pattern() {
        let (_guard, root) = setup();
        let err = resolve("res/[*.txt", &root).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_terminates() {
        let (_guard, root) = setup();
        std::os::unix::fs::symlink(root.join("res"), root.join("res/nested/loop")).unwrap();

        let found = resolve("res/**/*.txt", &root).unwrap();
        assert!(found.contains(&root.join("res/nested/deep/f.txt")));
        assert!(found.contains(&root.join("res/c.txt")));
    }

    #[test]
    fn test_current_dir_prefix_is_ignored() {
        let (_guard, root) = setup();
        let found = resolve_all(["./res/*.txt", "res/*.txt", "./a.txt"], &root).unwrap();
        assert_eq!(names(&root, found), ["a.txt", "res/c.txt"]);
    }
}
