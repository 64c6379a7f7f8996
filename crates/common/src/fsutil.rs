//! Directory size accounting and human-readable sizes.

use std::path::Path;

use anyhow::{Context, Result};

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Total size of all regular files below `path`, recursively.
///
/// Symbolic links are neither followed nor counted, whether they point at
/// files or directories.
pub fn directory_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("read directory {}", path.display()))?
    {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            total += directory_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Format a byte count as `"{value:.2} {unit}"`, dividing by 1024 per step.
///
/// Picks the first unit where the value drops below 1024; anything at or
/// beyond 1024 TB is printed in PB.
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.2} PB")
}

/// Sorted entry names of a directory.
pub fn list_dir(path: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(path)
        .with_context(|| format!("read directory {}", path.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn size_sums_nested_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), vec![0u8; 100]).unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("sub/b.bin"), vec![0u8; 250]).unwrap();
        fs::write(dir.path().join("sub/deeper/c.bin"), vec![0u8; 7]).unwrap();
        assert_eq!(directory_size(dir.path()).unwrap(), 357);
    }

    #[cfg(unix)]
    #[test]
    fn size_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.bin"), vec![0u8; 64]).unwrap();
        fs::write(outside.path().join("big.bin"), vec![0u8; 4096]).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.bin"), dir.path().join("link.bin"))
            .unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("linked_dir")).unwrap();
        assert_eq!(directory_size(dir.path()).unwrap(), 64);
    }

    #[test]
    fn size_of_empty_dir_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(directory_size(dir.path()).unwrap(), 0);
    }

    #[test]
    fn size_of_missing_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(directory_size(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn format_picks_smallest_unit_below_1024() {
        assert_eq!(format_size(0), "0.00 B");
        assert_eq!(format_size(1023), "1023.00 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024u64.pow(3) / 2), "1.50 GB");
        assert_eq!(format_size(2 * 1024u64.pow(4)), "2.00 TB");
    }

    #[test]
    fn format_falls_back_to_petabytes() {
        assert_eq!(format_size(1024u64.pow(5)), "1.00 PB");
        assert_eq!(format_size(4096 * 1024u64.pow(5)), "4096.00 PB");
    }

    #[test]
    fn list_dir_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.json"), "{}").unwrap();
        fs::write(dir.path().join("a.json"), "{}").unwrap();
        assert_eq!(list_dir(dir.path()).unwrap(), vec!["a.json", "b.json"]);
    }
}
