//! Deterministic mapping from a logical path to its on-disk locations.
//! The same logical path always maps to the same files, so a stale metadata
//! row and its parts stay correlated across restarts.

use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Stable identity of an object: SHA-256 of the logical path, lowercase hex.
pub fn hash_hex(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Directory holding every part of one object. Two-level hex fan-out bounds
/// directory size.
pub fn object_data_dir(root: &Path, hash_hex: &str) -> PathBuf {
    root.join("data").join(&hash_hex[0..2]).join(&hash_hex[2..4]).join(hash_hex)
}

/// Directory holding every bitmap of one object.
pub fn object_bitmap_dir(root: &Path, hash_hex: &str) -> PathBuf {
    root.join("bitmap").join(&hash_hex[0..2]).join(&hash_hex[2..4]).join(hash_hex)
}

pub fn data_path(root: &Path, hash_hex: &str, part_idx: u64) -> PathBuf {
    object_data_dir(root, hash_hex).join(format!("part_{:08}", part_idx))
}

pub fn bitmap_path(root: &Path, hash_hex: &str, part_idx: u64) -> PathBuf {
    object_bitmap_dir(root, hash_hex).join(format!("part_{:08}.bmp", part_idx))
}

pub fn meta_db(root: &Path) -> PathBuf {
    root.join("metadata.db")
}

/// Parses the part index back out of a bitmap file name, for recovery scans.
pub fn bitmap_part_idx(file_name: &str) -> Option<u64> {
    file_name.strip_prefix("part_")?.strip_suffix(".bmp")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_lowercase_hex() {
        let hh = hash_hex("/a.txt");
        assert_eq!(hh.len(), 64);
        assert!(hh.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hh, hash_hex("/a.txt"));
        assert_ne!(hh, hash_hex("/b.txt"));
    }

    #[test]
    fn paths_follow_fanout_convention() {
        let root = Path::new("/cache");
        let hh = hash_hex("/a.txt");
        let dp = data_path(root, &hh, 3);
        let expect = format!("/cache/data/{}/{}/{}/part_00000003", &hh[0..2], &hh[2..4], hh);
        assert_eq!(dp, PathBuf::from(expect));
        let bp = bitmap_path(root, &hh, 0);
        assert!(bp.to_string_lossy().ends_with("part_00000000.bmp"));
        assert!(bp.starts_with("/cache/bitmap"));
        assert_eq!(meta_db(root), PathBuf::from("/cache/metadata.db"));
    }

    #[test]
    fn bitmap_file_name_round_trip() {
        assert_eq!(bitmap_part_idx("part_00000042.bmp"), Some(42));
        assert_eq!(bitmap_part_idx("part_00000042"), None);
        assert_eq!(bitmap_part_idx("other.bmp"), None);
    }
}
