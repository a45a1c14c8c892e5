//! Key to path derivation
//!
//! The default transform hashes the lookup key with SHA-1 and splits the hex
//! digest into fixed-width directory segments, bounding fan-out per level:
//!
//! ```text
//! root/<node id>/68044/29f74/181a6/.../353ff/6804429f74181a63c50c3d81d733a12f14a353ff
//! ```

use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// Width of one directory segment in hex characters
pub const SEGMENT_WIDTH: usize = 5;

/// Pluggable key to path function
pub type PathTransform = fn(&str) -> PathKey;

/// Directory segments plus leaf filename for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub segments: Vec<String>,
    pub filename: String,
}

impl PathKey {
    /// Segments joined with '/'
    pub fn path_name(&self) -> String {
        self.segments.join("/")
    }

    /// First directory segment, the unit removed by `Store::delete`
    pub fn first_path_name(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or("")
    }

    /// Relative path of the leaf file
    pub fn full_path(&self) -> PathBuf {
        let mut path: PathBuf = self.segments.iter().collect();
        path.push(&self.filename);
        path
    }
}

/// SHA-1 content-addressed layout
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));
    // 40 hex chars; a trailing partial segment would be dropped below
    debug_assert_eq!(digest.len() % SEGMENT_WIDTH, 0);

    let segments = digest
        .as_bytes()
        .chunks(SEGMENT_WIDTH)
        .filter(|chunk| chunk.len() == SEGMENT_WIDTH)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();

    PathKey {
        segments,
        filename: digest,
    }
}

/// Key used verbatim as both directory and filename
pub fn identity_path_transform(key: &str) -> PathKey {
    PathKey {
        segments: vec![key.to_string()],
        filename: key.to_string(),
    }
}
