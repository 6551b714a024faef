//! Path and upload guards, run before any file or upload reaches the
//! extractor.

use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Image container recognized by its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Heic,
    Webp,
    Bmp,
    Tiff,
}

impl ImageFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Heic => "heic",
            ImageFormat::Webp => "webp",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Tiff => "tiff",
        }
    }

    /// Whether a configured format name ("jpg", "JPEG", "heif", ...) denotes
    /// this format.
    pub fn matches_name(&self, name: &str) -> bool {
        let name = name.trim().to_ascii_lowercase();
        match self {
            ImageFormat::Jpeg => name == "jpeg" || name == "jpg",
            ImageFormat::Heic => name == "heic" || name == "heif",
            ImageFormat::Tiff => name == "tiff" || name == "tif",
            other => name == other.name(),
        }
    }

    /// Identify the format from magic numbers.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        const HEIF_BRANDS: [&[u8; 4]; 7] =
            [b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"mif1"];

        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageFormat::Png)
        } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
            HEIF_BRANDS
                .iter()
                .any(|brand| &bytes[8..12] == *brand)
                .then_some(ImageFormat::Heic)
        } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else if bytes.starts_with(b"BM") && bytes.len() >= 14 {
            Some(ImageFormat::Bmp)
        } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
            Some(ImageFormat::Tiff)
        } else {
            None
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Verdict on an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Accepted(ImageFormat),
    TooLarge { size: usize, max: usize },
    UnsupportedType { declared: String },
}

/// True iff `candidate` resolves inside one of the `whitelist` directories.
///
/// Both sides are canonicalized (absolute, `..` removed, symlinks
/// followed). Anything that fails to resolve is treated as not allowed.
pub fn validate_path<P: AsRef<Path>>(candidate: &Path, whitelist: &[P]) -> bool {
    let resolved = match std::fs::canonicalize(candidate) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(path = %candidate.display(), error = %e, "path does not resolve");
            return false;
        }
    };

    let allowed = whitelist.iter().any(|root| {
        std::fs::canonicalize(root.as_ref())
            .map(|root| resolved.starts_with(&root))
            .unwrap_or(false)
    });
    if !allowed {
        tracing::warn!(path = %candidate.display(), "path outside allowed directories");
    }
    allowed
}

/// Check an upload's size and content signature.
///
/// `declared_type` is only reported back; the bytes decide.
pub fn validate_upload<S: AsRef<str>>(
    bytes: &[u8],
    declared_type: &str,
    max_size: usize,
    allowed_formats: &[S],
) -> UploadOutcome {
    if bytes.len() > max_size {
        return UploadOutcome::TooLarge {
            size: bytes.len(),
            max: max_size,
        };
    }

    match ImageFormat::sniff(bytes) {
        Some(format)
            if allowed_formats
                .iter()
                .any(|name| format.matches_name(name.as_ref())) =>
        {
            if !declared_type.is_empty() && !declared_type.contains(format.name()) {
                tracing::debug!(declared_type, sniffed = %format, "declared type differs from content");
            }
            UploadOutcome::Accepted(format)
        }
        _ => UploadOutcome::UnsupportedType {
            declared: declared_type.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];
    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const HEIC: &[u8] = b"\0\0\0\x18ftypheic\0\0\0\0mif1heic";

    fn formats() -> Vec<String> {
        ["jpeg", "png", "heic"].map(String::from).to_vec()
    }

    #[test]
    fn test_sniff_signatures() {
        assert_eq!(ImageFormat::sniff(JPEG), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::sniff(PNG), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::sniff(HEIC), Some(ImageFormat::Heic));
        assert_eq!(ImageFormat::sniff(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageFormat::Webp));
        assert_eq!(ImageFormat::sniff(b"\0\0\0\x18ftypmp42\0\0\0\0"), None);
        assert_eq!(ImageFormat::sniff(b"GIF89a"), None);
        assert_eq!(ImageFormat::sniff(b""), None);
    }

    #[test]
    fn test_upload_accepts_matching_signature() {
        assert_eq!(
            validate_upload(JPEG, "image/jpeg", 1024, &formats()),
            UploadOutcome::Accepted(ImageFormat::Jpeg)
        );
        assert_eq!(
            validate_upload(HEIC, "", 1024, &["heif"]),
            UploadOutcome::Accepted(ImageFormat::Heic)
        );
    }

    #[test]
    fn test_upload_ignores_declared_type() {
        // A script labelled as JPEG is still rejected.
        let outcome = validate_upload(b"#!/bin/sh\nrm -rf /", "image/jpeg", 1024, &formats());
        assert_eq!(
            outcome,
            UploadOutcome::UnsupportedType { declared: "image/jpeg".into() }
        );
        // A real PNG labelled as text is accepted on its content.
        assert_eq!(
            validate_upload(PNG, "text/plain", 1024, &formats()),
            UploadOutcome::Accepted(ImageFormat::Png)
        );
    }

    #[test]
    fn test_upload_format_not_allowed() {
        let outcome = validate_upload(b"RIFF\0\0\0\0WEBPVP8 ", "image/webp", 1024, &formats());
        assert!(matches!(outcome, UploadOutcome::UnsupportedType { .. }));
    }

    #[test]
    fn test_upload_too_large() {
        let big = vec![0xFFu8; 2048];
        assert_eq!(
            validate_upload(&big, "image/jpeg", 1024, &formats()),
            UploadOutcome::TooLarge { size: 2048, max: 1024 }
        );
    }

    #[test]
    fn test_validate_path_descendant_allowed() {
        let root = tempfile::tempdir().unwrap();
        let allowed = root.path().join("allowed");
        fs::create_dir_all(allowed.join("sub")).unwrap();
        fs::write(allowed.join("sub/photo.jpg"), b"x").unwrap();

        assert!(validate_path(&allowed.join("sub/photo.jpg"), &[&allowed]));
        assert!(validate_path(&allowed, &[&allowed]));
    }

    #[test]
    fn test_validate_path_traversal_rejected() {
        let root = tempfile::tempdir().unwrap();
        let allowed = root.path().join("allowed");
        fs::create_dir_all(allowed.join("x")).unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/passwd"), b"root").unwrap();

        let sneaky = allowed.join("x/../../etc/passwd");
        assert!(!validate_path(&sneaky, &[&allowed]));
        assert!(!validate_path(Path::new("/allowed/x/../../etc/passwd"), &[Path::new("/allowed")]));
    }

    #[test]
    fn test_validate_path_prefix_sibling_rejected() {
        let root = tempfile::tempdir().unwrap();
        let allowed = root.path().join("photos");
        let sibling = root.path().join("photos-private");
        fs::create_dir_all(&allowed).unwrap();
        fs::create_dir_all(&sibling).unwrap();

        assert!(!validate_path(&sibling, &[&allowed]));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_path_symlink_escape_rejected() {
        let root = tempfile::tempdir().unwrap();
        let allowed = root.path().join("allowed");
        let outside = root.path().join("outside");
        fs::create_dir_all(&allowed).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, allowed.join("link")).unwrap();

        assert!(!validate_path(&allowed.join("link"), &[&allowed]));
    }

    #[test]
    fn test_validate_path_unresolvable() {
        let root = tempfile::tempdir().unwrap();
        assert!(!validate_path(&root.path().join("missing.jpg"), &[root.path()]));
        let empty: [&Path; 0] = [];
        assert!(!validate_path(root.path(), &empty));
    }
}
