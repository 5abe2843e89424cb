use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch; 0 if the clock is before it.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Reduce an offered filename to a safe single path component.
///
/// Keeps alphanumerics, space, `.`, `-` and `_`, replaces everything else with
/// `_`, strips leading dots so nothing lands as a hidden file, and falls back
/// to `received_file` when nothing usable is left.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename);

    let cleaned: String = base
        .trim()
        .trim_start_matches('.')
        .chars()
        .map(|c| match c {
            c if c.is_alphanumeric() => c,
            ' ' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        "received_file".to_string()
    } else {
        cleaned
    }
}

/// First path under `dir` named `filename`, `stem (1).ext`, `stem (2).ext`, ...
/// that does not exist yet.
pub fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    unique_path_where(dir, filename, |path| path.exists())
}

/// Like [`unique_path`], with the caller deciding which candidates are taken.
pub fn unique_path_where<F>(dir: &Path, filename: &str, taken: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    let mut candidate = dir.join(filename);
    let mut counter = 1;

    while taken(&candidate) {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("file");

        let extension = Path::new(filename)
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| format!(".{}", s))
            .unwrap_or_default();

        candidate = dir.join(format!("{} ({}){}", stem, counter, extension));
        counter += 1;
    }

    candidate
}

pub fn hex_digest(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_digest(hasher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename(".env"), "env");
        assert_eq!(sanitize_filename("a<b>:c.txt"), "a_b__c.txt");
        assert_eq!(sanitize_filename("..."), "received_file");
        assert_eq!(sanitize_filename(""), "received_file");
    }

    #[test]
    fn test_unique_path_appends_counter() {
        let temp_dir = tempdir().unwrap();
        let first = unique_path(temp_dir.path(), "a.bin");
        assert_eq!(first, temp_dir.path().join("a.bin"));

        std::fs::write(&first, b"x").unwrap();
        let second = unique_path(temp_dir.path(), "a.bin");
        assert_eq!(second, temp_dir.path().join("a (1).bin"));

        std::fs::write(&second, b"x").unwrap();
        assert_eq!(
            unique_path(temp_dir.path(), "a.bin"),
            temp_dir.path().join("a (2).bin")
        );
    }

    #[test]
    fn test_sha256_bytes_hex() {
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(sha256_bytes(b"abc").len(), 64);
    }
}
