//! Hand matched photos to the desktop's default image viewer.

use facefind_core::QueryResult;
use std::path::Path;
use std::process::Command;

#[cfg(target_os = "macos")]
fn viewer_command(path: &Path) -> Command {
    let mut cmd = Command::new("open");
    cmd.arg(path);
    cmd
}

#[cfg(target_os = "windows")]
fn viewer_command(path: &Path) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", "start", ""]).arg(path);
    cmd
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn viewer_command(path: &Path) -> Command {
    let mut cmd = Command::new("xdg-open");
    cmd.arg(path);
    cmd
}

/// Open every match that still exists on disk. Returns how many viewers
/// were launched; failures are logged and skipped.
pub fn open_matches(matches: &[QueryResult]) -> usize {
    let mut opened = 0;
    for m in matches {
        let path = Path::new(&m.image_path);
        if !path.is_file() {
            tracing::warn!(path = %m.image_path, "matched photo no longer exists");
            continue;
        }
        match viewer_command(path).spawn() {
            Ok(_) => opened += 1,
            Err(e) => tracing::warn!(path = %m.image_path, error = %e, "cannot open viewer"),
        }
    }
    opened
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_not_opened() {
        let matches = [QueryResult::from_distance("/no/such/photo.jpg".into(), 0.1)];
        assert_eq!(open_matches(&matches), 0);
    }

    #[test]
    fn test_viewer_command_targets_the_photo() {
        let cmd = viewer_command(Path::new("/photos/a.jpg"));
        let last = cmd.get_args().last().map(|a| a.to_os_string());
        assert_eq!(last, Some("/photos/a.jpg".into()));
    }
}
