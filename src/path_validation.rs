use std::path::Path;

/// Maximum allowed path length for a tracker directory
const MAX_PATH_LENGTH: usize = 4096;

/// Validate a directory path before it is stored in a tracker.
///
/// Rejects blank paths, null bytes and overly long paths. The directory does
/// not need to exist yet: a tracker may point at storage that is mounted later.
pub fn validate_tracker_path(path: &Path) -> Result<(), String> {
    let path_str = path.to_string_lossy();

    if path_str.trim().is_empty() {
        return Err("Path is blank".to_string());
    }

    if path_str.len() > MAX_PATH_LENGTH {
        return Err(format!("Path too long (max {MAX_PATH_LENGTH} bytes)"));
    }

    if path_str.bytes().any(|b| b == 0) {
        return Err("Path contains null bytes".to_string());
    }

    Ok(())
}

/// Reject a tracker whose destination lives inside its own source folder.
///
/// Copying into a watched folder would feed every copy back in as a new file.
pub fn validate_tracker_pair(source: &Path, dest: &Path) -> Result<(), String> {
    validate_tracker_path(source)?;
    validate_tracker_path(dest)?;

    if dest.starts_with(source) {
        return Err(format!(
            "Destination {} is inside the watched folder {}",
            dest.display(),
            source.display()
        ));
    }

    Ok(())
}
