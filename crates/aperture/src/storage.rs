use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Fallback directories scanned in order when the configured burst path is
/// unusable.
const FALLBACK_DIRS: &[&str] = &["DCIM/Burst", "DCIM/Camera"];

/// Resolve the burst save directory once at burst start: the configured
/// path if it exists or can be created, else the first existing vendor
/// directory, else the system temp directory.
pub fn resolve_burst_dir(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        if path.is_dir() || fs::create_dir_all(path).is_ok() {
            return path.to_path_buf();
        }
        log::warn!("burst: configured dir {} unusable", path.display());
    }
    for candidate in FALLBACK_DIRS {
        let path = PathBuf::from(candidate);
        if path.is_dir() {
            return path;
        }
    }
    std::env::temp_dir()
}

/// Writes sequentially numbered image files into a directory resolved once
/// per burst.
pub struct BurstWriter {
    dir: PathBuf,
    prefix: String,
    seq: AtomicU32,
}

impl BurstWriter {
    pub fn new(dir: PathBuf, prefix: &str) -> Self {
        Self {
            dir,
            prefix: prefix.to_string(),
            seq: AtomicU32::new(0),
        }
    }

    /// Directory this burst saves into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Next sequential file path.
    pub fn next_path(&self) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        self.dir.join(format!("{}_{:04}.jpg", self.prefix, seq))
    }

    /// Write one shot; returns the path it landed at.
    pub fn save(&self, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.next_path();
        fs::write(&path, bytes)?;
        log::info!("burst: saved {} ({} bytes)", path.display(), bytes.len());
        Ok(path)
    }

    /// Shots written so far.
    pub fn written(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "aperture-burst-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn configured_dir_wins_when_creatable() {
        let dir = scratch_dir("cfg").join("nested");
        let resolved = resolve_burst_dir(Some(&dir));
        assert_eq!(resolved, dir);
        assert!(dir.is_dir());
    }

    #[test]
    fn unusable_path_falls_back() {
        // A path under a regular file can never be created.
        let base = scratch_dir("fallback");
        let file = base.join("blocker");
        fs::write(&file, b"x").expect("blocker");
        let resolved = resolve_burst_dir(Some(&file.join("sub")));
        assert_ne!(resolved, file.join("sub"));
    }

    #[test]
    fn writer_numbers_sequentially() {
        let dir = scratch_dir("seq");
        let writer = BurstWriter::new(dir.clone(), "shot");
        let a = writer.save(&[0u8; 16]).expect("save");
        let b = writer.save(&[0u8; 16]).expect("save");
        assert_eq!(a, dir.join("shot_0000.jpg"));
        assert_eq!(b, dir.join("shot_0001.jpg"));
        assert_eq!(writer.written(), 2);
        let _ = fs::remove_dir_all(&dir);
    }
}
