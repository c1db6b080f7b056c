//! Local media cache layout and integrity checks
//!
//! ```text
//! <root>/media/playlists/<trackId>.<ext>
//! <root>/media/schedules/<scheduleId>/<trackId>.<ext>
//! <root>/media/announcements/<trackId>.<ext>
//! ```
//!
//! In-flight data lives in `<final>.part` and is renamed into place only
//! after whole-file verification.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::download::job::Owner;
use crate::error::{Error, Result};
use fleetbox_common::model::Track;

const PARTIAL_SUFFIX: &str = "part";

#[derive(Debug, Clone)]
pub struct MediaCache {
    media_root: PathBuf,
}

impl MediaCache {
    /// Cache rooted at `<root>/media`
    pub fn new(root: &Path) -> Self {
        Self {
            media_root: root.join("media"),
        }
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    /// Final location of `track` for `owner`
    pub fn path_for(&self, track: &Track, owner: &Owner) -> Result<PathBuf> {
        let file_name = format!("{}.{}", safe_component(&track.id)?, track.extension());
        let path = match owner {
            Owner::Playlist(_) => self.media_root.join("playlists").join(file_name),
            Owner::Schedule(schedule_id) => self
                .schedule_dir(schedule_id)?
                .join(file_name),
            Owner::Announcement(_) => self.media_root.join("announcements").join(file_name),
        };
        Ok(path)
    }

    pub fn schedule_dir(&self, schedule_id: &str) -> Result<PathBuf> {
        Ok(self
            .media_root
            .join("schedules")
            .join(safe_component(schedule_id)?))
    }

    /// Remove every cached file of a schedule
    pub async fn remove_schedule_dir(&self, schedule_id: &str) -> Result<()> {
        let dir = self.schedule_dir(schedule_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Removed cached media for schedule {}", schedule_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from_io("remove schedule media", e)),
        }
    }

    /// Whether `path` holds a complete copy of `track`
    ///
    /// Without a checksum, presence of a non-empty file is enough.
    pub async fn is_complete(&self, track: &Track, path: &Path) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::from_io("stat cached file", e)),
        }

        if !track.has_checksum() {
            return Ok(true);
        }

        let actual = hash_file(path).await?;
        let matches = actual.eq_ignore_ascii_case(track.checksum.trim());
        if !matches {
            debug!(track = %track.id, "Cached file checksum mismatch");
        }
        Ok(matches)
    }

    /// Place a verified copy of `track` from `from` at `to`
    ///
    /// The copy goes through `<to>.part` and its digest is re-checked before
    /// the rename, so a torn copy never appears at the final path.
    pub async fn install_copy(&self, track: &Track, from: &Path, to: &Path) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from_io("create cache directory", e))?;
        }

        let partial = partial_path(to);
        tokio::fs::copy(from, &partial)
            .await
            .map_err(|e| Error::from_io("copy cached file", e))?;

        if track.has_checksum() {
            let actual = hash_file(&partial).await?;
            if !actual.eq_ignore_ascii_case(track.checksum.trim()) {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(Error::Checksum(format!(
                    "copy of {} expected {}, got {}",
                    track.id, track.checksum, actual
                )));
            }
        }

        tokio::fs::rename(&partial, to)
            .await
            .map_err(|e| Error::from_io("rename copied file", e))?;
        debug!(track = %track.id, to = %to.display(), "Installed cached copy");
        Ok(())
    }
}

/// Partial-download path for a final path
pub fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    final_path.with_file_name(name)
}

/// Lowercase hex SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Lowercase hex SHA-256 of a file, computed off the async runtime
pub async fn hash_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file =
            std::fs::File::open(&path).map_err(|e| Error::from_io("open for hashing", e))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| Error::from_io("read for hashing", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| Error::Internal(format!("hash task failed: {}", e)))?
}

/// Reject ids that would escape the cache directory
fn safe_component(id: &str) -> Result<String> {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        return Err(Error::FileSystem(format!("invalid cache id: {:?}", id)));
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, checksum: &str) -> Track {
        Track {
            id: id.to_string(),
            remote_path: format!("/lib/{}.ogg", id),
            local_path: None,
            duration: 10.0,
            size: 0,
            checksum: checksum.to_string(),
            name: None,
            artist: None,
        }
    }

    #[test]
    fn test_layout_per_owner() {
        let cache = MediaCache::new(Path::new("/data"));
        let t = track("t1", "");

        assert_eq!(
            cache.path_for(&t, &Owner::Playlist("p".into())).unwrap(),
            PathBuf::from("/data/media/playlists/t1.ogg")
        );
        assert_eq!(
            cache.path_for(&t, &Owner::Schedule("s-1".into())).unwrap(),
            PathBuf::from("/data/media/schedules/s-1/t1.ogg")
        );
        assert_eq!(
            cache.path_for(&t, &Owner::Announcement("a".into())).unwrap(),
            PathBuf::from("/data/media/announcements/t1.ogg")
        );
    }

    #[test]
    fn test_ids_cannot_escape_root() {
        let cache = MediaCache::new(Path::new("/data"));
        let path = cache
            .path_for(&track("../../etc/passwd", ""), &Owner::Playlist("p".into()))
            .unwrap();
        assert!(path.starts_with("/data/media/playlists"));
        assert!(cache.schedule_dir("..").is_err());
    }

    #[test]
    fn test_partial_path_suffix() {
        assert_eq!(
            partial_path(Path::new("/x/t1.mp3")),
            PathBuf::from("/x/t1.mp3.part")
        );
    }

    #[tokio::test]
    async fn test_is_complete_checks_digest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::new(dir.path());
        let path = dir.path().join("t1.mp3");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let good = track("t1", &sha256_hex(b"hello"));
        let bad = track("t1", &sha256_hex(b"other"));
        let unverifiable = track("t1", "");

        assert!(cache.is_complete(&good, &path).await.unwrap());
        assert!(!cache.is_complete(&bad, &path).await.unwrap());
        assert!(cache.is_complete(&unverifiable, &path).await.unwrap());
        assert!(!cache
            .is_complete(&good, &dir.path().join("missing.mp3"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_install_copy_verifies_before_rename() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::new(dir.path());
        let from = dir.path().join("src.mp3");
        tokio::fs::write(&from, b"hello").await.unwrap();

        let to = cache.schedule_dir("s1").unwrap().join("t1.mp3");
        let good = track("t1", &sha256_hex(b"hello"));
        cache.install_copy(&good, &from, &to).await.unwrap();
        assert_eq!(tokio::fs::read(&to).await.unwrap(), b"hello");

        let other = dir.path().join("other.mp3");
        let bad = track("t1", &sha256_hex(b"nope"));
        let err = cache.install_copy(&bad, &from, &other).await.unwrap_err();
        assert!(matches!(err, Error::Checksum(_)));
        assert!(!other.exists());
        assert!(!partial_path(&other).exists());
    }

    #[tokio::test]
    async fn test_remove_schedule_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::new(dir.path());
        let sched = cache.schedule_dir("s1").unwrap();
        tokio::fs::create_dir_all(&sched).await.unwrap();
        tokio::fs::write(sched.join("t.mp3"), b"x").await.unwrap();

        cache.remove_schedule_dir("s1").await.unwrap();
        assert!(!sched.exists());
        cache.remove_schedule_dir("s1").await.unwrap();
    }
}
