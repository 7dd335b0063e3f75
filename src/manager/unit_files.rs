//! .nspawn file storage
//!
//! Files are written next to their final location and renamed into place,
//! so systemd-nspawn never reads a half-written file.

use std::io;
use std::path::PathBuf;

pub struct UnitFiles {
    dir: PathBuf,
}

impl UnitFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<dir>/<machine>.nspawn`
    pub fn path(&self, machine: &str) -> PathBuf {
        self.dir.join(format!("{}.nspawn", machine))
    }

    pub async fn write(&self, machine: &str, contents: &str) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path(machine);
        let tmp = self.dir.join(format!(".{}.nspawn.tmp", machine));
        if let Err(e) = tokio::fs::write(&tmp, contents).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        log::debug!("Wrote {}", path.display());
        Ok(path)
    }

    /// Remove a unit file; a missing file is not an error
    pub async fn remove(&self, machine: &str) -> io::Result<()> {
        let path = self.path(machine);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                log::debug!("Removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, machine: &str) -> bool {
        tokio::fs::try_exists(self.path(machine)).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_test_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = PathBuf::from(format!("/tmp/nspawn-units-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn test_write_creates_dir_and_file() {
        let dir = unique_test_dir();
        let files = UnitFiles::new(&dir);

        let path = files.write("web-a1", "[Exec]\nBoot=on\n").await.unwrap();
        assert_eq!(path, dir.join("web-a1.nspawn"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[Exec]\nBoot=on\n");
        assert!(files.exists("web-a1").await);
        assert!(!dir.join(".web-a1.nspawn.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_replaces_existing() {
        let files = UnitFiles::new(unique_test_dir());
        files.write("m", "old\n").await.unwrap();
        files.write("m", "new\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(files.path("m")).unwrap(), "new\n");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let files = UnitFiles::new(unique_test_dir());
        files.write("m", "x\n").await.unwrap();
        files.remove("m").await.unwrap();
        assert!(!files.exists("m").await);
        files.remove("m").await.unwrap();
    }
}
