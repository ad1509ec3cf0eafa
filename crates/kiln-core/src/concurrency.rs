use crate::{CoreError, Phase};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Exclusive hold on a layers directory for the length of one phase (or one
/// `create`). The lock file records the holder as `<pid> <phase>` so a
/// second run can say who it is waiting on.
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Take the lock without blocking. A held lock is [`CoreError::Locked`].
    pub fn acquire(lock_path: &Path, phase: Phase) -> Result<Self, CoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;
        if file.try_lock_exclusive().is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = holder.trim();
            return Err(CoreError::Locked {
                dir: lock_path
                    .parent()
                    .map_or_else(|| lock_path.to_path_buf(), Path::to_path_buf),
                holder: if holder.is_empty() {
                    "unknown".to_owned()
                } else {
                    holder.to_owned()
                },
            });
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{} {phase}", std::process::id())?;
        Ok(Self {
            file,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

static INTERRUPTS: AtomicUsize = AtomicUsize::new(0);

/// The first Ctrl-C lets the running phase stop at its next checkpoint. The
/// second exits on the spot with 130.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(|| {
        if INTERRUPTS.fetch_add(1, Ordering::SeqCst) > 0 {
            std::process::exit(130);
        }
        eprintln!("\ninterrupt received, stopping at the next checkpoint (again to abort)");
    });
}

pub fn shutdown_requested() -> bool {
    INTERRUPTS.load(Ordering::SeqCst) > 0
}

/// Checkpoint between units of work: buildpacks, layers, blobs.
pub(crate) fn check_interrupted() -> Result<(), CoreError> {
    if shutdown_requested() {
        return Err(CoreError::Interrupted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_is_recorded_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".kiln.lock");
        let lock = WorkspaceLock::acquire(&path, Phase::Build).unwrap();
        assert_eq!(lock.path(), path);
        let recorded = std::fs::read_to_string(&path).unwrap();
        assert_eq!(recorded.trim(), format!("{} build", std::process::id()));

        drop(lock);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        assert!(WorkspaceLock::acquire(&path, Phase::Export).is_ok());
    }

    #[test]
    fn contended_lock_names_the_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".kiln.lock");
        let _held = WorkspaceLock::acquire(&path, Phase::Create).unwrap();
        match WorkspaceLock::acquire(&path, Phase::Detect) {
            Err(CoreError::Locked { dir: locked, holder }) => {
                assert_eq!(locked, dir.path());
                assert!(holder.ends_with("create"), "{holder}");
            }
            other => panic!("expected Locked, got {:?}", other.map(|l| l.path().to_path_buf())),
        }
    }

    #[test]
    fn no_checkpoint_trips_without_a_signal() {
        assert!(!shutdown_requested());
        assert!(check_interrupted().is_ok());
    }
}
