use super::codecfs::CodecFs;
use super::config::{Config, Mode};
use super::constants::{FS_NAME_EGRESS, FS_NAME_INGEST};
use super::proto::HoleFs;
use super::reaper::Reaper;
use anyhow::{Context, Result};
use fuser::MountOption;
use libc::{SIGINT, SIGTERM};
use log::{info, warn};
use signal_hook::iterator::Signals;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Mounts a codec filesystem and keeps it alive until a signal arrives.
pub struct FilesystemManager {
    config: Config,
}

impl FilesystemManager {
    /// `config` should already have passed [`Config::validate`].
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Translates the `-o` options into `fuser` mount options.
    ///
    /// Egress mounts are always read-only. Options `fuser` has no variant for
    /// are passed through verbatim.
    pub fn mount_options(&self) -> Vec<MountOption> {
        let name = match self.config.mode {
            Mode::Ingest => FS_NAME_INGEST,
            Mode::Egress => FS_NAME_EGRESS,
        };
        let mut options = vec![
            MountOption::FSName(name.to_string()),
            MountOption::Subtype(name.to_string()),
        ];
        if self.config.mode == Mode::Egress {
            options.push(MountOption::RO);
        }

        for opt in self.config.split_options() {
            let option = match opt {
                "ro" if self.config.mode == Mode::Egress => continue,
                "ro" => MountOption::RO,
                "rw" if self.config.mode == Mode::Egress => {
                    warn!("Ignoring 'rw': egress mounts are read-only");
                    continue;
                }
                "rw" => MountOption::RW,
                "dev" => MountOption::Dev,
                "nodev" => MountOption::NoDev,
                "suid" => MountOption::Suid,
                "nosuid" => MountOption::NoSuid,
                "exec" => MountOption::Exec,
                "noexec" => MountOption::NoExec,
                "atime" => MountOption::Atime,
                "noatime" => MountOption::NoAtime,
                "sync" => MountOption::Sync,
                "async" => MountOption::Async,
                "dirsync" => MountOption::DirSync,
                "auto_unmount" => MountOption::AutoUnmount,
                "default_permissions" => MountOption::DefaultPermissions,
                // refused by Config::validate
                "allow_other" | "allow_root" => continue,
                other => MountOption::CUSTOM(other.to_string()),
            };
            options.push(option);
        }
        options
    }

    /// Mounts at the configured mountpoint and blocks until SIGINT or
    /// SIGTERM, or until the filesystem is unmounted from outside.
    ///
    /// `workers` is the runtime that executes content I/O.
    pub fn mount(&self, workers: Handle) -> Result<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let core = Arc::new(CodecFs::new(self.config.clone()));
        let fs = HoleFs::new(Arc::clone(&core), workers).with_shutdown(signals.handle());

        let session = fuser::spawn_mount2(fs, &self.config.mountpoint, &self.mount_options())
            .with_context(|| format!("mounting {}", self.config.mountpoint.display()))?;
        // started after mounting: fuser may wait on its own fusermount child
        let watch = Reaper::global().watch_sigchld()?;
        info!(
            "Mounted {} as {} mount at {}",
            self.config.root.display(),
            self.config.mode,
            self.config.mountpoint.display()
        );

        match signals.forever().next() {
            Some(sig) => info!("Received signal {}, unmounting...", sig),
            None => info!("Filesystem was unmounted"),
        }
        watch.stop();
        drop(session);

        let reaper = Reaper::global();
        reaper.sweep();
        if reaper.outstanding() > 0 {
            warn!("{} codec processes are still running", reaper.outstanding());
        }
        if !core.sessions().is_empty() {
            warn!("{} sessions were never released", core.sessions().len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn manager(mode: Mode, options: &[&str]) -> FilesystemManager {
        let mut config = Config::new(mode, PathBuf::from("/data"), PathBuf::from("/mnt"));
        config.mount_options = options.iter().map(|o| o.to_string()).collect();
        FilesystemManager::new(config)
    }

    #[test]
    fn test_egress_is_read_only() {
        let options = manager(Mode::Egress, &["rw,noatime"]).mount_options();
        assert!(options.contains(&MountOption::RO));
        assert!(!options.contains(&MountOption::RW));
        assert!(options.contains(&MountOption::NoAtime));
        assert!(options.contains(&MountOption::FSName(FS_NAME_EGRESS.into())));
    }

    #[test]
    fn test_ingest_options() {
        let options = manager(Mode::Ingest, &["nodev,nosuid", "max_read=65536"]).mount_options();
        assert!(!options.contains(&MountOption::RO));
        assert!(options.contains(&MountOption::NoDev));
        assert!(options.contains(&MountOption::NoSuid));
        assert!(options.contains(&MountOption::CUSTOM("max_read=65536".into())));
        assert!(options.contains(&MountOption::Subtype(FS_NAME_INGEST.into())));
    }

    #[test]
    fn test_shared_access_never_reaches_fuser() {
        let options = manager(Mode::Ingest, &["allow_other", "allow_root"]).mount_options();
        assert!(!options.contains(&MountOption::AllowOther));
        assert!(!options.contains(&MountOption::AllowRoot));
        assert_eq!(options.len(), 2);
    }
}
