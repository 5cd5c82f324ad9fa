//! Mount configuration.
//!
//! A [`Config`] is assembled by the CLI, validated once with
//! [`Config::validate`] and then shared read-only by every component.

use super::constants::*;
use super::error::{FsError, FsResult};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fmt;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Which way content flows through the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Writes are encoded before they land in the backing store
    Ingest,
    /// Reads are decoded after they leave the backing store
    Egress,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Ingest => write!(f, "ingest"),
            Mode::Egress => write!(f, "egress"),
        }
    }
}

/// External codec program and its per-mode argument templates.
///
/// `{path}` expands to the backing path of the file being opened and
/// `{recipient}` to the configured identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSpec {
    /// Program name, resolved through `PATH`
    pub program: String,
    /// Arguments for ingest (encode) sessions; the codec reads stdin
    pub ingest_args: Vec<String>,
    /// Arguments for egress (decode) sessions; the codec writes stdout
    pub egress_args: Vec<String>,
}

impl Default for CodecSpec {
    fn default() -> Self {
        let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            program: DEFAULT_CODEC.to_string(),
            ingest_args: args(&[
                "--batch",
                "--yes",
                "--trust-model",
                "always",
                "--encrypt",
                "--recipient",
                RECIPIENT_PLACEHOLDER,
                "--output",
                PATH_PLACEHOLDER,
            ]),
            egress_args: args(&["--batch", "--quiet", "--decrypt", PATH_PLACEHOLDER]),
        }
    }
}

impl CodecSpec {
    /// Loads a codec profile from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading codec profile {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("parsing codec profile {}", path.display()))
    }

    /// Parses a codec profile from JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        let spec: CodecSpec = serde_json::from_str(content)?;
        if spec.program.trim().is_empty() {
            bail!("codec program must not be empty");
        }
        Ok(spec)
    }

    /// Builds the NUL-terminated argv for one session, program first.
    ///
    /// Everything the child needs is allocated here, before any fork.
    pub fn argv(
        &self,
        mode: Mode,
        backing: &Path,
        recipient: Option<&str>,
    ) -> FsResult<Vec<CString>> {
        let templates = match mode {
            Mode::Ingest => &self.ingest_args,
            Mode::Egress => &self.egress_args,
        };

        let mut argv = Vec::with_capacity(templates.len() + 1);
        argv.push(to_cstring(self.program.as_bytes().to_vec())?);
        for template in templates {
            let arg = template.replace(RECIPIENT_PLACEHOLDER, recipient.unwrap_or_default());
            let arg = replace_bytes(
                arg.as_bytes(),
                PATH_PLACEHOLDER.as_bytes(),
                backing.as_os_str().as_bytes(),
            );
            argv.push(to_cstring(arg)?);
        }
        Ok(argv)
    }
}

/// `haystack` with every occurrence of `needle` replaced by `with`.
fn replace_bytes(haystack: &[u8], needle: &[u8], with: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(at) = rest.windows(needle.len()).position(|w| w == needle) {
        out.extend_from_slice(&rest[..at]);
        out.extend_from_slice(with);
        rest = &rest[at + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}

fn to_cstring(bytes: Vec<u8>) -> FsResult<CString> {
    CString::new(bytes).map_err(|e| {
        FsError::InvalidPath(String::from_utf8_lossy(&e.into_vec()).into_owned())
    })
}

/// Everything a mount needs to know.
#[derive(Debug, Clone)]
pub struct Config {
    /// Direction of the codec
    pub mode: Mode,
    /// Backing directory mirrored by the mount
    pub root: PathBuf,
    /// Where the filesystem is mounted
    pub mountpoint: PathBuf,
    /// Identity handed to the ingest codec
    pub recipient: Option<String>,
    /// Codec program and argument templates
    pub codec: CodecSpec,
    /// Raw `-o` mount options
    pub mount_options: Vec<String>,
}

impl Config {
    /// Creates a configuration with the default (GnuPG) codec.
    pub fn new(mode: Mode, root: PathBuf, mountpoint: PathBuf) -> Self {
        Self {
            mode,
            root,
            mountpoint,
            recipient: None,
            codec: CodecSpec::default(),
            mount_options: Vec::new(),
        }
    }

    /// Checks the rules a mount must satisfy before it starts.
    ///
    /// # Errors
    ///
    /// * the root directory is missing or not a directory
    /// * ingest mode without a recipient
    /// * `allow_other` / `allow_root` requested
    pub fn validate(&self) -> Result<()> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => bail!("root {} is not a directory", self.root.display()),
            Err(e) => bail!("root directory {} is not accessible: {}", self.root.display(), e),
        }

        if self.mode == Mode::Ingest
            && self.recipient.as_deref().map_or(true, |r| r.trim().is_empty())
        {
            bail!("ingest mode needs a codec recipient (--recipient)");
        }

        if let Some(opt) = self.unsafe_option() {
            bail!(
                "the mount option '{}' is not permitted: other users must not reach the codec",
                opt
            );
        }

        Ok(())
    }

    /// First requested option that would let other principals into the mount.
    pub fn unsafe_option(&self) -> Option<&str> {
        self.split_options()
            .find(|opt| matches!(*opt, "allow_other" | "allow_root"))
    }

    /// `-o` values split on commas, empty entries dropped.
    pub fn split_options(&self) -> impl Iterator<Item = &str> {
        self.mount_options
            .iter()
            .flat_map(|o| o.split(','))
            .map(str::trim)
            .filter(|o| !o.is_empty())
    }
}

/// Refuses to run as a privileged account.
pub fn ensure_unprivileged() -> Result<()> {
    if nix::unistd::getuid().is_root() || nix::unistd::geteuid().is_root() {
        bail!("refusing to run as root; use a low privileged user");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn strings(argv: &[CString]) -> Vec<String> {
        argv.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_default_codec_templates() -> FsResult<()> {
        let codec = CodecSpec::default();
        let ingest = codec.argv(Mode::Ingest, Path::new("/data/secret.txt"), Some("alice"))?;
        assert_eq!(
            strings(&ingest),
            [
                "gpg",
                "--batch",
                "--yes",
                "--trust-model",
                "always",
                "--encrypt",
                "--recipient",
                "alice",
                "--output",
                "/data/secret.txt"
            ]
        );

        let egress = codec.argv(Mode::Egress, Path::new("/data/secret.txt"), None)?;
        assert_eq!(
            strings(&egress),
            ["gpg", "--batch", "--quiet", "--decrypt", "/data/secret.txt"]
        );
        Ok(())
    }

    #[test]
    fn test_placeholder_inside_argument() -> FsResult<()> {
        let codec = CodecSpec {
            program: "age".into(),
            ingest_args: vec!["--recipient={recipient}".into(), "--output={path}".into()],
            egress_args: vec![],
        };
        let argv = codec.argv(Mode::Ingest, Path::new("/r/a b"), Some("key1"))?;
        assert_eq!(strings(&argv), ["age", "--recipient=key1", "--output=/r/a b"]);
        Ok(())
    }

    #[test]
    fn test_non_utf8_path_inside_argument() -> FsResult<()> {
        use std::ffi::OsStr;

        let codec = CodecSpec {
            program: "age".into(),
            ingest_args: vec!["--output={path}".into(), "{path}".into()],
            egress_args: vec![],
        };
        let backing = Path::new(OsStr::from_bytes(b"/r/caf\xe9"));
        let argv = codec.argv(Mode::Ingest, backing, Some("key1"))?;
        assert_eq!(argv[1].as_bytes(), b"--output=/r/caf\xe9");
        assert_eq!(argv[2].as_bytes(), b"/r/caf\xe9");
        Ok(())
    }

    #[test]
    fn test_nul_in_program_is_rejected() {
        let codec = CodecSpec {
            program: "bad\0prog".into(),
            ..CodecSpec::default()
        };
        let err = codec.argv(Mode::Egress, Path::new("/x"), None).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_codec_profile_json() -> Result<()> {
        let spec = CodecSpec::from_json(
            r#"{"program":"sh","ingest_args":["-c","cat > \"$0\"","{path}"],"egress_args":["-c","cat \"$0\"","{path}"]}"#,
        )?;
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.ingest_args.len(), 3);

        assert!(CodecSpec::from_json(r#"{"program":" ","ingest_args":[],"egress_args":[]}"#).is_err());
        assert!(CodecSpec::from_json("not json").is_err());
        Ok(())
    }

    #[test]
    fn test_validate_requires_existing_root() {
        let config = Config::new(
            Mode::Egress,
            PathBuf::from("/definitely/not/here"),
            PathBuf::from("/mnt"),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_ingest_needs_recipient() -> Result<()> {
        let root = tempdir()?;
        let mut config = Config::new(Mode::Ingest, root.path().to_path_buf(), PathBuf::from("/mnt"));
        assert!(config.validate().is_err());

        config.recipient = Some("alice@example.org".into());
        config.validate()?;
        Ok(())
    }

    #[test]
    fn test_validate_refuses_shared_access() -> Result<()> {
        let root = tempdir()?;
        let mut config = Config::new(Mode::Egress, root.path().to_path_buf(), PathBuf::from("/mnt"));
        config.mount_options = vec!["noatime, allow_root".into()];
        assert_eq!(config.unsafe_option(), Some("allow_root"));
        assert!(config.validate().is_err());

        config.mount_options = vec!["noatime".into(), "nodev".into()];
        assert_eq!(config.unsafe_option(), None);
        config.validate()?;
        Ok(())
    }
}
