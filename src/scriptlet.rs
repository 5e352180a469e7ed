// src/scriptlet.rs

//! Install scriptlets
//!
//! A package may ship a `.INSTALL` shell script defining functions named
//! after the transaction phases (`pre_install`, `post_upgrade`, ...). The
//! engine runs the matching function around each install, upgrade and
//! removal. When the root is not `/` the script runs chrooted into it.

use crate::error::{Error, Result};
use std::fmt;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Transaction phase a scriptlet function is named after
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PreInstall,
    PostInstall,
    PreUpgrade,
    PostUpgrade,
    PreRemove,
    PostRemove,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreInstall => "pre_install",
            Phase::PostInstall => "post_install",
            Phase::PreUpgrade => "pre_upgrade",
            Phase::PostUpgrade => "post_upgrade",
            Phase::PreRemove => "pre_remove",
            Phase::PostRemove => "post_remove",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs scriptlets and post-transaction hooks
pub trait ScriptRunner {
    /// Run the `phase` function of the script at `script`
    ///
    /// A missing script, or one that does not define the function, is not an
    /// error.
    fn run(
        &self,
        root: &Path,
        script: &Path,
        phase: Phase,
        version: &str,
        old_version: Option<&str>,
    ) -> Result<()>;

    /// Refresh the dynamic linker cache below `root`
    fn refresh_linker_cache(&self, root: &Path) -> Result<()>;
}

/// Runs scriptlets with `/bin/sh`
#[derive(Debug, Clone, Default)]
pub struct ShellScriptRunner;

impl ShellScriptRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a shell command line, chrooted into `root` unless it is `/`
    fn run_chroot(&self, root: &Path, cmdline: &str) -> Result<()> {
        debug!("executing \"{}\" under chroot \"{}\"", cmdline, root.display());

        let mut command = if root == Path::new("/") {
            let mut c = Command::new("/bin/sh");
            c.arg("-c").arg(cmdline);
            c
        } else {
            if !nix::unistd::geteuid().is_root() {
                warn!("running scriptlets in {} requires root privileges, skipping", root.display());
                return Ok(());
            }
            let mut c = Command::new("chroot");
            c.arg(root).arg("/bin/sh").arg("-c").arg(cmdline);
            c
        };

        let output = command
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| Error::ScriptletFailed(format!("could not execute '{}': {}", cmdline, e)))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!("{}", line);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            warn!("{}", line);
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ScriptletFailed(format!(
                "'{}' exited with code {}: {}",
                cmdline,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )))
        }
    }
}

impl ScriptRunner for ShellScriptRunner {
    fn run(
        &self,
        root: &Path,
        script: &Path,
        phase: Phase,
        version: &str,
        old_version: Option<&str>,
    ) -> Result<()> {
        let content = match fs::read_to_string(script) {
            Ok(content) => content,
            Err(_) => {
                debug!("scriptlet '{}' not found", script.display());
                return Ok(());
            }
        };

        if !content.contains(phase.as_str()) {
            debug!("scriptlet {} does not define {}", script.display(), phase);
            return Ok(());
        }

        // the copy must be reachable from inside the chroot
        let tmp = root.join("tmp");
        fs::create_dir_all(&tmp)?;
        let workdir = tempfile::Builder::new().prefix("alam_").tempdir_in(&tmp)?;
        let scriptfn = workdir.path().join(".INSTALL");
        fs::write(&scriptfn, content)?;

        let inside = Path::new("/").join(scriptfn.strip_prefix(root).unwrap_or(&scriptfn));
        let cmdline = match old_version {
            Some(old) => format!(". {}; {} {} {}", inside.display(), phase, version, old),
            None => format!(". {}; {} {}", inside.display(), phase, version),
        };

        self.run_chroot(root, &cmdline)
    }

    fn refresh_linker_cache(&self, root: &Path) -> Result<()> {
        let ldconfig = root.join("sbin/ldconfig");
        if !ldconfig.is_file() {
            debug!("no ldconfig in {}", root.display());
            return Ok(());
        }

        debug!("running \"ldconfig -r {}\"", root.display());
        let status = Command::new(&ldconfig)
            .arg("-r")
            .arg(root)
            .stdin(Stdio::null())
            .status()?;
        if !status.success() {
            warn!("ldconfig exited with {}", status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_script_is_ok() {
        let dir = tempdir().unwrap();
        let runner = ShellScriptRunner::new();
        runner
            .run(dir.path(), &dir.path().join("install"), Phase::PostInstall, "1.0-1", None)
            .unwrap();
    }

    #[test]
    fn test_undefined_phase_is_skipped() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("install");
        fs::write(&script, "post_install() {\n  exit 1\n}\n").unwrap();
        let runner = ShellScriptRunner::new();
        // would fail if it ran, but pre_remove is not defined
        runner.run(dir.path(), &script, Phase::PreRemove, "1.0-1", None).unwrap();
    }

    #[test]
    fn test_runs_phase_function() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        let script = dir.path().join("install");
        fs::write(
            &script,
            format!("post_upgrade() {{\n  echo \"$1 $2\" > {}\n}}\n", out.display()),
        )
        .unwrap();

        let runner = ShellScriptRunner::new();
        runner
            .run(Path::new("/"), &script, Phase::PostUpgrade, "1.0-1", Some("0.9-1"))
            .unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "1.0-1 0.9-1");
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::PreUpgrade.to_string(), "pre_upgrade");
        assert_eq!(Phase::PostRemove.as_str(), "post_remove");
    }
}
