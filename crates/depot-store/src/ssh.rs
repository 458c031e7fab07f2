use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use tempfile::TempDir;
use tracing::debug;

use crate::channel::ProcessChannel;
use crate::config::SshConfig;

const MASTER_SOCKET_NAME: &str = "master.sock";
const MASTER_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared SSH substrate for one remote host. When multiplexing is enabled a
/// single master connection carries every logical connection; it is
/// established lazily on first demand and torn down when the master itself is
/// dropped, never by the logical connections riding on it.
pub struct SshMaster {
    host: String,
    key: Option<PathBuf>,
    compress: bool,
    use_master: bool,
    /// Holds the control socket and pinned known_hosts file.
    workdir: Option<TempDir>,
    known_hosts: Option<PathBuf>,
    control: Mutex<Option<MasterControl>>,
}

struct MasterControl {
    child: std::process::Child,
    socket: PathBuf,
}

impl Drop for MasterControl {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl SshMaster {
    /// Prepare an SSH substrate for `host`. `use_master` should be true only
    /// when more than one simultaneous connection is expected; a
    /// single-connection backend gains nothing from multiplexing.
    ///
    /// # Errors
    ///
    /// Returns an error when the pinned host key cannot be decoded or the
    /// working directory for control state cannot be created.
    pub fn new(host: &str, config: &SshConfig, use_master: bool) -> Result<Self> {
        let workdir = if use_master || config.host_public_key.is_some() {
            Some(
                tempfile::Builder::new()
                    .prefix("depot-ssh-")
                    .tempdir()
                    .context("failed to create SSH control directory")?,
            )
        } else {
            None
        };
        let known_hosts = match (&config.host_public_key, &workdir) {
            (Some(encoded), Some(dir)) => {
                let decoded = BASE64_STANDARD
                    .decode(encoded.as_bytes())
                    .context("base64-ssh-public-host-key is not valid base64")?;
                let key = String::from_utf8(decoded)
                    .context("base64-ssh-public-host-key does not decode to text")?;
                let path = dir.path().join("known_hosts");
                let host_name = host.rsplit('@').next().unwrap_or(host);
                fs::write(&path, format!("{host_name} {key}\n"))
                    .context("failed to write pinned known_hosts file")?;
                Some(path)
            }
            _ => None,
        };
        Ok(Self {
            host: host.to_string(),
            key: config.key.clone(),
            compress: config.compress,
            use_master,
            workdir,
            known_hosts,
            control: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn uses_master(&self) -> bool {
        self.use_master
    }

    #[must_use]
    pub fn master_established(&self) -> bool {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `command` on the remote host, returning its stdio as a channel.
    ///
    /// # Errors
    ///
    /// Returns an error when the master (if enabled) cannot be established or
    /// the `ssh` client cannot be spawned.
    pub fn start_command(&self, command: &str) -> Result<ProcessChannel> {
        let control = if self.use_master {
            Some(self.ensure_master()?)
        } else {
            None
        };
        let args = self.command_args(control.as_deref(), command);
        let child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start ssh to {}", self.host))?;
        debug!(host = %self.host, master = control.is_some(), %command, "spawned remote command");
        ProcessChannel::from_child(child)
    }

    fn ensure_master(&self) -> Result<PathBuf> {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(master) = control.as_ref() {
            return Ok(master.socket.clone());
        }
        let dir = self
            .workdir
            .as_ref()
            .context("SSH master requested without a control directory")?;
        let socket = dir.path().join(MASTER_SOCKET_NAME);

        let mut args = self.common_args();
        args.push("-M".into());
        args.push("-N".into());
        args.push("-S".into());
        args.push(socket.clone().into());
        args.push(self.host.clone().into());
        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start ssh master to {}", self.host))?;

        let deadline = Instant::now() + MASTER_STARTUP_TIMEOUT;
        while !socket.exists() {
            if let Some(status) = child.try_wait()? {
                bail!("ssh master to {} exited during startup: {status}", self.host);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                bail!("ssh master to {} did not come up in time", self.host);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        debug!(host = %self.host, socket = %socket.display(), "ssh master established");
        *control = Some(MasterControl {
            child,
            socket: socket.clone(),
        });
        Ok(socket)
    }

    fn common_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-x".into(), "-oBatchMode=yes".into()];
        if self.compress {
            args.push("-C".into());
        }
        if let Some(key) = &self.key {
            args.push("-i".into());
            args.push(key.clone().into());
        }
        if let Some(known_hosts) = &self.known_hosts {
            args.push(format!("-oUserKnownHostsFile={}", known_hosts.display()).into());
            args.push("-oStrictHostKeyChecking=yes".into());
        }
        args
    }

    fn command_args(&self, control: Option<&Path>, command: &str) -> Vec<OsString> {
        let mut args = self.common_args();
        if let Some(socket) = control {
            args.push("-S".into());
            args.push(socket.into());
        }
        args.push(self.host.clone().into());
        args.push(command.into());
        args
    }
}

/// Quote a string for the remote shell, the portable single-quote way.
#[must_use]
pub fn shell_quote(raw: &str) -> String {
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('\'');
    for ch in raw.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_to_strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn single_connection_backend_never_multiplexes() -> Result<()> {
        let master = SshMaster::new("build@example.org", &SshConfig::default(), false)?;
        assert!(!master.uses_master());
        assert!(!master.master_established());
        let args = args_to_strings(&master.command_args(None, "depot-daemon --stdio"));
        assert!(!args.contains(&"-S".to_string()));
        assert!(!args.contains(&"-M".to_string()));
        Ok(())
    }

    #[test]
    fn command_args_reflect_key_compression_and_control() -> Result<()> {
        let config = SshConfig {
            key: Some(PathBuf::from("/home/op/.ssh/id_ed25519")),
            host_public_key: None,
            compress: true,
        };
        let master = SshMaster::new("example.org", &config, true)?;
        assert!(master.uses_master());
        // Lazy: constructing the master object does not establish anything.
        assert!(!master.master_established());

        let control = PathBuf::from("/tmp/ctl.sock");
        let args = args_to_strings(&master.command_args(Some(&control), "depot-daemon --stdio"));
        assert!(args.contains(&"-C".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"/home/op/.ssh/id_ed25519".to_string()));
        let s_index = args.iter().position(|a| a == "-S").expect("-S present");
        assert_eq!(args[s_index + 1], "/tmp/ctl.sock");
        assert_eq!(args[args.len() - 2], "example.org");
        assert_eq!(args[args.len() - 1], "depot-daemon --stdio");
        Ok(())
    }

    #[test]
    fn pinned_host_key_produces_strict_known_hosts() -> Result<()> {
        let key_line = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIF9kExample host";
        let config = SshConfig {
            key: None,
            host_public_key: Some(BASE64_STANDARD.encode(key_line)),
            compress: false,
        };
        let master = SshMaster::new("op@example.org", &config, false)?;
        let args = args_to_strings(&master.command_args(None, "true"));
        assert!(args.iter().any(|a| a.starts_with("-oUserKnownHostsFile=")));
        assert!(args.contains(&"-oStrictHostKeyChecking=yes".to_string()));

        let known_hosts = args
            .iter()
            .find_map(|a| a.strip_prefix("-oUserKnownHostsFile="))
            .map(PathBuf::from)
            .expect("known_hosts arg");
        let contents = fs::read_to_string(known_hosts)?;
        assert_eq!(contents, format!("example.org {key_line}\n"));
        Ok(())
    }

    #[test]
    fn shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("don't"), "'don'\\''t'");
    }
}
