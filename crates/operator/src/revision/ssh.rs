//! SSH ref discovery through `git ls-remote`, with the private key written to
//! a temporary file for the lifetime of one call.
use std::{io::Write, process::Stdio, time::Duration};
use tokio::process::Command;

use super::{RemoteRef, Stage, TransportError};

#[derive(Debug, Clone)]
pub struct SshRefLister { timeout: Duration }

impl SshRefLister {
    pub fn new(timeout: Duration) -> Self { Self { timeout } }

    pub async fn list(&self, url: &str, key: Option<&str>) -> Result<Vec<RemoteRef>, TransportError> {
        let keyfile = match key {
            Some(k) => Some(write_key(k).map_err(|e| TransportError::new(Stage::Connect, format!("writing ssh key: {e}")))?),
            None => None,
        };
        let mut ssh = format!(
            "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -o BatchMode=yes -o ConnectTimeout={}",
            self.timeout.as_secs().max(1)
        );
        if let Some(f) = &keyfile {
            ssh.push_str(&format!(" -o IdentitiesOnly=yes -i {}", f.path().display()));
        }
        let child = Command::new("git")
            .args(["ls-remote", url])
            .env("GIT_SSH_COMMAND", ssh)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::new(Stage::Connect, format!("spawning git: {e}")))?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| TransportError::new(Stage::Connect, format!("ls-remote {url} timed out after {:?}", self.timeout)))?
            .map_err(|e| TransportError::new(Stage::Connect, e.to_string()))?;
        drop(keyfile);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::new(classify_ssh_stderr(&stderr), stderr.trim().to_string()));
        }
        Ok(parse_ls_remote(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn write_key(key: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(key.as_bytes())?;
    // OpenSSH rejects keys without a trailing newline
    if !key.ends_with('\n') { file.write_all(b"\n")?; }
    file.flush()?;
    Ok(file)
}

/// Maps `git`/`ssh` diagnostics to the stage that failed.
pub fn classify_ssh_stderr(stderr: &str) -> Stage {
    let s = stderr.to_ascii_lowercase();
    const AUTH: [&str; 6] = ["permission denied", "publickey", "authentication failed", "could not read username", "invalid format", "host key verification failed"];
    const MISSING: [&str; 3] = ["repository not found", "does not appear to be a git repository", "project you were looking for could not be found"];
    if MISSING.iter().any(|m| s.contains(m)) {
        Stage::NotFound
    } else if AUTH.iter().any(|m| s.contains(m)) {
        Stage::Authenticate
    } else {
        Stage::Connect
    }
}

/// `git ls-remote` prints `<oid>\t<refname>` per line.
fn parse_ls_remote(stdout: &str) -> Vec<RemoteRef> {
    stdout
        .lines()
        .filter_map(|l| l.split_once('\t'))
        .map(|(oid, name)| RemoteRef::new(name.trim(), oid.trim()))
        .collect()
}
