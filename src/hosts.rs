use std::{
    ffi::OsStr,
    future::Future,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use bon::Builder;
use tokio::{process::Command, time::timeout};
use tracing::{debug, info, warn};

pub const SECTION_START: &str = "# PORT_FORWARD_HELPER_START";
pub const SECTION_END: &str = "# PORT_FORWARD_HELPER_END";
pub const MANAGED_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PRIVILEGED_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

// Location of the OS hosts file.
pub fn default_hosts_path() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/etc/hosts")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostsUpdate {
    // Managed section already had the desired contents; nothing was written.
    Unchanged,
    Written,
}

#[derive(thiserror::Error, Debug)]
pub enum HostsError {
    #[error(
        "Unable to write {}: {reason}. Please re-run with administrator privileges.",
        path.display()
    )]
    PrivilegedWriteFailed { path: PathBuf, reason: String },
    #[error("Unable to read {}: {reason}", path.display())]
    PrivilegedReadFailed { path: PathBuf, reason: String },
    #[error("Timed out after {duration:?} while writing {}", path.display())]
    Timeout { path: PathBuf, duration: Duration },
    #[error(transparent)]
    Io(#[from] io::Error),
}

// Capability to access files that need elevated privileges.
// Content is raw bytes, since hosts files aren't guaranteed to be UTF-8.
pub trait PrivilegedFileAccess: Send + Sync + 'static {
    fn read_protected_file(
        &self,
        path: &Path,
    ) -> impl Future<Output = Result<Vec<u8>, HostsError>> + Send;

    fn write_protected_file(
        &self,
        path: &Path,
        content: &[u8],
    ) -> impl Future<Output = Result<(), HostsError>> + Send;
}

// Plain file access, for processes that already hold the needed privileges.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectFileAccess;

impl PrivilegedFileAccess for DirectFileAccess {
    async fn read_protected_file(&self, path: &Path) -> Result<Vec<u8>, HostsError> {
        tokio::fs::read(path)
            .await
            .map_err(|error| HostsError::PrivilegedReadFailed {
                path: path.to_path_buf(),
                reason: error.to_string(),
            })
    }

    async fn write_protected_file(&self, path: &Path, content: &[u8]) -> Result<(), HostsError> {
        tokio::fs::write(path, content)
            .await
            .map_err(|error| HostsError::PrivilegedWriteFailed {
                path: path.to_path_buf(),
                reason: error.to_string(),
            })
    }
}

// Access through an elevation command (`sudo -n` by default).
// Writes go to a private temporary file first, which is then copied over the target.
#[derive(Debug, Clone, Builder)]
pub struct ElevatedFileAccess {
    // Program and arguments prefixed to every privileged command.
    // An empty command runs the privileged commands directly.
    #[builder(default = vec!["sudo".into(), "-n".into()])]
    elevation_command: Vec<String>,
}

impl Default for ElevatedFileAccess {
    fn default() -> Self {
        ElevatedFileAccess::builder().build()
    }
}

impl ElevatedFileAccess {
    async fn run<I, S>(&self, args: I) -> Result<Vec<u8>, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut args: Vec<std::ffi::OsString> = self
            .elevation_command
            .iter()
            .map(Into::into)
            .chain(args.into_iter().map(|arg| arg.as_ref().to_os_string()))
            .collect();
        if args.is_empty() {
            return Err("empty command".into());
        }
        let program = args.remove(0);
        debug!(?program, ?args, "Running privileged command.");
        let output = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| format!("failed to run {}: {error}", program.to_string_lossy()))?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(format!(
                "{} exited with {}: {}",
                program.to_string_lossy(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

impl PrivilegedFileAccess for ElevatedFileAccess {
    async fn read_protected_file(&self, path: &Path) -> Result<Vec<u8>, HostsError> {
        self.run([OsStr::new("cat"), path.as_os_str()])
            .await
            .map_err(|reason| HostsError::PrivilegedReadFailed {
                path: path.to_path_buf(),
                reason,
            })
    }

    async fn write_protected_file(&self, path: &Path, content: &[u8]) -> Result<(), HostsError> {
        let write_failed = |reason: String| HostsError::PrivilegedWriteFailed {
            path: path.to_path_buf(),
            reason,
        };
        // Removed when dropped, whether or not the copy succeeded.
        let temp_file = tempfile::Builder::new()
            .prefix("kubehost-hosts-")
            .tempfile()
            .map_err(|error| write_failed(error.to_string()))?;
        tokio::fs::write(temp_file.path(), content)
            .await
            .map_err(|error| write_failed(error.to_string()))?;
        self.run([OsStr::new("cp"), temp_file.path().as_os_str(), path.as_os_str()])
            .await
            .map_err(write_failed)?;
        #[cfg(unix)]
        self.run([OsStr::new("chmod"), OsStr::new("644"), path.as_os_str()])
            .await
            .map_err(write_failed)?;
        Ok(())
    }
}

// Hosts file content split around the managed section.
// Lines keep their own terminators, so content outside the section is written back as it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HostsSections<'a> {
    before: Vec<&'a [u8]>,
    managed: Vec<&'a [u8]>,
    after: Vec<&'a [u8]>,
    // Terminator for the lines that are written by us.
    line_ending: &'static [u8],
}

fn is_marker(line: &[u8], marker: &str) -> bool {
    line.trim_ascii() == marker.as_bytes()
}

fn is_managed_line(line: &[u8]) -> bool {
    line.strip_prefix(MANAGED_ADDRESS.as_bytes())
        .and_then(|rest| rest.first())
        .is_some_and(|byte| matches!(byte, b' ' | b'\t'))
}

fn is_blank(line: Option<&&[u8]>) -> bool {
    line.is_none_or(|line| line.trim_ascii().is_empty())
}

fn parse_sections(content: &[u8]) -> HostsSections<'_> {
    let lines: Vec<&[u8]> = content.split_inclusive(|&byte| byte == b'\n').collect();
    let line_ending: &'static [u8] = match lines.iter().find(|line| line.ends_with(b"\n")) {
        Some(line) if line.ends_with(b"\r\n") => b"\r\n",
        _ => b"\n",
    };
    let Some(start) = lines.iter().position(|line| is_marker(line, SECTION_START)) else {
        return HostsSections {
            before: lines,
            managed: Vec::new(),
            after: Vec::new(),
            line_ending,
        };
    };
    let before = lines[..start].to_vec();
    let rest = &lines[start + 1..];
    let (managed, after) = match rest.iter().position(|line| is_marker(line, SECTION_END)) {
        Some(end) => (rest[..end].to_vec(), rest[end + 1..].to_vec()),
        // Unterminated section: only the lines that look like ours belong to it.
        None => {
            let end = rest
                .iter()
                .position(|line| !is_managed_line(line))
                .unwrap_or(rest.len());
            (rest[..end].to_vec(), rest[end..].to_vec())
        }
    };
    HostsSections {
        before,
        managed,
        after,
        line_ending,
    }
}

fn render(sections: &HostsSections<'_>, domains: &[String]) -> Vec<u8> {
    let line_ending = sections.line_ending;
    let mut output = Vec::new();
    for line in &sections.before {
        output.extend_from_slice(line);
        // Only the last line of a file can be missing its terminator.
        if !line.ends_with(b"\n") {
            output.extend_from_slice(line_ending);
        }
    }
    if !is_blank(sections.before.last()) {
        output.extend_from_slice(line_ending);
    }
    output.extend_from_slice(SECTION_START.as_bytes());
    output.extend_from_slice(line_ending);
    for domain in domains {
        output.extend_from_slice(MANAGED_ADDRESS.as_bytes());
        output.push(b'\t');
        output.extend_from_slice(domain.as_bytes());
        output.extend_from_slice(line_ending);
    }
    output.extend_from_slice(SECTION_END.as_bytes());
    output.extend_from_slice(line_ending);
    if !is_blank(sections.after.first()) {
        output.extend_from_slice(line_ending);
    }
    for line in &sections.after {
        output.extend_from_slice(line);
    }
    output
}

// Keeps the managed section of the hosts file in sync with a list of domains.
#[derive(Builder)]
pub struct HostsFileEditor<A> {
    #[builder(default = default_hosts_path(), into)]
    path: PathBuf,
    access: A,
    #[builder(default = DEFAULT_PRIVILEGED_WRITE_TIMEOUT)]
    write_timeout: Duration,
}

impl<A: PrivilegedFileAccess> HostsFileEditor<A> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    // Rewrite the managed section so that it lists exactly the given domains, in order.
    pub async fn update(&self, domains: &[String]) -> Result<HostsUpdate, HostsError> {
        let current = self.read().await?;
        let updated = render(&parse_sections(&current), domains);
        if updated == current {
            debug!(path = %self.path.display(), "Hosts file already up to date.");
            return Ok(HostsUpdate::Unchanged);
        }
        match timeout(
            self.write_timeout,
            self.access.write_protected_file(&self.path, &updated),
        )
        .await
        {
            Ok(Ok(())) => {
                info!(path = %self.path.display(), count = domains.len(), "Updated hosts file.");
                Ok(HostsUpdate::Written)
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(HostsError::Timeout {
                path: self.path.clone(),
                duration: self.write_timeout,
            }),
        }
    }

    // Empty the managed section, leaving its markers in place.
    pub async fn cleanup(&self) -> Result<HostsUpdate, HostsError> {
        self.update(&[]).await
    }

    // Domains currently listed in the managed section.
    pub async fn read_current_domains(&self) -> Vec<String> {
        let current = match self.read().await {
            Ok(current) => current,
            Err(error) => {
                warn!(%error, "Unable to read hosts file.");
                return Vec::new();
            }
        };
        parse_sections(&current)
            .managed
            .into_iter()
            .filter(|line| is_managed_line(line))
            .filter_map(|line| {
                String::from_utf8_lossy(line)
                    .split_whitespace()
                    .nth(1)
                    .map(str::to_string)
            })
            .collect()
    }

    // Read the hosts file, escalating on permission errors.
    // A missing file, or one that can't be read even with privileges, counts as empty.
    // Any other error is returned so that the file is never rewritten from partial content.
    async fn read(&self) -> Result<Vec<u8>, HostsError> {
        match tokio::fs::read(&self.path).await {
            Ok(content) => Ok(content),
            Err(error) if error.kind() == io::ErrorKind::PermissionDenied => {
                match self.access.read_protected_file(&self.path).await {
                    Ok(content) => Ok(content),
                    Err(error) => {
                        warn!(%error, "Unable to read hosts file. Assuming it's empty.");
                        Ok(Vec::new())
                    }
                }
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Hosts file doesn't exist yet.");
                Ok(Vec::new())
            }
            Err(error) => Err(HostsError::Io(error)),
        }
    }
}
