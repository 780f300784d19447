use crate::probe::{
    MediaProber, ProbeError, StorageDomains, DEFAULT_PROBE_TIMEOUT_SECS,
};
use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, instrument, warn};

/// Probes remote media with `ffprobe -show_format`, reading only the
/// container metadata rather than downloading the file.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    program: String,
    timeout: Duration,
    domains: StorageDomains,
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new(
            "ffprobe",
            Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            StorageDomains::default(),
        )
    }
}

impl FfprobeProber {
    pub fn new(
        program: impl Into<String>,
        timeout: Duration,
        domains: StorageDomains,
    ) -> Self {
        Self {
            program: program.into(),
            timeout,
            domains,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn domains(&self) -> &StorageDomains {
        &self.domains
    }

    fn tool_missing(&self) -> ProbeError {
        ProbeError::ToolMissing {
            program: self.program.clone(),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    #[instrument(skip(self), fields(url = %short_url(url)))]
    async fn probe(&self, url: &str) -> Result<Option<f64>, ProbeError> {
        if !self.domains.is_probeable(url) {
            debug!("Skipping URL outside the storage allowlist");
            return Ok(None);
        }

        let mut command = Command::new(&self.program);
        command
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running ffprobe command: {:?}", command);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(self.tool_missing())
            }
            Err(e) => {
                warn!("Failed to spawn {}: {}", self.program, e);
                return Ok(None);
            }
        };

        // Dropping the future on timeout drops the child, which kills it.
        let output = match time::timeout(self.timeout, child.wait_with_output())
            .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Error probing {}: {}", short_url(url), e);
                return Ok(None);
            }
            Err(_) => {
                warn!("Timeout probing: {}", short_url(url));
                return Ok(None);
            }
        };

        if !output.status.success() {
            debug!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }

        let duration = parse_ffprobe_duration(&output.stdout);
        if duration.is_none() {
            warn!("Invalid ffprobe output for: {}", short_url(url));
        }
        Ok(duration)
    }

    async fn ensure_available(&self) -> Result<(), ProbeError> {
        let status = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => {
                warn!("{} -version exited with {}", self.program, status);
                Err(self.tool_missing())
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::NotFound | ErrorKind::PermissionDenied
                ) =>
            {
                Err(self.tool_missing())
            }
            Err(e) => {
                warn!("Could not check {}: {}", self.program, e);
                Ok(())
            }
        }
    }
}

/// Extracts `format.duration` (seconds) from ffprobe's JSON output.
pub fn parse_ffprobe_duration(stdout: &[u8]) -> Option<f64> {
    let json: Value = serde_json::from_slice(stdout).ok()?;
    let seconds = match &json["format"]["duration"] {
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

fn short_url(url: &str) -> String {
    if url.chars().count() > 80 {
        format!("{}...", url.chars().take(80).collect::<String>())
    } else {
        url.to_string()
    }
}
