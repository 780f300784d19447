pub mod fake;
pub mod ffprobe;

use async_trait::async_trait;
use url::Url;

/// Default per-file probe timeout in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 30;

/// Storage provider that still serves every recording we care about.
pub const DEFAULT_STORAGE_DOMAIN: &str = "amazonaws.com";

/// Errors that make probing impossible for every URL, not just one.
///
/// Per-URL problems (timeouts, bad output, unreachable hosts) are not errors
/// at all: they show up as `Ok(None)` from [`MediaProber::probe`].
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("media probe tool '{program}' was not found; install ffmpeg (macOS: brew install ffmpeg, Ubuntu: sudo apt install ffmpeg)")]
    ToolMissing { program: String },
}

/// A trait that abstracts media duration probing for testing
///
/// The real implementation shells out to ffprobe; the fake one returns
/// scripted values so the scheduler and the reconciliation job can be
/// exercised without network access.
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Returns the duration of the media behind `url` in seconds, or `None`
    /// when the URL is not probeable or the probe failed.
    async fn probe(&self, url: &str) -> Result<Option<f64>, ProbeError>;

    /// Checks that the external tool can be launched at all.
    async fn ensure_available(&self) -> Result<(), ProbeError> {
        Ok(())
    }
}

/// Hosts we are willing to probe.
///
/// A domain matches when its labels appear as a contiguous run of the host's
/// labels, so `amazonaws.com` covers `bucket.s3.amazonaws.com` and the
/// regional `bucket.s3.cn-north-1.amazonaws.com.cn`, but not
/// `notamazonaws.com`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDomains {
    domains: Vec<String>,
    allow_any: bool,
}

impl Default for StorageDomains {
    fn default() -> Self {
        Self::new([DEFAULT_STORAGE_DOMAIN])
    }
}

impl StorageDomains {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self {
            domains,
            allow_any: false,
        }
    }

    /// An allowlist that accepts every host, used with `--include-dead-urls`.
    pub fn any() -> Self {
        Self {
            domains: Vec::new(),
            allow_any: true,
        }
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn allows_any(&self) -> bool {
        self.allow_any
    }

    pub fn is_probeable(&self, url: &str) -> bool {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        let host = match parsed.host_str() {
            Some(host) => host.to_lowercase(),
            None => return false,
        };
        if self.allow_any {
            return true;
        }
        let host_labels: Vec<&str> = host.split('.').collect();
        self.domains.iter().any(|domain| {
            let labels: Vec<&str> = domain.split('.').collect();
            host_labels
                .windows(labels.len())
                .any(|run| run == labels.as_slice())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allowlist_matches_s3_hosts() {
        let domains = StorageDomains::default();
        assert!(domains.is_probeable(
            "https://bucket.s3.ap-south-1.amazonaws.com/audio/rec-1.webm"
        ));
        assert!(domains.is_probeable("https://amazonaws.com/a.mp3"));
        assert!(!domains.is_probeable("https://foreverlearning.in/a.mp3"));
        assert!(!domains.is_probeable("https://notamazonaws.com/a.mp3"));
        assert!(!domains.is_probeable("not a url"));
        assert!(!domains.is_probeable("file:///tmp/a.mp3"));
    }

    #[test]
    fn regional_partition_hosts_are_allowed() {
        let domains = StorageDomains::default();
        assert!(domains.is_probeable(
            "https://bucket.s3.cn-north-1.amazonaws.com.cn/audio/rec-1.webm"
        ));
        assert!(domains.is_probeable("https://s3.amazonaws.com.cn/b/a.mp3"));
        assert!(!domains.is_probeable("https://amazonaws.community/a.mp3"));
        assert!(!domains.is_probeable("https://evil-amazonaws.com.cn/a.mp3"));
    }

    #[test]
    fn configured_domains_are_normalized() {
        let domains = StorageDomains::new([" .Storage.Example.COM ", ""]);
        assert_eq!(domains.domains(), ["storage.example.com"]);
        assert!(domains.is_probeable("https://cdn.storage.example.com/x.m4a"));
    }

    #[test]
    fn allow_any_still_requires_http_url() {
        let domains = StorageDomains::any();
        assert!(domains.is_probeable("https://foreverlearning.in/a.mp3"));
        assert!(!domains.is_probeable("garbage"));
    }
}
