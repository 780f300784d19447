use crate::probe::{MediaProber, ProbeError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct FakeResponse {
    // `None` means not scripted: fall back to the default duration.
    duration: Option<Option<f64>>,
    delay: Duration,
}

/// A fake prober for testing
///
/// Each URL can be scripted with a duration (or a failure) and an artificial
/// delay. Calls are recorded, and the highest number of probes in flight at
/// once is tracked so tests can check the scheduler's concurrency bound.
///
/// # Example
///
/// ```
/// use audio_browser::probe::fake::FakeProber;
/// use audio_browser::probe::MediaProber;
///
/// #[tokio::main]
/// async fn main() {
///     let prober = FakeProber::new().with_duration("https://a.amazonaws.com/1.mp3", 45.3);
///     let seconds = prober.probe("https://a.amazonaws.com/1.mp3").await.unwrap();
///     assert_eq!(seconds, Some(45.3));
///     assert_eq!(prober.call_count(), 1);
/// }
/// ```
#[derive(Debug, Default)]
pub struct FakeProber {
    responses: HashMap<String, FakeResponse>,
    default_duration: Option<f64>,
    tool_missing: bool,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a successful probe.
    pub fn with_duration(mut self, url: &str, seconds: f64) -> Self {
        self.responses.entry(url.to_string()).or_default().duration =
            Some(Some(seconds));
        self
    }

    /// Scripts a failed probe (timeout, bad output, dead host).
    pub fn with_failure(mut self, url: &str) -> Self {
        self.responses.entry(url.to_string()).or_default().duration = Some(None);
        self
    }

    pub fn with_delay(mut self, url: &str, delay: Duration) -> Self {
        self.responses.entry(url.to_string()).or_default().delay = delay;
        self
    }

    /// Duration returned for URLs that were not scripted.
    pub fn with_default_duration(mut self, seconds: f64) -> Self {
        self.default_duration = Some(seconds);
        self
    }

    /// Behave as if the external tool is not installed.
    pub fn with_missing_tool(mut self) -> Self {
        self.tool_missing = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProber for FakeProber {
    async fn probe(&self, url: &str) -> Result<Option<f64>, ProbeError> {
        if self.tool_missing {
            return Err(ProbeError::ToolMissing {
                program: "fake-ffprobe".to_string(),
            });
        }
        self.calls.lock().unwrap().push(url.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let response = self.responses.get(url).cloned().unwrap_or_default();
        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(response.duration.unwrap_or(self.default_duration))
    }

    async fn ensure_available(&self) -> Result<(), ProbeError> {
        if self.tool_missing {
            return Err(ProbeError::ToolMissing {
                program: "fake-ffprobe".to_string(),
            });
        }
        Ok(())
    }
}
