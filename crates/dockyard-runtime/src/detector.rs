//! Container runtime detection with TTL-cached probe results.
//!
//! Detection runs two independent probes per engine: a version command and
//! a functional `info` command. An engine is only reported available when
//! both succeed; an installed-but-broken daemon is unavailable with a
//! distinguishing error.

use crate::error::RuntimeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long a probe result stays fresh.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// How long a single probe subprocess may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Supported container engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    /// Name of the engine binary.
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }

    /// All engines Dockyard knows how to drive, in preference order.
    pub fn all() -> [RuntimeKind; 2] {
        [Self::Docker, Self::Podman]
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// Parsed engine version details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Bare semantic version (e.g. "27.0.1").
    pub version: String,

    /// Full first line of the version command output.
    pub full_version: String,

    /// Build identifier, when the engine reports one.
    pub build_info: Option<String>,
}

/// Result of probing one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Engine that was probed.
    pub kind: RuntimeKind,

    /// True only when both the version and functional probes succeeded.
    pub available: bool,

    /// Version details, when the version probe produced output.
    pub version_info: Option<VersionInfo>,

    /// Why the engine is unavailable, when it is.
    pub error: Option<String>,
}

/// Version bounds for a compatibility check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionRequirement {
    pub min_version: Option<String>,
    pub max_version: Option<String>,
}

/// Outcome of [`RuntimeDetector::validate_compatibility`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub compatible: bool,
    pub version_compatible: bool,
    pub features_compatible: bool,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Seam over the two engine probes so tests can inject fakes and count
/// spawns.
#[async_trait]
pub trait EngineProbe: Send + Sync {
    /// Run the version command and return its raw stdout.
    async fn version_output(&self, kind: RuntimeKind) -> Result<String, RuntimeError>;

    /// Run the functional probe (an `info`-equivalent round trip).
    async fn functional_check(&self, kind: RuntimeKind) -> Result<(), RuntimeError>;
}

/// Probe implementation that shells out to the engine CLI.
#[derive(Debug, Default)]
pub struct CliProbe;

impl CliProbe {
    async fn run(
        &self,
        kind: RuntimeKind,
        probe: &'static str,
        args: &[&str],
    ) -> Result<String, RuntimeError> {
        let mut command = tokio::process::Command::new(kind.binary());
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(PROBE_TIMEOUT, command.output())
            .await
            .map_err(|_| RuntimeError::Probe {
                engine: kind.binary(),
                probe,
                message: format!("timed out after {}s", PROBE_TIMEOUT.as_secs()),
            })?
            .map_err(|err| RuntimeError::Probe {
                engine: kind.binary(),
                probe,
                message: err.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::Probe {
                engine: kind.binary(),
                probe,
                message: format!(
                    "exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl EngineProbe for CliProbe {
    async fn version_output(&self, kind: RuntimeKind) -> Result<String, RuntimeError> {
        self.run(kind, "version", &["--version"]).await
    }

    async fn functional_check(&self, kind: RuntimeKind) -> Result<(), RuntimeError> {
        self.run(kind, "info", &["info"]).await.map(|_| ())
    }
}

struct CacheEntry {
    info: RuntimeInfo,
    expires_at: Instant,
}

/// Probes for available container engines, caching results per engine.
///
/// The cache is instance-local so multiple detectors (e.g. in tests) never
/// interfere with each other.
pub struct RuntimeDetector {
    probe: Arc<dyn EngineProbe>,
    cache: Mutex<HashMap<RuntimeKind, CacheEntry>>,
    ttl: Duration,
}

impl Default for RuntimeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeDetector {
    /// Create a detector backed by the engine CLIs.
    pub fn new() -> Self {
        Self::with_probe(Arc::new(CliProbe), DEFAULT_CACHE_TTL)
    }

    /// Create a detector with a custom probe and TTL (used by tests).
    pub fn with_probe(probe: Arc<dyn EngineProbe>, ttl: Duration) -> Self {
        Self {
            probe,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Probe all known engines, consulting the cache first.
    pub async fn detect_runtimes(&self) -> Vec<RuntimeInfo> {
        let mut infos = Vec::with_capacity(RuntimeKind::all().len());
        for kind in RuntimeKind::all() {
            infos.push(self.detect(kind).await);
        }
        infos
    }

    /// Probe one engine, consulting the cache first.
    pub async fn detect(&self, kind: RuntimeKind) -> RuntimeInfo {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&kind) {
                if entry.expires_at > Instant::now() {
                    debug!(engine = %kind, "Runtime info served from cache");
                    return entry.info.clone();
                }
            }
        }

        let info = self.probe_engine(kind).await;

        let mut cache = self.cache.lock().await;
        cache.insert(
            kind,
            CacheEntry {
                info: info.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        info
    }

    /// Pick the engine to use.
    ///
    /// Honors `preferred` when that engine is functional; otherwise docker
    /// wins over podman. Returns `None` when no engine is functional.
    pub async fn best_runtime(&self, preferred: Option<RuntimeKind>) -> Option<RuntimeKind> {
        if let Some(kind) = preferred {
            if self.detect(kind).await.available {
                return Some(kind);
            }
            warn!(engine = %kind, "Preferred runtime unavailable, falling back");
        }
        for kind in RuntimeKind::all() {
            if self.detect(kind).await.available {
                return Some(kind);
            }
        }
        None
    }

    /// Check a detected engine version against the given bounds.
    ///
    /// Comparison failures become issues in the report, never panics.
    pub async fn validate_compatibility(
        &self,
        kind: RuntimeKind,
        requirement: &VersionRequirement,
    ) -> CompatibilityReport {
        let info = self.detect(kind).await;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if !info.available {
            issues.push(
                info.error
                    .clone()
                    .unwrap_or_else(|| format!("{kind} is not available")),
            );
        }

        let detected = info
            .version_info
            .as_ref()
            .and_then(|v| parse_semver(&v.version).map(|parsed| (v.version.clone(), parsed)));

        let mut version_compatible = true;
        match &detected {
            None => {
                version_compatible = false;
                let raw = info
                    .version_info
                    .as_ref()
                    .map(|v| v.version.clone())
                    .unwrap_or_else(|| "<missing>".to_string());
                issues.push(format!("unable to parse {kind} version '{raw}'"));
            }
            Some((version, parsed)) => {
                if let Some(min) = &requirement.min_version {
                    match parse_semver(min) {
                        Some(min_parsed) if *parsed < min_parsed => {
                            version_compatible = false;
                            issues.push(format!(
                                "{kind} version {version} is below the minimum {min}"
                            ));
                            recommendations
                                .push(format!("upgrade {kind} to at least {min}"));
                        }
                        Some(_) => {}
                        None => {
                            version_compatible = false;
                            issues.push(format!("unable to parse minimum version '{min}'"));
                        }
                    }
                }
                if let Some(max) = &requirement.max_version {
                    match parse_semver(max) {
                        Some(max_parsed) if *parsed > max_parsed => {
                            version_compatible = false;
                            issues.push(format!(
                                "{kind} version {version} is above the maximum {max}"
                            ));
                            recommendations
                                .push(format!("downgrade {kind} to at most {max}"));
                        }
                        Some(_) => {}
                        None => {
                            version_compatible = false;
                            issues.push(format!("unable to parse maximum version '{max}'"));
                        }
                    }
                }
            }
        }

        let features_compatible = info.available;
        CompatibilityReport {
            compatible: info.available && version_compatible && features_compatible,
            version_compatible,
            features_compatible,
            issues,
            recommendations,
        }
    }

    /// Drop all cached probe results. Safe to call repeatedly.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    async fn probe_engine(&self, kind: RuntimeKind) -> RuntimeInfo {
        let raw_version = match self.probe.version_output(kind).await {
            Ok(raw) => raw,
            Err(err) => {
                debug!(engine = %kind, error = %err, "Version probe failed");
                return RuntimeInfo {
                    kind,
                    available: false,
                    version_info: None,
                    error: Some(format!("{kind} is not installed: {err}")),
                };
            }
        };

        let version_info = parse_version_output(&raw_version);

        match self.probe.functional_check(kind).await {
            Ok(()) => {
                info!(
                    engine = %kind,
                    version = version_info.as_ref().map(|v| v.version.as_str()).unwrap_or("unknown"),
                    "Runtime detected"
                );
                RuntimeInfo {
                    kind,
                    available: true,
                    version_info,
                    error: None,
                }
            }
            Err(err) => {
                warn!(engine = %kind, error = %err, "Engine installed but not functional");
                RuntimeInfo {
                    kind,
                    available: false,
                    version_info,
                    error: Some(format!("{kind} is installed but not functional: {err}")),
                }
            }
        }
    }
}

/// Extract version details from a version command's first output line,
/// e.g. `Docker version 27.0.1, build ff1e2c0`.
fn parse_version_output(raw: &str) -> Option<VersionInfo> {
    let line = raw.lines().next()?.trim();
    if line.is_empty() {
        return None;
    }

    let version = line
        .split_whitespace()
        .map(|token| token.trim_end_matches(','))
        .find(|token| {
            token.chars().next().is_some_and(|c| c.is_ascii_digit()) && token.contains('.')
        })?
        .to_string();

    let build_info = line
        .split_whitespace()
        .skip_while(|token| *token != "build")
        .nth(1)
        .map(|token| token.trim_end_matches(',').to_string());

    Some(VersionInfo {
        version,
        full_version: line.to_string(),
        build_info,
    })
}

/// Parse `major.minor.patch` (missing components default to 0).
fn parse_semver(version: &str) -> Option<(u64, u64, u64)> {
    let core = version.split(['-', '+']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted probe that counts every simulated spawn.
    struct FakeProbe {
        version_line: HashMap<RuntimeKind, Result<String, String>>,
        functional: HashMap<RuntimeKind, bool>,
        spawns: AtomicUsize,
    }

    impl FakeProbe {
        fn new() -> Self {
            Self {
                version_line: HashMap::new(),
                functional: HashMap::new(),
                spawns: AtomicUsize::new(0),
            }
        }

        fn engine(mut self, kind: RuntimeKind, version: &str, functional: bool) -> Self {
            self.version_line.insert(kind, Ok(version.to_string()));
            self.functional.insert(kind, functional);
            self
        }

        fn missing(mut self, kind: RuntimeKind) -> Self {
            self.version_line
                .insert(kind, Err("command not found".to_string()));
            self
        }

        fn spawn_count(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EngineProbe for FakeProbe {
        async fn version_output(&self, kind: RuntimeKind) -> Result<String, RuntimeError> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            match self.version_line.get(&kind) {
                Some(Ok(line)) => Ok(line.clone()),
                Some(Err(message)) => Err(RuntimeError::Probe {
                    engine: kind.binary(),
                    probe: "version",
                    message: message.clone(),
                }),
                None => Err(RuntimeError::Probe {
                    engine: kind.binary(),
                    probe: "version",
                    message: "command not found".to_string(),
                }),
            }
        }

        async fn functional_check(&self, kind: RuntimeKind) -> Result<(), RuntimeError> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            if self.functional.get(&kind).copied().unwrap_or(false) {
                Ok(())
            } else {
                Err(RuntimeError::Probe {
                    engine: kind.binary(),
                    probe: "info",
                    message: "daemon not reachable".to_string(),
                })
            }
        }
    }

    fn detector(probe: FakeProbe, ttl: Duration) -> (Arc<FakeProbe>, RuntimeDetector) {
        let probe = Arc::new(probe);
        let detector = RuntimeDetector::with_probe(probe.clone(), ttl);
        (probe, detector)
    }

    #[tokio::test]
    async fn test_cache_hit_spawns_nothing() {
        let (probe, detector) = detector(
            FakeProbe::new()
                .engine(RuntimeKind::Docker, "Docker version 27.0.1, build ff1e2c0", true),
            Duration::from_secs(300),
        );

        let first = detector.detect(RuntimeKind::Docker).await;
        assert!(first.available);
        let after_first = probe.spawn_count();

        let second = detector.detect(RuntimeKind::Docker).await;
        assert_eq!(second, first);
        assert_eq!(probe.spawn_count(), after_first, "cache hit must not spawn");
    }

    #[tokio::test]
    async fn test_clear_cache_reprobes() {
        let (probe, detector) = detector(
            FakeProbe::new().engine(RuntimeKind::Docker, "Docker version 27.0.1", true),
            Duration::from_secs(300),
        );

        detector.detect(RuntimeKind::Docker).await;
        let after_first = probe.spawn_count();

        detector.clear_cache().await;
        detector.clear_cache().await; // idempotent
        detector.detect(RuntimeKind::Docker).await;
        assert!(probe.spawn_count() > after_first);
    }

    #[tokio::test]
    async fn test_ttl_expiry_reprobes() {
        let (probe, detector) = detector(
            FakeProbe::new().engine(RuntimeKind::Docker, "Docker version 27.0.1", true),
            Duration::from_millis(10),
        );

        detector.detect(RuntimeKind::Docker).await;
        let after_first = probe.spawn_count();

        tokio::time::sleep(Duration::from_millis(30)).await;
        detector.detect(RuntimeKind::Docker).await;
        assert!(probe.spawn_count() > after_first);
    }

    #[tokio::test]
    async fn test_best_runtime_prefers_docker() {
        let (_, detector) = detector(
            FakeProbe::new()
                .engine(RuntimeKind::Docker, "Docker version 27.0.1", true)
                .engine(RuntimeKind::Podman, "podman version 5.2.0", true),
            Duration::from_secs(300),
        );

        assert_eq!(detector.best_runtime(None).await, Some(RuntimeKind::Docker));
        assert_eq!(
            detector.best_runtime(Some(RuntimeKind::Podman)).await,
            Some(RuntimeKind::Podman)
        );
    }

    #[tokio::test]
    async fn test_non_functional_engine_is_unavailable() {
        let (_, detector) = detector(
            FakeProbe::new()
                .engine(RuntimeKind::Docker, "Docker version 27.0.1", false)
                .missing(RuntimeKind::Podman),
            Duration::from_secs(300),
        );

        let info = detector.detect(RuntimeKind::Docker).await;
        assert!(!info.available);
        assert!(info.error.as_deref().unwrap().contains("not functional"));
        // Version probe still succeeded, so we keep what we learned.
        assert!(info.version_info.is_some());

        assert_eq!(detector.best_runtime(None).await, None);
    }

    #[tokio::test]
    async fn test_min_version_issue_names_both_versions() {
        let (_, detector) = detector(
            FakeProbe::new().engine(RuntimeKind::Docker, "Docker version 24.0.7, build afdd53b", true),
            Duration::from_secs(300),
        );

        let report = detector
            .validate_compatibility(
                RuntimeKind::Docker,
                &VersionRequirement {
                    min_version: Some("25.0.0".to_string()),
                    max_version: None,
                },
            )
            .await;

        assert!(!report.version_compatible);
        assert!(!report.compatible);
        let issue = report.issues.join(" ");
        assert!(issue.contains("24.0.7"));
        assert!(issue.contains("25.0.0"));
        assert!(!report.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_max_version_violation() {
        let (_, detector) = detector(
            FakeProbe::new().engine(RuntimeKind::Docker, "Docker version 27.0.1", true),
            Duration::from_secs(300),
        );

        let report = detector
            .validate_compatibility(
                RuntimeKind::Docker,
                &VersionRequirement {
                    min_version: None,
                    max_version: Some("26.0.0".to_string()),
                },
            )
            .await;

        assert!(!report.version_compatible);
        let issue = report.issues.join(" ");
        assert!(issue.contains("27.0.1"));
        assert!(issue.contains("26.0.0"));
    }

    #[tokio::test]
    async fn test_unparseable_version_is_an_issue() {
        let (_, detector) = detector(
            FakeProbe::new().engine(RuntimeKind::Docker, "Docker version mystery", true),
            Duration::from_secs(300),
        );

        let report = detector
            .validate_compatibility(RuntimeKind::Docker, &VersionRequirement::default())
            .await;

        assert!(!report.version_compatible);
        assert!(report.issues.iter().any(|i| i.contains("unable to parse")));
    }

    #[test]
    fn test_parse_version_output() {
        let info = parse_version_output("Docker version 27.0.1, build ff1e2c0\n").unwrap();
        assert_eq!(info.version, "27.0.1");
        assert_eq!(info.build_info.as_deref(), Some("ff1e2c0"));

        let info = parse_version_output("podman version 5.2.0").unwrap();
        assert_eq!(info.version, "5.2.0");
        assert!(info.build_info.is_none());

        assert!(parse_version_output("").is_none());
    }

    #[test]
    fn test_parse_semver() {
        assert_eq!(parse_semver("27.0.1"), Some((27, 0, 1)));
        assert_eq!(parse_semver("5.2"), Some((5, 2, 0)));
        assert_eq!(parse_semver("1.2.3-rc1"), Some((1, 2, 3)));
        assert_eq!(parse_semver("mystery"), None);
    }
}
