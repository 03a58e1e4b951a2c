//! Startup health checks.
//!
//! Each check exercises one collaborator the way a turn would use it and
//! reports a finding instead of failing. The CLI prints the report; a
//! frontend can render it as a checklist.

use crate::config::EngineOptions;
use crate::engine::{EngineKind, EngineRegistry, GenerateOptions, GenerationResult};
use crate::tts::TtsClient;
use serde::Serialize;

/// Prompt sent to the cloud backend by the connectivity check.
pub const CLOUD_CHECK_PROMPT: &str = "Hi";
/// Prompt sent to the local model by the self-test.
pub const LOCAL_CHECK_PROMPT: &str = "Hello";

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSeverity {
    Ok,
    Warning,
    Error,
}

/// Outcome of one check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthFinding {
    pub id: &'static str,
    pub severity: HealthSeverity,
    pub summary: String,
    pub evidence: Vec<String>,
}

impl HealthFinding {
    fn new(id: &'static str, severity: HealthSeverity, summary: impl Into<String>) -> Self {
        Self {
            id,
            severity,
            summary: summary.into(),
            evidence: Vec::new(),
        }
    }

    fn with_evidence(mut self, line: impl Into<String>) -> Self {
        self.evidence.push(line.into());
        self
    }
}

/// All findings from one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub findings: Vec<HealthFinding>,
}

impl HealthReport {
    /// Worst severity in the report (`Ok` when empty).
    pub fn worst(&self) -> HealthSeverity {
        self.findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(HealthSeverity::Ok)
    }

    pub fn is_healthy(&self) -> bool {
        self.worst() < HealthSeverity::Error
    }
}

/// Round-trip a short prompt through the cloud backend.
pub async fn check_cloud(engines: &EngineRegistry, api_key: &str) -> HealthFinding {
    let options = GenerateOptions::with_api_key(api_key);
    if options.api_key.is_none() {
        return HealthFinding::new(
            "cloud",
            HealthSeverity::Warning,
            "No cloud API key configured; cloud replies will be the placeholder.",
        );
    }
    match engines
        .get(EngineKind::Cloud)
        .generate(CLOUD_CHECK_PROMPT, &options)
        .await
    {
        GenerationResult::Text(reply) => {
            HealthFinding::new("cloud", HealthSeverity::Ok, "Cloud backend answered.")
                .with_evidence(format!("reply chars: {}", reply.chars().count()))
        }
        GenerationResult::NoOutput => HealthFinding::new(
            "cloud",
            HealthSeverity::Error,
            "Cloud backend produced no output; check the key, model and network.",
        ),
    }
}

/// Check the speech server's health route.
pub async fn check_tts(tts: &TtsClient, endpoint: &str) -> HealthFinding {
    match tts.health(endpoint).await {
        Ok(()) => HealthFinding::new("tts", HealthSeverity::Ok, "Speech server is up.")
            .with_evidence(endpoint.to_owned()),
        Err(e) => HealthFinding::new(
            "tts",
            HealthSeverity::Warning,
            "Speech server unreachable; replies will be shown without voice.",
        )
        .with_evidence(e.to_string()),
    }
}

/// Load the local model and run a one-prompt self-test.
pub async fn check_local(engines: &EngineRegistry) -> HealthFinding {
    let backend = engines.get(EngineKind::Local);
    if let Err(e) = backend.prepare().await {
        return HealthFinding::new(
            "local",
            HealthSeverity::Error,
            "Local model could not be initialised.",
        )
        .with_evidence(e.to_string());
    }
    match backend
        .generate(LOCAL_CHECK_PROMPT, &GenerateOptions::default())
        .await
    {
        GenerationResult::Text(reply) => {
            HealthFinding::new("local", HealthSeverity::Ok, "Local model self-test passed.")
                .with_evidence(format!("reply chars: {}", reply.chars().count()))
        }
        GenerationResult::NoOutput => HealthFinding::new(
            "local",
            HealthSeverity::Warning,
            "Local model loaded but the self-test produced no output.",
        ),
    }
}

/// Run the checks relevant to `options`.
///
/// The local model is only exercised when it is the selected engine, since
/// loading it is expensive.
pub async fn run_checks(
    engines: &EngineRegistry,
    tts: &TtsClient,
    options: &EngineOptions,
) -> HealthReport {
    let mut report = HealthReport::default();
    match EngineKind::from_name(&options.engine) {
        EngineKind::Cloud => report
            .findings
            .push(check_cloud(engines, &options.api_key).await),
        EngineKind::Local => report.findings.push(check_local(engines).await),
    }
    report
        .findings
        .push(check_tts(tts, &options.tts_endpoint).await);
    report
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::engine::GenerationBackend;
    use crate::error::{CompanionError, Result};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Fixed(Option<&'static str>);

    #[async_trait]
    impl GenerationBackend for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> GenerationResult {
            match self.0 {
                Some(text) => GenerationResult::from_text(text),
                None => GenerationResult::NoOutput,
            }
        }
    }

    struct Unloadable;

    #[async_trait]
    impl GenerationBackend for Unloadable {
        fn name(&self) -> &str {
            "local"
        }

        async fn prepare(&self) -> Result<()> {
            Err(CompanionError::Capability("no GPU".into()))
        }

        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> GenerationResult {
            GenerationResult::NoOutput
        }
    }

    #[tokio::test]
    async fn cloud_without_key_is_a_warning() {
        let engines = EngineRegistry::new(Arc::new(Fixed(Some("hey"))), Arc::new(Unloadable));
        let finding = check_cloud(&engines, "  ").await;
        assert_eq!(finding.severity, HealthSeverity::Warning);
    }

    #[tokio::test]
    async fn cloud_reply_is_ok_and_silence_is_error() {
        let ok = EngineRegistry::new(Arc::new(Fixed(Some("hey"))), Arc::new(Unloadable));
        assert_eq!(check_cloud(&ok, "k").await.severity, HealthSeverity::Ok);

        let silent = EngineRegistry::new(Arc::new(Fixed(None)), Arc::new(Unloadable));
        assert_eq!(check_cloud(&silent, "k").await.severity, HealthSeverity::Error);
    }

    #[tokio::test]
    async fn local_init_failure_is_reported() {
        let engines = EngineRegistry::new(Arc::new(Fixed(None)), Arc::new(Unloadable));
        let finding = check_local(&engines).await;
        assert_eq!(finding.severity, HealthSeverity::Error);
        assert!(finding.evidence[0].contains("CAPABILITY_MISSING"));
    }

    #[test]
    fn worst_severity_drives_health() {
        let mut report = HealthReport::default();
        assert!(report.is_healthy());
        report
            .findings
            .push(HealthFinding::new("tts", HealthSeverity::Warning, "down"));
        assert!(report.is_healthy());
        report
            .findings
            .push(HealthFinding::new("cloud", HealthSeverity::Error, "down"));
        assert!(!report.is_healthy());
        assert_eq!(report.worst(), HealthSeverity::Error);
    }
}
