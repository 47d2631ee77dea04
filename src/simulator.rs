//! Tiered plan simulation
//!
//! Three tiers trade latency for signal coverage. Signal providers are
//! small capability interfaces; any may be absent and a missing signal
//! simply contributes no weight. Provider infrastructure failures become
//! warnings with a neutral signal; negative findings become errors and
//! depress the aggregate. No provider error ever terminates a simulation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cancel::CancelContext;
use crate::error::{PlannerError, PlannerResult};
use crate::node::PlanNode;
use crate::types::{SimulationResult, SimulationTier};

/// Fast, I/O-free syntax check
pub trait PatchValidator: Send + Sync {
    fn check_syntax(&self, code: &str, language: &str) -> bool;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LintResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait LintRunner: Send + Sync {
    async fn lint(
        &self,
        ctx: &CancelContext,
        content: &str,
        language: &str,
    ) -> PlannerResult<LintResult>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlastRadius {
    pub total_affected: usize,
    pub affected_files: Vec<String>,
}

#[async_trait]
pub trait BlastRadiusAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        ctx: &CancelContext,
        file_path: &str,
        include_tests: bool,
    ) -> PlannerResult<BlastRadius>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: bool,
    pub output: String,
    pub duration: Duration,
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(
        &self,
        ctx: &CancelContext,
        test_file: &str,
        test_name: &str,
    ) -> PlannerResult<TestOutcome>;
}

/// Severity of a security finding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    fn is_blocking(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityIssue {
    pub severity: Severity,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityReport {
    /// Already bounded to [0, 1] by the scanner
    pub score: f64,
    pub issues: Vec<SecurityIssue>,
}

#[async_trait]
pub trait SecurityScanner: Send + Sync {
    async fn scan(&self, ctx: &CancelContext, code: &str) -> PlannerResult<SecurityReport>;
}

/// Simulator configuration: tier timeouts and promotion thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub quick_timeout: Duration,
    pub standard_timeout: Duration,
    pub full_timeout: Duration,
    /// Quick-tier score needed to run the standard tier
    pub quick_threshold: f64,
    /// Standard-tier score needed to run the full tier
    pub standard_threshold: f64,
    pub include_tests_in_blast: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            quick_timeout: Duration::from_millis(50),
            standard_timeout: Duration::from_secs(1),
            full_timeout: Duration::from_secs(5),
            quick_threshold: 0.6,
            standard_threshold: 0.7,
            include_tests_in_blast: true,
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&self) -> PlannerResult<()> {
        for (name, v) in [
            ("quick_threshold", self.quick_threshold),
            ("standard_threshold", self.standard_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(PlannerError::invalid_config(format!(
                    "{name} must lie in [0, 1]"
                )));
            }
        }
        Ok(())
    }

    fn timeout_for(&self, tier: SimulationTier) -> Duration {
        match tier {
            SimulationTier::Quick => self.quick_timeout,
            SimulationTier::Standard => self.standard_timeout,
            SimulationTier::Full => self.full_timeout,
        }
    }
}

/// Signal weights per tier; missing signals contribute no weight
fn tier_weights(tier: SimulationTier) -> &'static [(&'static str, f64)] {
    match tier {
        SimulationTier::Quick => &[("syntax", 0.6), ("complexity", 0.4)],
        SimulationTier::Standard => &[("syntax", 0.3), ("complexity", 0.2), ("lint", 0.5)],
        SimulationTier::Full => &[
            ("syntax", 0.15),
            ("complexity", 0.10),
            ("lint", 0.20),
            ("blast_radius", 0.15),
            ("tests", 0.30),
            ("security", 0.10),
        ],
    }
}

/// Composes the available signal providers into tiered scores
pub struct Simulator {
    config: SimulatorConfig,
    syntax: Option<Arc<dyn PatchValidator>>,
    lint: Option<Arc<dyn LintRunner>>,
    blast: Option<Arc<dyn BlastRadiusAnalyzer>>,
    tests: Option<Arc<dyn TestRunner>>,
    security: Option<Arc<dyn SecurityScanner>>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            syntax: None,
            lint: None,
            blast: None,
            tests: None,
            security: None,
        }
    }

    pub fn with_syntax(mut self, provider: Arc<dyn PatchValidator>) -> Self {
        self.syntax = Some(provider);
        self
    }

    pub fn with_lint(mut self, provider: Arc<dyn LintRunner>) -> Self {
        self.lint = Some(provider);
        self
    }

    pub fn with_blast(mut self, provider: Arc<dyn BlastRadiusAnalyzer>) -> Self {
        self.blast = Some(provider);
        self
    }

    pub fn with_tests(mut self, provider: Arc<dyn TestRunner>) -> Self {
        self.tests = Some(provider);
        self
    }

    pub fn with_security(mut self, provider: Arc<dyn SecurityScanner>) -> Self {
        self.security = Some(provider);
        self
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Simulate a node at one tier. Cancellation mid-tier yields a result
    /// aggregated from the signals collected so far.
    pub async fn simulate(
        &self,
        ctx: &CancelContext,
        node: &PlanNode,
        tier: SimulationTier,
    ) -> SimulationResult {
        let started = Instant::now();

        let Some(action) = node.action() else {
            let mut result = SimulationResult::neutral(tier);
            result.duration = started.elapsed();
            return result;
        };
        if !action.validated {
            let mut result = SimulationResult::rejected(tier, "action not validated");
            result.duration = started.elapsed();
            return result;
        }

        let mut signals: HashMap<String, f64> = HashMap::new();
        let mut errors: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let timeout = self.config.timeout_for(tier);

        // Syntax and complexity run at every tier; both are in-memory.
        if let Some(syntax) = &self.syntax {
            if syntax.check_syntax(&action.code_diff, &action.language) {
                signals.insert("syntax".into(), 1.0);
            } else {
                signals.insert("syntax".into(), 0.0);
                errors.push("syntax check failed".into());
            }
        }
        signals.insert("complexity".into(), complexity_score(&action.code_diff));

        let mut cancelled = ctx.check().is_err();

        if !cancelled && tier != SimulationTier::Quick {
            if let Some(lint) = &self.lint {
                match tokio::time::timeout(
                    timeout,
                    lint.lint(ctx, &action.code_diff, &action.language),
                )
                .await
                {
                    Ok(Ok(result)) => {
                        signals.insert("lint".into(), if result.valid { 1.0 } else { 0.0 });
                        if !result.valid {
                            errors.extend(result.errors);
                        }
                        warnings.extend(result.warnings);
                    }
                    Ok(Err(err)) => {
                        signals.insert("lint".into(), 0.5);
                        warnings.push(format!("lint unavailable: {err}"));
                    }
                    Err(_) => {
                        signals.insert("lint".into(), 0.5);
                        warnings.push("lint timed out".into());
                    }
                }
            }
            cancelled = ctx.check().is_err();
        }

        if !cancelled && tier == SimulationTier::Full {
            if let Some(blast) = &self.blast {
                match tokio::time::timeout(
                    timeout,
                    blast.analyze(ctx, &action.file_path, self.config.include_tests_in_blast),
                )
                .await
                {
                    Ok(Ok(radius)) => {
                        signals.insert("blast_radius".into(), blast_score(radius.total_affected));
                    }
                    Ok(Err(err)) => {
                        signals.insert("blast_radius".into(), 0.5);
                        warnings.push(format!("blast-radius analysis unavailable: {err}"));
                    }
                    Err(_) => {
                        signals.insert("blast_radius".into(), 0.5);
                        warnings.push("blast-radius analysis timed out".into());
                    }
                }
            }
            cancelled = ctx.check().is_err();

            if !cancelled {
                if let Some(tests) = &self.tests {
                    match tokio::time::timeout(
                        timeout,
                        tests.run(ctx, &action.file_path, ""),
                    )
                    .await
                    {
                        Ok(Ok(outcome)) => {
                            if outcome.passed {
                                signals.insert("tests".into(), 1.0);
                            } else {
                                signals.insert("tests".into(), 0.0);
                                errors.push(format!("tests failed: {}", outcome.output));
                            }
                        }
                        Ok(Err(err)) => {
                            signals.insert("tests".into(), 0.5);
                            warnings.push(format!("test runner unavailable: {err}"));
                        }
                        Err(_) => {
                            signals.insert("tests".into(), 0.5);
                            warnings.push("test run timed out".into());
                        }
                    }
                }
                cancelled = ctx.check().is_err();
            }

            if !cancelled {
                if let Some(security) = &self.security {
                    match tokio::time::timeout(timeout, security.scan(ctx, &action.code_diff))
                        .await
                    {
                        Ok(Ok(report)) => {
                            signals.insert("security".into(), report.score.clamp(0.0, 1.0));
                            for issue in report.issues {
                                let line =
                                    format!("security [{}]: {}", issue.severity.as_str(), issue.message);
                                if issue.severity.is_blocking() {
                                    errors.push(line);
                                } else {
                                    warnings.push(line);
                                }
                            }
                        }
                        Ok(Err(err)) => {
                            signals.insert("security".into(), 0.5);
                            warnings.push(format!("security scan unavailable: {err}"));
                        }
                        Err(_) => {
                            signals.insert("security".into(), 0.5);
                            warnings.push("security scan timed out".into());
                        }
                    }
                }
            }
        }

        let score = aggregate(tier, &signals);
        let promote_to_next = match tier {
            SimulationTier::Quick => score >= self.config.quick_threshold,
            SimulationTier::Standard => score >= self.config.standard_threshold,
            SimulationTier::Full => false,
        };

        trace!(
            node = node.id(),
            tier = tier.as_str(),
            score,
            signals = signals.len(),
            "simulation complete",
        );
        SimulationResult {
            score,
            signals,
            errors,
            warnings,
            duration: started.elapsed(),
            tier,
            promote_to_next,
        }
    }

    /// Run the quick tier and promote through standard and full while the
    /// score clears each threshold. Every tier recomputes its own signals.
    pub async fn simulate_progressive(
        &self,
        ctx: &CancelContext,
        node: &PlanNode,
    ) -> SimulationResult {
        let mut result = self.simulate(ctx, node, SimulationTier::Quick).await;
        while result.promote_to_next {
            let Some(next) = result.tier.next() else { break };
            if ctx.check().is_err() {
                break;
            }
            result = self.simulate(ctx, node, next).await;
        }
        result
    }
}

/// Weighted mean over present signals; neutral 0.5 when none produced
fn aggregate(tier: SimulationTier, signals: &HashMap<String, f64>) -> f64 {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for (name, weight) in tier_weights(tier) {
        if let Some(signal) = signals.get(*name) {
            weighted += signal * weight;
            total_weight += weight;
        }
    }
    if total_weight > 0.0 {
        weighted / total_weight
    } else {
        0.5
    }
}

/// Discretised on code-size buckets; smaller diffs score higher
fn complexity_score(diff: &str) -> f64 {
    match diff.lines().count() {
        0..=10 => 0.9,
        11..=50 => 0.7,
        51..=200 => 0.5,
        201..=500 => 0.3,
        _ => 0.1,
    }
}

/// Fewer downstream files means a safer change
fn blast_score(total_affected: usize) -> f64 {
    match total_affected {
        0 => 1.0,
        1..=2 => 0.8,
        3..=5 => 0.6,
        6..=10 => 0.4,
        11..=20 => 0.2,
        _ => 0.1,
    }
}
