pub mod audit;
pub mod error;
pub mod policy;
pub mod provider;
pub mod report;
pub mod settings;

pub use audit::{
    coordinator::{decode_inputs, spawn_decoder, Auditor, InputStream},
    extract::RuleSet,
    CheckResult, PolicyBackend, Properties, Report, ResultSet, Rule, RuleKind,
    RuleValidationError,
};
pub use error::{AuditError, AuditResult, CheckPhase};
pub use policy::{
    test_runner::{run_policy_tests, PolicyTestResult, TestOutcome},
    FilePolicyLoader, PolicyModule, RegoBackend,
};
pub use provider::{GitHub, GitHubSettings, GitLab, Provider};
pub use report::{render_report, render_reports, OutputFormat};
pub use settings::{AuditSettings, SettingsOverrides};
