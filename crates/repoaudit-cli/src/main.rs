use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use repoaudit_core::provider::{client::GitHubClient, Builtin};
use repoaudit_core::{
    render_reports, run_policy_tests, spawn_decoder, AuditSettings, Auditor, FilePolicyLoader,
    GitHub, GitHubSettings, GitLab, OutputFormat, PolicyModule, Provider, RegoBackend, Report,
    RuleSet, SettingsOverrides, TestOutcome,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "repoaudit",
    author,
    version,
    about = "Audit repository metadata against Rego policies",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    exec: ExecArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Audit JSON records (the default command)
    Exec(ExecArgs),
    /// Run the `test_*` rules of the loaded policies
    Test(TestArgs),
}

#[derive(Args, Debug, Default)]
struct PolicyArgs {
    /// Policy file or directory; repeatable
    #[arg(short = 'p', long = "policy", value_name = "PATH")]
    policies: Vec<PathBuf>,
}

#[derive(Args, Debug, Default)]
struct ExecArgs {
    #[command(flatten)]
    policy: PolicyArgs,

    /// Output format: json or sarif
    #[arg(short, long, value_name = "FORMAT")]
    format: Option<OutputFormat>,

    /// Force a namespace instead of detecting it from each record
    #[arg(short, long, value_name = "NAMESPACE")]
    namespace: Option<String>,

    /// Write the rendered report here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Merge all reports into one
    #[arg(long)]
    merge: bool,

    /// Enable policy evaluation tracing
    #[arg(short, long)]
    trace: bool,

    /// Maximum number of rule checks evaluated at once
    #[arg(short = 'j', long = "jobs", value_name = "N")]
    jobs: Option<usize>,

    /// JSON input file; reads stdin when omitted or `-`
    #[arg(value_name = "INPUT")]
    input: Option<PathBuf>,
}

impl ExecArgs {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            policy_paths: self.policy.policies.clone(),
            format: self.format,
            namespace: self.namespace.clone(),
            trace: self.trace,
            merge: self.merge,
            max_concurrency: self.jobs,
        }
    }
}

#[derive(Args, Debug)]
struct TestArgs {
    #[command(flatten)]
    policy: PolicyArgs,

    /// Emit test results as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = cli.config.as_deref();
    let outcome = match cli.command {
        Some(Commands::Exec(args)) => exec(config, args).await,
        Some(Commands::Test(args)) => test_policies(config, args).await,
        None => exec(config, cli.exec).await,
    };
    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn exec(config: Option<&Path>, args: ExecArgs) -> Result<ExitCode> {
    let settings = AuditSettings::load(config)?.apply(args.overrides());
    debug!(?settings, "resolved settings");

    let modules = load_policies(&settings)?;
    let providers = providers()?;
    let backend = compile(&modules, &providers)?.with_tracing(settings.trace);
    let auditor = Auditor::new(Arc::new(backend), RuleSet::from_modules(&modules), providers)
        .with_namespace(settings.namespace.clone())
        .with_max_concurrency(settings.max_concurrency);

    let inputs = spawn_decoder(open_input(args.input.as_deref())?)?;

    let outcomes = tokio::select! {
        outcomes = auditor.audit_stream(inputs) => outcomes?,
        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
    };

    let mut reports = Vec::with_capacity(outcomes.len());
    let mut failures = 0usize;
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(report) => reports.push(report),
            Err(err) => {
                failures += 1;
                error!(input = index, error = %err, "audit failed");
                eprintln!("error: input #{index}: {err}");
            }
        }
    }
    if settings.merge && !reports.is_empty() {
        reports = vec![Report::merge(reports)];
    }

    let rendered = render_reports(&reports, settings.format)?;
    write_output(args.output.as_deref(), &rendered).await?;

    Ok(if failures > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn test_policies(config: Option<&Path>, args: TestArgs) -> Result<ExitCode> {
    let settings = AuditSettings::load(config)?.apply(SettingsOverrides {
        policy_paths: args.policy.policies,
        ..SettingsOverrides::default()
    });
    let modules = load_policies(&settings)?;
    let backend = compile(&modules, &providers()?)?;
    let results = run_policy_tests(&modules, &backend).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for result in &results {
            let label = match &result.outcome {
                TestOutcome::Pass => "PASS".to_string(),
                TestOutcome::Fail => "FAIL".to_string(),
                TestOutcome::Error(message) => format!("ERROR ({message})"),
            };
            println!("{label:<5} data.{}.{}", result.package, result.name);
        }
        let passed = results.iter().filter(|r| r.passed()).count();
        println!("{passed}/{} test(s) passed", results.len());
    }

    Ok(if results.iter().all(|r| r.passed()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn load_policies(settings: &AuditSettings) -> Result<Vec<PolicyModule>> {
    let modules = FilePolicyLoader::new(&settings.policy_paths)
        .load()
        .context("failed to load policies")?;
    debug!(modules = modules.len(), "loaded policy modules");
    Ok(modules)
}

fn providers() -> Result<Vec<Arc<dyn Provider>>> {
    let client = GitHubClient::new(&GitHubSettings::from_env()?)?;
    Ok(vec![Arc::new(GitHub::new(client)), Arc::new(GitLab)])
}

fn compile(modules: &[PolicyModule], providers: &[Arc<dyn Provider>]) -> Result<RegoBackend> {
    let builtins: Vec<Builtin> = providers.iter().flat_map(|p| p.builtins()).collect();
    RegoBackend::compile(modules, &builtins).context("failed to compile policies")
}

fn open_input(path: Option<&Path>) -> Result<Box<dyn Read + Send>> {
    match path {
        Some(path) if path != Path::new("-") => {
            let file = File::open(path)
                .with_context(|| format!("failed to read input {}", path.display()))?;
            Ok(Box::new(file))
        }
        _ => Ok(Box::new(std::io::stdin())),
    }
}

async fn write_output(path: Option<&Path>, rendered: &str) -> Result<()> {
    match path {
        Some(path) if path != Path::new("-") => tokio::fs::write(path, format!("{rendered}\n"))
            .await
            .with_context(|| format!("failed to write {}", path.display())),
        _ => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(rendered.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
