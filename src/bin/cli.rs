use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dockyard::config::{Config, CONFIG_FILE};
use dockyard::domain::{
    Ecosystem, ExpectedAttestations, ExpectedProvenance, ExpectedPublisher, PackageIdentifier,
};
use dockyard::error::ProvenanceError;
use dockyard::output::OutputFormat;

#[derive(Parser)]
#[command(
    name = "dockhand",
    about = "Verify the provenance of npm and PyPI packages",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the provenance of one package version
    Verify {
        /// Package ecosystem (npm, npx, pypi, uvx)
        ecosystem: String,

        /// Package name
        name: String,

        /// Exact package version
        version: String,

        #[command(flatten)]
        common: CommonArgs,

        /// Repository URI the package is expected to come from
        #[arg(long)]
        expect_repository: Option<String>,

        /// Trusted publisher repository (owner/repo) the package is expected to carry;
        /// implies attestations are expected
        #[arg(long)]
        expect_publisher: Option<String>,

        /// Workflow file the trusted publisher is expected to use, e.g. release.yml
        #[arg(long, requires = "expect_publisher")]
        expect_workflow: Option<String>,
    },

    /// Verify several packages concurrently
    Batch {
        /// Packages as ecosystem:name@version
        #[arg(required = true)]
        packages: Vec<String>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Generate a starter .dockhand.toml config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct CommonArgs {
    /// Config file path
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Output format (console, json)
    #[arg(long, short = 'f', default_value = "console")]
    format: String,

    /// Write output to file instead of stdout
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Only VERIFIED and ATTESTATIONS pass
    #[arg(long)]
    strict: bool,

    /// Debug logging and verification details
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Commands::Verify { common, .. } | Commands::Batch { common, .. } => common.verbose,
        Commands::Init { .. } => false,
    };
    init_tracing(verbose);

    let result = match cli.command {
        Commands::Verify {
            ecosystem,
            name,
            version,
            common,
            expect_repository,
            expect_publisher,
            expect_workflow,
        } => {
            cmd_verify(
                &ecosystem,
                name,
                version,
                common,
                expect_repository,
                expect_publisher,
                expect_workflow,
            )
            .await
        }
        Commands::Batch { packages, common } => cmd_batch(packages, common).await,
        Commands::Init { force } => cmd_init(force),
    };

    match result {
        Ok(exit_code) => process::exit(exit_code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "dockyard=debug,info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Token cancelled on Ctrl-C so in-flight requests stop promptly.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling verification");
            child.cancel();
        }
    });
    token
}

async fn cmd_verify(
    ecosystem_str: &str,
    name: String,
    version: String,
    common: CommonArgs,
    expect_repository: Option<String>,
    expect_publisher: Option<String>,
    expect_workflow: Option<String>,
) -> Result<i32, ProvenanceError> {
    let ecosystem =
        Ecosystem::from_str_lenient(ecosystem_str).ok_or_else(|| ProvenanceError::InvalidPackage {
            input: format!("{ecosystem_str}:{name}@{version}"),
            message: format!("unknown ecosystem '{ecosystem_str}'"),
        })?;
    let pkg = PackageIdentifier::new(ecosystem, name, version);
    pkg.validate()?;

    let expected = ExpectedProvenance {
        repository_uri: expect_repository,
        attestations: expect_publisher.map(|repository| ExpectedAttestations {
            available: true,
            publisher: Some(ExpectedPublisher {
                kind: None,
                repository: Some(repository),
                workflow: expect_workflow,
            }),
        }),
    };

    run(vec![pkg], common, expected).await
}

async fn cmd_batch(packages: Vec<String>, common: CommonArgs) -> Result<i32, ProvenanceError> {
    let packages = packages
        .iter()
        .map(|s| s.parse::<PackageIdentifier>())
        .collect::<Result<Vec<_>, _>>()?;
    run(packages, common, ExpectedProvenance::default()).await
}

async fn run(
    packages: Vec<PackageIdentifier>,
    common: CommonArgs,
    expected: ExpectedProvenance,
) -> Result<i32, ProvenanceError> {
    let format = OutputFormat::from_str_lenient(&common.format).unwrap_or_else(|| {
        eprintln!("Warning: unknown format '{}', using console", common.format);
        OutputFormat::Console
    });

    let config_path = common
        .config
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let mut config = Config::load(&config_path)?;
    if common.strict {
        config.requirements.strict = true;
    }

    let service = dockyard::build_service(&config).await?;
    let cancel = cancel_on_ctrl_c();
    let report = dockyard::verify_packages(
        &service,
        &packages,
        &config.requirements,
        &expected,
        &cancel,
    )
    .await;

    let rendered = dockyard::render_report(&report, format, common.verbose)?;
    match common.output {
        Some(out) => std::fs::write(&out, &rendered)?,
        None => print!("{}", rendered),
    }

    // Exit code: 0 = pass, 1 = requirements failed, 2 = verification error
    if let Some(e) = report.error {
        eprintln!("Error: {}", e);
        return Ok(e.exit_code());
    }
    Ok(if report.passed() { 0 } else { 1 })
}

fn cmd_init(force: bool) -> Result<i32, ProvenanceError> {
    let path = PathBuf::from(CONFIG_FILE);

    if path.exists() && !force {
        eprintln!("{} already exists. Use --force to overwrite.", CONFIG_FILE);
        return Ok(1);
    }

    std::fs::write(&path, Config::starter_toml())?;
    println!("Created {}", CONFIG_FILE);

    Ok(0)
}
