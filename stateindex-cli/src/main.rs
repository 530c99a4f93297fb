use std::future::Future;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use log::{debug, warn};

use stateindex_state::{
    BackendRegistry, LoadReport, ResourceDescriptor, StateDecoder, create_connector,
};

#[derive(Parser)]
#[command(name = "stateindex")]
#[command(about = "Index the resources managed by remote Terraform state", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the backends configuration
    Validate {
        /// Path to the backends configuration
        #[arg(default_value = "backends.json")]
        config: PathBuf,
    },
    /// Fetch every configured state file into the destination directory
    Pull {
        /// Path to the backends configuration
        #[arg(default_value = "backends.json")]
        config: PathBuf,

        /// Serve objects from a local mirror ({mirror}/{bucket}/{key}) instead of S3
        #[arg(long)]
        mirror: Option<PathBuf>,
    },
    /// Build the resource index
    Index {
        /// Path to the backends configuration
        #[arg(default_value = "backends.json")]
        config: PathBuf,

        /// Serve objects from a local mirror ({mirror}/{bucket}/{key}) instead of S3
        #[arg(long)]
        mirror: Option<PathBuf>,

        /// Use already fetched files only
        #[arg(long)]
        no_pull: bool,

        /// Print the index as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show which state manages each resource identifier
    Lookup {
        /// Path to the backends configuration
        #[arg(long, short, default_value = "backends.json")]
        config: PathBuf,

        /// Resource identifiers
        #[arg(required = true)]
        ids: Vec<String>,

        /// Serve objects from a local mirror ({mirror}/{bucket}/{key}) instead of S3
        #[arg(long)]
        mirror: Option<PathBuf>,

        /// Use already fetched files only
        #[arg(long)]
        no_pull: bool,
    },
    /// Decode a local state file and list its resources
    Decode {
        /// Path to a state file
        file: PathBuf,

        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,

        /// Include data sources
        #[arg(long)]
        include_data_sources: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let result = match cli.command {
        Commands::Validate { config } => run_validate(&config),
        Commands::Pull { config, mirror } => {
            interruptible(run_pull(&config, mirror.as_deref())).await
        }
        Commands::Index {
            config,
            mirror,
            no_pull,
            json,
        } => interruptible(run_index(&config, mirror.as_deref(), no_pull, json)).await,
        Commands::Lookup {
            config,
            ids,
            mirror,
            no_pull,
        } => interruptible(run_lookup(&config, &ids, mirror.as_deref(), no_pull)).await,
        Commands::Decode {
            file,
            json,
            include_data_sources,
        } => run_decode(&file, json, include_data_sources),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Run a command until it finishes or Ctrl-C is pressed
///
/// Interrupting a transfer can leave partially written state files behind.
async fn interruptible<F>(work: F) -> Result<(), String>
where
    F: Future<Output = Result<(), String>>,
{
    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received Ctrl-C, stopping");
            Err("Interrupted; partially fetched files may remain".to_string())
        }
    }
}

fn load_registry(config: &Path) -> Result<BackendRegistry, String> {
    let mut registry = BackendRegistry::from_file(config).map_err(|e| e.to_string())?;
    registry.validate().map_err(|e| e.to_string())?;
    debug!(
        "Loaded {} backends from {} (destination {})",
        registry.config().s3.len(),
        config.display(),
        registry.config().destination.display()
    );
    Ok(registry)
}

async fn pull(registry: &mut BackendRegistry, mirror: Option<&Path>) -> Result<(), String> {
    let concurrency = registry.config().fetch_options().concurrency;
    let connector = create_connector(mirror, concurrency);

    eprintln!("{}", "Pulling state files...".cyan());
    let summary = registry
        .pull(connector.as_ref())
        .await
        .map_err(|e| e.to_string())?;

    eprintln!(
        "{}",
        format!(
            "✓ {} state files from {} backends ({} downloaded, {} already present).",
            summary.objects, summary.backends, summary.downloaded, summary.skipped
        )
        .green()
        .bold()
    );
    Ok(())
}

async fn prepare(
    config: &Path,
    mirror: Option<&Path>,
    no_pull: bool,
) -> Result<BackendRegistry, String> {
    let mut registry = load_registry(config)?;
    if no_pull {
        registry.locate().map_err(|e| e.to_string())?;
    } else {
        pull(&mut registry, mirror).await?;
    }
    Ok(registry)
}

fn run_validate(config: &Path) -> Result<(), String> {
    println!("{}", "Validating...".cyan());

    let registry = load_registry(config)?;
    let config = registry.config();
    let keys: usize = config.s3.iter().map(|b| b.keys.len()).sum();

    println!(
        "{}",
        format!(
            "✓ {} backends with {} state files validated successfully.",
            config.s3.len(),
            keys
        )
        .green()
        .bold()
    );

    for backend in &config.s3 {
        let region = backend.region().unwrap_or("default region");
        match backend.role_arn() {
            Some(role) => println!(
                "  • s3://{} ({}, as {}): {} keys",
                backend.bucket,
                region,
                role,
                backend.keys.len()
            ),
            None => println!(
                "  • s3://{} ({}): {} keys",
                backend.bucket,
                region,
                backend.keys.len()
            ),
        }
    }

    Ok(())
}

async fn run_pull(config: &Path, mirror: Option<&Path>) -> Result<(), String> {
    let mut registry = load_registry(config)?;
    pull(&mut registry, mirror).await?;

    for object in registry.state_files().iter() {
        println!(
            "  {} {} {}",
            object.path.display(),
            "←".dimmed(),
            object.remote
        );
    }
    Ok(())
}

async fn run_index(
    config: &Path,
    mirror: Option<&Path>,
    no_pull: bool,
    json: bool,
) -> Result<(), String> {
    let registry = prepare(config, mirror, no_pull).await?;
    let report = registry.load();
    debug!(
        "Indexed {} resources, {} state files skipped",
        report.index.len(),
        report.skipped.len()
    );

    if json {
        let output = serde_json::to_string_pretty(&report.index).map_err(|e| e.to_string())?;
        println!("{}", output);
    } else {
        print_index(&report);
    }

    print_skipped(&report);
    Ok(())
}

async fn run_lookup(
    config: &Path,
    ids: &[String],
    mirror: Option<&Path>,
    no_pull: bool,
) -> Result<(), String> {
    let registry = prepare(config, mirror, no_pull).await?;
    let report = registry.load();

    let mut unmanaged = 0;
    for id in ids {
        match report.index.owner(id) {
            Some(owner) => println!("  {} {} {}", "✓".green(), id.bold(), owner),
            None => {
                println!("  {} {} {}", "✗".red(), id.bold(), "not managed".yellow());
                unmanaged += 1;
            }
        }
    }

    print_skipped(&report);

    if unmanaged > 0 {
        return Err(format!("{} of {} identifiers are not managed", unmanaged, ids.len()));
    }
    Ok(())
}

fn run_decode(file: &Path, json: bool, include_data_sources: bool) -> Result<(), String> {
    let decoder = StateDecoder::new().with_data_sources(include_data_sources);
    let descriptors = decoder
        .decode_file(file)
        .map_err(|e| format!("Failed to decode {}: {}", file.display(), e))?;

    if json {
        let output = serde_json::to_string_pretty(&descriptors).map_err(|e| e.to_string())?;
        println!("{}", output);
        return Ok(());
    }

    println!(
        "{}",
        format!("{} resources in {}", descriptors.len(), file.display()).bold()
    );
    for descriptor in &descriptors {
        println!("  • {}", format_descriptor(descriptor));
    }
    Ok(())
}

fn format_descriptor(descriptor: &ResourceDescriptor) -> String {
    match &descriptor.arn {
        Some(arn) => format!("{} {} ({})", descriptor.address, descriptor.id.bold(), arn),
        None => format!("{} {}", descriptor.address, descriptor.id.bold()),
    }
}

fn print_index(report: &LoadReport) {
    if report.index.is_empty() {
        println!("{}", "No managed resources found.".yellow());
        return;
    }

    for (owner, ids) in report.index.by_owner() {
        println!("{} ({} resources)", owner.cyan().bold(), ids.len());
        for id in ids {
            println!("  • {}", id);
        }
    }

    println!();
    println!(
        "{}",
        format!(
            "✓ {} resources indexed from {} state files.",
            report.index.len(),
            report.loaded.len()
        )
        .green()
        .bold()
    );
}

fn print_skipped(report: &LoadReport) {
    if report.is_complete() {
        return;
    }

    eprintln!(
        "{}",
        format!(
            "⚠ {} state files could not be decoded; the index is incomplete:",
            report.skipped.len()
        )
        .yellow()
        .bold()
    );
    for skipped in &report.skipped {
        eprintln!(
            "  {} {} ({}): {}",
            "✗".red(),
            skipped.path.display(),
            skipped.remote,
            skipped.reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_lookup() {
        let cli = Cli::parse_from([
            "stateindex",
            "lookup",
            "-c",
            "conf.json",
            "i-123",
            "i-456",
            "--no-pull",
        ]);
        match cli.command {
            Commands::Lookup {
                config,
                ids,
                no_pull,
                mirror,
            } => {
                assert_eq!(config, PathBuf::from("conf.json"));
                assert_eq!(ids, vec!["i-123", "i-456"]);
                assert!(no_pull);
                assert!(mirror.is_none());
            }
            _ => panic!("Expected lookup command"),
        }
    }

    #[test]
    fn test_format_descriptor() {
        colored::control::set_override(false);
        let descriptor = ResourceDescriptor {
            id: "Z123".to_string(),
            arn: None,
            resource_type: "aws_route53_zone".to_string(),
            address: "aws_route53_zone.main".to_string(),
        };
        assert_eq!(format_descriptor(&descriptor), "aws_route53_zone.main Z123");
    }

    #[test]
    fn test_load_registry() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("backends.json");

        let config = serde_json::json!({
            "destination": dir.path().join("cache"),
            "s3": [{"bucket": "states", "keys": ["app.tfstate"]}]
        });
        std::fs::write(&config_path, config.to_string()).unwrap();
        let registry = load_registry(&config_path).unwrap();
        assert_eq!(registry.config().s3.len(), 1);

        std::fs::write(&config_path, r#"{"destination": "cache", "s3": []}"#).unwrap();
        assert!(load_registry(&config_path).is_err());
    }

    #[tokio::test]
    async fn test_index_from_mirror() {
        let mirror = tempfile::tempdir().unwrap();
        let destination = tempfile::tempdir().unwrap();
        let state = r#"{"version": 4, "resources": [{"mode": "managed", "type": "aws_instance",
            "name": "web", "instances": [{"attributes": {"id": "i-1", "arn": "arn:i-1"}}]}]}"#;
        std::fs::create_dir_all(mirror.path().join("states")).unwrap();
        std::fs::write(mirror.path().join("states/app.tfstate"), state).unwrap();

        let config_path = destination.path().join("backends.json");
        let config = serde_json::json!({
            "destination": destination.path().join("cache"),
            "s3": [{"bucket": "states", "keys": ["app.tfstate"], "region": "eu-west-1"}]
        });
        std::fs::write(&config_path, config.to_string()).unwrap();

        let registry = prepare(&config_path, Some(mirror.path()), false)
            .await
            .unwrap();
        let report = registry.load();
        assert_eq!(report.index.owner("i-1"), Some("arn:aws:s3:::states/app.tfstate"));

        run_lookup(&config_path, &["i-1".to_string()], Some(mirror.path()), true)
            .await
            .unwrap();
        assert!(
            run_lookup(&config_path, &["i-2".to_string()], None, true)
                .await
                .is_err()
        );
    }
}
