//! Operator tool for module artifacts
//!
//! Inspects artifacts, scans an artifacts directory and runs ad-hoc code
//! through the sandbox with the configured ceilings.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use module_runtime::config::RuntimeConfig;
use module_runtime::module::loader::compute_checksum;
use module_runtime::module::registry::{ModuleDiscovery, ModuleManifest, MANIFEST_FILE_NAME};
use module_runtime::module::validation::{ManifestValidator, ValidationResult};
use module_runtime::module::Sandbox;
use module_runtime::utils::init_logging_from_config;

#[derive(Parser)]
#[command(name = "modrt", version, about = "Module runtime operator tool")]
struct Cli {
    /// Runtime configuration file (TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate one artifact directory and print its checksum
    Inspect {
        artifact: PathBuf,
    },
    /// List every artifact under the configured artifacts directory
    Discover,
    /// Run a script inside the sandbox
    Exec {
        /// Module the execution is attributed to
        #[arg(short, long, default_value = "modrt/adhoc")]
        module: String,
        script: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("loading configuration from {:?}", path))?,
        None => RuntimeConfig::default(),
    };
    config.validate()?;
    init_logging_from_config(Some(&config.logging));

    match cli.command {
        Command::Inspect { artifact } => inspect(&artifact),
        Command::Discover => discover(&config),
        Command::Exec { module, script } => exec(&config, &module, &script).await,
    }
}

fn inspect(artifact: &Path) -> Result<()> {
    let manifest = ModuleManifest::from_file(artifact.join(MANIFEST_FILE_NAME))?;
    let (hooks, unknown) = manifest.declared_hooks();

    println!("name:        {}", manifest.name);
    println!("version:     {}", manifest.version);
    println!("runtime:     {:?}", manifest.runtime);
    println!("entry point: {}", manifest.entry_point);
    println!("hooks:       {}", hooks.names().join(", "));
    if !manifest.capabilities.tools.is_empty() {
        println!("tools:       {}", manifest.capabilities.tools.join(", "));
    }

    if let ValidationResult::Invalid(errors) = ManifestValidator::new().validate(&manifest) {
        for error in &errors {
            eprintln!("error: {}", error);
        }
        bail!("manifest of {} is invalid", manifest.name);
    }
    if !unknown.is_empty() {
        eprintln!("warning: unknown hooks {}", unknown.join(", "));
    }
    let missing = hooks.missing_mandatory();
    if !missing.is_empty() {
        bail!("missing mandatory hooks: {}", missing.join(", "));
    }

    println!("checksum:    {}", compute_checksum(artifact)?);
    Ok(())
}

fn discover(config: &RuntimeConfig) -> Result<()> {
    let discovered = ModuleDiscovery::new(&config.artifacts_dir).discover_modules()?;
    if discovered.is_empty() {
        println!("no artifacts under {:?}", config.artifacts_dir);
    }
    for module in discovered {
        println!(
            "{:<24} {:<10} {}  {}",
            module.manifest.name,
            module.manifest.version,
            &module.checksum[..12.min(module.checksum.len())],
            module.directory.display()
        );
    }
    Ok(())
}

async fn exec(config: &RuntimeConfig, module: &str, script: &Path) -> Result<()> {
    let code = std::fs::read_to_string(script)
        .with_context(|| format!("reading {:?}", script))?;
    let sandbox = Sandbox::new(config.sandbox.clone())?;
    let context = sandbox.create_context(module, None);

    let output = sandbox.execute(&context, &code, &HashMap::new()).await?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);

    let stats = sandbox.stats(module).await;
    eprintln!(
        "exit {} after {:?} (user {:?}, system {:?})",
        output.exit_code,
        output.runtime,
        stats.resource_usage.user_time,
        stats.resource_usage.system_time
    );
    if !output.success() {
        std::process::exit(output.exit_code);
    }
    Ok(())
}
