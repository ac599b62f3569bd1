use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use plugforge_core::config::ConfigLoader;
use plugforge_core::metadata::{il, json, Module};
use plugforge_core::pipeline::{self, Analysis};
use plugforge_core::process::ExternalTools;
use plugforge_core::{
    Architecture, BuildRequest, ContractCatalog, MetadataSource, PluginKind, WrapperTarget,
};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "plugforge", about = "Build native file manager plugins from managed modules")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to $PLUGFORGE_CONFIG, then ./plugforge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze, trim, reassemble and package a plugin
    Build(BuildArgs),
    /// Report the plugin declarations and export decision
    Analyze(AnalyzeArgs),
    /// Remove stripped exports from wrapper IL text
    Trim(TrimArgs),
    /// Print the contract tables
    Catalog(CatalogArgs),
}

#[derive(Args)]
struct MetadataArgs {
    /// JSON metadata dump of the managed module
    #[arg(long, conflicts_with = "il")]
    metadata_json: Option<PathBuf>,

    /// Disassembled managed module
    #[arg(long)]
    il: Option<PathBuf>,

    /// Disassembled reference module (repeatable)
    #[arg(long = "reference-il", requires = "il")]
    reference_il: Vec<PathBuf>,
}

impl MetadataArgs {
    fn source(&self) -> MetadataSource {
        match (&self.metadata_json, &self.il) {
            (Some(path), _) => MetadataSource::Json(path.clone()),
            (None, Some(module)) => MetadataSource::Il {
                module: module.clone(),
                references: self.reference_il.clone(),
            },
            (None, None) => MetadataSource::Disassemble,
        }
    }

    fn load(&self) -> Result<(Module, Vec<Module>)> {
        match self.source() {
            MetadataSource::Json(path) => {
                let dump = json::load(&path)?;
                Ok((dump.module, dump.references))
            }
            MetadataSource::Il { module, references } => {
                let read = |path: &Path| -> Result<Module> {
                    let text = fs::read_to_string(path)
                        .context(format!("Failed to read {:?}", path))?;
                    Ok(il::from_text(&text)?)
                };
                let references = references
                    .iter()
                    .map(|path| read(path.as_path()))
                    .collect::<Result<Vec<_>>>()?;
                Ok((read(module.as_path())?, references))
            }
            MetadataSource::Disassemble => {
                anyhow::bail!("analysis needs --metadata-json or --il")
            }
        }
    }
}

#[derive(Args)]
struct BuildArgs {
    /// Compiled managed plugin assembly
    #[arg(long)]
    assembly: PathBuf,

    #[command(flatten)]
    metadata: MetadataArgs,

    /// Wrapper template as ARCH=PATH; the first is the primary wrapper
    #[arg(long = "wrapper", required = true, value_parser = parse_wrapper)]
    wrappers: Vec<WrapperTarget>,

    /// Reference file to bundle (repeatable)
    #[arg(long = "reference")]
    references: Vec<PathBuf>,

    /// Output directory
    #[arg(long, default_value = ".")]
    out: PathBuf,

    /// Runtime identifier appended to the archive name
    #[arg(long)]
    rid: Option<String>,

    /// Plugin name (defaults to the assembly name)
    #[arg(long)]
    name: Option<String>,

    /// Packer default extension
    #[arg(long)]
    default_extension: Option<String>,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct AnalyzeArgs {
    #[command(flatten)]
    metadata: MetadataArgs,

    /// Print the analysis as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct TrimArgs {
    #[command(flatten)]
    metadata: MetadataArgs,

    /// Wrapper IL text to trim
    #[arg(long)]
    input: PathBuf,

    /// Where to write the trimmed text
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args)]
struct CatalogArgs {
    /// Only this kind
    #[arg(long)]
    kind: Option<PluginKind>,
}

fn parse_wrapper(value: &str) -> Result<WrapperTarget, String> {
    let (arch, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ARCH=PATH, got `{value}`"))?;
    let architecture: Architecture = arch.parse()?;
    Ok(WrapperTarget {
        architecture,
        template: PathBuf::from(path),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let catalog = ContractCatalog::load();
    match cli.command {
        Commands::Build(args) => build(args, cli.config.as_deref(), &catalog),
        Commands::Analyze(args) => analyze(args, &catalog),
        Commands::Trim(args) => trim(args, &catalog),
        Commands::Catalog(args) => {
            print_catalog(&catalog, args.kind);
            Ok(())
        }
    }
}

fn build(args: BuildArgs, config: Option<&Path>, catalog: &ContractCatalog) -> Result<()> {
    let config = ConfigLoader::load(config).context("Failed to load configuration")?;
    let request = BuildRequest {
        managed_assembly: args.assembly.clone(),
        metadata: args.metadata.source(),
        wrappers: args.wrappers,
        references: args.references,
        output_dir: args.out,
        runtime_identifier: args.rid,
        name: args.name,
        default_extension: args.default_extension,
    };
    let tools = ExternalTools::new(config.tools.clone());
    let cancel = CancellationToken::new();
    let outcome = pipeline::build(&request, &config, catalog, &tools, &cancel)
        .context(format!("Failed to build plugin from {:?}", args.assembly))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_analysis(&outcome.analysis);
        for entry in &outcome.package.entries {
            println!("  {:<32} {:>10}  {}", entry.name, entry.size, entry.md5);
        }
    }
    let generated: Vec<String> = outcome
        .generated_files
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    println!("generated: {}", generated.join(";"));
    Ok(())
}

fn analyze(args: AnalyzeArgs, catalog: &ContractCatalog) -> Result<()> {
    let (module, references) = args.metadata.load()?;
    let analysis = pipeline::analyze(&module, &references, catalog)
        .context(format!("Failed to analyze {}", module.assembly.name))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    } else {
        print_analysis(&analysis);
    }
    Ok(())
}

fn trim(args: TrimArgs, catalog: &ContractCatalog) -> Result<()> {
    let (module, references) = args.metadata.load()?;
    let analysis = pipeline::analyze(&module, &references, catalog)
        .context(format!("Failed to analyze {}", module.assembly.name))?;
    let text = fs::read_to_string(&args.input)
        .context(format!("Failed to read {:?}", args.input))?;
    let (trimmed, report) = pipeline::trim(&text, &analysis.decision)
        .context(format!("Failed to parse {:?}", args.input))?;
    fs::write(&args.output, trimmed).context(format!("Failed to write {:?}", args.output))?;

    for removed in &report.removed {
        println!("removed {} from {} (line {})", removed.name, removed.method, removed.line);
    }
    println!("generated: {}", args.output.display());
    Ok(())
}

fn print_analysis(analysis: &Analysis) {
    for declaration in &analysis.scan.declarations {
        println!("declared: {}", declaration);
    }
    for warning in &analysis.scan.warnings {
        println!("warning: {}", warning);
    }
    for (kind, members) in &analysis.implemented {
        for member in members {
            println!("implemented ({}): {} in {}", kind, member.signature, member.declaring_type);
        }
    }
    let decision = &analysis.decision;
    println!(
        "{} plugin{}:",
        decision.kind,
        if decision.merged { " (with content)" } else { "" }
    );
    for (name, verdict) in &decision.verdicts {
        println!("  {:<36} {}", name, verdict);
    }
}

fn print_catalog(catalog: &ContractCatalog, only: Option<PluginKind>) {
    let kinds: Vec<PluginKind> = match only {
        Some(kind) => vec![kind],
        None => PluginKind::ALL.to_vec(),
    };
    for kind in kinds {
        let contracts = catalog.contracts(kind);
        println!("{} ({} members)", kind, contracts.len());
        for contract in contracts {
            let flag = if contract.mandatory {
                "mandatory"
            } else if contract.base_implemented {
                "base"
            } else {
                "optional"
            };
            println!(
                "  {:<40} {:<10} {}",
                contract.signature,
                flag,
                contract.export_names.join(", ")
            );
        }
    }
}
