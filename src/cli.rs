use crate::batch::{BatchConverter, ProgressInfo};
use crate::orchestrator::TierOrchestrator;
use crate::{format_bytes, format_duration, sanitize_filename, CancellationSignal, Config, Document, Metrics, TargetFormat};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "render-tiers")]
#[command(about = "Convert markup documents with capability-driven tier fallback")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Maximum engine processes")]
    pub max_instances: Option<usize>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert a single markup file
    Convert {
        #[arg(short, long, help = "Input markup file")]
        input: PathBuf,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,

        #[arg(short, long, help = "Target format (pdf, png, jpeg, mhtml, html)")]
        format: Option<String>,
    },

    /// Convert every markup file in a directory or list file
    Batch {
        #[arg(short, long, help = "Input directory, or a file listing one path per line")]
        input: PathBuf,

        #[arg(short, long, help = "Output directory")]
        output: PathBuf,

        #[arg(short, long, help = "Target format (pdf, png, jpeg, mhtml, html)")]
        format: Option<String>,

        #[arg(short, long, help = "Concurrency level (default: number of CPUs)")]
        concurrency: Option<usize>,
    },

    /// Print the capability assessment of this host
    Probe {
        #[arg(long, help = "Run the heavier benchmarks")]
        intensive: bool,

        #[arg(long, help = "Print JSON instead of a table")]
        json: bool,
    },

    /// List registered remote conversion services
    Services {
        #[arg(long, help = "Run a health probe against every service")]
        check: bool,
    },

    /// Validate the configuration file given with --config
    Validate,
}

/// Apply global flags on top of a loaded configuration.
pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(max_instances) = args.max_instances {
        config.pool.max_instances = max_instances;
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.engine.chrome_path = Some(chrome_path.clone());
    }
    if let Commands::Probe { intensive, .. } = &args.command {
        config.capability.intensive = *intensive;
        config.capability.cache = false;
    }
}

pub async fn load_config(args: &Cli) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };

    apply_overrides(&mut config, args);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Max engine processes: {}", config.pool.max_instances);
    info!("Max fallback attempts: {}", config.orchestrator.max_fallback_attempts);
    info!("Default target: {}", config.orchestrator.default_target);

    Ok(config)
}

fn parse_format(format: Option<&str>) -> Result<Option<TargetFormat>> {
    format
        .map(|f| f.parse::<TargetFormat>().map_err(anyhow::Error::msg))
        .transpose()
}

fn source_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("xhtml") | Some("xht") => "application/xhtml+xml",
        _ => "text/html",
    }
}

fn is_markup_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("html") | Some("htm") | Some("xhtml") | Some("xht")
    )
}

pub async fn read_document(path: &Path) -> Result<Document> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut document = Document::new(content).with_title(
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Document".to_string()),
    );
    document.source_type = source_type_for(path).to_string();
    Ok(document)
}

/// Markup files named by `input`: a directory's markup files or the paths
/// listed in a file, one per line (`#` starts a comment).
pub async fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    if fs::metadata(input).await?.is_dir() {
        let mut entries = fs::read_dir(input).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_markup_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();
    } else {
        let base = input.parent().unwrap_or_else(|| Path::new("."));
        let content = fs::read_to_string(input).await?;
        paths = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| base.join(line))
            .collect();
    }
    Ok(paths)
}

pub struct CliRunner {
    pub config: Config,
    pub orchestrator: Arc<TierOrchestrator>,
    pub cancel: CancellationSignal,
}

impl CliRunner {
    pub async fn new(config: Config, metrics: Arc<Metrics>) -> Result<Self> {
        let orchestrator = TierOrchestrator::builder(config.clone())
            .metrics(metrics)
            .build()
            .await?;

        Ok(Self {
            config,
            orchestrator: Arc::new(orchestrator),
            cancel: CancellationSignal::new(),
        })
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Convert { input, output, format } => {
                self.run_convert(&input, &output, parse_format(format.as_deref())?)
                    .await
            }
            Commands::Batch {
                input,
                output,
                format,
                concurrency,
            } => {
                let concurrency = concurrency.unwrap_or_else(num_cpus::get);
                self.run_batch(&input, &output, parse_format(format.as_deref())?, concurrency)
                    .await
            }
            Commands::Probe { json, .. } => self.run_probe(json).await,
            Commands::Services { check } => self.run_services(check).await,
            Commands::Validate => {
                self.config.validate()?;
                print_config_summary(&self.config);
                Ok(())
            }
        }
    }

    pub async fn run_convert(&self, input: &Path, output: &Path, format: Option<TargetFormat>) -> Result<()> {
        let document = read_document(input).await?;
        info!("Converting {} ({})", input.display(), format_bytes(document.size()));

        let result = self
            .orchestrator
            .convert_with_cancel(&document, format, &self.cancel)
            .await?;

        if let Some(requested) = result.metadata.extra.get("requested_format") {
            warn!(
                "Requested {} could not be produced; wrote {} instead",
                requested, result.metadata.target_format
            );
        }
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(output, &result.content).await?;

        println!("Document converted successfully:");
        println!("  Input: {}", input.display());
        println!("  Output: {}", output.display());
        println!("  Format: {}", result.metadata.target_format);
        println!("  Tier: {}", result.metadata.tier);
        if let Some(service) = &result.metadata.service_used {
            println!("  Service: {service}");
        }
        println!("  Fallbacks: {}", result.metadata.fallback_attempts);
        println!("  Size: {}", format_bytes(result.content.len()));
        println!("  Duration: {}", format_duration(result.metadata.execution_time));
        Ok(())
    }

    pub async fn run_batch(
        &self,
        input: &Path,
        output: &Path,
        format: Option<TargetFormat>,
        concurrency: usize,
    ) -> Result<()> {
        let paths = collect_inputs(input).await?;
        if paths.is_empty() {
            bail!("no markup files found in {}", input.display());
        }
        info!("Loaded {} documents from {}", paths.len(), input.display());
        fs::create_dir_all(output).await?;

        let mut documents = Vec::with_capacity(paths.len());
        for path in &paths {
            documents.push(read_document(path).await?);
        }

        let batch = BatchConverter::new(self.orchestrator.clone(), concurrency)
            .with_cancel(self.cancel.clone())
            .on_progress(|progress: &ProgressInfo| {
                println!(
                    "Progress: {}/{} - Success: {}, Errors: {}, Rate: {:.1}/s, ETA: {}",
                    progress.completed,
                    progress.total,
                    progress.success,
                    progress.errors,
                    progress.rate,
                    progress.eta.map(format_duration).unwrap_or_else(|| "-".to_string())
                );
            });
        let outcomes = batch.process(documents, format).await;

        let mut failed = 0;
        for outcome in outcomes {
            let source = &paths[outcome.index];
            match outcome.result {
                Ok(result) => {
                    let stem = source
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| outcome.document_id.clone());
                    let target = output.join(format!(
                        "{}.{}",
                        sanitize_filename(&stem),
                        result.metadata.target_format.extension()
                    ));
                    fs::write(&target, &result.content).await?;
                    info!("Saved {} via {}", target.display(), result.metadata.tier);
                }
                Err(failure) => {
                    failed += 1;
                    warn!("Failed to convert {}: {}", source.display(), failure);
                }
            }
        }

        info!("Batch finished with {} failure(s)", failed);
        Ok(())
    }

    pub async fn run_probe(&self, json: bool) -> Result<()> {
        let assessment = self.orchestrator.probe().assess().await;
        if json {
            println!("{}", serde_json::to_string_pretty(&assessment)?);
            return Ok(());
        }

        println!("Capability Assessment");
        println!("=====================");
        for capability in assessment.backend_scores.values() {
            println!(
                "  {:<8} available: {:<5} performance: {:.2}",
                capability.backend, capability.available, capability.performance
            );
        }
        println!("Overall score: {:.2}", assessment.overall_score);
        println!("Recommended tier: {}", assessment.recommended_tier);
        for limitation in assessment.limitations() {
            println!("  - {limitation}");
        }

        let formats = self.orchestrator.get_supported_formats().await;
        println!(
            "Supported formats: {}",
            formats.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
        );
        Ok(())
    }

    pub async fn run_services(&self, check: bool) -> Result<()> {
        let Some(client) = self.orchestrator.remote() else {
            println!("No remote services registered");
            return Ok(());
        };

        println!("Remote Services");
        println!("===============");
        for service in client.services() {
            println!(
                "  {:<20} {:<6} priority {:<3} {}/{}",
                service.id,
                service.category,
                service.priority,
                service.url.trim_end_matches('/'),
                service.endpoint.trim_start_matches('/')
            );
        }

        if check {
            println!("\nHealth:");
            for (id, healthy) in client.health_check_all().await {
                let status = client
                    .get_health(&id)
                    .map(|h| h.status.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("  {:<20} {} ({})", id, if healthy { "ok" } else { "failed" }, status);
            }
        }
        Ok(())
    }
}

pub async fn validate_config_file(path: &Path) -> Result<()> {
    println!("Validating configuration: {}", path.display());

    let config = Config::load(path).await?;
    config.validate()?;
    print_config_summary(&config);
    Ok(())
}

fn print_config_summary(config: &Config) {
    println!("Configuration is valid:");
    println!("  Max engine processes: {}", config.pool.max_instances);
    println!("  Max fallback attempts: {}", config.orchestrator.max_fallback_attempts);
    println!("  Default target: {}", config.orchestrator.default_target);
    println!("  Render timeout: {:?}", config.engine.render_timeout);
    println!("  Remote services: {}", config.remote.services.len());
}

pub fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_override_config() {
        let cli = Cli::try_parse_from([
            "render-tiers",
            "--max-instances",
            "9",
            "--chrome-path",
            "/opt/chromium",
            "probe",
            "--intensive",
        ])
        .expect("parse");

        let mut config = Config::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.pool.max_instances, 9);
        assert_eq!(config.engine.chrome_path.as_deref(), Some("/opt/chromium"));
        assert!(config.capability.intensive);
        assert!(!config.capability.cache);
    }

    #[test]
    fn convert_arguments_parse() {
        let cli = Cli::try_parse_from([
            "render-tiers",
            "convert",
            "-i",
            "in.html",
            "-o",
            "out.pdf",
            "--format",
            "pdf",
            "--verbose",
        ])
        .expect("parse");
        assert!(cli.verbose);
        match cli.command {
            Commands::Convert { input, format, .. } => {
                assert_eq!(input, PathBuf::from("in.html"));
                assert_eq!(parse_format(format.as_deref()).expect("format"), Some(TargetFormat::Pdf));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(parse_format(Some("webp")).is_err());
    }

    #[tokio::test]
    async fn collects_inputs_from_directory_and_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("b.html"), "<p>b</p>").await.expect("write");
        fs::write(dir.path().join("a.xhtml"), "<p>a</p>").await.expect("write");
        fs::write(dir.path().join("notes.txt"), "ignored").await.expect("write");

        let found = collect_inputs(dir.path()).await.expect("dir");
        assert_eq!(found, vec![dir.path().join("a.xhtml"), dir.path().join("b.html")]);

        let list = dir.path().join("list.txt");
        fs::write(&list, "# docs\nb.html\n\n a.xhtml \n").await.expect("write");
        let listed = collect_inputs(&list).await.expect("list");
        assert_eq!(listed, vec![dir.path().join("b.html"), dir.path().join("a.xhtml")]);

        let doc = read_document(&dir.path().join("a.xhtml")).await.expect("read");
        assert_eq!(doc.source_type, "application/xhtml+xml");
        assert_eq!(doc.title.as_deref(), Some("a"));
    }
}
