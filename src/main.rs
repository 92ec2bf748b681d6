//! Brain Streamlines
//!
//! CLI commands:
//! - search: Find connectivity experiments injected in a brain region
//! - csv: List or download experiments from an atlas CSV export
//! - download: Fetch streamlines into the local cache
//! - parse: Build tube geometry and report its size
//! - render: Build tube geometry and save a PNG snapshot

mod color;
mod config;
mod connectome;
mod download;
mod error;
mod frame;
mod geometry;
mod logging;
mod render;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use connectome::{AllenConnectivityApi, ExperimentId, SearchParams};
use download::{CsvIngest, HttpFetcher, StreamlinesApi};
use geometry::{StreamlineActor, TubeStyle};

#[derive(Parser)]
#[command(name = "brain_streamlines")]
#[command(about = "Download and build neural connectivity streamlines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to streamlines.yaml config
    #[arg(short, long, default_value = "streamlines.yaml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Find experiments injected in a brain region
    Search {
        /// Region acronym, e.g. VISp
        region: String,

        /// Also match experiments where the region is not the primary injection
        #[arg(long)]
        all_structures: bool,

        /// Restrict to transgenic lines ("0" for wild type)
        #[arg(long = "transgenic-line")]
        transgenic_lines: Vec<String>,

        /// Download streamlines for every match
        #[arg(long)]
        download: bool,
    },

    /// Read experiment ids from an atlas CSV export
    Csv {
        file: PathBuf,

        /// Download instead of printing links
        #[arg(long)]
        download: bool,
    },

    /// Download streamlines into the cache
    Download {
        #[arg(required = true)]
        ids: Vec<ExperimentId>,

        /// Cache directory override
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// Build tube geometry and print a summary
    Parse {
        #[command(flatten)]
        input: GeometryInput,

        #[command(flatten)]
        style: StyleArgs,
    },

    /// Build tube geometry and save a PNG snapshot
    Render {
        #[command(flatten)]
        input: GeometryInput,

        #[command(flatten)]
        style: StyleArgs,

        /// Output PNG path
        #[arg(short, long)]
        output: PathBuf,

        /// Image size in pixels
        #[arg(long, default_value = "800")]
        size: u32,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct GeometryInput {
    /// Streamline JSON file
    #[arg(long)]
    file: Option<PathBuf>,

    /// Experiment id, loaded through the cache
    #[arg(long)]
    id: Option<ExperimentId>,
}

#[derive(Args)]
struct StyleArgs {
    #[arg(long)]
    radius: Option<f32>,
    #[arg(long)]
    color: Option<String>,
    #[arg(long)]
    alpha: Option<f32>,
    #[arg(long)]
    resolution: Option<u32>,
}

type Api = StreamlinesApi<AllenConnectivityApi, HttpFetcher>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = config::Env::load();
    logging::init_logging(&env.log_dir);
    tracing::info!("Brain Streamlines starting up");

    let cli = Cli::parse();
    tracing::debug!("CLI args parsed: config={:?}", cli.config);

    let config = if cli.config.exists() {
        tracing::info!("Loading config from {:?}", cli.config);
        config::Config::load(&cli.config)?
    } else {
        tracing::warn!("Config file not found: {:?}, using defaults", cli.config);
        config::Config::default()
    };
    let config = config.with_env(&env);

    let api = build_api(&config)?;
    tracing::info!("Streamline cache: {:?}", api.cache_dir());

    match cli.command {
        Commands::Search {
            region,
            all_structures,
            transgenic_lines,
            download,
        } => {
            let params = SearchParams {
                primary_structure_only: !all_structures,
                transgenic_lines,
            };
            if download {
                let cached = api.download_streamlines_for_region(&region, &params).await?;
                report_cached(&cached);
            } else {
                let ids = api.experiments_for_region(&region, &params).await?;
                println!("Found {} experiments injected in {}", ids.len(), region);
                println!("IDs: {}", download::join_ids(&ids));
            }
        }

        Commands::Csv { file, download } => match api.extract_ids_from_csv(&file, download).await? {
            CsvIngest::Ids(ids) => tracing::debug!("Listed {} ids", ids.len()),
            CsvIngest::Downloaded(cached) => report_cached(&cached),
        },

        Commands::Download { ids, cache_dir } => {
            let cached = api.download_streamlines(ids, cache_dir.as_deref()).await?;
            report_cached(&cached);
        }

        Commands::Parse { input, style } => {
            let actors = build_geometry(&api, &config, &input, &style).await?;
            for actor in &actors {
                println!(
                    "{} tubes, {} vertices, {} triangles",
                    actor.tube_count(),
                    actor.mesh.vertex_count(),
                    actor.mesh.triangle_count()
                );
            }
        }

        Commands::Render {
            input,
            style,
            output,
            size,
        } => {
            let actors = build_geometry(&api, &config, &input, &style).await?;
            render::render_to_png(&actors, &output, size)?;
        }
    }

    Ok(())
}

fn http_client(config: &config::Config) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());
    if let Some(secs) = config.request_timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    Ok(builder.build()?)
}

fn build_api(config: &config::Config) -> anyhow::Result<Api> {
    let client = http_client(config)?;
    Ok(StreamlinesApi::new(
        AllenConnectivityApi::new(client.clone(), &config.connectivity_api),
        HttpFetcher::new(client),
        &config.cache_dir,
        &config.streamlines_url,
    ))
}

/// Load the requested input and build the merged tubes
async fn build_geometry(
    api: &Api,
    config: &config::Config,
    input: &GeometryInput,
    args: &StyleArgs,
) -> anyhow::Result<Vec<StreamlineActor>> {
    let mut defaults = config.render.clone();
    if let Some(radius) = args.radius {
        defaults.radius = radius;
    }
    if let Some(color) = &args.color {
        defaults.color = color.clone();
    }
    if let Some(alpha) = args.alpha {
        defaults.alpha = alpha;
    }
    if let Some(resolution) = args.resolution {
        defaults.resolution = resolution;
    }
    let style = TubeStyle::from_defaults(&defaults)?;

    let cached = match input.id {
        Some(id) => api.download_streamlines([id], None).await?.into_iter().next(),
        None => None,
    };

    let actors = geometry::parse_streamline(
        input.file.as_deref(),
        cached.as_ref().map(|c| &c.data),
        &style,
    )?;
    Ok(actors)
}

fn report_cached(cached: &[download::CachedStreamlines]) {
    println!("Resolved {} experiments:", cached.len());
    for entry in cached {
        println!("  [OK] {} -> {} ({} records)", entry.id, entry.path.display(), entry.data.num_rows());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_input_takes_file_or_id() {
        let cli = Cli::try_parse_from(["brain_streamlines", "parse", "--id", "100141219"]).unwrap();
        match cli.command {
            Commands::Parse { input, .. } => {
                assert_eq!(input.id, Some(ExperimentId(100141219)));
                assert!(input.file.is_none());
            }
            _ => panic!("expected parse command"),
        }
    }

    #[test]
    fn test_file_and_id_together_rejected_before_any_download() {
        let both = Cli::try_parse_from([
            "brain_streamlines",
            "render",
            "--file",
            "streamlines.json",
            "--id",
            "42",
            "--output",
            "out.png",
        ]);
        assert_eq!(both.err().map(|e| e.kind()), Some(clap::error::ErrorKind::ArgumentConflict));

        let neither = Cli::try_parse_from(["brain_streamlines", "parse"]);
        assert_eq!(
            neither.err().map(|e| e.kind()),
            Some(clap::error::ErrorKind::MissingRequiredArgument)
        );
    }
}
