//! logprof - HTTP access log and packet capture profiler
//!
//! Aggregates access logs (LTSV, JSON, regexp) or HTTP traffic
//! reconstructed from pcap captures into per-endpoint statistics.

mod render;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use logprof_capture::{PcapOptions, PcapParser, PipelineConfig};
use logprof_core::config::LogprofConfig;
use logprof_core::{
    ConfigLoader, JsonParser, LogParser, LtsvParser, ParseError, ParserOptions, PositionFile,
    RegexpParser, TimeUnit, UriOptions,
};
use logprof_stats::{diff, snapshot, Aggregator, SortKey, SortOptions, StatsOptions};
use render::{render_diff, render_stats, OutputFormat};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, Registry};

#[derive(Parser)]
#[command(name = "logprof")]
#[command(version)]
#[command(about = "HTTP access log and packet capture profiler", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "LOGPROF_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Profile an LTSV access log
    Ltsv {
        #[command(flatten)]
        profile: ProfileArgs,
    },

    /// Profile a log with one JSON object per line
    Json {
        #[command(flatten)]
        profile: ProfileArgs,
    },

    /// Profile a log matched line by line with a regular expression
    Regexp {
        #[command(flatten)]
        profile: ProfileArgs,

        /// Pattern with named groups (default: combined log format)
        #[arg(long)]
        pattern: Option<String>,
    },

    /// Profile HTTP traffic reconstructed from a pcap capture
    Pcap {
        #[command(flatten)]
        profile: ProfileArgs,

        /// Server address whose traffic is profiled (repeatable)
        #[arg(long = "pcap-server-ip")]
        server_ips: Vec<String>,

        /// Server TCP port
        #[arg(long = "pcap-server-port")]
        server_port: Option<u16>,
    },

    /// Compare two dumped snapshots
    Diff {
        /// Older snapshot
        from: PathBuf,

        /// Newer snapshot
        to: PathBuf,

        #[command(flatten)]
        output: OutputArgs,
    },
}

/// Options controlling ordering and rendering
#[derive(Args, Clone, Default)]
struct OutputArgs {
    /// Sort key (count, uri, method, max, min, sum, avg, pNN, stddev, with -body or -reqbody suffixes)
    #[arg(short, long)]
    sort: Option<String>,

    /// Reverse the sort order
    #[arg(short, long)]
    reverse: bool,

    /// Percentiles to show, comma separated
    #[arg(long)]
    percentiles: Option<String>,

    /// Output format (tsv, json)
    #[arg(long)]
    format: Option<String>,
}

/// Options shared by every profiling subcommand
#[derive(Args, Clone, Default)]
struct ProfileArgs {
    /// Input file (default: stdin)
    #[arg(long)]
    file: Option<PathBuf>,

    #[command(flatten)]
    output: OutputArgs,

    /// URI patterns collapsing matching URIs into one group, comma separated
    #[arg(short, long)]
    matching_groups: Option<String>,

    /// Filter expression, e.g. 'Status >= 500 && Uri matches "^/api"'
    #[arg(short, long)]
    filters: Option<String>,

    /// Maximum number of distinct groups
    #[arg(long)]
    limit: Option<usize>,

    /// Keep query strings in URIs
    #[arg(short, long)]
    query_string: bool,

    /// Replace query values with a placeholder
    #[arg(long)]
    qs_ignore_values: bool,

    /// Percent-decode URI paths
    #[arg(long)]
    decode_uri: bool,

    /// Unit of response time values in the log (s, ms, us)
    #[arg(long)]
    response_time_unit: Option<String>,

    /// Write the aggregated groups to a YAML snapshot
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Render a YAML snapshot instead of parsing input
    #[arg(long)]
    load: Option<PathBuf>,

    /// Position file for resuming a partially read log
    #[arg(long)]
    pos: Option<PathBuf>,

    /// Treat malformed input as a hard error
    #[arg(long)]
    strict: bool,
}

/// Which parser a profiling run builds
enum Source {
    Ltsv,
    Json,
    Regexp { pattern: Option<String> },
    Pcap {
        server_ips: Vec<String>,
        server_port: Option<u16>,
    },
}

/// Ordering and rendering settings after merging CLI and config
struct OutputSettings {
    sort: SortOptions,
    percentiles: Vec<u8>,
    format: OutputFormat,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging is up before the config is read so its warnings are seen;
    // the config level applies afterwards unless -v was given
    let log_level = init_logging(verbose_level(cli.verbose).unwrap_or(Level::WARN))?;
    let config = load_config(cli.config.clone());
    if verbose_level(cli.verbose).is_none() {
        let level = config_level(&config.general.log_level);
        log_level.modify(|filter| *filter = LevelFilter::from_level(level))?;
    }

    match cli.command {
        Commands::Ltsv { profile } => profile_command(&config, profile, Source::Ltsv),
        Commands::Json { profile } => profile_command(&config, profile, Source::Json),
        Commands::Regexp { profile, pattern } => {
            profile_command(&config, profile, Source::Regexp { pattern })
        }
        Commands::Pcap {
            profile,
            server_ips,
            server_port,
        } => profile_command(
            &config,
            profile,
            Source::Pcap {
                server_ips,
                server_port,
            },
        ),
        Commands::Diff { from, to, output } => diff_command(&config, &from, &to, &output),
    }
}

/// Install the stderr subscriber, returning a handle to change its level
fn init_logging(level: Level) -> anyhow::Result<reload::Handle<LevelFilter, Registry>> {
    let (filter, handle) = reload::Layer::new(LevelFilter::from_level(level));
    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(handle)
}

fn verbose_level(verbose: u8) -> Option<Level> {
    match verbose {
        0 => None,
        1 => Some(Level::INFO),
        2 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

fn config_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> LogprofConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load configuration: {}, using defaults", e);
            LogprofConfig::default()
        }
    }
}

/// Split a comma separated flag value
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_percentiles(value: &str) -> anyhow::Result<Vec<u8>> {
    split_list(value)
        .iter()
        .map(|p| match p.parse::<u8>() {
            Ok(n) if n <= 100 => Ok(n),
            _ => bail!("invalid percentile {:?}: must be between 0 and 100", p),
        })
        .collect()
}

/// Merge output flags with config settings. CLI values win when given.
fn merge_output(config: &LogprofConfig, args: &OutputArgs) -> anyhow::Result<OutputSettings> {
    let sort = args.sort.as_deref().unwrap_or(config.general.sort.as_str());
    let key: SortKey = sort.parse()?;
    let percentiles = match &args.percentiles {
        Some(list) => parse_percentiles(list)?,
        None => config.general.percentiles.clone(),
    };
    let format: OutputFormat = args
        .format
        .as_deref()
        .unwrap_or(config.general.format.as_str())
        .parse()?;

    Ok(OutputSettings {
        sort: SortOptions {
            key,
            reverse: args.reverse || config.general.reverse,
        },
        percentiles,
        format,
    })
}

/// Merge aggregation flags with config settings
fn merge_stats(config: &LogprofConfig, args: &ProfileArgs) -> StatsOptions {
    let settings = &config.stats;
    StatsOptions {
        matching_groups: args
            .matching_groups
            .as_deref()
            .map(split_list)
            .unwrap_or_else(|| settings.matching_groups.clone()),
        filter: args.filters.clone().or_else(|| settings.filters.clone()),
        limit: args.limit.unwrap_or(settings.limit),
        response_time_percentile: settings.response_time_percentile,
        request_body_percentile: settings.request_body_percentile,
        response_body_percentile: settings.response_body_percentile,
    }
}

fn merge_parser(config: &LogprofConfig, args: &ProfileArgs) -> anyhow::Result<ParserOptions> {
    let settings = &config.parser;
    let response_time_unit = match &args.response_time_unit {
        Some(unit) => unit.parse::<TimeUnit>()?,
        None => settings.response_time_unit,
    };
    Ok(ParserOptions {
        uri: UriOptions {
            query_string: args.query_string || settings.query_string,
            qs_ignore_values: args.qs_ignore_values || settings.qs_ignore_values,
            decode_uri: args.decode_uri || settings.decode_uri,
        },
        strict: args.strict || settings.strict,
        response_time_unit,
    })
}

fn open_input(path: Option<&Path>) -> anyhow::Result<Box<dyn Read + Send>> {
    match path {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdin())),
    }
}

fn build_parser(
    config: &LogprofConfig,
    args: &ProfileArgs,
    source: Source,
) -> anyhow::Result<Box<dyn LogParser>> {
    let options = merge_parser(config, args)?;
    let input = open_input(args.file.as_deref())?;

    let parser: Box<dyn LogParser> = match source {
        Source::Ltsv => Box::new(LtsvParser::new(
            input,
            config.parser.ltsv.clone(),
            options,
        )),
        Source::Json => Box::new(JsonParser::new(
            input,
            config.parser.json.clone(),
            options,
        )),
        Source::Regexp { pattern } => {
            let pattern = pattern.or_else(|| config.parser.regexp.pattern.clone());
            Box::new(RegexpParser::new(
                input,
                pattern.as_deref(),
                config.parser.regexp.fields.clone(),
                options,
            )?)
        }
        Source::Pcap {
            server_ips,
            server_port,
        } => {
            let server_ips = if server_ips.is_empty() {
                config.pcap.server_ips.clone()
            } else {
                server_ips
            };
            let pcap = PcapOptions {
                server_ips,
                server_port: server_port.unwrap_or(config.pcap.server_port),
                uri: options.uri,
                pipeline: PipelineConfig {
                    channel_capacity: config.pipeline.channel_capacity,
                    worker_threads: config.pipeline.worker_threads,
                },
                ..Default::default()
            };
            Box::new(PcapParser::new(input, pcap).context("Failed to open capture")?)
        }
    };
    Ok(parser)
}

/// Pull every record out of `parser` into `aggregator`
fn aggregate(parser: &mut dyn LogParser, aggregator: &mut Aggregator) -> anyhow::Result<()> {
    let mut parsed = 0u64;
    let mut skipped = 0u64;

    loop {
        match parser.parse() {
            Ok(record) => {
                parsed += 1;
                aggregator.observe(&record)?;
            }
            Err(ParseError::Skip) => skipped += 1,
            Err(ParseError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        "Parsed {} records ({} skipped, {} filtered out) into {} groups",
        parsed,
        skipped,
        aggregator.filtered_count(),
        aggregator.count_uris()
    );
    Ok(())
}

fn profile_command(
    config: &LogprofConfig,
    args: ProfileArgs,
    source: Source,
) -> anyhow::Result<()> {
    let output = merge_output(config, &args.output)?;
    let stats_options = merge_stats(config, &args);

    let mut aggregator = match &args.load {
        Some(path) => {
            let stats = snapshot::load_file(path)?;
            Aggregator::from_stats(stats_options, stats)?
        }
        None => {
            if args.pos.is_some() && matches!(source, Source::Pcap { .. }) {
                bail!("--pos is not supported for pcap input");
            }

            let mut aggregator = Aggregator::new(stats_options)?;
            let mut parser = build_parser(config, &args, source)?;

            let position = args.pos.as_ref().map(PositionFile::new);
            if let Some(position) = &position {
                let offset = position.read().with_context(|| {
                    format!("Failed to read position file {}", position.path().display())
                })?;
                debug!("Resuming from byte offset {}", offset);
                parser.seek(offset)?;
            }

            aggregate(parser.as_mut(), &mut aggregator)?;

            if let Some(position) = &position {
                match parser.read_bytes() {
                    Some(offset) => position.write(offset)?,
                    None => warn!("Parser does not track its position, not updating it"),
                }
            }
            aggregator
        }
    };

    if let Some(path) = &args.dump {
        snapshot::dump_file(path, aggregator.stats())?;
    }

    aggregator.sort(&output.sort);

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    render_stats(&mut out, aggregator.stats(), &output.percentiles, output.format)?;
    out.flush()?;
    Ok(())
}

fn diff_command(
    config: &LogprofConfig,
    from: &Path,
    to: &Path,
    args: &OutputArgs,
) -> anyhow::Result<()> {
    let output = merge_output(config, args)?;

    let from = snapshot::load_file(from)?;
    let mut to = snapshot::load_file(to)?;
    logprof_stats::sort_stats(&mut to, &output.sort);

    let entries = diff(&from, &to, &output.percentiles);
    let changed = entries.iter().filter(|e| !e.is_unchanged()).count();
    info!("{} groups compared, {} changed", entries.len(), changed);

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    render_diff(&mut out, &entries, &output.percentiles, output.format)?;
    out.flush()?;
    Ok(())
}
