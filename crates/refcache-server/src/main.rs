use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use refcache_artifact::{ArtifactCache, ArtifactKind};
use refcache_core::{parse_interval, ReferenceStore, SeedBundle, SeedEntry, ServiceConfig};
use refcache_server::{telemetry, ApiClient};
use std::net::SocketAddr;
use std::path::PathBuf;

fn cli() -> Command {
    let api = Arg::new("api")
        .long("api")
        .value_name("URL")
        .help("Base URL of a running service (defaults to the configured bind address)");

    Command::new("refcache")
        .version(refcache_server::VERSION)
        .about("Reference-resolving scheduled data cache")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("data-root")
                .long("data-root")
                .global(true)
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Override the data root"),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the scheduler and HTTP API")
                .arg(
                    Arg::new("bind")
                        .long("bind")
                        .value_name("ADDR")
                        .value_parser(value_parser!(SocketAddr))
                        .help("HTTP listen address"),
                )
                .arg(
                    Arg::new("workers")
                        .long("workers")
                        .value_parser(value_parser!(usize))
                        .help("Concurrent refresh limit"),
                ),
        )
        .subcommand(
            Command::new("seed")
                .about("Merge the seed file into the reference store (service stopped)"),
        )
        .subcommand(
            Command::new("list")
                .about("List references and their status")
                .arg(api.clone())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("refresh")
                .about("Request an immediate refresh")
                .arg(Arg::new("name").required(true))
                .arg(api.clone()),
        )
        .subcommand(
            Command::new("register")
                .about("Add a new reference")
                .arg(Arg::new("name").required(true))
                .arg(
                    Arg::new("kind")
                        .long("kind")
                        .required(true)
                        .value_parser(value_parser!(ArtifactKind))
                        .help("parquet, model or image"),
                )
                .arg(
                    Arg::new("source")
                        .long("source")
                        .required(true)
                        .value_name("JSON")
                        .help("Source descriptor, e.g. '{\"type\":\"http\",\"url\":\"...\"}'"),
                )
                .arg(
                    Arg::new("interval")
                        .long("interval")
                        .required(true)
                        .help("Refresh interval: seconds or 90s / 15m / 1h / 1d"),
                )
                .arg(api.clone()),
        )
        .subcommand(
            Command::new("prune")
                .about("Delete old artifact versions")
                .arg(Arg::new("name").required(true))
                .arg(
                    Arg::new("keep")
                        .long("keep")
                        .value_parser(value_parser!(usize))
                        .help("Versions to keep (defaults to retain_count)"),
                )
                .arg(api),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<ServiceConfig> {
    let path = matches.get_one::<PathBuf>("config");
    let mut config = ServiceConfig::load(path.map(PathBuf::as_path)).context("loading configuration")?;
    if let Some(root) = matches.get_one::<PathBuf>("data-root") {
        config.data_root.clone_from(root);
    }
    Ok(config)
}

fn client(args: &ArgMatches, config: &ServiceConfig) -> anyhow::Result<ApiClient> {
    let base = args
        .get_one::<String>("api")
        .cloned()
        .unwrap_or_else(|| ApiClient::base_for(config.http.bind));
    ApiClient::new(base)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let mut config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("serve", args)) => {
            if let Some(bind) = args.get_one::<SocketAddr>("bind") {
                config.http.bind = *bind;
            }
            if let Some(workers) = args.get_one::<usize>("workers") {
                config.worker_pool_size = *workers;
            }
            config.validate()?;
            let log_file = telemetry::init(&config.log, &config.data_root())?;
            tracing::info!(version = refcache_server::VERSION, log_file = ?log_file, "starting refcache");
            refcache_server::serve(config, refcache_server::shutdown_signal()).await
        }
        Some(("seed", _)) => {
            telemetry::init_cli();
            seed(&config).await
        }
        Some(("list", args)) => {
            telemetry::init_cli();
            let references = client(args, &config)?.list().await?;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&references)?);
                return Ok(());
            }
            println!("{:<24} {:<8} {:<11} {:>8}  LAST SUCCESS", "NAME", "KIND", "STATUS", "VERSION");
            for r in references {
                println!(
                    "{:<24} {:<8} {:<11} {:>8}  {}",
                    r.name,
                    r.kind.to_string(),
                    format!("{:?}", r.status).to_lowercase(),
                    r.current_version.map_or_else(|| "-".to_string(), |v| v.to_string()),
                    r.last_success_at.map_or_else(|| "never".to_string(), |t| t.to_rfc3339()),
                );
            }
            Ok(())
        }
        Some(("refresh", args)) => {
            telemetry::init_cli();
            let name = required(args, "name")?;
            let outcome = client(args, &config)?.refresh(name).await?;
            println!("{name}: {}", outcome["outcome"].as_str().unwrap_or("unknown"));
            Ok(())
        }
        Some(("register", args)) => {
            telemetry::init_cli();
            let name = required(args, "name")?;
            let kind = *args
                .get_one::<ArtifactKind>("kind")
                .context("--kind is required")?;
            let source: serde_json::Value = serde_json::from_str(required(args, "source")?)
                .context("--source must be a JSON object")?;
            if !source.is_object() {
                bail!("--source must be a JSON object");
            }
            let interval = parse_interval(required(args, "interval")?).map_err(anyhow::Error::msg)?;

            let reference = client(args, &config)?
                .register(name, SeedEntry::new(kind, source, interval))
                .await?;
            println!("registered {} ({})", reference.name, reference.kind);
            Ok(())
        }
        Some(("prune", args)) => {
            telemetry::init_cli();
            let name = required(args, "name")?;
            let keep = args.get_one::<usize>("keep").copied();
            let response = client(args, &config)?.prune(name, keep).await?;
            if response.removed.is_empty() {
                println!("{name}: nothing to prune");
            } else {
                println!("{name}: removed versions {:?}", response.removed);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn required<'a>(args: &'a ArgMatches, id: &str) -> anyhow::Result<&'a str> {
    args.get_one::<String>(id)
        .map(String::as_str)
        .with_context(|| format!("missing <{id}>"))
}

async fn seed(config: &ServiceConfig) -> anyhow::Result<()> {
    let root = config.data_root();
    root.ensure()?;
    let store = ReferenceStore::open(root.clone()).await?;
    let bundle = SeedBundle::resolve(config.seed_file.as_deref(), &root).await?;
    let report = store.seed(&bundle).await?;

    let cache = ArtifactCache::open(root, config.cache_config())?;
    let repaired = store.reconcile(&cache).await?;

    println!(
        "seeded {} reference(s), {} already present",
        report.inserted.len(),
        report.skipped
    );
    for name in &report.inserted {
        println!("  + {name}");
    }
    for name in &repaired {
        println!("  ! {name}: pointer repaired");
    }
    Ok(())
}
