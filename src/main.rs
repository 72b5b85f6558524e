pub mod args;
pub mod cache;
pub mod chksums;
pub mod compression;
pub mod config;
pub mod db;
pub mod discovery;
pub mod download;
pub mod errors;
pub mod hdlist;
pub mod prefs;
pub mod resolver;
pub mod rpmdb;
pub mod sync;
pub mod synthesis;
pub mod transaction;
pub mod utils;
pub mod web;

use crate::args::{Args, SubCommand};
use crate::config::Context;
use crate::db::Database;
use crate::discovery::Peer;
use crate::errors::*;
use crate::prefs::Preferences;
use crate::resolver::{InstallRequest, Resolution, Resolver, ResolverOptions, SolverDebug, TransactionType};
use crate::utils::format_size;
use clap::Parser;
use env_logger::Env;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let log_level = match args.verbose {
        0 => "urpm=info",
        1 => "info,urpm=debug",
        2 => "debug",
        3 => "debug,urpm=trace",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let ctx = Context::detect();
    match run(&ctx, args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Interrupted) => ExitCode::from(130),
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn open_db(ctx: &Context) -> Result<Database> {
    let db = Database::open(&ctx.db_path()).await?;
    if let Some(message) = db.take_background_error().await? {
        warn!("A background operation failed earlier: {message}");
    }
    Ok(db)
}

fn parse_choices(raw: &[String]) -> HashMap<String, String> {
    raw.iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(cap, pkg)| (cap.trim().to_string(), pkg.trim().to_string()))
        })
        .collect()
}

/// Peers are tracked by the daemon; a CLI run asks it over loopback and
/// quietly proceeds without peers when no daemon is running.
async fn daemon_peers(ctx: &Context) -> Vec<Peer> {
    #[derive(serde::Deserialize)]
    struct PeerList {
        peers: Vec<serde_json::Value>,
    }
    let Ok(client) = utils::http_client(utils::IpMode::Auto) else {
        return Vec::new();
    };
    let url = format!("http://127.0.0.1:{}/api/peers", ctx.daemon_port);
    match client.get_json::<PeerList>(&url).await {
        Ok(list) => list
            .peers
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn print_resolution(resolution: &Resolution) {
    for action in &resolution.actions {
        match action.action {
            TransactionType::Upgrade | TransactionType::Downgrade => println!(
                "  {} {} {} -> {}",
                action.action.as_str(),
                action.name,
                action.from_evr,
                action.evr
            ),
            _ => println!(
                "  {} {} ({})",
                action.action.as_str(),
                action.nevra,
                action.reason.as_str()
            ),
        }
    }
    if resolution.install_size > 0 {
        println!("Download size: {}", format_size(resolution.install_size));
    }
    if resolution.remove_size > 0 {
        println!("Freed after removal: {}", format_size(resolution.remove_size));
    }
    for held in &resolution.held_upgrades {
        println!("  held back: {held}");
    }
    for (held, by) in &resolution.held_obsoletes {
        println!("  held back: {held} (would be obsoleted by {by})");
    }
}

fn print_alternatives(resolution: &Resolution, prefer: Option<&Preferences>) {
    for alt in &resolution.alternatives {
        let providers = match prefer {
            Some(prefs) => prefs.filter_providers(&alt.providers),
            None => alt.providers.clone(),
        };
        if alt.required_by.is_empty() {
            println!("Multiple providers for {}:", alt.capability);
        } else {
            println!(
                "Multiple providers for {} (needed by {}):",
                alt.capability, alt.required_by
            );
        }
        for (idx, provider) in providers.iter().enumerate() {
            println!("  {}. {provider}", idx + 1);
        }
        println!(
            "Pick one with --choose={}=<provider>",
            alt.capability
        );
    }
}

async fn build_resolver(
    ctx: &Context,
    db: &Database,
    root: Option<&Path>,
    install_recommends: bool,
    debug: Option<&[String]>,
) -> Result<Resolver> {
    let opts = ResolverOptions {
        root: root.map(Path::to_path_buf),
        install_recommends,
        ..Default::default()
    };
    let mut resolver = Resolver::new(ctx.clone(), db.clone(), opts);
    if let Some(watched) = debug {
        resolver.debug = SolverDebug::new(true, watched);
    }
    let installed = rpmdb::load_installed(root).await?;
    resolver.load_pool(&installed).await?;
    Ok(resolver)
}

#[allow(clippy::too_many_lines)]
async fn run(ctx: &Context, args: Args) -> Result<()> {
    match args.subcommand {
        SubCommand::Install(cmd) => install(ctx, cmd, false).await,
        SubCommand::Download(cmd) => install(ctx, cmd, true).await,
        SubCommand::Erase(cmd) => erase(ctx, cmd).await,
        SubCommand::Upgrade(cmd) => upgrade(ctx, cmd).await,
        SubCommand::Search(cmd) => {
            let db = open_db(ctx).await?;
            for hit in db.search(&cmd.pattern, cmd.limit, cmd.provides).await? {
                match hit.matched_provide {
                    Some(cap) => println!(
                        "{}  {} (provides {cap})",
                        hit.package.nevra,
                        hit.package.summary.as_deref().unwrap_or("")
                    ),
                    None => println!(
                        "{}  {}",
                        hit.package.nevra,
                        hit.package.summary.as_deref().unwrap_or("")
                    ),
                }
            }
            Ok(())
        }
        SubCommand::Depends(cmd) => {
            let db = open_db(ctx).await?;
            let Some(pkg) = db.get_package_smart(&cmd.name).await? else {
                return Err(Error::PackageNotFound(cmd.name));
            };
            for cap in db.get_deps(pkg.id, "requires").await? {
                println!("{cap}");
            }
            Ok(())
        }
        SubCommand::Rdepends(cmd) => {
            let db = open_db(ctx).await?;
            for pkg in db.whatrequires(&cmd.name, cmd.limit).await? {
                println!("{}", pkg.nevra);
            }
            Ok(())
        }
        SubCommand::Recommends(cmd) => {
            let db = open_db(ctx).await?;
            for pkg in db.whatrecommends(&cmd.name, cmd.limit).await? {
                println!("{}", pkg.nevra);
            }
            Ok(())
        }
        SubCommand::Suggests(cmd) => {
            let db = open_db(ctx).await?;
            let Some(pkg) = db.get_package_smart(&cmd.name).await? else {
                return Err(Error::PackageNotFound(cmd.name));
            };
            for cap in db.get_deps(pkg.id, "suggests").await? {
                println!("{cap}");
            }
            Ok(())
        }
        SubCommand::Whatprovides(cmd) => {
            let db = open_db(ctx).await?;
            for pkg in db.whatprovides(&cmd.name).await? {
                println!("{}", pkg.nevra);
            }
            Ok(())
        }
        SubCommand::Sync(cmd) => {
            let db = open_db(ctx).await?;
            match cmd.media {
                Some(media) => {
                    let report =
                        sync::sync_media(ctx, &db, &media, cmd.force, cmd.hdlist, None).await?;
                    if report.skipped {
                        println!("{media}: up to date");
                    } else {
                        println!("{media}: {} packages", report.packages);
                    }
                }
                None => {
                    for (media, result) in sync::sync_all_media(ctx, &db, cmd.force, None).await? {
                        match result {
                            Ok(report) if report.skipped => println!("{media}: up to date"),
                            Ok(report) => println!("{media}: {} packages", report.packages),
                            Err(err) => println!("{media}: failed ({err})"),
                        }
                    }
                }
            }
            Ok(())
        }
        SubCommand::Media(cmd) => media_cmd(ctx, cmd).await,
        SubCommand::Server(cmd) => server_cmd(ctx, cmd).await,
        SubCommand::Pin(cmd) => pin_cmd(ctx, cmd).await,
        SubCommand::Cache(cmd) => cache_cmd(ctx, cmd).await,
        SubCommand::History(cmd) => {
            let db = open_db(ctx).await?;
            for entry in db.list_history(cmd.limit, cmd.action.as_deref()).await? {
                let packages = db.history_packages(entry.id).await?;
                let undone = match entry.undone_by {
                    Some(by) => format!(" (undone by #{by})"),
                    None => String::new(),
                };
                println!(
                    "#{} {} {} [{}] {} packages{undone}",
                    entry.id,
                    entry.timestamp,
                    entry.action,
                    entry.status,
                    packages.len()
                );
            }
            Ok(())
        }
        SubCommand::Peer(cmd) => peer_cmd(ctx, cmd).await,
        SubCommand::Config(cmd) => {
            let db = open_db(ctx).await?;
            match (cmd.key, cmd.value, cmd.unset) {
                (Some(key), _, true) => db.unset_config(&key).await,
                (Some(key), Some(value), false) => db.set_config(&key, &value).await,
                (Some(key), None, false) => {
                    match db.get_config(&key).await? {
                        Some(value) => println!("{value}"),
                        None => println!("(unset)"),
                    }
                    Ok(())
                }
                (None, _, _) => Ok(()),
            }
        }
        SubCommand::Daemon(cmd) => {
            let mut ctx = ctx.clone();
            if let Some(port) = cmd.port {
                ctx.daemon_port = port;
            }
            let db = open_db(&ctx).await?;
            // discovery holds its own store handle
            let discovery_db = Database::open(&ctx.db_path()).await?;
            let discovery =
                discovery::PeerDiscovery::new(ctx.clone(), discovery_db, ctx.daemon_port);
            discovery.start();
            web::run(&ctx, db, discovery).await
        }
    }
}

async fn install(ctx: &Context, cmd: args::Install, download_only: bool) -> Result<()> {
    let db = open_db(ctx).await?;
    let mut resolver = build_resolver(
        ctx,
        &db,
        cmd.root.as_deref(),
        !cmd.no_recommends,
        cmd.debug_solver.as_deref(),
    )
    .await?;

    // local .rpm arguments join a synthetic repo
    let mut names: Vec<String> = Vec::new();
    let mut local_rpms = Vec::new();
    for arg in &cmd.packages {
        if arg.ends_with(".rpm") && Path::new(arg).exists() {
            let record = hdlist::read_rpm_package(Path::new(arg)).await?;
            names.push(record.name.clone());
            local_rpms.push((record, PathBuf::from(arg)));
        } else {
            names.push(arg.clone());
        }
    }
    if !local_rpms.is_empty() {
        resolver.add_local_rpms(local_rpms)?;
    }

    let mut request = InstallRequest {
        choices: parse_choices(&cmd.choices),
        ..Default::default()
    };
    let preferences = cmd.prefer.as_deref().map(Preferences::parse);
    if let Some(prefs) = &preferences {
        let mut prefs = prefs.clone();
        if let Some(pool) = resolver.pool() {
            prefs.resolve_patterns(pool);
        }
        request.favored = prefs.resolved_packages.iter().cloned().collect();
        request.explicit_disfavor = prefs.disfavored_packages.iter().cloned().collect();
        request.preference_patterns = prefs.patterns();
    }

    let resolution = resolver.resolve_install(&names, &request)?;
    if !resolution.success {
        if !resolution.alternatives.is_empty() {
            print_alternatives(&resolution, preferences.as_ref());
            return Err(Error::Resolution(vec!["alternatives need a choice".into()]));
        }
        return Err(Error::Resolution(resolution.problems.clone()));
    }
    if resolution.actions.is_empty() {
        println!("Nothing to do");
        return Ok(());
    }
    print_resolution(&resolution);

    if cmd.with_suggests {
        let resolved: Vec<String> = resolution.actions.iter().map(|a| a.name.clone()).collect();
        let (suggests, suggest_alts) = resolver
            .find_suggests_iterative(&names, &request.choices, &resolved)
            .await?;
        for suggest in &suggests {
            println!("  suggested: {}", suggest.nevra);
        }
        for alt in &suggest_alts {
            println!("  suggested alternative: {} ({})", alt.capability, alt.required_by);
        }
    }

    let peers = if cmd.no_peers && !cmd.only_peers {
        Vec::new()
    } else {
        daemon_peers(ctx).await
    };
    let (items, local_paths) =
        download::build_download_items(&db, &resolver, &resolution.actions).await?;
    let opts = download::DownloadOptions {
        use_peers: !cmd.no_peers,
        only_peers: cmd.only_peers,
        verify_signatures: !cmd.nosignature,
    };
    let outcome = download::download_all(ctx, &db, peers, items, &opts).await?;
    if !outcome.failures().is_empty() {
        return Err(Error::Resolution(
            outcome
                .results
                .iter()
                .filter_map(|(name, r)| {
                    r.as_ref().err().map(|e| format!("{name}: {e}"))
                })
                .collect(),
        ));
    }
    info!(
        "{} downloaded, {} from cache, {} from peers",
        outcome.downloaded, outcome.cached, outcome.peer_stats.files
    );
    if download_only {
        for path in outcome.paths() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let mut files: HashMap<String, PathBuf> = outcome
        .paths()
        .into_iter()
        .filter_map(|path| {
            path.file_name()
                .map(|name| (name.to_string_lossy().into_owned(), path.clone()))
        })
        .collect();
    for path in local_paths {
        if let Some(name) = path.file_name() {
            files.insert(name.to_string_lossy().into_owned(), path.clone());
        }
    }

    let install_opts = transaction::InstallOptions {
        verify_signatures: !cmd.nosignature,
        force: cmd.force,
        test: cmd.test,
        no_scripts: false,
        root: cmd.root.clone(),
        config_policy: transaction::ConfigPolicy::parse(
            &db.get_config("config-policy")
                .await?
                .unwrap_or_else(|| "keep".to_string()),
        ),
    };
    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    let report = transaction::execute(
        ctx,
        &db,
        &resolution,
        &files,
        &install_opts,
        "install",
        Some(&command_line),
        None,
        None,
    )
    .await?;
    println!(
        "Transaction #{} complete: {} installed, {} removed",
        report.history_id, report.installed, report.removed
    );
    Ok(())
}

async fn erase(ctx: &Context, cmd: args::Erase) -> Result<()> {
    let db = open_db(ctx).await?;
    let mut resolver = build_resolver(ctx, &db, cmd.root.as_deref(), true, None).await?;
    let resolution = resolver.resolve_remove(&cmd.packages, !cmd.no_clean_deps)?;
    if !resolution.success {
        return Err(Error::Resolution(resolution.problems.clone()));
    }
    if resolution.actions.is_empty() {
        println!("Nothing to do");
        return Ok(());
    }
    print_resolution(&resolution);

    let install_opts = transaction::InstallOptions {
        verify_signatures: true,
        root: cmd.root.clone(),
        ..Default::default()
    };
    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    let report = transaction::execute(
        ctx,
        &db,
        &resolution,
        &HashMap::new(),
        &install_opts,
        "erase",
        Some(&command_line),
        None,
        None,
    )
    .await?;
    println!(
        "Transaction #{} complete: {} removed",
        report.history_id, report.removed
    );
    Ok(())
}

async fn upgrade(ctx: &Context, cmd: args::Upgrade) -> Result<()> {
    let db = open_db(ctx).await?;
    let mut resolver = build_resolver(ctx, &db, cmd.root.as_deref(), true, None).await?;
    let resolution = resolver.resolve_upgrade(&cmd.packages)?;
    if !resolution.success {
        return Err(Error::Resolution(resolution.problems.clone()));
    }
    if resolution.actions.is_empty() {
        println!("System is up to date");
        for held in &resolution.held_upgrades {
            println!("  held back: {held}");
        }
        return Ok(());
    }
    print_resolution(&resolution);

    for orphan in resolver.find_upgrade_orphans(&resolution)? {
        println!("  now orphaned: {}", orphan.nevra);
    }

    let peers = if cmd.no_peers {
        Vec::new()
    } else {
        daemon_peers(ctx).await
    };
    let (items, _) = download::build_download_items(&db, &resolver, &resolution.actions).await?;
    let opts = download::DownloadOptions {
        use_peers: !cmd.no_peers,
        only_peers: false,
        verify_signatures: !cmd.nosignature,
    };
    let outcome = download::download_all(ctx, &db, peers, items, &opts).await?;
    if !outcome.failures().is_empty() {
        return Err(Error::Resolution(
            outcome.failures().iter().map(|f| f.to_string()).collect(),
        ));
    }

    let files: HashMap<String, PathBuf> = outcome
        .paths()
        .into_iter()
        .filter_map(|path| {
            path.file_name()
                .map(|name| (name.to_string_lossy().into_owned(), path.clone()))
        })
        .collect();
    let install_opts = transaction::InstallOptions {
        verify_signatures: !cmd.nosignature,
        root: cmd.root.clone(),
        ..Default::default()
    };
    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    let report = transaction::execute(
        ctx,
        &db,
        &resolution,
        &files,
        &install_opts,
        "upgrade",
        Some(&command_line),
        None,
        None,
    )
    .await?;
    println!(
        "Transaction #{} complete: {} upgraded/installed, {} removed",
        report.history_id, report.installed, report.removed
    );
    Ok(())
}

async fn media_cmd(ctx: &Context, cmd: args::MediaCmd) -> Result<()> {
    let db = open_db(ctx).await?;
    match cmd {
        args::MediaCmd::List => {
            for media in db.list_media().await? {
                let flag = if media.enabled { "" } else { " (disabled)" };
                println!(
                    "{} [{}] prio={} version={}{}",
                    media.name,
                    media.short_name.as_deref().unwrap_or("-"),
                    media.priority,
                    media.mageia_version.as_deref().unwrap_or("-"),
                    flag
                );
            }
        }
        args::MediaCmd::Add(add) => {
            db.add_media(&db::NewMedia {
                name: add.name.clone(),
                mageia_version: add.version,
                architecture: add.arch,
                short_name: add.short_name,
                relative_path: add.relative_path,
                official: !add.unofficial,
                enabled: true,
                update_media: add.update,
                priority: add.priority,
            })
            .await?;
            println!("Added media {}", add.name);
        }
        args::MediaCmd::Remove { name } => db.remove_media(&name).await?,
        args::MediaCmd::Enable { name } => db.enable_media(&name, true).await?,
        args::MediaCmd::Disable { name } => db.enable_media(&name, false).await?,
        args::MediaCmd::Priority { name, priority } => {
            db.set_media_priority(&name, priority).await?
        }
        args::MediaCmd::Quota {
            name,
            quota_mb,
            retention_days,
        } => {
            let quota = (quota_mb > 0).then_some(quota_mb);
            let retention = (retention_days > 0).then_some(retention_days);
            db.set_media_quota(&name, quota, retention).await?
        }
        args::MediaCmd::Link { media, server } => {
            let media_row = db
                .get_media(&media)
                .await?
                .ok_or(Error::MediaNotFound(media))?;
            let server_row = db
                .get_server(&server)
                .await?
                .ok_or(Error::NoServer(server))?;
            db.link_media_server(media_row.id, server_row.id).await?;
        }
    }
    Ok(())
}

async fn server_cmd(ctx: &Context, cmd: args::ServerCmd) -> Result<()> {
    let db = open_db(ctx).await?;
    match cmd {
        args::ServerCmd::List => {
            for server in db.list_servers().await? {
                let flag = if server.enabled { "" } else { " (disabled)" };
                println!(
                    "{} {}://{}{} prio={} ip={}{}",
                    server.name,
                    server.protocol,
                    server.host,
                    server.base_path,
                    server.priority,
                    server.ip_mode,
                    flag
                );
            }
        }
        args::ServerCmd::Add(add) => {
            db.add_server(
                &add.name,
                &add.protocol,
                &add.host,
                &add.base_path,
                !add.unofficial,
                add.priority,
            )
            .await?;
            println!("Added server {}", add.name);
        }
        args::ServerCmd::Remove { name } => db.remove_server(&name).await?,
        args::ServerCmd::Enable { name } => db.enable_server(&name, true).await?,
        args::ServerCmd::Disable { name } => db.enable_server(&name, false).await?,
        args::ServerCmd::Priority { name, priority } => {
            db.set_server_priority(&name, priority).await?
        }
        args::ServerCmd::Ipmode { name, mode } => db.set_server_ip_mode(&name, &mode).await?,
    }
    Ok(())
}

async fn pin_cmd(ctx: &Context, cmd: args::PinCmd) -> Result<()> {
    let db = open_db(ctx).await?;
    match cmd {
        args::PinCmd::List => {
            for pin in db.list_pins().await? {
                println!(
                    "#{} {} media={} prio={} {}",
                    pin.id,
                    pin.package_pattern,
                    pin.media_pattern.as_deref().unwrap_or("*"),
                    pin.priority,
                    pin.comment.as_deref().unwrap_or("")
                );
            }
        }
        args::PinCmd::Add {
            package_pattern,
            media,
            priority,
            version,
            comment,
        } => {
            let id = db
                .add_pin(
                    &package_pattern,
                    media.as_deref(),
                    priority,
                    version.as_deref(),
                    comment.as_deref(),
                )
                .await?;
            println!("Added pin #{id}");
        }
        args::PinCmd::Remove { id } => db.remove_pin(id).await?,
    }
    Ok(())
}

async fn cache_cmd(ctx: &Context, cmd: args::CacheCmd) -> Result<()> {
    let db = open_db(ctx).await?;
    let manager = cache::CacheManager::new(ctx.clone(), db.clone());
    match cmd {
        args::CacheCmd::Info => {
            let stats = db.get_stats().await?;
            let (cache_size, cache_files) = db.cache_usage(None).await?;
            println!("store: {}", stats.db_path);
            println!(
                "packages={} provides={} requires={} media={}",
                stats.packages, stats.provides, stats.requires, stats.media
            );
            println!("store size: {}", format_size(stats.db_size as i64));
            println!(
                "cache: {} files, {}",
                cache_files,
                format_size(cache_size)
            );
        }
        args::CacheCmd::Clean { dry_run } => {
            let report = manager.enforce_quotas(dry_run).await?;
            println!(
                "{} files ({}) {}",
                report.total_deleted(),
                format_size(report.total_bytes()),
                if dry_run { "would be deleted" } else { "deleted" }
            );
        }
        args::CacheCmd::Rebuild => {
            let report = manager.reconcile().await?;
            println!(
                "{} stale records removed, {} untracked files registered",
                report.orphan_records_removed, report.untracked_files_added
            );
        }
    }
    Ok(())
}

async fn peer_cmd(ctx: &Context, cmd: args::PeerCmd) -> Result<()> {
    let db = open_db(ctx).await?;
    match cmd {
        args::PeerCmd::List => {
            let peers = daemon_peers(ctx).await;
            if peers.is_empty() {
                println!("No live peers (is the daemon running?)");
            }
            for peer in peers {
                println!(
                    "{}:{} media={} version={}",
                    peer.host,
                    peer.port,
                    peer.media.len(),
                    peer.local_version
                );
            }
        }
        args::PeerCmd::Downloads { host, limit } => {
            for download in db.get_peer_downloads(host.as_deref(), limit).await? {
                let verified = if download.verified { "verified" } else { "unverified" };
                println!(
                    "{} from {}:{} ({verified})",
                    download.filename, download.peer_host, download.peer_port
                );
            }
        }
        args::PeerCmd::Blacklist { host, port, reason } => {
            db.blacklist_peer(&host, port, reason.as_deref()).await?;
        }
        args::PeerCmd::Unblacklist { host, port } => {
            db.unblacklist_peer(&host, port).await?;
        }
        args::PeerCmd::Clean { host } => {
            let count = db.delete_peer_downloads(&host).await?;
            println!("Removed {count} provenance records");
        }
    }
    Ok(())
}
