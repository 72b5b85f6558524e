use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about = "Package manager with a local queryable index")]
pub struct Args {
    /// Increase logging output (can be used multiple times)
    #[arg(short, long, global = true, action(ArgAction::Count))]
    pub verbose: u8,
    #[command(subcommand)]
    pub subcommand: SubCommand,
}

#[derive(Debug, Subcommand)]
pub enum SubCommand {
    /// Install packages (names, globs, capabilities or local .rpm files)
    Install(Install),
    /// Remove installed packages
    Erase(Erase),
    /// Upgrade packages (everything when no name is given)
    Upgrade(Upgrade),
    /// Download packages without installing them
    Download(Install),
    /// Search packages by name (and provides)
    Search(Search),
    /// Show what a package requires
    Depends(Query),
    /// Show what requires a capability
    Rdepends(Query),
    /// Show what recommends a capability
    Recommends(Query),
    /// Show what a package suggests
    Suggests(Query),
    /// Show packages providing a capability
    Whatprovides(Query),
    /// Synchronize media metadata
    Sync(Sync),
    /// Manage media
    #[command(subcommand)]
    Media(MediaCmd),
    /// Manage servers
    #[command(subcommand)]
    Server(ServerCmd),
    /// Manage per-package priority pins
    #[command(subcommand)]
    Pin(PinCmd),
    /// Cache accounting and cleanup
    #[command(subcommand)]
    Cache(CacheCmd),
    /// Transaction history
    History(History),
    /// Peer status and provenance
    #[command(subcommand)]
    Peer(PeerCmd),
    /// Read or change configuration keys
    Config(Config),
    /// Run the daemon (discovery + HTTP endpoint)
    Daemon(Daemon),
}

#[derive(Debug, Parser)]
pub struct Install {
    /// Packages to install
    #[arg(required = true)]
    pub packages: Vec<String>,
    /// Resolve an alternative: capability=provider (repeatable)
    #[arg(long = "choose", value_name = "CAP=PKG")]
    pub choices: Vec<String>,
    /// Preference expression, e.g. php:8.4,nginx,-apache-mod_php
    #[arg(long)]
    pub prefer: Option<String>,
    /// Do not install recommended packages
    #[arg(long)]
    pub no_recommends: bool,
    /// Also surface suggested packages
    #[arg(long)]
    pub with_suggests: bool,
    /// Skip GPG signature verification
    #[arg(long)]
    pub nosignature: bool,
    #[arg(long)]
    pub force: bool,
    /// Resolve and download but run rpm in test mode
    #[arg(long)]
    pub test: bool,
    /// Install into a chroot
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Only fetch from LAN peers
    #[arg(long)]
    pub only_peers: bool,
    /// Never fetch from LAN peers
    #[arg(long)]
    pub no_peers: bool,
    /// Debug the solver, optionally watching specific packages
    #[arg(long, value_name = "PKG", num_args = 0.., require_equals = true)]
    pub debug_solver: Option<Vec<String>>,
}

#[derive(Debug, Parser)]
pub struct Erase {
    #[arg(required = true)]
    pub packages: Vec<String>,
    /// Keep orphaned dependencies installed
    #[arg(long)]
    pub no_clean_deps: bool,
    /// Removing recommends-only dependents is allowed
    #[arg(long)]
    pub erase_recommends: bool,
    #[arg(long)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct Upgrade {
    pub packages: Vec<String>,
    #[arg(long)]
    pub nosignature: bool,
    #[arg(long)]
    pub root: Option<PathBuf>,
    #[arg(long)]
    pub no_peers: bool,
}

#[derive(Debug, Parser)]
pub struct Search {
    pub pattern: String,
    /// Also match against provides
    #[arg(short, long)]
    pub provides: bool,
    #[arg(short, long, default_value_t = 50)]
    pub limit: usize,
}

#[derive(Debug, Parser)]
pub struct Query {
    pub name: String,
    #[arg(short, long, default_value_t = 50)]
    pub limit: usize,
}

#[derive(Debug, Parser)]
pub struct Sync {
    /// Media to sync (all enabled media when omitted)
    pub media: Option<String>,
    /// Re-import even when the synthesis MD5 is unchanged
    #[arg(short, long)]
    pub force: bool,
    /// Also fetch the hdlist
    #[arg(long)]
    pub hdlist: bool,
}

#[derive(Debug, Subcommand)]
pub enum MediaCmd {
    /// List media
    List,
    /// Add a media
    Add(MediaAdd),
    /// Remove a media and its packages
    Remove { name: String },
    Enable { name: String },
    Disable { name: String },
    /// Set media priority
    Priority { name: String, priority: i64 },
    /// Set quota (MB) and retention (days); 0 clears
    Quota {
        name: String,
        quota_mb: i64,
        #[arg(default_value_t = 0)]
        retention_days: i64,
    },
    /// Attach a media to a server
    Link { media: String, server: String },
}

#[derive(Debug, Parser)]
pub struct MediaAdd {
    pub name: String,
    /// Distro version tag, e.g. 9 or cauldron
    #[arg(long)]
    pub version: Option<String>,
    #[arg(long)]
    pub arch: Option<String>,
    /// Short class name, e.g. core-release
    #[arg(long)]
    pub short_name: Option<String>,
    /// Path under the server base, e.g. 9/x86_64/media/core/release
    #[arg(long)]
    pub relative_path: Option<String>,
    #[arg(long)]
    pub unofficial: bool,
    /// Floating always-latest source
    #[arg(long)]
    pub update: bool,
    #[arg(long, default_value_t = 50)]
    pub priority: i64,
}

#[derive(Debug, Subcommand)]
pub enum ServerCmd {
    List,
    Add(ServerAdd),
    Remove { name: String },
    Enable { name: String },
    Disable { name: String },
    Priority { name: String, priority: i64 },
    /// Constrain address resolution: auto, ipv4, ipv6 or dual
    Ipmode { name: String, mode: String },
}

#[derive(Debug, Parser)]
pub struct ServerAdd {
    pub name: String,
    /// http, https or file
    pub protocol: String,
    /// Host name (empty for file servers)
    #[arg(default_value = "")]
    pub host: String,
    pub base_path: String,
    #[arg(long)]
    pub unofficial: bool,
    #[arg(long, default_value_t = 50)]
    pub priority: i64,
}

#[derive(Debug, Subcommand)]
pub enum PinCmd {
    List,
    Add {
        package_pattern: String,
        #[arg(long)]
        media: Option<String>,
        #[arg(long, default_value_t = 100)]
        priority: i64,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
    Remove { id: i64 },
}

#[derive(Debug, Subcommand)]
pub enum CacheCmd {
    /// Usage and store statistics
    Info,
    /// Enforce quotas and retention
    Clean {
        #[arg(long)]
        dry_run: bool,
    },
    /// Reconcile the cache table with the filesystem
    Rebuild,
}

#[derive(Debug, Parser)]
pub struct History {
    #[arg(short, long, default_value_t = 20)]
    pub limit: usize,
    /// Filter by action (install, erase, upgrade, ...)
    #[arg(long)]
    pub action: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum PeerCmd {
    /// Live peers known to the local daemon
    List,
    /// Files obtained from peers
    Downloads {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
    Blacklist {
        host: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        reason: Option<String>,
    },
    Unblacklist {
        host: String,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Forget provenance records for a peer
    Clean { host: String },
}

#[derive(Debug, Parser)]
pub struct Config {
    pub key: Option<String>,
    pub value: Option<String>,
    #[arg(long)]
    pub unset: bool,
}

#[derive(Debug, Parser)]
pub struct Daemon {
    /// Override the HTTP port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,
}
