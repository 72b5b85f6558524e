pub mod alternatives;
pub mod evr;
pub mod orphans;
pub mod pool;
pub mod sat;

use crate::config::Context;
use crate::db::Database;
use crate::errors::*;
use crate::resolver::evr::{evr_cmp, evr_matches};
use crate::resolver::pool::{Dep, Pool, RelOp, RepoKind, SolvableId};
use crate::resolver::sat::SatSolver;
use crate::synthesis::{parse_synthesis, PackageRecord};
use globset::GlobBuilder;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::LazyLock;
use varisat::Lit;

const DEFAULT_SUGGESTS_ITERATION_CAP: usize = 10;
const INSTALLED_PRIORITY: i64 = i64::MAX / 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Install,
    Remove,
    Upgrade,
    Downgrade,
    Reinstall,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Install => "install",
            TransactionType::Remove => "remove",
            TransactionType::Upgrade => "upgrade",
            TransactionType::Downgrade => "downgrade",
            TransactionType::Reinstall => "reinstall",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallReason {
    Explicit,
    Dependency,
    Recommended,
    Suggested,
}

impl InstallReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallReason::Explicit => "explicit",
            InstallReason::Dependency => "dependency",
            InstallReason::Recommended => "recommended",
            InstallReason::Suggested => "suggested",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackageAction {
    pub action: TransactionType,
    pub name: String,
    pub evr: String,
    pub arch: String,
    pub nevra: String,
    pub size: i64,
    pub filesize: i64,
    pub media_name: String,
    pub reason: InstallReason,
    /// previous version for upgrades/downgrades
    pub from_evr: String,
}

#[derive(Debug, Clone)]
pub struct Alternative {
    pub capability: String,
    pub required_by: String,
    pub providers: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Resolution {
    pub success: bool,
    pub actions: Vec<PackageAction>,
    pub problems: Vec<String>,
    pub install_size: i64,
    pub remove_size: i64,
    pub alternatives: Vec<Alternative>,
    pub held_upgrades: Vec<String>,
    pub held_obsoletes: Vec<(String, String)>,
}

impl Resolution {
    fn failure(problems: Vec<String>) -> Resolution {
        Resolution {
            success: false,
            problems,
            ..Default::default()
        }
    }
}

/// Structured debug output for remote troubleshooting; carried on the
/// resolver, decided once at construction.
#[derive(Debug, Default, Clone)]
pub struct SolverDebug {
    pub enabled: bool,
    watched: HashSet<String>,
}

impl SolverDebug {
    pub fn new(enabled: bool, watched: &[String]) -> SolverDebug {
        SolverDebug {
            enabled,
            watched: watched.iter().map(|w| w.to_lowercase()).collect(),
        }
    }

    pub fn log(&self, msg: &str) {
        if self.enabled {
            eprintln!("[SOLVER] {msg}");
        }
    }

    pub fn watch(&self, pkg: &str, action: &str, detail: &str) {
        if self.enabled && self.watched.contains(&pkg.to_lowercase()) {
            if detail.is_empty() {
                eprintln!("[WATCH:{pkg}] {action}");
            } else {
                eprintln!("[WATCH:{pkg}] {action}: {detail}");
            }
        }
    }

    pub fn is_watched(&self, pkg: &str) -> bool {
        self.watched.contains(&pkg.to_lowercase())
    }
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub arch: String,
    pub root: Option<PathBuf>,
    pub install_recommends: bool,
    pub ignore_installed: bool,
    pub allowed_arches: Vec<String>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        ResolverOptions {
            arch: "x86_64".to_string(),
            root: None,
            install_recommends: true,
            ignore_installed: false,
            allowed_arches: vec!["x86_64".to_string(), "noarch".to_string()],
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct InstallRequest {
    /// capability -> chosen provider, from earlier alternative prompts
    pub choices: HashMap<String, String>,
    /// packages favored by user preferences
    pub favored: HashSet<String>,
    /// packages explicitly disfavored (leading `-` preference terms)
    pub explicit_disfavor: HashSet<String>,
    /// raw preference capability patterns
    pub preference_patterns: Vec<String>,
}

static NAME_SPACED_CONSTRAINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)\s+(>=|<=|==|=|>|<)\s+(.+)$").expect("static regex"));
static NAME_BRACKET_CONSTRAINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\[]+)\[([<>=!]+)\s*(.+)\]$").expect("static regex"));

fn parse_name_constraint(arg: &str) -> (String, Option<(RelOp, String)>) {
    if let Some(m) = NAME_SPACED_CONSTRAINT.captures(arg) {
        if let Some(op) = RelOp::parse(&m[2]) {
            return (m[1].to_string(), Some((op, m[3].to_string())));
        }
    }
    if let Some(m) = NAME_BRACKET_CONSTRAINT.captures(arg) {
        if let Some(op) = RelOp::parse(&m[2]) {
            return (m[1].to_string(), Some((op, m[3].to_string())));
        }
    }
    (arg.to_string(), None)
}

pub struct Resolver {
    ctx: Context,
    db: Database,
    pub opts: ResolverOptions,
    pub debug: SolverDebug,
    pool: Option<Pool>,
    local_packages: HashSet<String>,
    held_patterns: Vec<String>,
}

impl Resolver {
    pub fn new(ctx: Context, db: Database, opts: ResolverOptions) -> Resolver {
        Resolver {
            ctx,
            db,
            opts,
            debug: SolverDebug::default(),
            pool: None,
            local_packages: HashSet::new(),
            held_patterns: Vec::new(),
        }
    }

    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    pub fn local_packages(&self) -> &HashSet<String> {
        &self.local_packages
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    fn pool_ref(&self) -> Result<&Pool> {
        self.pool
            .as_ref()
            .ok_or_else(|| Error::Solver("pool not loaded".into()))
    }

    /// Build the pool: installed set, then every enabled media in the
    /// accepted-versions set whose arch the target allows. Each media
    /// prefers its cached synthesis; the index store is the fallback.
    pub async fn load_pool(&mut self, installed: &[PackageRecord]) -> Result<()> {
        let mut pool = Pool::new(&self.opts.arch, self.opts.allowed_arches.clone());
        self.debug.log(&format!(
            "Creating pool for arch={}, root={:?}",
            self.opts.arch, self.opts.root
        ));

        if !self.opts.ignore_installed {
            for record in installed {
                if record.name == "gpg-pubkey" {
                    continue;
                }
                pool.add_record(
                    record.clone(),
                    RepoKind::Installed,
                    "@System",
                    INSTALLED_PRIORITY,
                    None,
                );
            }
        }
        let installed_count = pool.solvables.len();
        self.debug
            .log(&format!("Loaded {installed_count} installed packages"));

        let pins = self.db.list_pins().await?;
        let media_list = crate::sync::accepted_media(&self.db).await?;
        for media in media_list {
            if let Some(media_arch) = &media.architecture {
                if !self.opts.allowed_arches.contains(media_arch) {
                    self.debug.log(&format!(
                        "Skipping media {}: arch {media_arch} not allowed",
                        media.name
                    ));
                    continue;
                }
            }

            let records = match self.cached_synthesis(&media).await {
                Some(records) => records,
                None => self.records_from_store(media.id).await?,
            };
            for record in records {
                if record.arch == "src" || record.arch == "nosrc" {
                    continue;
                }
                if !pool.arch_allowed(&record.arch) {
                    continue;
                }
                let priority = effective_priority(&pins, &record.name, &media.name, media.priority);
                pool.add_record(record, RepoKind::Available, &media.name, priority, None);
            }
        }

        pool.create_whatprovides();
        self.debug.log(&format!(
            "Pool: {} solvables, {} installed",
            pool.solvables.len(),
            installed_count
        ));

        self.held_patterns = self.db.get_held_packages().await?;
        self.pool = Some(pool);
        Ok(())
    }

    async fn cached_synthesis(&self, media: &crate::db::Media) -> Option<Vec<PackageRecord>> {
        let servers = self.db.servers_for_media(media.id).await.ok()?;
        let server = servers.first()?;
        let relative_path = media.relative_path.as_deref()?;
        let hostname = crate::config::hostname_from_url(&server.media_url(relative_path));
        let path = self
            .ctx
            .media_dir(&hostname, &media.name)
            .join("media_info/synthesis.hdlist.cz");
        if !path.exists() {
            return None;
        }
        match crate::compression::decompress_to_string(&path).await {
            Ok(text) => Some(parse_synthesis(&text).collect()),
            Err(err) => {
                warn!("Cached synthesis unreadable for {}: {err}", media.name);
                None
            }
        }
    }

    async fn records_from_store(&self, media_id: i64) -> Result<Vec<PackageRecord>> {
        let packages = self.db.packages_for_media(media_id).await?;
        let mut by_id: BTreeMap<i64, PackageRecord> = packages
            .into_iter()
            .map(|p| {
                (
                    p.id,
                    PackageRecord {
                        name: p.name,
                        epoch: p.epoch,
                        version: p.version,
                        release: p.release,
                        arch: p.arch,
                        nevra: p.nevra,
                        summary: p.summary.unwrap_or_default(),
                        size: p.size,
                        filesize: p.filesize,
                        ..Default::default()
                    },
                )
            })
            .collect();

        type CapField = fn(&mut PackageRecord) -> &mut Vec<String>;
        let tables: [(&str, CapField); 6] = [
            ("provides", |r| &mut r.provides),
            ("requires", |r| &mut r.requires),
            ("conflicts", |r| &mut r.conflicts),
            ("obsoletes", |r| &mut r.obsoletes),
            ("recommends", |r| &mut r.recommends),
            ("suggests", |r| &mut r.suggests),
        ];
        for (table, field) in tables {
            for (pkg_id, cap) in self.db.deps_for_media(media_id, table).await? {
                if let Some(record) = by_id.get_mut(&pkg_id) {
                    field(record).push(cap);
                }
            }
        }
        Ok(by_id.into_values().collect())
    }

    /// Add local .rpm files as a synthetic @LocalRPMs repo.
    pub fn add_local_rpms(&mut self, rpms: Vec<(PackageRecord, PathBuf)>) -> Result<()> {
        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| Error::Solver("pool not loaded".into()))?;
        for (record, path) in rpms {
            self.local_packages.insert(record.name.clone());
            pool.add_record(
                record,
                RepoKind::LocalRpms,
                "@LocalRPMs",
                INSTALLED_PRIORITY - 1,
                Some(path),
            );
        }
        pool.create_whatprovides();
        Ok(())
    }

    fn is_held(&self, name: &str) -> bool {
        self.held_patterns.iter().any(|pattern| {
            GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(|g| g.compile_matcher().is_match(name))
                .unwrap_or(false)
        })
    }

    // ------------------------------------------------------------------
    // Install
    // ------------------------------------------------------------------

    pub fn resolve_install(
        &mut self,
        package_names: &[String],
        request: &InstallRequest,
    ) -> Result<Resolution> {
        let explicit: HashSet<String> = package_names
            .iter()
            .map(|n| parse_name_constraint(n).0.to_lowercase())
            .chain(request.choices.values().map(|v| v.to_lowercase()))
            .collect();

        // favor/disfavor shifts candidate preference before encoding
        let mut disfavored: HashSet<String> = request.explicit_disfavor.clone();
        let favored_lower: HashSet<String> =
            request.favored.iter().map(|f| f.to_lowercase()).collect();
        {
            let pool = self.pool_ref()?;
            for (cap, chosen) in &request.choices {
                for id in pool.whatprovides(cap, None) {
                    let solvable = pool.get(id);
                    if solvable.repo != RepoKind::Installed
                        && solvable.name() != chosen
                        && !favored_lower.contains(&solvable.name().to_lowercase())
                    {
                        disfavored.insert(solvable.name().to_string());
                    }
                }
            }
        }
        self.apply_bias(&request.favored, &disfavored);

        // capabilities owned by disfavored packages: favored packages that
        // overlap them get a weak install so the swap actually happens
        let weak_installs = self.weak_installs_for(request, &disfavored)?;

        let pool = self.pool.as_ref().expect("pool loaded above");
        let mut sat = SatSolver::new();
        let mut assumptions: Vec<Lit> = Vec::new();
        let mut not_found = Vec::new();

        for raw in package_names {
            let (base_name, constraint) = parse_name_constraint(raw);

            let mut selection = pool.select_name(&base_name, false);
            if selection.is_empty() {
                selection = pool.select_glob(&base_name, false);
            }
            if selection.is_empty() {
                selection = pool.select_provides(&base_name, false);
                if !selection.is_empty() && !request.choices.contains_key(raw) {
                    let provider_names: HashSet<String> = selection
                        .iter()
                        .filter(|&&id| pool.get(id).repo != RepoKind::Installed)
                        .map(|&id| pool.get(id).name().to_string())
                        .collect();
                    if provider_names.len() > 1 {
                        let names: Vec<String> = provider_names.into_iter().collect();
                        return Ok(Resolution {
                            success: false,
                            alternatives: vec![Alternative {
                                capability: raw.clone(),
                                required_by: String::new(),
                                providers: alternatives::prioritize_providers(pool, &names, 10),
                            }],
                            ..Default::default()
                        });
                    }
                }
            }

            if let Some((op, evr)) = &constraint {
                selection.retain(|&id| evr_matches(&pool.get(id).evr(), *op, evr));
            }
            // local rpms are selected by solvable, so installed copies of
            // the same name get replaced
            if self.local_packages.contains(&base_name) {
                selection.retain(|&id| pool.get(id).repo == RepoKind::LocalRpms);
            } else {
                selection.retain(|&id| pool.get(id).repo != RepoKind::Installed);
            }

            if selection.is_empty() {
                not_found.push(raw.clone());
            } else {
                let indicator = sat.add_install_job(pool, &selection, raw);
                assumptions.push(indicator);
            }
        }

        if !not_found.is_empty() {
            return Ok(Resolution::failure(
                not_found
                    .iter()
                    .map(|n| format!("Package not found: {n}"))
                    .collect(),
            ));
        }

        if !sat.solve(pool, &assumptions)? {
            let mut problems = sat.failed_jobs();
            problems.extend(sat.notes.iter().cloned());
            return Ok(Resolution::failure(problems));
        }

        // weak installs: chosen alternatives and qualifying favored
        for name in &weak_installs {
            let Some(&id) = pool
                .select_name(name, false)
                .iter()
                .find(|&&id| pool.get(id).repo != RepoKind::Installed)
            else {
                continue;
            };
            sat.try_weak(pool, &mut assumptions, id)?;
        }

        sat.minimize(pool, &mut assumptions)?;
        let recommended = self.apply_recommends(pool, &mut sat, &mut assumptions)?;

        let mut resolution = self.classify(pool, &sat, &explicit, &recommended);

        let requested_names: HashSet<String> = package_names
            .iter()
            .map(|n| parse_name_constraint(n).0)
            .collect();
        let mut alternatives =
            alternatives::find_alternatives(pool, &resolution.actions, &explicit);
        alternatives.retain(|alt| !request.choices.contains_key(&alt.capability));
        alternatives.retain(|alt| !alt.providers.iter().any(|p| requested_names.contains(p)));

        if !alternatives.is_empty() {
            resolution.success = false;
            resolution.alternatives = alternatives;
        }
        Ok(resolution)
    }

    fn apply_bias(&mut self, favored: &HashSet<String>, disfavored: &HashSet<String>) {
        const BIAS: i64 = 1_000_000;
        let Some(pool) = self.pool.as_mut() else { return };
        for solvable in &mut pool.solvables {
            if solvable.repo == RepoKind::Installed {
                continue;
            }
            let name_lower = solvable.record.name.to_lowercase();
            if favored.iter().any(|f| f.to_lowercase() == name_lower) {
                solvable.priority += BIAS;
            }
            if disfavored.iter().any(|d| d.to_lowercase() == name_lower) {
                solvable.priority -= BIAS;
            }
        }
    }

    fn weak_installs_for(
        &self,
        request: &InstallRequest,
        disfavored: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let pool = self.pool_ref()?;
        let mut weak: Vec<String> = request.choices.values().cloned().collect();

        if !request.preference_patterns.is_empty() {
            let mut disfavored_caps: HashSet<String> = HashSet::new();
            for name in disfavored {
                for &id in pool.by_name(name) {
                    if pool.get(id).repo == RepoKind::Installed {
                        continue;
                    }
                    for dep in &pool.get(id).deps.provides {
                        let cap = dep.name();
                        if cap.is_empty()
                            || cap.starts_with('/')
                            || cap.starts_with("lib")
                            || cap.starts_with("pkgconfig(")
                        {
                            continue;
                        }
                        disfavored_caps.insert(cap.to_string());
                    }
                }
            }

            for name in &request.favored {
                if weak.contains(name) {
                    continue;
                }
                for &id in pool.by_name(name) {
                    let solvable = pool.get(id);
                    if solvable.repo == RepoKind::Installed {
                        continue;
                    }
                    let caps: HashSet<String> = solvable
                        .deps
                        .provides
                        .iter()
                        .map(|d| d.name().to_string())
                        .chain(solvable.deps.requires.iter().map(|d| d.name().to_string()))
                        .map(|c| c.to_lowercase())
                        .collect();
                    let matches_all = request
                        .preference_patterns
                        .iter()
                        .all(|p| caps.contains(&p.to_lowercase()));
                    if !matches_all {
                        continue;
                    }
                    let provides: HashSet<String> = solvable
                        .deps
                        .provides
                        .iter()
                        .map(|d| d.name().to_string())
                        .collect();
                    if provides.intersection(&disfavored_caps).next().is_some() {
                        weak.push(name.clone());
                    }
                    break;
                }
            }
        }
        weak.sort();
        weak.dedup();
        Ok(weak)
    }

    /// Weak-dependency pass: recommends of every package entering the
    /// system are installed when satisfiable, iterated to a fixed point.
    fn apply_recommends(
        &self,
        pool: &Pool,
        sat: &mut SatSolver,
        assumptions: &mut Vec<Lit>,
    ) -> Result<HashSet<String>> {
        let mut recommended: HashSet<String> = HashSet::new();
        if !self.opts.install_recommends {
            return Ok(recommended);
        }

        for _ in 0..DEFAULT_SUGGESTS_ITERATION_CAP {
            let mut changed = false;
            let snapshot: Vec<SolvableId> = {
                let mut ids: Vec<SolvableId> = sat
                    .model()
                    .iter()
                    .copied()
                    .filter(|&id| pool.get(id).repo != RepoKind::Installed)
                    .collect();
                ids.sort_by(|&a, &b| pool.get(a).name().cmp(pool.get(b).name()).then(a.cmp(&b)));
                ids
            };

            for id in snapshot {
                for dep in pool.get(id).deps.recommends.clone() {
                    if dep.is_file() || dep.is_rpmlib() {
                        continue;
                    }
                    let providers = pool.whatprovides_dep(&dep);
                    if providers.is_empty() {
                        continue;
                    }
                    let satisfied = providers.iter().any(|&p| {
                        if pool.get(p).repo == RepoKind::Installed {
                            // still satisfied unless the solver decided to
                            // remove this provider
                            !sat.knows(p) || sat.is_true(p)
                        } else {
                            sat.is_true(p)
                        }
                    });
                    if satisfied {
                        continue;
                    }
                    let mut candidates: Vec<SolvableId> = providers
                        .into_iter()
                        .filter(|&p| pool.get(p).repo != RepoKind::Installed)
                        .filter(|&p| pool.arch_allowed(pool.get(p).arch()))
                        .collect();
                    pool.preference_order(&mut candidates);
                    for candidate in candidates {
                        if sat.try_weak(pool, assumptions, candidate)? {
                            recommended.insert(pool.get(candidate).name().to_string());
                            changed = true;
                            break;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
        Ok(recommended)
    }

    /// Turn the final model into an ordered action list.
    fn classify(
        &self,
        pool: &Pool,
        sat: &SatSolver,
        explicit: &HashSet<String>,
        recommended: &HashSet<String>,
    ) -> Resolution {
        let installed_by_name: HashMap<&str, &pool::Solvable> = pool
            .installed()
            .map(|s| (s.name(), s))
            .collect();

        let mut incoming: Vec<&pool::Solvable> = sat
            .model()
            .iter()
            .map(|&id| pool.get(id))
            .filter(|s| s.repo != RepoKind::Installed)
            .collect();
        incoming.sort_by(|a, b| a.name().cmp(b.name()));

        let incoming_names: HashSet<&str> = incoming.iter().map(|s| s.name()).collect();

        let mut actions = Vec::new();
        let mut install_size = 0;
        let mut remove_size = 0;

        for solvable in &incoming {
            let (action, from_evr) = match installed_by_name.get(solvable.name()) {
                Some(old) => match evr_cmp(&solvable.evr(), &old.evr()) {
                    Ordering::Greater => (TransactionType::Upgrade, old.evr()),
                    Ordering::Less => (TransactionType::Downgrade, old.evr()),
                    Ordering::Equal => (TransactionType::Reinstall, old.evr()),
                },
                None => (TransactionType::Install, String::new()),
            };
            let name_lower = solvable.name().to_lowercase();
            let reason = if explicit.contains(&name_lower) {
                InstallReason::Explicit
            } else if recommended.contains(solvable.name()) {
                InstallReason::Recommended
            } else {
                InstallReason::Dependency
            };
            install_size += solvable.record.filesize;
            actions.push((
                solvable.id,
                PackageAction {
                    action,
                    name: solvable.name().to_string(),
                    evr: solvable.evr(),
                    arch: solvable.arch().to_string(),
                    nevra: solvable.nevra().to_string(),
                    size: solvable.record.size,
                    filesize: solvable.record.filesize,
                    media_name: solvable.media_name.clone(),
                    reason,
                    from_evr,
                },
            ));
        }

        let ordered = order_installs(pool, sat, actions);

        let mut final_actions: Vec<PackageAction> = ordered;

        // installed packages forced out without a same-name replacement
        let mut removals: Vec<&pool::Solvable> = pool
            .installed()
            .filter(|s| sat.knows(s.id) && !sat.is_true(s.id))
            .filter(|s| !incoming_names.contains(s.name()))
            .collect();
        removals.sort_by(|a, b| a.name().cmp(b.name()));
        for solvable in removals {
            remove_size += solvable.record.size;
            final_actions.push(PackageAction {
                action: TransactionType::Remove,
                name: solvable.name().to_string(),
                evr: solvable.evr(),
                arch: solvable.arch().to_string(),
                nevra: solvable.nevra().to_string(),
                size: solvable.record.size,
                filesize: solvable.record.filesize,
                media_name: "@System".to_string(),
                reason: InstallReason::Dependency,
                from_evr: String::new(),
            });
        }

        Resolution {
            success: true,
            actions: final_actions,
            problems: Vec::new(),
            install_size,
            remove_size,
            alternatives: Vec::new(),
            held_upgrades: Vec::new(),
            held_obsoletes: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Upgrade
    // ------------------------------------------------------------------

    pub fn resolve_upgrade(&mut self, package_names: &[String]) -> Result<Resolution> {
        let pool = self.pool_ref()?;
        let mut sat = SatSolver::new();
        let mut assumptions: Vec<Lit> = Vec::new();
        let mut held_upgrades: Vec<String> = Vec::new();
        let mut held_obsoletes: Vec<(String, String)> = Vec::new();
        let explicit: HashSet<String> =
            package_names.iter().map(|n| n.to_lowercase()).collect();

        if !package_names.is_empty() {
            let mut not_installed = Vec::new();
            let mut not_found = Vec::new();
            for name in package_names {
                if self.local_packages.contains(name) {
                    let selection: Vec<SolvableId> = pool
                        .by_name(name)
                        .iter()
                        .copied()
                        .filter(|&id| pool.get(id).repo == RepoKind::LocalRpms)
                        .collect();
                    if selection.is_empty() {
                        not_found.push(name.clone());
                    } else {
                        assumptions.push(sat.add_install_job(pool, &selection, name));
                    }
                    continue;
                }

                let mut inst = pool.select_name(name, true);
                if inst.is_empty() {
                    inst = pool.select_glob(name, true);
                }
                if inst.is_empty() {
                    not_installed.push(name.clone());
                    continue;
                }

                let mut avail: Vec<SolvableId> = pool
                    .select_name(name, false)
                    .into_iter()
                    .filter(|&id| pool.get(id).repo != RepoKind::Installed)
                    .collect();
                if avail.is_empty() {
                    avail = pool
                        .select_glob(name, false)
                        .into_iter()
                        .filter(|&id| pool.get(id).repo != RepoKind::Installed)
                        .collect();
                }
                if avail.is_empty() {
                    not_found.push(name.clone());
                } else {
                    assumptions.push(sat.add_install_job(pool, &avail, name));
                }
            }
            if !not_installed.is_empty() {
                return Ok(Resolution::failure(
                    not_installed
                        .iter()
                        .map(|n| format!("Package not installed: {n}"))
                        .collect(),
                ));
            }
            if !not_found.is_empty() {
                return Ok(Resolution::failure(
                    not_found
                        .iter()
                        .map(|n| format!("Package not found: {n}"))
                        .collect(),
                ));
            }
        } else {
            // full upgrade: best available candidate per installed package
            let mut updates = 0;
            let installed: Vec<&pool::Solvable> = {
                let mut v: Vec<_> = pool.installed().collect();
                v.sort_by(|a, b| a.name().cmp(b.name()));
                v
            };
            for inst in &installed {
                let mut best: Option<&pool::Solvable> = None;
                for &id in pool.by_name(inst.name()) {
                    let cand = pool.get(id);
                    if cand.repo == RepoKind::Installed || !pool.arch_allowed(cand.arch()) {
                        continue;
                    }
                    best = Some(match best {
                        None => cand,
                        Some(current) => {
                            let cand_same = cand.arch() == inst.arch();
                            let cur_same = current.arch() == inst.arch();
                            if cand_same != cur_same {
                                if cand_same { cand } else { current }
                            } else if evr_cmp(&cand.evr(), &current.evr()) == Ordering::Greater {
                                cand
                            } else {
                                current
                            }
                        }
                    });
                }
                let Some(best) = best else { continue };
                if evr_cmp(&best.evr(), &inst.evr()) != Ordering::Greater {
                    continue;
                }
                if self.is_held(inst.name()) {
                    held_upgrades.push(inst.name().to_string());
                    self.debug.watch(inst.name(), "held, upgrade skipped", "");
                    continue;
                }
                assumptions.push(sat.add_install_job(
                    pool,
                    &[best.id],
                    &format!("upgrade {}", inst.name()),
                ));
                updates += 1;
            }

            // packages that obsolete something installed
            let installed_names: HashSet<&str> =
                pool.installed().map(|s| s.name()).collect();
            let mut seen_obsoletes: HashSet<(String, String)> = HashSet::new();
            let mut obsoleters: Vec<&pool::Solvable> = pool
                .solvables
                .iter()
                .filter(|s| s.repo == RepoKind::Available)
                .filter(|s| !s.deps.obsoletes.is_empty())
                .collect();
            obsoleters.sort_by(|a, b| a.name().cmp(b.name()));
            for s in obsoleters {
                if installed_names.contains(s.name()) {
                    continue;
                }
                for dep in &s.deps.obsoletes {
                    let (obs_name, constraint) = match dep {
                        Dep::Simple(n) => (n.as_str(), None),
                        Dep::Versioned { name, op, evr } => (name.as_str(), Some((*op, evr))),
                        Dep::Rich(_) => continue,
                    };
                    if obs_name == s.name() {
                        continue;
                    }
                    for &inst_id in pool.by_name(obs_name) {
                        let inst = pool.get(inst_id);
                        if inst.repo != RepoKind::Installed {
                            continue;
                        }
                        let version_ok = match constraint {
                            None => true,
                            Some((op, evr)) => evr_matches(&inst.evr(), op, evr),
                        };
                        if !version_ok {
                            continue;
                        }
                        let key = (inst.name().to_string(), s.name().to_string());
                        if !seen_obsoletes.insert(key) {
                            continue;
                        }
                        if self.is_held(inst.name()) {
                            held_obsoletes
                                .push((inst.name().to_string(), s.name().to_string()));
                        } else {
                            assumptions.push(sat.add_install_job(
                                pool,
                                &[s.id],
                                &format!("{} obsoletes {}", s.name(), inst.name()),
                            ));
                            updates += 1;
                        }
                        break;
                    }
                }
            }

            if updates == 0 {
                return Ok(Resolution {
                    success: true,
                    held_upgrades,
                    held_obsoletes,
                    ..Default::default()
                });
            }
        }

        if !sat.solve(pool, &assumptions)? {
            let mut problems = sat.failed_jobs();
            problems.extend(sat.notes.iter().cloned());
            return Ok(Resolution::failure(problems));
        }
        sat.minimize(pool, &mut assumptions)?;
        let recommended = self.apply_recommends(pool, &mut sat, &mut assumptions)?;

        let mut resolution = self.classify(pool, &sat, &explicit, &recommended);
        resolution.held_upgrades = held_upgrades;
        resolution.held_obsoletes = held_obsoletes;
        Ok(resolution)
    }

    // ------------------------------------------------------------------
    // Remove
    // ------------------------------------------------------------------

    pub fn resolve_remove(&mut self, package_names: &[String], clean_deps: bool) -> Result<Resolution> {
        let pool = self.pool_ref()?;
        let mut sat = SatSolver::new();
        let mut assumptions: Vec<Lit> = Vec::new();
        let mut not_found = Vec::new();
        let mut erase_names: Vec<String> = Vec::new();

        for name in package_names {
            let mut selection = pool.select_name(name, true);
            if selection.is_empty() {
                selection = pool.select_glob(name, true);
            }
            if selection.is_empty() {
                selection = pool.select_provides(name, true);
            }
            if selection.is_empty() {
                not_found.push(name.clone());
            } else {
                for id in selection {
                    erase_names.push(pool.get(id).name().to_string());
                    assumptions.push(sat.add_erase_job(pool, id, name));
                }
            }
        }

        if !not_found.is_empty() {
            // everything already gone: nothing to do rather than an error
            if not_found.len() == package_names.len() {
                return Ok(Resolution {
                    success: true,
                    ..Default::default()
                });
            }
            return Ok(Resolution::failure(
                not_found
                    .iter()
                    .map(|n| format!("Package not installed: {n}"))
                    .collect(),
            ));
        }

        if !sat.solve(pool, &assumptions)? {
            let mut problems = sat.failed_jobs();
            problems.extend(sat.notes.iter().cloned());
            return Ok(Resolution::failure(problems));
        }
        sat.minimize(pool, &mut assumptions)?;

        let mut resolution = self.classify(pool, &sat, &HashSet::new(), &HashSet::new());
        for action in &mut resolution.actions {
            if erase_names.contains(&action.name) {
                action.reason = InstallReason::Explicit;
            }
        }

        if clean_deps && !resolution.actions.is_empty() {
            let installed_records: Vec<PackageRecord> =
                pool.installed().map(|s| s.record.clone()).collect();
            let all_removed: Vec<String> = resolution
                .actions
                .iter()
                .map(|a| a.name.clone())
                .collect();
            let unrequested = orphans::read_unrequested(self.opts.root.as_deref());
            let already: HashSet<String> = all_removed.iter().cloned().collect();
            let orphan_actions = orphans::find_erase_orphans(
                &installed_records,
                &all_removed,
                &unrequested,
                false,
                false,
            );
            for orphan in orphan_actions {
                if !already.contains(&orphan.name) {
                    resolution.remove_size += orphan.size;
                    resolution.actions.push(orphan);
                }
            }
        }
        Ok(resolution)
    }

    // ------------------------------------------------------------------
    // Suggests and queries
    // ------------------------------------------------------------------

    /// Suggests are surfaced iteratively: each accepted provider may
    /// suggest more. Bounded by the configured cap so pathological
    /// recommends-of-recommends chains terminate.
    pub async fn find_suggests_iterative(
        &self,
        package_names: &[String],
        choices: &HashMap<String, String>,
        resolved_packages: &[String],
    ) -> Result<(Vec<PackageAction>, Vec<Alternative>)> {
        let pool = self.pool_ref()?;
        let cap = match self.db.get_config("suggests-iteration-cap").await? {
            Some(v) => v.parse().unwrap_or(DEFAULT_SUGGESTS_ITERATION_CAP),
            None => DEFAULT_SUGGESTS_ITERATION_CAP,
        };

        let mut all_suggests: Vec<PackageAction> = Vec::new();
        let mut all_alternatives: Vec<Alternative> = Vec::new();
        let mut resolved: Vec<String> = resolved_packages.to_vec();
        let mut frontier: Vec<String> = package_names.to_vec();

        for _ in 0..cap {
            let (suggests, alternatives) =
                alternatives::find_available_suggests(pool, &frontier, choices, &resolved);
            let mut next_frontier = Vec::new();
            for action in suggests {
                if resolved.contains(&action.name) {
                    continue;
                }
                resolved.push(action.name.clone());
                next_frontier.push(action.name.clone());
                all_suggests.push(action);
            }
            for alt in alternatives {
                if !all_alternatives
                    .iter()
                    .any(|a: &Alternative| a.capability == alt.capability)
                {
                    all_alternatives.push(alt);
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }
        Ok((all_suggests, all_alternatives))
    }

    pub fn get_providers(&self, capability: &str, include_installed: bool) -> Result<Vec<String>> {
        let pool = self.pool_ref()?;
        let mut names: Vec<String> = pool
            .whatprovides(capability, None)
            .into_iter()
            .map(|id| pool.get(id))
            .filter(|s| include_installed || s.repo != RepoKind::Installed)
            .map(|s| s.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn package_deps(
        &self,
        package_name: &str,
        pick: impl Fn(&pool::Solvable) -> Vec<String>,
    ) -> Result<Vec<String>> {
        let pool = self.pool_ref()?;
        for &id in pool.by_name(package_name) {
            let solvable = pool.get(id);
            if solvable.repo == RepoKind::Installed {
                continue;
            }
            return Ok(pick(solvable));
        }
        Ok(Vec::new())
    }

    pub fn get_package_requires(&self, package_name: &str) -> Result<Vec<String>> {
        self.package_deps(package_name, |s| {
            s.record
                .requires
                .iter()
                .filter(|c| !c.starts_with("rpmlib(") && !c.starts_with('/'))
                .cloned()
                .collect()
        })
    }

    pub fn get_package_recommends(&self, package_name: &str) -> Result<Vec<String>> {
        self.package_deps(package_name, |s| s.record.recommends.clone())
    }

    pub fn get_package_suggests(&self, package_name: &str) -> Result<Vec<String>> {
        self.package_deps(package_name, |s| s.record.suggests.clone())
    }

    pub fn detect_blocs(&self, capabilities: &[String]) -> Result<alternatives::BlocInfo> {
        Ok(alternatives::detect_blocs(self.pool_ref()?, capabilities))
    }

    /// Upgrade orphans for a resolved transaction (S-C5.1 companion).
    pub fn find_upgrade_orphans(&self, resolution: &Resolution) -> Result<Vec<PackageAction>> {
        let pool = self.pool_ref()?;
        let installed_records: Vec<PackageRecord> =
            pool.installed().map(|s| s.record.clone()).collect();
        let upgrades: Vec<(String, Vec<String>)> = resolution
            .actions
            .iter()
            .filter(|a| a.action == TransactionType::Upgrade)
            .filter_map(|a| {
                pool.by_name(&a.name)
                    .iter()
                    .map(|&id| pool.get(id))
                    .find(|s| s.repo != RepoKind::Installed && s.evr() == a.evr)
                    .map(|s| (a.name.clone(), s.record.requires.clone()))
            })
            .collect();
        let unrequested = orphans::read_unrequested(self.opts.root.as_deref());
        Ok(orphans::find_upgrade_orphans(
            &installed_records,
            &upgrades,
            &unrequested,
        ))
    }

    /// Dependency edges between packages of one resolution only.
    pub fn build_dependency_graph(
        &self,
        resolution: &Resolution,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let pool = self.pool_ref()?;
        let resolved: HashSet<String> = resolution
            .actions
            .iter()
            .filter(|a| {
                matches!(
                    a.action,
                    TransactionType::Install | TransactionType::Upgrade
                )
            })
            .map(|a| a.name.clone())
            .collect();

        let mut cap_to_provider: HashMap<String, String> = HashMap::new();
        for name in &resolved {
            for &id in pool.by_name(name) {
                let solvable = pool.get(id);
                if solvable.repo == RepoKind::Installed {
                    continue;
                }
                for dep in &solvable.deps.provides {
                    let cap = dep.name().to_string();
                    cap_to_provider.entry(cap).or_insert_with(|| name.clone());
                }
                break;
            }
        }

        let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in &resolved {
            let entry = graph.entry(name.clone()).or_default();
            for &id in pool.by_name(name) {
                let solvable = pool.get(id);
                if solvable.repo == RepoKind::Installed {
                    continue;
                }
                for dep in &solvable.deps.requires {
                    if dep.is_file() || dep.is_rpmlib() {
                        continue;
                    }
                    if let Some(provider) = cap_to_provider.get(dep.name()) {
                        if provider != name && resolved.contains(provider)
                            && !entry.contains(provider)
                        {
                            entry.push(provider.clone());
                        }
                    }
                }
                break;
            }
        }
        Ok(graph)
    }
}

fn effective_priority(
    pins: &[crate::db::Pin],
    package_name: &str,
    media_name: &str,
    media_priority: i64,
) -> i64 {
    for pin in pins {
        let pkg_match = GlobBuilder::new(&pin.package_pattern)
            .case_insensitive(true)
            .build()
            .map(|g| g.compile_matcher().is_match(package_name))
            .unwrap_or(false);
        if !pkg_match {
            continue;
        }
        let media_match = match &pin.media_pattern {
            None => true,
            Some(pattern) => GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(|g| g.compile_matcher().is_match(media_name))
                .unwrap_or(false),
        };
        if media_match {
            return pin.priority;
        }
    }
    media_priority
}

/// Dependencies first; ties broken by name so the order is reproducible.
fn order_installs(
    pool: &Pool,
    sat: &SatSolver,
    actions: Vec<(SolvableId, PackageAction)>,
) -> Vec<PackageAction> {
    let ids: HashSet<SolvableId> = actions.iter().map(|(id, _)| *id).collect();
    let mut deps_of: BTreeMap<SolvableId, Vec<SolvableId>> = BTreeMap::new();
    for (id, _) in &actions {
        let mut edges = Vec::new();
        for dep in &pool.get(*id).deps.requires {
            if dep.is_file() || dep.is_rpmlib() {
                continue;
            }
            for provider in pool.whatprovides_dep(dep) {
                if provider != *id && ids.contains(&provider) && sat.is_true(provider) {
                    edges.push(provider);
                }
            }
        }
        edges.sort_unstable();
        edges.dedup();
        deps_of.insert(*id, edges);
    }

    let by_id: HashMap<SolvableId, PackageAction> = actions.into_iter().collect();
    let mut emitted: HashSet<SolvableId> = HashSet::new();
    let mut visiting: HashSet<SolvableId> = HashSet::new();

    fn visit(
        id: SolvableId,
        deps_of: &BTreeMap<SolvableId, Vec<SolvableId>>,
        emitted: &mut HashSet<SolvableId>,
        visiting: &mut HashSet<SolvableId>,
        ordered: &mut Vec<SolvableId>,
    ) {
        if emitted.contains(&id) || !visiting.insert(id) {
            return;
        }
        for &dep in deps_of.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            visit(dep, deps_of, emitted, visiting, ordered);
        }
        visiting.remove(&id);
        if emitted.insert(id) {
            ordered.push(id);
        }
    }

    let mut roots: Vec<SolvableId> = deps_of.keys().copied().collect();
    roots.sort_by(|&a, &b| {
        by_id[&a]
            .name
            .cmp(&by_id[&b].name)
            .then(a.cmp(&b))
    });
    let mut ordered_ids = Vec::new();
    for id in roots {
        visit(id, &deps_of, &mut emitted, &mut visiting, &mut ordered_ids);
    }
    ordered_ids.into_iter().map(|id| by_id[&id].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewMedia;

    fn record(name: &str, version: &str, provides: &[&str], requires: &[&str]) -> PackageRecord {
        PackageRecord {
            name: name.to_string(),
            version: version.to_string(),
            release: "1.mga9".to_string(),
            arch: "x86_64".to_string(),
            nevra: format!("{name}-{version}-1.mga9.x86_64"),
            filesize: 1000,
            size: 4000,
            provides: provides.iter().map(|s| s.to_string()).collect(),
            requires: requires.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn resolver_with(
        available: Vec<PackageRecord>,
        installed: Vec<PackageRecord>,
    ) -> Resolver {
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let db = Database::open_memory().await.unwrap();
        db.set_config("system-version", "9").await.unwrap();
        let media_id = db
            .add_media(&NewMedia {
                name: "Core Release".to_string(),
                mageia_version: Some("9".to_string()),
                architecture: Some("x86_64".to_string()),
                short_name: Some("core-release".to_string()),
                relative_path: Some("9/x86_64/media/core/release".to_string()),
                official: true,
                enabled: true,
                update_media: false,
                priority: 50,
            })
            .await
            .unwrap();
        db.import_packages(media_id, "synthesis", &available)
            .await
            .unwrap();

        let mut resolver = Resolver::new(ctx, db, ResolverOptions::default());
        resolver.load_pool(&installed).await.unwrap();
        resolver
    }

    fn installs(resolution: &Resolution) -> Vec<String> {
        resolution
            .actions
            .iter()
            .filter(|a| a.action == TransactionType::Install)
            .map(|a| a.name.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_install_with_dependency() {
        let available = vec![
            record("firefox", "120.0", &["webclient"], &["libgtk3"]),
            record("libgtk3", "3.24", &["libgtk3"], &[]),
        ];
        let mut resolver = resolver_with(available, vec![]).await;

        let resolution = resolver
            .resolve_install(&["firefox".to_string()], &InstallRequest::default())
            .unwrap();
        assert!(resolution.success, "problems: {:?}", resolution.problems);
        let names = installs(&resolution);
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"firefox".to_string()));
        assert!(names.contains(&"libgtk3".to_string()));
        // dependencies install first
        assert_eq!(names[0], "libgtk3");
        assert_eq!(
            resolution
                .actions
                .iter()
                .find(|a| a.name == "firefox")
                .unwrap()
                .reason,
            InstallReason::Explicit
        );
        assert_eq!(
            resolution
                .actions
                .iter()
                .find(|a| a.name == "libgtk3")
                .unwrap()
                .reason,
            InstallReason::Dependency
        );
    }

    #[tokio::test]
    async fn test_install_dependency_already_installed() {
        let available = vec![
            record("firefox", "120.0", &[], &["libgtk3"]),
            record("libgtk3", "3.24", &["libgtk3"], &[]),
        ];
        let installed = vec![record("libgtk3", "3.24", &["libgtk3"], &[])];
        let mut resolver = resolver_with(available, installed).await;

        let resolution = resolver
            .resolve_install(&["firefox".to_string()], &InstallRequest::default())
            .unwrap();
        assert!(resolution.success);
        assert_eq!(installs(&resolution), vec!["firefox"]);
    }

    #[tokio::test]
    async fn test_install_not_found() {
        let mut resolver = resolver_with(vec![record("vim", "9.0", &[], &[])], vec![]).await;
        let resolution = resolver
            .resolve_install(&["nosuchpkg".to_string()], &InstallRequest::default())
            .unwrap();
        assert!(!resolution.success);
        assert_eq!(resolution.problems, vec!["Package not found: nosuchpkg"]);
    }

    #[tokio::test]
    async fn test_install_alternative_providers() {
        let available = vec![
            record("task-pulseaudio", "1.0", &["task-sound"], &[]),
            record("task-pipewire", "1.0", &["task-sound"], &[]),
        ];
        let mut resolver = resolver_with(available, vec![]).await;

        let resolution = resolver
            .resolve_install(&["task-sound".to_string()], &InstallRequest::default())
            .unwrap();
        assert!(!resolution.success);
        assert!(resolution.problems.is_empty());
        assert_eq!(resolution.alternatives.len(), 1);
        let alt = &resolution.alternatives[0];
        assert_eq!(alt.capability, "task-sound");
        let mut providers = alt.providers.clone();
        providers.sort();
        assert_eq!(providers, vec!["task-pipewire", "task-pulseaudio"]);
    }

    #[tokio::test]
    async fn test_install_alternative_resolved_by_choice() {
        let available = vec![
            record("task-pulseaudio", "1.0", &["task-sound"], &[]),
            record("task-pipewire", "1.0", &["task-sound"], &[]),
        ];
        let mut resolver = resolver_with(available, vec![]).await;

        let request = InstallRequest {
            choices: maplit::hashmap! {
                "task-sound".to_string() => "task-pulseaudio".to_string(),
            },
            ..Default::default()
        };
        let resolution = resolver
            .resolve_install(&["task-sound".to_string()], &request)
            .unwrap();
        assert!(resolution.success, "problems: {:?}", resolution.problems);
        let names = installs(&resolution);
        assert!(names.contains(&"task-pulseaudio".to_string()));
        assert!(!names.contains(&"task-pipewire".to_string()));
    }

    #[tokio::test]
    async fn test_install_conflict_fails() {
        let available = vec![
            record("a", "1.0", &[], &["b"]),
            {
                let mut b = record("b", "1.0", &[], &[]);
                b.conflicts = vec!["c".to_string()];
                b
            },
        ];
        let installed = vec![record("c", "1.0", &[], &[])];
        let mut resolver = resolver_with(available, installed).await;

        // installing a pulls b which conflicts with installed c;
        // allow-uninstall lets the solver remove c
        let resolution = resolver
            .resolve_install(&["a".to_string()], &InstallRequest::default())
            .unwrap();
        assert!(resolution.success, "problems: {:?}", resolution.problems);
        assert!(resolution
            .actions
            .iter()
            .any(|a| a.name == "c" && a.action == TransactionType::Remove));
    }

    #[tokio::test]
    async fn test_upgrade_full() {
        let available = vec![
            record("vim", "9.1", &[], &[]),
            record("glibc", "2.38", &[], &[]),
        ];
        let installed = vec![
            record("vim", "9.0", &[], &[]),
            record("glibc", "2.38", &[], &[]),
        ];
        let mut resolver = resolver_with(available, installed).await;

        let resolution = resolver.resolve_upgrade(&[]).unwrap();
        assert!(resolution.success, "problems: {:?}", resolution.problems);
        let upgrades: Vec<_> = resolution
            .actions
            .iter()
            .filter(|a| a.action == TransactionType::Upgrade)
            .collect();
        assert_eq!(upgrades.len(), 1);
        assert_eq!(upgrades[0].name, "vim");
        assert_eq!(upgrades[0].from_evr, "9.0-1.mga9");
        assert_eq!(upgrades[0].evr, "9.1-1.mga9");
    }

    #[tokio::test]
    async fn test_upgrade_held_package_skipped() {
        let available = vec![record("vim", "9.1", &[], &[])];
        let installed = vec![record("vim", "9.0", &[], &[])];
        let mut resolver = resolver_with(available, installed).await;
        resolver
            .db
            .set_config("held_packages", "vim")
            .await
            .unwrap();
        resolver.held_patterns = resolver.db.get_held_packages().await.unwrap();

        let resolution = resolver.resolve_upgrade(&[]).unwrap();
        assert!(resolution.success);
        assert!(resolution.actions.is_empty());
        assert_eq!(resolution.held_upgrades, vec!["vim"]);
    }

    #[tokio::test]
    async fn test_upgrade_obsoletes() {
        let mut dhcpcd = record("dhcpcd", "10.0", &[], &[]);
        dhcpcd.obsoletes = vec!["dhcp-client".to_string()];
        let available = vec![dhcpcd];
        let installed = vec![record("dhcp-client", "4.4", &[], &[])];
        let mut resolver = resolver_with(available, installed).await;

        let resolution = resolver.resolve_upgrade(&[]).unwrap();
        assert!(resolution.success, "problems: {:?}", resolution.problems);
        assert!(resolution
            .actions
            .iter()
            .any(|a| a.name == "dhcpcd" && a.action == TransactionType::Install));
        assert!(resolution
            .actions
            .iter()
            .any(|a| a.name == "dhcp-client" && a.action == TransactionType::Remove));
    }

    #[tokio::test]
    async fn test_remove_with_orphans() {
        let installed = vec![
            record("firefox", "120.0", &[], &["libgtk3"]),
            record("libgtk3", "3.24", &["libgtk3"], &[]),
            record("vim", "9.0", &[], &[]),
        ];
        let mut resolver = resolver_with(vec![], installed).await;

        // mark libgtk3 as auto-installed in a scratch root
        let root = tempfile::tempdir().unwrap();
        resolver.opts.root = Some(root.path().to_path_buf());
        orphans::mark_as_dependency(Some(root.path()), &["libgtk3".to_string()]).unwrap();

        let resolution = resolver
            .resolve_remove(&["firefox".to_string()], true)
            .unwrap();
        assert!(resolution.success, "problems: {:?}", resolution.problems);
        let removed: Vec<_> = resolution.actions.iter().map(|a| a.name.as_str()).collect();
        assert!(removed.contains(&"firefox"));
        assert!(removed.contains(&"libgtk3"));
        assert!(!removed.contains(&"vim"));
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let mut resolver = resolver_with(vec![], vec![]).await;
        let resolution = resolver
            .resolve_remove(&["ghost".to_string()], false)
            .unwrap();
        assert!(resolution.success);
        assert!(resolution.actions.is_empty());
    }

    #[tokio::test]
    async fn test_recommends_installed_by_default() {
        let mut firefox = record("firefox", "120.0", &[], &[]);
        firefox.recommends = vec!["firefox-fr".to_string()];
        let available = vec![
            firefox,
            record("firefox-fr", "120.0", &["firefox-fr"], &[]),
        ];
        let mut resolver = resolver_with(available, vec![]).await;

        let resolution = resolver
            .resolve_install(&["firefox".to_string()], &InstallRequest::default())
            .unwrap();
        assert!(resolution.success);
        let fr = resolution
            .actions
            .iter()
            .find(|a| a.name == "firefox-fr")
            .expect("recommended package installed");
        assert_eq!(fr.reason, InstallReason::Recommended);

        // and skipped when weak deps are off
        resolver.opts.install_recommends = false;
        let resolution = resolver
            .resolve_install(&["firefox".to_string()], &InstallRequest::default())
            .unwrap();
        assert!(installs(&resolution).iter().all(|n| n != "firefox-fr"));
    }

    #[tokio::test]
    async fn test_version_conflict_blocks_pool() {
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let db = Database::open_memory().await.unwrap();
        db.set_config("system-version", "9").await.unwrap();
        for (name, version) in [("Core Release", "9"), ("Cauldron", "cauldron")] {
            db.add_media(&NewMedia {
                name: name.to_string(),
                mageia_version: Some(version.to_string()),
                architecture: Some("x86_64".to_string()),
                enabled: true,
                priority: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let mut resolver = Resolver::new(ctx, db, ResolverOptions::default());
        assert!(resolver.load_pool(&[]).await.is_err());

        resolver
            .db
            .set_config("version-mode", "system")
            .await
            .unwrap();
        assert!(resolver.load_pool(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_pin_steers_provider_choice() {
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let db = Database::open_memory().await.unwrap();
        db.set_config("system-version", "9").await.unwrap();
        for (media, priority) in [("Core Release", 50), ("Backports", 20)] {
            let id = db
                .add_media(&NewMedia {
                    name: media.to_string(),
                    mageia_version: Some("9".to_string()),
                    architecture: Some("x86_64".to_string()),
                    enabled: true,
                    priority,
                    ..Default::default()
                })
                .await
                .unwrap();
            let version = if media == "Backports" { "9.2" } else { "9.0" };
            db.import_packages(id, "synthesis", &[record("vim", version, &[], &[])])
                .await
                .unwrap();
        }
        // without a pin the higher-priority media wins even with the
        // older version
        let mut resolver = Resolver::new(ctx.clone(), db.clone(), ResolverOptions::default());
        resolver.load_pool(&[]).await.unwrap();
        let resolution = resolver
            .resolve_install(&["vim".to_string()], &InstallRequest::default())
            .unwrap();
        assert!(resolution.success);
        assert_eq!(resolution.actions[0].evr, "9.0-1.mga9");

        // pinning vim to Backports flips the choice
        db.add_pin("vim", Some("Backports"), 500, None, None)
            .await
            .unwrap();
        let mut resolver = Resolver::new(ctx, db, ResolverOptions::default());
        resolver.load_pool(&[]).await.unwrap();
        let resolution = resolver
            .resolve_install(&["vim".to_string()], &InstallRequest::default())
            .unwrap();
        assert!(resolution.success);
        assert_eq!(resolution.actions[0].evr, "9.2-1.mga9");
    }

    #[tokio::test]
    async fn test_dependency_graph() {
        let available = vec![
            record("firefox", "120.0", &[], &["libgtk3"]),
            record("libgtk3", "3.24", &["libgtk3"], &[]),
        ];
        let mut resolver = resolver_with(available, vec![]).await;
        let resolution = resolver
            .resolve_install(&["firefox".to_string()], &InstallRequest::default())
            .unwrap();
        let graph = resolver.build_dependency_graph(&resolution).unwrap();
        assert_eq!(graph.get("firefox").unwrap(), &vec!["libgtk3".to_string()]);
        assert!(graph.get("libgtk3").unwrap().is_empty());
    }
}
