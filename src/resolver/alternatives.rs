//! Alternative detection and ranking: when several packages can satisfy
//! the same capability, surface the choice instead of silently picking one.

use crate::resolver::pool::{extract_cap_name, Dep, Pool, RepoKind, SolvableId};
use crate::resolver::{Alternative, InstallReason, PackageAction, TransactionType};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

const MAX_PROVIDERS: usize = 10;

static VERSIONED_REQ: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9_-]+)\s*(=|>=|<=|>|<)\s*(.+)$").expect("static regex")
});
static BLOC_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+:\d+\.\d+)").expect("static regex"));

/// Capabilities that are internal rpm/systemd plumbing, never a
/// user-facing choice.
pub const INTERNAL_CAPS: &[&str] = &["should-restart", "postshell", "config", "bundled", "debuginfo"];

pub fn is_library_package(name: &str) -> bool {
    let name = name.to_lowercase();
    if name.starts_with("lib64") || name.starts_with("lib32") || name.starts_with("libx") {
        return true;
    }
    name.starts_with("lib") && name[3..].chars().any(|c| c.is_ascii_digit())
}

fn dep_base_name(dep: &Dep) -> Option<String> {
    match dep {
        Dep::Simple(name) => Some(name.clone()),
        Dep::Versioned { name, .. } => Some(name.clone()),
        Dep::Rich(_) => None,
    }
}

/// Whether the providers really represent a user decision.
fn is_valid_alternative(capability: &str, provider_names: &BTreeSet<String>) -> bool {
    if provider_names.contains(capability) {
        return false;
    }
    if provider_names.iter().all(|p| is_library_package(p)) {
        return false;
    }

    // Providers whose name is the capability plus a version suffix are one
    // package under different numbers, not a choice. Distinct functional
    // suffixes (php8.4-cgi vs php8.4-cli) stay a choice.
    let normalize = |s: &str| s.replace(['-', '_'], "").to_lowercase();
    let cap_norm = normalize(capability);
    let matching: Vec<&String> = provider_names
        .iter()
        .filter(|p| normalize(p).contains(&cap_norm))
        .collect();
    if !matching.is_empty() {
        let mut suffixes = BTreeSet::new();
        for p in &matching {
            let p_norm = normalize(p);
            if let Some(idx) = p_norm.find(&cap_norm) {
                let suffix: String = p_norm[idx + cap_norm.len()..]
                    .chars()
                    .filter(|c| !c.is_ascii_digit())
                    .collect();
                suffixes.insert(suffix);
            }
        }
        if suffixes.len() <= 1 {
            return false;
        }
    }
    true
}

/// Count dependencies of a package that are not installed yet, up to a
/// small depth. Cheap providers sort first in alternative prompts.
pub fn count_missing_deps(pool: &Pool, pkg_name: &str, depth: usize) -> usize {
    let installed: HashSet<String> = pool
        .installed()
        .map(|s| s.name().to_lowercase())
        .collect();

    let mut missing: HashSet<String> = HashSet::new();
    let mut checked: HashSet<String> = HashSet::new();

    fn walk(
        pool: &Pool,
        name: &str,
        depth: usize,
        installed: &HashSet<String>,
        missing: &mut HashSet<String>,
        checked: &mut HashSet<String>,
    ) {
        if depth == 0 || !checked.insert(name.to_lowercase()) {
            return;
        }
        let Some(&id) = pool
            .select_name(name, false)
            .iter()
            .find(|&&id| pool.get(id).repo != RepoKind::Installed)
        else {
            return;
        };
        let solvable = pool.get(id);
        for dep in &solvable.deps.requires {
            if dep.is_file() || dep.is_rpmlib() {
                continue;
            }
            if dep.name().starts_with("config(") {
                continue;
            }
            let providers = pool.whatprovides_dep(dep);
            let satisfied = providers
                .iter()
                .any(|&p| installed.contains(&pool.get(p).name().to_lowercase()));
            if satisfied {
                continue;
            }
            if let Some(&first) = providers
                .iter()
                .find(|&&p| pool.get(p).repo != RepoKind::Installed)
            {
                let pname = pool.get(first).name().to_lowercase();
                if missing.insert(pname.clone()) {
                    walk(pool, &pname, depth - 1, installed, missing, checked);
                }
            }
        }
    }

    walk(pool, pkg_name, depth, &installed, &mut missing, &mut checked);
    missing.len()
}

/// Rank providers: fewest new packages first, then locale match against
/// `$LANG`, then name.
pub fn prioritize_providers(pool: &Pool, providers: &[String], max_count: usize) -> Vec<String> {
    let lang = std::env::var("LANG")
        .unwrap_or_else(|_| "en_US.UTF-8".to_string())
        .split('_')
        .next()
        .unwrap_or("en")
        .to_lowercase();
    const COMMON_LANGS: &[&str] = &["en", "fr", "de", "es", "it", "pt", "ru", "zh", "ja", "ko"];

    let missing: HashMap<String, usize> = providers
        .iter()
        .map(|name| (name.clone(), count_missing_deps(pool, name, 3)))
        .collect();

    let mut sorted = providers.to_vec();
    sorted.sort_by_key(|name| {
        let name_lower = name.to_lowercase();
        let locale_score = if name_lower.contains(&format!("-{lang}"))
            || name_lower.ends_with(&format!("_{lang}"))
        {
            0
        } else if COMMON_LANGS
            .iter()
            .any(|l| name_lower.contains(&format!("-{l}")) || name_lower.ends_with(&format!("_{l}")))
        {
            1
        } else {
            2
        };
        (
            missing.get(name).copied().unwrap_or(999),
            locale_score,
            name.clone(),
        )
    });
    sorted.truncate(max_count);
    sorted
}

/// Scan the install steps of a transaction for capabilities several
/// distinct packages could satisfy.
pub fn find_alternatives(
    pool: &Pool,
    actions: &[PackageAction],
    explicit: &HashSet<String>,
) -> Vec<Alternative> {
    let mut alternatives = Vec::new();
    let mut seen_caps: HashSet<String> = HashSet::new();
    let installing: HashSet<String> = actions
        .iter()
        .filter(|a| a.action == TransactionType::Install)
        .map(|a| a.name.clone())
        .collect();

    for action in actions {
        if action.action != TransactionType::Install {
            continue;
        }
        let Some(&step_id) = pool
            .select_name(&action.name, false)
            .iter()
            .find(|&&id| pool.get(id).repo != RepoKind::Installed)
        else {
            continue;
        };
        let step = pool.get(step_id);

        // what this package provides (virtual provides like task-sound)
        for dep in &step.deps.provides {
            let Some(base_cap) = dep_base_name(dep) else { continue };
            if base_cap == action.name || seen_caps.contains(&base_cap) {
                continue;
            }
            // arch-tagged, perl(...), pkgconfig(...) and friends
            if base_cap.contains('(') {
                continue;
            }
            if let Some(alt) =
                alternative_for_cap(pool, &base_cap, &action.name, &installing, explicit)
            {
                seen_caps.insert(base_cap);
                alternatives.push(alt);
            }
        }

        // what this package pulls in (requires then recommends)
        for dep in step.deps.requires.iter().chain(step.deps.recommends.iter()) {
            let Some(base_cap) = dep_base_name(dep) else { continue };
            if base_cap.contains('(') || seen_caps.contains(&base_cap) {
                continue;
            }
            if let Some(alt) =
                alternative_for_cap(pool, &base_cap, &action.name, &installing, explicit)
            {
                seen_caps.insert(base_cap);
                alternatives.push(alt);
            }
        }
    }

    alternatives
}

fn alternative_for_cap(
    pool: &Pool,
    capability: &str,
    required_by: &str,
    installing: &HashSet<String>,
    explicit: &HashSet<String>,
) -> Option<Alternative> {
    let providers = pool.whatprovides(capability, None);

    // satisfied by something already on the system: no choice to make
    if providers
        .iter()
        .any(|&id| pool.get(id).repo == RepoKind::Installed)
    {
        return None;
    }

    let provider_names: BTreeSet<String> = providers
        .iter()
        .filter(|&&id| pool.get(id).repo != RepoKind::Installed)
        .map(|&id| pool.get(id).name().to_string())
        .collect();
    if provider_names.len() < 2 {
        return None;
    }
    if !is_valid_alternative(capability, &provider_names) {
        return None;
    }
    // a provider the user asked for by name settles the choice
    if provider_names
        .iter()
        .any(|p| explicit.contains(&p.to_lowercase()))
    {
        return None;
    }

    let required_by = find_requirer(pool, capability, installing)
        .unwrap_or_else(|| required_by.to_string());
    let names: Vec<String> = provider_names.into_iter().collect();
    Some(Alternative {
        capability: capability.to_string(),
        required_by,
        providers: prioritize_providers(pool, &names, MAX_PROVIDERS),
    })
}

fn find_requirer(pool: &Pool, capability: &str, installing: &HashSet<String>) -> Option<String> {
    let requirers = pool.whatmatchesdep(capability, |s| s.deps.requires.as_slice());
    for id in requirers {
        let name = pool.get(id).name();
        if installing.contains(name) {
            return Some(name.to_string());
        }
    }
    let recommenders = pool.whatmatchesdep(capability, |s| s.deps.recommends.as_slice());
    for id in recommenders {
        let name = pool.get(id).name();
        if installing.contains(name) {
            return Some(name.to_string());
        }
    }
    None
}

/// Bloc detection: group providers by the exact-version requires they
/// share (all php8.4-* require php-common = 3:8.4).
#[derive(Debug, Default, Clone)]
pub struct BlocInfo {
    /// capability -> the distinct versions providers require it at
    pub bloc_defining_caps: BTreeMap<String, Vec<String>>,
    /// bloc key (version) -> capability -> providers
    pub blocs: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    /// provider -> its versioned requires
    pub providers_info: BTreeMap<String, BTreeMap<String, String>>,
}

fn versioned_requires(pool: &Pool, id: SolvableId) -> BTreeMap<String, String> {
    let mut versioned = BTreeMap::new();
    for dep in &pool.get(id).deps.requires {
        let dep_str = match dep {
            Dep::Versioned { name, op, evr } => {
                let op = match op {
                    crate::resolver::pool::RelOp::Lt => "<",
                    crate::resolver::pool::RelOp::Le => "<=",
                    crate::resolver::pool::RelOp::Eq => "=",
                    crate::resolver::pool::RelOp::Ge => ">=",
                    crate::resolver::pool::RelOp::Gt => ">",
                };
                format!("{name} {op} {evr}")
            }
            _ => continue,
        };
        if dep_str.starts_with("lib")
            || dep_str.starts_with("ld-")
            || dep_str.starts_with("config(")
            || dep_str.starts_with('/')
        {
            continue;
        }
        if let Some(m) = VERSIONED_REQ.captures(&dep_str) {
            if let Some(ver) = BLOC_VERSION.captures(&m[3]) {
                versioned.insert(m[1].to_string(), ver[1].to_string());
            }
        }
    }
    versioned
}

pub fn detect_blocs(pool: &Pool, capabilities: &[String]) -> BlocInfo {
    let mut info = BlocInfo::default();

    for cap in capabilities {
        for id in pool.whatprovides(cap, None) {
            let solvable = pool.get(id);
            if solvable.repo == RepoKind::Installed {
                continue;
            }
            info.providers_info
                .entry(solvable.name().to_string())
                .or_insert_with(|| versioned_requires(pool, id));
        }
    }

    let mut cap_versions: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for reqs in info.providers_info.values() {
        for (cap, ver) in reqs {
            cap_versions
                .entry(cap.clone())
                .or_default()
                .insert(ver.clone());
        }
    }
    info.bloc_defining_caps = cap_versions
        .into_iter()
        .filter(|(_, versions)| versions.len() > 1)
        .map(|(cap, versions)| (cap, versions.into_iter().collect()))
        .collect();

    for cap in capabilities {
        for id in pool.whatprovides(cap, None) {
            let solvable = pool.get(id);
            if solvable.repo == RepoKind::Installed {
                continue;
            }
            let name = solvable.name().to_string();
            let Some(reqs) = info.providers_info.get(&name) else {
                continue;
            };
            let bloc_key = info
                .bloc_defining_caps
                .keys()
                .find_map(|bc| reqs.get(bc).cloned());
            if let Some(key) = bloc_key {
                let providers = info
                    .blocs
                    .entry(key)
                    .or_default()
                    .entry(cap.clone())
                    .or_default();
                if !providers.contains(&name) {
                    providers.push(name);
                }
            }
        }
    }

    info
}

/// One round of suggests discovery for the given packages.
///
/// The engine never auto-installs suggests, so they are surfaced here:
/// single providers become suggested actions, multi-provider capabilities
/// become alternatives. Providers requiring a rejected alternative are
/// dropped.
pub fn find_available_suggests(
    pool: &Pool,
    package_names: &[String],
    choices: &HashMap<String, String>,
    resolved_packages: &[String],
) -> (Vec<PackageAction>, Vec<Alternative>) {
    let mut suggests = Vec::new();
    let mut alternatives = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let mut present: HashSet<String> = pool
        .installed()
        .map(|s| s.name().to_lowercase())
        .collect();
    present.extend(resolved_packages.iter().map(|n| n.to_lowercase()));

    // alternatives the user decided against
    let mut rejected: HashSet<String> = HashSet::new();
    for (cap, chosen) in choices {
        if INTERNAL_CAPS.contains(&cap.as_str()) {
            continue;
        }
        for id in pool.whatprovides(cap, None) {
            let name = pool.get(id).name();
            if name != chosen {
                rejected.insert(name.to_lowercase());
            }
        }
    }

    for pkg_name in package_names {
        let Some(&pkg_id) = pool
            .select_name(pkg_name, false)
            .iter()
            .find(|&&id| pool.get(id).repo != RepoKind::Installed)
        else {
            continue;
        };

        for dep in pool.get(pkg_id).deps.suggests.clone() {
            let cap = match &dep {
                Dep::Simple(n) => n.clone(),
                Dep::Versioned { name, .. } => name.clone(),
                Dep::Rich(_) => continue,
            };
            if !seen.insert(cap.clone()) {
                continue;
            }

            let mut valid: Vec<SolvableId> = Vec::new();
            for id in pool.whatprovides_dep(&dep) {
                let solvable = pool.get(id);
                if solvable.repo == RepoKind::Installed {
                    continue;
                }
                if present.contains(&solvable.name().to_lowercase()) {
                    continue;
                }
                if solvable.arch() == "src" || solvable.arch() == "nosrc" {
                    continue;
                }
                if requires_rejected(pool, id, &rejected) {
                    continue;
                }
                valid.push(id);
            }
            if valid.is_empty() {
                continue;
            }

            // one entry per provider name, best version
            let mut by_name: BTreeMap<String, SolvableId> = BTreeMap::new();
            for id in valid {
                by_name.entry(pool.get(id).name().to_string()).or_insert(id);
            }

            let mut providers: Vec<(String, SolvableId)> = by_name.into_iter().collect();
            if let Some(chosen) = choices.get(&cap) {
                if let Some(entry) = providers.iter().find(|(n, _)| n == chosen).cloned() {
                    providers = vec![entry];
                }
            }

            if providers.len() == 1 {
                let (_, id) = &providers[0];
                let solvable = pool.get(*id);
                suggests.push(PackageAction {
                    action: TransactionType::Install,
                    name: solvable.name().to_string(),
                    evr: solvable.evr(),
                    arch: solvable.arch().to_string(),
                    nevra: solvable.nevra().to_string(),
                    size: solvable.record.size,
                    filesize: solvable.record.filesize,
                    media_name: solvable.media_name.clone(),
                    reason: InstallReason::Suggested,
                    from_evr: String::new(),
                });
            } else {
                let names: Vec<String> = providers.into_iter().map(|(n, _)| n).collect();
                alternatives.push(Alternative {
                    capability: cap,
                    required_by: format!("suggested by {pkg_name}"),
                    providers: prioritize_providers(pool, &names, names.len()),
                });
            }
        }
    }

    (suggests, alternatives)
}

fn requires_rejected(pool: &Pool, id: SolvableId, rejected: &HashSet<String>) -> bool {
    if rejected.is_empty() {
        return false;
    }
    for dep in &pool.get(id).deps.requires {
        if dep.is_file() || dep.is_rpmlib() {
            continue;
        }
        let providers = pool.whatprovides_dep(dep);
        if providers.is_empty() {
            continue;
        }
        let names: HashSet<String> = providers
            .iter()
            .map(|&p| pool.get(p).name().to_lowercase())
            .collect();
        if names.iter().all(|n| rejected.contains(n)) {
            return true;
        }
        if rejected.contains(&extract_cap_name(dep.name()).to_lowercase()) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::PackageRecord;

    fn record(name: &str, provides: &[&str], requires: &[&str]) -> PackageRecord {
        PackageRecord {
            name: name.to_string(),
            version: "1.0".to_string(),
            release: "1.mga9".to_string(),
            arch: "x86_64".to_string(),
            nevra: format!("{name}-1.0-1.mga9.x86_64"),
            provides: provides.iter().map(|s| s.to_string()).collect(),
            requires: requires.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_library_package() {
        assert!(is_library_package("lib64png16"));
        assert!(is_library_package("libpng16"));
        assert!(is_library_package("libxslt"));
        assert!(!is_library_package("firefox"));
        assert!(!is_library_package("libreoffice"));
    }

    #[test]
    fn test_is_valid_alternative_version_suffixes() {
        // same functional suffix, only version digits differ: not a choice
        let providers: BTreeSet<String> =
            ["lib64digikamcore7".to_string(), "lib64digikamcore8".to_string()]
                .into_iter()
                .collect();
        assert!(!is_valid_alternative("digikam-core", &providers));

        // distinct functional suffixes are a real choice
        let providers: BTreeSet<String> =
            ["php8.4-cgi".to_string(), "php8.4-cli".to_string()]
                .into_iter()
                .collect();
        assert!(is_valid_alternative("php8.4", &providers));
    }

    #[test]
    fn test_detect_blocs() {
        let mut pool = Pool::new("x86_64", vec!["x86_64".to_string(), "noarch".to_string()]);
        for (name, req) in [
            ("php8.4-filter", "php-common = 3:8.4"),
            ("php8.5-filter", "php-common = 3:8.5"),
            ("php8.4-gd", "php-common = 3:8.4"),
            ("php8.5-gd", "php-common = 3:8.5"),
        ] {
            pool.add_record(
                record(name, &["php-filter", "php-gd"], &[req]),
                RepoKind::Available,
                "Core Release",
                50,
                None,
            );
        }
        pool.create_whatprovides();

        let info = detect_blocs(
            &pool,
            &["php-filter".to_string(), "php-gd".to_string()],
        );
        assert_eq!(
            info.bloc_defining_caps.get("php-common").unwrap(),
            &vec!["3:8.4".to_string(), "3:8.5".to_string()]
        );
        let bloc84 = info.blocs.get("3:8.4").unwrap();
        assert!(bloc84
            .get("php-filter")
            .unwrap()
            .contains(&"php8.4-filter".to_string()));
        assert!(bloc84
            .get("php-gd")
            .unwrap()
            .contains(&"php8.4-gd".to_string()));
    }

    #[test]
    fn test_find_available_suggests_rejects() {
        let mut pool = Pool::new("x86_64", vec!["x86_64".to_string(), "noarch".to_string()]);
        pool.add_record(
            record("phpmyadmin", &[], &[]),
            RepoKind::Available,
            "Core Release",
            50,
            None,
        );
        // inject a suggests edge manually via record
        let mut app = record("phpmyadmin2", &[], &[]);
        app.suggests = vec!["php-bz2".to_string()];
        pool.add_record(app, RepoKind::Available, "Core Release", 50, None);
        pool.add_record(
            record("php8.4-bz2", &["php-bz2"], &["php8.4-cli"]),
            RepoKind::Available,
            "Core Release",
            50,
            None,
        );
        pool.add_record(
            record("php8.4-cli", &[], &[]),
            RepoKind::Available,
            "Core Release",
            50,
            None,
        );
        pool.create_whatprovides();

        // without choices the single provider is suggested
        let (suggests, alternatives) = find_available_suggests(
            &pool,
            &["phpmyadmin2".to_string()],
            &HashMap::new(),
            &[],
        );
        assert_eq!(suggests.len(), 1);
        assert_eq!(suggests[0].name, "php8.4-bz2");
        assert_eq!(suggests[0].reason, InstallReason::Suggested);
        assert!(alternatives.is_empty());

        // choosing another provider for a capability php8.4-cli provides
        // rejects php8.4-cli, which drops the bz2 module too
        let choices: HashMap<String, String> =
            [("php8.4-cli".to_string(), "somethingelse".to_string())]
                .into_iter()
                .collect();
        let (suggests, _) = find_available_suggests(
            &pool,
            &["phpmyadmin2".to_string()],
            &choices,
            &[],
        );
        assert!(suggests.is_empty());
    }
}
