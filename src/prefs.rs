//! User preferences for alternative resolution.
//!
//! A preference expression is a comma-separated list of terms:
//! `php:8.4,nginx` (capability with a major.minor constraint plus a plain
//! pattern), `-apache-mod_php` (disfavor). Terms resolve against the pool
//! and steer provider choices without hard-failing when nothing matches.

use crate::resolver::pool::{Pool, RepoKind};
use globset::GlobBuilder;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

static NAME_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.\d+)").expect("static regex"));

/// Families that exclude each other: preferring one side drops providers
/// of the other from alternative lists.
const FAMILY_CONFLICTS: &[(&str, &[&str])] = &[
    ("nginx", &["apache", "lighttpd"]),
    ("apache", &["nginx", "lighttpd"]),
    ("lighttpd", &["apache", "nginx"]),
    ("fpm", &["cgi", "cli"]),
    ("cgi", &["fpm"]),
    ("qt", &["gtk"]),
    ("gtk", &["qt"]),
];

#[derive(Debug, Default, Clone)]
pub struct Preferences {
    /// capability -> required major.minor version
    pub version_constraints: BTreeMap<String, String>,
    /// plain capability or glob patterns
    pub name_patterns: Vec<String>,
    /// leading-dash terms
    pub negative_patterns: Vec<String>,
    /// packages matched through whatprovides (after resolve_patterns)
    pub resolved_packages: BTreeSet<String>,
    /// packages to explicitly disfavor
    pub disfavored_packages: BTreeSet<String>,
    compatible_providers: BTreeSet<String>,
}

impl Preferences {
    pub fn parse(expr: &str) -> Preferences {
        let mut prefs = Preferences::default();
        for part in expr.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some(negative) = part.strip_prefix('-') {
                prefs.negative_patterns.push(negative.to_lowercase());
            } else if let Some((cap, version)) = part.split_once(':') {
                prefs
                    .version_constraints
                    .insert(cap.to_lowercase(), version.to_lowercase());
            } else {
                prefs.name_patterns.push(part.to_lowercase());
            }
        }
        prefs
    }

    pub fn is_empty(&self) -> bool {
        self.version_constraints.is_empty()
            && self.name_patterns.is_empty()
            && self.negative_patterns.is_empty()
    }

    pub fn has_version_constraints(&self) -> bool {
        !self.version_constraints.is_empty()
    }

    /// All positive patterns, for weak-install qualification.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns = self.name_patterns.clone();
        patterns.extend(self.version_constraints.keys().cloned());
        patterns
    }

    fn candidates(pool: &Pool, cap: &str, version: Option<&str>) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for id in pool.whatprovides(cap, None) {
            let solvable = pool.get(id);
            if solvable.repo == RepoKind::Installed {
                continue;
            }
            let name_lower = solvable.name().to_lowercase();
            match version {
                None => {
                    out.insert(name_lower);
                }
                Some(version) => {
                    // constrain by the version embedded in the provider name
                    if let Some(m) = NAME_VERSION.captures(&name_lower) {
                        if &m[1] == version {
                            out.insert(name_lower);
                        }
                    }
                }
            }
        }
        out
    }

    /// Resolve patterns to package names via whatprovides. Overlapping
    /// candidate sets are intersected (`php:8.4,php-fpm` -> php8.4-fpm),
    /// disjoint sets are kept side by side.
    pub fn resolve_patterns(&mut self, pool: &Pool) {
        let mut candidate_sets: Vec<BTreeSet<String>> = Vec::new();

        for pattern in &self.name_patterns {
            let candidates = Self::candidates(pool, pattern, None);
            if !candidates.is_empty() {
                candidate_sets.push(candidates);
            }
        }
        for (cap, version) in &self.version_constraints {
            let candidates = Self::candidates(pool, cap, Some(version));
            if !candidates.is_empty() {
                candidate_sets.push(candidates);
            }
        }

        let mut result: BTreeSet<String> = BTreeSet::new();
        let mut processed = vec![false; candidate_sets.len()];
        for i in 0..candidate_sets.len() {
            if processed[i] {
                continue;
            }
            let mut group = candidate_sets[i].clone();
            processed[i] = true;
            for (j, other) in candidate_sets.iter().enumerate() {
                if i != j && !processed[j] && !group.is_disjoint(other) {
                    group = group.intersection(other).cloned().collect();
                    processed[j] = true;
                }
            }
            result.extend(group);
        }
        self.resolved_packages = result;

        // negative terms: capability first, then substring/glob over names
        for negative in &self.negative_patterns {
            let candidates = Self::candidates(pool, negative, None);
            if !candidates.is_empty() {
                self.disfavored_packages.extend(candidates);
                continue;
            }
            let glob = GlobBuilder::new(&format!("*{negative}*"))
                .case_insensitive(true)
                .build()
                .ok()
                .map(|g| g.compile_matcher());
            for solvable in &pool.solvables {
                if solvable.repo == RepoKind::Installed {
                    continue;
                }
                let name_lower = solvable.name().to_lowercase();
                let hit = name_lower.contains(negative)
                    || glob.as_ref().map(|g| g.is_match(&name_lower)).unwrap_or(false);
                if hit {
                    self.disfavored_packages.insert(name_lower);
                }
            }
        }

        self.find_compatible_providers(pool);
    }

    /// Packages that require something a resolved package provides and
    /// share a version with it are compatible (php8.4-fpm-apache when
    /// php8.4-fpm was resolved). Alternatives that merely provide the same
    /// capabilities are not.
    fn find_compatible_providers(&mut self, pool: &Pool) {
        if self.resolved_packages.is_empty() {
            return;
        }

        let preferred_versions: HashSet<String> = self
            .resolved_packages
            .iter()
            .filter_map(|name| NAME_VERSION.captures(name).map(|m| m[1].to_string()))
            .collect();

        let mut provided_caps: HashSet<String> = HashSet::new();
        for name in &self.resolved_packages {
            for &id in pool.by_name(name) {
                let solvable = pool.get(id);
                if solvable.repo == RepoKind::Installed {
                    continue;
                }
                for dep in &solvable.deps.provides {
                    let cap = dep.name();
                    if cap.is_empty() || cap.starts_with('/') || cap.starts_with("lib") {
                        continue;
                    }
                    provided_caps.insert(cap.to_string());
                }
            }
        }

        for solvable in &pool.solvables {
            if solvable.repo == RepoKind::Installed {
                continue;
            }
            let name_lower = solvable.name().to_lowercase();
            if self.resolved_packages.contains(&name_lower) {
                continue;
            }
            if !preferred_versions.is_empty() {
                if let Some(m) = NAME_VERSION.captures(&name_lower) {
                    if !preferred_versions.contains(&m[1]) {
                        continue;
                    }
                }
            }

            let requires: HashSet<&str> =
                solvable.deps.requires.iter().map(|d| d.name()).collect();
            let provides: HashSet<&str> = solvable
                .deps
                .provides
                .iter()
                .map(|d| d.name())
                .filter(|c| !c.is_empty() && !c.starts_with('/') && !c.starts_with("lib"))
                .collect();

            let requires_preferred = requires
                .iter()
                .any(|cap| provided_caps.contains(&cap.to_string()));
            let is_alternative = provides
                .iter()
                .any(|cap| provided_caps.contains(&cap.to_string()))
                && !requires_preferred;

            if requires_preferred && !is_alternative {
                self.compatible_providers.insert(name_lower);
            }
        }
    }

    /// Whether a provider name matches the preferences, directly or as a
    /// compatible provider.
    pub fn match_provider_name(&self, provider: &str) -> bool {
        let name_lower = provider.to_lowercase();
        self.resolved_packages.contains(&name_lower)
            || self.compatible_providers.contains(&name_lower)
    }

    /// Whether a bloc (by its version key) matches the explicit constraints
    /// or the versions embedded in resolved package names.
    pub fn match_bloc_version(
        &self,
        bloc_defining_caps: &BTreeMap<String, Vec<String>>,
        bloc_key: &str,
    ) -> bool {
        let bloc_version = bloc_key.rsplit(':').next().unwrap_or(bloc_key);

        for (cap, version) in &self.version_constraints {
            for bloc_cap in bloc_defining_caps.keys() {
                let bloc_cap_lower = bloc_cap.to_lowercase();
                if bloc_cap_lower.contains(cap) || cap.contains(&bloc_cap_lower) {
                    if version.contains(bloc_version) || bloc_version.contains(version.as_str()) {
                        return true;
                    }
                }
            }
        }

        for name in &self.resolved_packages {
            if let Some(m) = NAME_VERSION.captures(name) {
                let pkg_version = &m[1];
                if bloc_version.contains(pkg_version) || bloc_version.ends_with(pkg_version) {
                    return true;
                }
            }
        }
        false
    }

    /// Filter and sort a provider list: drop providers from conflicting
    /// families, put preference matches first, never return empty.
    pub fn filter_providers(&self, providers: &[String]) -> Vec<String> {
        if self.name_patterns.is_empty() {
            return providers.to_vec();
        }

        let mut exclude: BTreeSet<&str> = BTreeSet::new();
        let mut prefer: Vec<String> = Vec::new();
        for pattern in &self.name_patterns {
            let cleaned = pattern.replace(['*', '?'], "");
            if let Some((_, conflicts)) = FAMILY_CONFLICTS.iter().find(|(k, _)| *k == cleaned) {
                exclude.extend(conflicts.iter());
            }
            prefer.push(cleaned);
        }

        let filtered: Vec<String> = providers
            .iter()
            .filter(|p| {
                let p_lower = p.to_lowercase();
                !exclude.iter().any(|e| p_lower.contains(e))
            })
            .cloned()
            .collect();
        let result = if filtered.is_empty() {
            providers.to_vec()
        } else {
            filtered
        };

        let mut indexed: Vec<(usize, usize, String)> = result
            .into_iter()
            .enumerate()
            .map(|(original, p)| {
                let p_lower = p.to_lowercase();
                let rank = prefer
                    .iter()
                    .position(|pref| p_lower.contains(pref))
                    .map(|i| (0, i))
                    .unwrap_or((1, 0));
                (rank.0 * 1000 + rank.1, original, p)
            })
            .collect();
        indexed.sort();
        indexed.into_iter().map(|(_, _, p)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::pool::RepoKind;
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

    fn php_pool() -> Pool {
        let mut pool = Pool::new("x86_64", vec!["x86_64".to_string(), "noarch".to_string()]);
        for (name, provides, requires) in [
            ("php8.4-fpm", vec!["php-fpm", "php"], vec!["php-common"]),
            ("php8.5-fpm", vec!["php-fpm", "php"], vec!["php-common"]),
            ("php8.4-cli", vec!["php-cli", "php"], vec!["php-common"]),
            (
                "php8.4-fpm-apache",
                vec!["php-fpm-config"],
                vec!["php-fpm"],
            ),
            ("nginx", vec!["webserver"], vec![]),
            ("apache", vec!["webserver"], vec![]),
        ] {
            let provides: Vec<&str> = provides;
            let requires: Vec<&str> = requires;
            pool.add_record(
                record(name, &provides, &requires),
                RepoKind::Available,
                "Core Release",
                50,
                None,
            );
        }
        pool.create_whatprovides();
        pool
    }

    #[test]
    fn test_parse_terms() {
        let prefs = Preferences::parse("php:8.4,nginx,-apache-mod_php");
        assert_eq!(
            prefs.version_constraints.get("php").map(String::as_str),
            Some("8.4")
        );
        assert_eq!(prefs.name_patterns, vec!["nginx"]);
        assert_eq!(prefs.negative_patterns, vec!["apache-mod_php"]);
    }

    #[test]
    fn test_resolve_patterns_version_filter() {
        let pool = php_pool();
        let mut prefs = Preferences::parse("php:8.4");
        prefs.resolve_patterns(&pool);
        assert!(prefs.resolved_packages.contains("php8.4-fpm"));
        assert!(prefs.resolved_packages.contains("php8.4-cli"));
        assert!(!prefs.resolved_packages.contains("php8.5-fpm"));
    }

    #[test]
    fn test_resolve_patterns_intersection() {
        // php:8.4 + php-fpm overlap: only the 8.4 fpm provider remains
        let pool = php_pool();
        let mut prefs = Preferences::parse("php:8.4,php-fpm");
        prefs.resolve_patterns(&pool);
        assert!(prefs.resolved_packages.contains("php8.4-fpm"));
        assert!(!prefs.resolved_packages.contains("php8.4-cli"));
        assert!(!prefs.resolved_packages.contains("php8.5-fpm"));
    }

    #[test]
    fn test_compatible_providers() {
        let pool = php_pool();
        let mut prefs = Preferences::parse("php:8.4,php-fpm");
        prefs.resolve_patterns(&pool);
        // requires php-fpm and carries the 8.4 version: compatible
        assert!(prefs.match_provider_name("php8.4-fpm-apache"));
        // an alternative provider of php-fpm is not
        assert!(!prefs.match_provider_name("php8.5-fpm"));
    }

    #[test]
    fn test_negative_patterns_capability() {
        // a term naming an existing capability disfavors its providers
        let pool = php_pool();
        let mut prefs = Preferences::parse("-webserver");
        prefs.resolve_patterns(&pool);
        assert!(prefs.disfavored_packages.contains("apache"));
        assert!(prefs.disfavored_packages.contains("nginx"));
    }

    #[test]
    fn test_negative_patterns_substring() {
        // no capability of that name: falls back to name matching
        let pool = php_pool();
        let mut prefs = Preferences::parse("-fpm-apache");
        prefs.resolve_patterns(&pool);
        assert!(prefs.disfavored_packages.contains("php8.4-fpm-apache"));
        assert!(!prefs.disfavored_packages.contains("nginx"));
    }

    #[test]
    fn test_filter_providers_family_conflict() {
        let prefs = Preferences::parse("nginx");
        let providers = vec![
            "apache-mod_php".to_string(),
            "php-fpm-nginx".to_string(),
            "lighttpd-php".to_string(),
        ];
        let filtered = prefs.filter_providers(&providers);
        assert_eq!(filtered, vec!["php-fpm-nginx"]);
    }

    #[test]
    fn test_filter_providers_never_empty() {
        let prefs = Preferences::parse("nginx");
        let providers = vec!["apache-mod_php".to_string()];
        let filtered = prefs.filter_providers(&providers);
        assert_eq!(filtered, providers);
    }

    #[test]
    fn test_filter_providers_preference_first() {
        let prefs = Preferences::parse("qt");
        let providers = vec![
            "player-cli".to_string(),
            "player-qt".to_string(),
        ];
        let filtered = prefs.filter_providers(&providers);
        assert_eq!(filtered[0], "player-qt");
    }

    #[test]
    fn test_match_bloc_version() {
        let pool = php_pool();
        let mut prefs = Preferences::parse("php:8.4");
        prefs.resolve_patterns(&pool);

        let mut defining = BTreeMap::new();
        defining.insert(
            "php-common".to_string(),
            vec!["3:8.4".to_string(), "3:8.5".to_string()],
        );
        assert!(prefs.match_bloc_version(&defining, "3:8.4"));
        assert!(!prefs.match_bloc_version(&defining, "3:8.5"));
    }
}
