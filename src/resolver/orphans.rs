//! Orphan detection: packages pulled in as dependencies that nothing
//! remaining needs once a removal or upgrade goes through.

use crate::errors::*;
use crate::resolver::pool::extract_cap_name;
use crate::resolver::{InstallReason, PackageAction, TransactionType};
use crate::synthesis::PackageRecord;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// `<root>/var/lib/rpm/installed-through-deps.list`
pub fn deps_list_path(root: Option<&Path>) -> PathBuf {
    let root = root.unwrap_or_else(|| Path::new("/"));
    root.join("var/lib/rpm/installed-through-deps.list")
}

/// Read the auto-installed set. The file may have drifted under manual
/// edits; unknown shapes are skipped, never fatal.
pub fn read_unrequested(root: Option<&Path>) -> HashSet<String> {
    let mut unrequested = HashSet::new();
    let Ok(content) = std::fs::read_to_string(deps_list_path(root)) else {
        return unrequested;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.split_whitespace().next() {
            unrequested.insert(name.to_lowercase());
        }
    }
    unrequested
}

/// Rewrite the auto-installed list atomically (write + rename), sorted,
/// one name per line.
pub fn write_unrequested(root: Option<&Path>, packages: &HashSet<String>) -> Result<()> {
    let path = deps_list_path(root);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let sorted: BTreeSet<&String> = packages.iter().collect();
    let mut content = String::new();
    for name in sorted {
        content.push_str(name);
        content.push('\n');
    }
    let tmp = path.with_extension("list.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

pub fn mark_as_dependency(root: Option<&Path>, names: &[String]) -> Result<()> {
    let mut unrequested = read_unrequested(root);
    unrequested.extend(names.iter().map(|n| n.to_lowercase()));
    write_unrequested(root, &unrequested)
}

pub fn mark_as_explicit(root: Option<&Path>, names: &[String]) -> Result<()> {
    let mut unrequested = read_unrequested(root);
    for name in names {
        unrequested.remove(&name.to_lowercase());
    }
    write_unrequested(root, &unrequested)
}

fn removal_action(record: &PackageRecord) -> PackageAction {
    PackageAction {
        action: TransactionType::Remove,
        name: record.name.clone(),
        evr: record.evr(),
        arch: record.arch.clone(),
        nevra: record.nevra.clone(),
        size: record.size,
        filesize: record.filesize,
        media_name: "@System".to_string(),
        reason: InstallReason::Dependency,
        from_evr: String::new(),
    }
}

struct InstalledMaps<'a> {
    records: HashMap<String, &'a PackageRecord>,
    cap_provided_by: HashMap<String, BTreeSet<String>>,
    requires: HashMap<String, BTreeSet<String>>,
    recommends: HashMap<String, BTreeSet<String>>,
    suggests: HashMap<String, BTreeSet<String>>,
}

fn build_maps(installed: &[PackageRecord]) -> InstalledMaps<'_> {
    let mut maps = InstalledMaps {
        records: HashMap::new(),
        cap_provided_by: HashMap::new(),
        requires: HashMap::new(),
        recommends: HashMap::new(),
        suggests: HashMap::new(),
    };

    let clean = |caps: &[String]| -> BTreeSet<String> {
        caps.iter()
            .filter(|c| !c.starts_with("rpmlib(") && !c.starts_with('/'))
            .map(|c| extract_cap_name(c).to_string())
            .collect()
    };

    for record in installed {
        if record.name == "gpg-pubkey" {
            continue;
        }
        maps.records.insert(record.name.clone(), record);
        for cap in &record.provides {
            maps.cap_provided_by
                .entry(extract_cap_name(cap).to_string())
                .or_default()
                .insert(record.name.clone());
        }
        // the package name itself is always provided
        maps.cap_provided_by
            .entry(record.name.clone())
            .or_default()
            .insert(record.name.clone());
        maps.requires.insert(record.name.clone(), clean(&record.requires));
        maps.recommends
            .insert(record.name.clone(), clean(&record.recommends));
        maps.suggests.insert(record.name.clone(), clean(&record.suggests));
    }
    maps
}

/// Orphans created by erasing `erase_names`.
///
/// 1. Build the forward closure of the erase set over requires ∪ recommends.
/// 2. Candidates are closure members that are auto-installed.
/// 3. Shrink to a fixed point: a candidate survives (is kept) when it is
///    the only remaining provider of a capability some surviving package
///    still needs.
pub fn find_erase_orphans(
    installed: &[PackageRecord],
    erase_names: &[String],
    unrequested: &HashSet<String>,
    erase_recommends: bool,
    keep_suggests: bool,
) -> Vec<PackageAction> {
    let maps = build_maps(installed);

    let erase_set: BTreeSet<String> = erase_names
        .iter()
        .filter_map(|n| maps.records.keys().find(|k| k.eq_ignore_ascii_case(n)))
        .cloned()
        .collect();
    if erase_set.is_empty() {
        return Vec::new();
    }

    // capability -> packages that need it, honoring the weak-dep options
    let mut cap_needed_by: HashMap<&String, Vec<&String>> = HashMap::new();
    for (name, reqs) in &maps.requires {
        for cap in reqs {
            cap_needed_by.entry(cap).or_default().push(name);
        }
    }
    if !erase_recommends {
        for (name, recs) in &maps.recommends {
            for cap in recs {
                cap_needed_by.entry(cap).or_default().push(name);
            }
        }
    }
    if keep_suggests {
        for (name, sugs) in &maps.suggests {
            for cap in sugs {
                cap_needed_by.entry(cap).or_default().push(name);
            }
        }
    }

    // forward closure over requires ∪ recommends (suggests are not
    // installed by default, so they are not walked)
    let mut dep_tree: BTreeSet<String> = erase_set.clone();
    let mut to_process: Vec<String> = erase_set.iter().cloned().collect();
    while let Some(pkg) = to_process.pop() {
        let mut deps: BTreeSet<&String> = BTreeSet::new();
        for cap in maps
            .requires
            .get(&pkg)
            .into_iter()
            .chain(maps.recommends.get(&pkg))
            .flatten()
        {
            if let Some(providers) = maps.cap_provided_by.get(cap) {
                if let Some(provider) = providers.iter().next() {
                    if provider != &pkg {
                        deps.insert(provider);
                    }
                }
            }
        }
        for dep in deps {
            if !dep_tree.contains(dep) {
                dep_tree.insert(dep.clone());
                to_process.push(dep.clone());
            }
        }
    }

    // candidates: closure members that are auto-installed, plus the
    // explicit erase set
    let mut candidates: BTreeSet<String> = erase_set.clone();
    for pkg in &dep_tree {
        if unrequested.contains(&pkg.to_lowercase()) {
            candidates.insert(pkg.clone());
        }
    }

    // fixed-point shrink
    let empty = BTreeSet::new();
    loop {
        let mut kept = None;
        'candidates: for pkg in &candidates {
            if erase_set.contains(pkg) {
                continue;
            }
            let provides = maps
                .records
                .get(pkg)
                .map(|r| {
                    let mut caps: BTreeSet<String> = r
                        .provides
                        .iter()
                        .map(|c| extract_cap_name(c).to_string())
                        .collect();
                    caps.insert(pkg.clone());
                    caps
                })
                .unwrap_or_default();
            for cap in &provides {
                for &dependent in cap_needed_by.get(cap).map(Vec::as_slice).unwrap_or(&[]) {
                    if dependent == pkg || candidates.contains(dependent) {
                        continue;
                    }
                    // dependent survives and needs this capability; does
                    // any other surviving package provide it?
                    let others = maps
                        .cap_provided_by
                        .get(cap)
                        .unwrap_or(&empty)
                        .iter()
                        .any(|p| p != pkg && !candidates.contains(p));
                    if !others {
                        kept = Some(pkg.clone());
                        break 'candidates;
                    }
                }
            }
        }
        match kept {
            Some(pkg) => {
                candidates.remove(&pkg);
            }
            None => break,
        }
    }

    candidates
        .into_iter()
        .filter(|name| !erase_set.contains(name))
        .filter_map(|name| maps.records.get(&name).map(|r| removal_action(r)))
        .collect()
}

/// Orphans created by an upgrade: capabilities the old versions required
/// but the new ones no longer do, whose auto-installed providers lose
/// their last requirer.
pub fn find_upgrade_orphans(
    installed: &[PackageRecord],
    upgrades: &[(String, Vec<String>)],
    unrequested: &HashSet<String>,
) -> Vec<PackageAction> {
    if unrequested.is_empty() {
        return Vec::new();
    }
    let maps = build_maps(installed);

    let upgraded_names: HashSet<&String> = upgrades.iter().map(|(name, _)| name).collect();

    let mut old_requires: BTreeSet<String> = BTreeSet::new();
    let mut new_requires: BTreeSet<String> = BTreeSet::new();
    for (name, new_reqs) in upgrades {
        if let Some(reqs) = maps.requires.get(name) {
            old_requires.extend(reqs.iter().cloned());
        }
        new_requires.extend(
            new_reqs
                .iter()
                .filter(|c| !c.starts_with("rpmlib(") && !c.starts_with('/'))
                .map(|c| extract_cap_name(c).to_string()),
        );
    }
    let lost: BTreeSet<_> = old_requires.difference(&new_requires).collect();
    if lost.is_empty() {
        return Vec::new();
    }

    // requires as they will look after the upgrade
    let mut post_requires: HashMap<&String, BTreeSet<String>> = HashMap::new();
    for (name, reqs) in &maps.requires {
        post_requires.insert(name, reqs.clone());
    }
    for (name, new_reqs) in upgrades {
        if let Some((key, _)) = maps.requires.get_key_value(name) {
            post_requires.insert(
                key,
                new_reqs
                    .iter()
                    .filter(|c| !c.starts_with("rpmlib(") && !c.starts_with('/'))
                    .map(|c| extract_cap_name(c).to_string())
                    .collect(),
            );
        }
    }

    let mut orphans = Vec::new();
    for (name, record) in &maps.records {
        if !unrequested.contains(&name.to_lowercase()) || upgraded_names.contains(name) {
            continue;
        }
        let mut provides: BTreeSet<String> = record
            .provides
            .iter()
            .map(|c| extract_cap_name(c).to_string())
            .collect();
        provides.insert(name.clone());

        if !provides.iter().any(|p| lost.contains(p)) {
            continue;
        }
        let still_required = post_requires.iter().any(|(other, reqs)| {
            *other != name && provides.iter().any(|p| reqs.contains(p))
        });
        if !still_required {
            orphans.push(removal_action(record));
        }
    }
    orphans.sort_by(|a, b| a.name.cmp(&b.name));
    orphans
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn names(actions: &[PackageAction]) -> Vec<String> {
        let mut names: Vec<String> = actions.iter().map(|a| a.name.clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_erase_orphan_basic() {
        // firefox requires libgtk3 which is auto-installed and otherwise
        // unused: erasing firefox orphans libgtk3
        let installed = vec![
            record("firefox", &["webclient"], &["libgtk3", "glibc"]),
            record("libgtk3", &["libgtk3"], &["glibc"]),
            record("glibc", &["libc.so.6()(64bit)"], &[]),
            record("vim", &[], &["glibc"]),
        ];
        let unrequested: HashSet<String> =
            ["libgtk3".to_string(), "glibc".to_string()].into_iter().collect();

        let orphans = find_erase_orphans(
            &installed,
            &["firefox".to_string()],
            &unrequested,
            false,
            false,
        );
        // glibc is still needed by vim, libgtk3 is not
        assert_eq!(names(&orphans), vec!["libgtk3"]);
    }

    #[test]
    fn test_erase_orphan_kept_by_survivor() {
        let installed = vec![
            record("firefox", &[], &["libgtk3"]),
            record("gimp", &[], &["libgtk3"]),
            record("libgtk3", &[], &[]),
        ];
        let unrequested: HashSet<String> = ["libgtk3".to_string()].into_iter().collect();

        let orphans = find_erase_orphans(
            &installed,
            &["firefox".to_string()],
            &unrequested,
            false,
            false,
        );
        assert!(orphans.is_empty());
    }

    #[test]
    fn test_erase_orphan_idempotent() {
        let installed = vec![
            record("firefox", &[], &["libgtk3"]),
            record("libgtk3", &[], &[]),
        ];
        let unrequested: HashSet<String> = ["libgtk3".to_string()].into_iter().collect();

        let first = find_erase_orphans(
            &installed,
            &["firefox".to_string()],
            &unrequested,
            false,
            false,
        );
        assert_eq!(names(&first), vec!["libgtk3"]);

        // after erasing firefox and libgtk3, a second pass finds nothing
        let remaining: Vec<PackageRecord> = installed
            .into_iter()
            .filter(|r| r.name != "firefox" && r.name != "libgtk3")
            .collect();
        let second = find_erase_orphans(
            &remaining,
            &[],
            &unrequested,
            false,
            false,
        );
        assert!(second.is_empty());
    }

    #[test]
    fn test_erase_recommends_blocks_removal() {
        let unrequested: HashSet<String> = ["codec".to_string()].into_iter().collect();

        // survivor recommending the candidate keeps it by default
        let survivors = vec![
            {
                let mut r = record("desktop", &[], &[]);
                r.recommends = vec!["codec".to_string()];
                r
            },
            record("codec", &[], &[]),
            record("player", &[], &["codec"]),
        ];
        let orphans = find_erase_orphans(
            &survivors,
            &["player".to_string()],
            &unrequested,
            false,
            false,
        );
        assert!(orphans.is_empty());

        // with erase_recommends the recommend no longer blocks
        let orphans = find_erase_orphans(
            &survivors,
            &["player".to_string()],
            &unrequested,
            true,
            false,
        );
        assert_eq!(names(&orphans), vec!["codec"]);
    }

    #[test]
    fn test_upgrade_orphans_lost_capability() {
        let installed = vec![
            record("app", &[], &["oldlib"]),
            record("oldlib", &[], &[]),
            record("glibc", &[], &[]),
        ];
        let unrequested: HashSet<String> = ["oldlib".to_string()].into_iter().collect();

        // app 2.0 dropped its oldlib dependency
        let upgrades = vec![("app".to_string(), vec!["glibc".to_string()])];
        let orphans = find_upgrade_orphans(&installed, &upgrades, &unrequested);
        assert_eq!(names(&orphans), vec!["oldlib"]);

        // nothing lost, nothing proposed
        let upgrades = vec![("app".to_string(), vec!["oldlib".to_string()])];
        let orphans = find_upgrade_orphans(&installed, &upgrades, &unrequested);
        assert!(orphans.is_empty());
    }

    #[test]
    fn test_deps_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let root = Some(dir.path());

        assert!(read_unrequested(root).is_empty());
        mark_as_dependency(
            root,
            &["libgtk3".to_string(), "LibFoo".to_string()],
        )
        .unwrap();
        let set = read_unrequested(root);
        assert!(set.contains("libgtk3"));
        assert!(set.contains("libfoo"));

        mark_as_explicit(root, &["libgtk3".to_string()]).unwrap();
        let set = read_unrequested(root);
        assert!(!set.contains("libgtk3"));
        assert!(set.contains("libfoo"));

        // sorted, one per line
        let content =
            std::fs::read_to_string(deps_list_path(root)).unwrap();
        assert_eq!(content, "libfoo\n");
    }

    #[test]
    fn test_drift_tolerant_read() {
        let dir = tempfile::tempdir().unwrap();
        let root = Some(dir.path());
        let path = deps_list_path(root);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "# manual note\nlibgtk3\t(pulled by firefox)\n\nweird entry with spaces\n",
        )
        .unwrap();
        let set = read_unrequested(root);
        assert!(set.contains("libgtk3"));
        assert!(set.contains("weird"));
        assert!(!set.contains("# manual note"));
    }
}
