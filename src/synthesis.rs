use serde::{Deserialize, Serialize};
use std::str::Lines;

/// One binary package as described by a metadata source (synthesis, hdlist,
/// the installed rpmdb or a local .rpm file).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub epoch: i64,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub nevra: String,
    pub summary: String,
    pub description: String,
    pub size: i64,
    pub filesize: i64,
    pub group: String,
    pub url: String,
    pub license: String,
    pub provides: Vec<String>,
    pub requires: Vec<String>,
    pub conflicts: Vec<String>,
    pub obsoletes: Vec<String>,
    pub recommends: Vec<String>,
    pub suggests: Vec<String>,
    pub supplements: Vec<String>,
    pub enhances: Vec<String>,
}

impl PackageRecord {
    /// `epoch:version-release`, epoch omitted when zero.
    pub fn evr(&self) -> String {
        if self.epoch > 0 {
            format!("{}:{}-{}", self.epoch, self.version, self.release)
        } else {
            format!("{}-{}", self.version, self.release)
        }
    }
}

/// Split a NEVRA-shaped token into (name, version, release, arch).
///
/// The arch is everything after the last dot; name may itself contain dashes
/// so version and release are taken from the right.
pub fn parse_nevra(nevra: &str) -> (String, String, String, String) {
    let (name_ver_rel, arch) = match nevra.rsplit_once('.') {
        Some((nvr, arch)) => (nvr, arch),
        None => (nevra, "noarch"),
    };

    let mut parts = name_ver_rel.rsplitn(3, '-');
    let release = parts.next().unwrap_or("");
    let version = parts.next();
    let name = parts.next();

    match (name, version) {
        (Some(name), Some(version)) => (
            name.to_string(),
            version.to_string(),
            release.to_string(),
            arch.to_string(),
        ),
        (None, Some(version)) => (
            version.to_string(),
            release.to_string(),
            String::new(),
            arch.to_string(),
        ),
        _ => (
            name_ver_rel.to_string(),
            String::new(),
            String::new(),
            arch.to_string(),
        ),
    }
}

/// Split a synthesis line on `@`, but never inside parentheses.
///
/// Rich boolean provides carry literal `@` in npm scopes, e.g.
/// `bundled(npm(@xterm/addon-canvas))`.
pub fn split_on_at(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;

    for ch in line.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            '@' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Streaming parser over a decompressed synthesis text.
///
/// Tag lines accumulate until an `@info@` line closes the package; the
/// iterator yields one record per `@info@` and never buffers the file.
pub struct SynthesisParser<'a> {
    lines: Lines<'a>,
    tags: PackageRecord,
}

pub fn parse_synthesis(content: &str) -> SynthesisParser<'_> {
    SynthesisParser {
        lines: content.lines(),
        tags: PackageRecord::default(),
    }
}

impl SynthesisParser<'_> {
    fn finish_package(&mut self, parts: &[String]) -> PackageRecord {
        let nevra = parts.get(2).map(String::as_str).unwrap_or("");
        let (name, version, release, arch) = parse_nevra(nevra);

        let mut pkg = std::mem::take(&mut self.tags);
        pkg.name = name;
        pkg.version = version;
        pkg.release = release;
        pkg.arch = arch;
        pkg.nevra = nevra.to_string();
        pkg.epoch = parts
            .get(3)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        pkg.size = parts
            .get(4)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        pkg.group = parts.get(5).cloned().unwrap_or_default();
        pkg
    }
}

impl Iterator for SynthesisParser<'_> {
    type Item = PackageRecord;

    fn next(&mut self) -> Option<PackageRecord> {
        loop {
            let line = self.lines.next()?.trim();
            if !line.starts_with('@') {
                continue;
            }

            let parts = split_on_at(line);
            if parts.len() < 2 {
                continue;
            }

            let fields = || parts[2..].to_vec();
            match parts[1].as_str() {
                "info" => return Some(self.finish_package(&parts)),
                "summary" => self.tags.summary = parts.get(2).cloned().unwrap_or_default(),
                "provides" => self.tags.provides = fields(),
                "requires" => self.tags.requires = fields(),
                "conflicts" => self.tags.conflicts = fields(),
                "obsoletes" => self.tags.obsoletes = fields(),
                "recommends" => self.tags.recommends = fields(),
                "suggests" => self.tags.suggests = fields(),
                "supplements" => self.tags.supplements = fields(),
                "enhances" => self.tags.enhances = fields(),
                "filesize" => {
                    self.tags.filesize = parts
                        .get(2)
                        .and_then(|s| s.parse().ok())
                        .unwrap_or_default()
                }
                _ => (),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub const SYNTHESIS_FIXTURE: &str = "\
@summary@Vi IMproved@
@provides@vim[== 9.0-1.mga9]@vim-enhanced
@requires@glibc[>= 2.38]@libncurses.so.6()(64bit)
@filesize@3200000
@info@vim-9.0-1.mga9.x86_64@0@9000000@Editors
@summary@Mozilla Firefox web browser
@provides@firefox[== 120.0-1.mga9]@webclient
@requires@glibc[>= 2.38]@libgtk3
@recommends@firefox-fr
@suggests@hunspell-en
@filesize@60000000
@info@firefox-120.0-1.mga9.x86_64@0@250000000@Networking/WWW
@summary@The GNU libc libraries
@provides@glibc[== 2.38-1.mga9]@libc.so.6()(64bit)
@filesize@5000000
@info@glibc-2.38-1.mga9.x86_64@0@15000000@System/Libraries
";

    #[test]
    fn test_parse_nevra() {
        assert_eq!(
            parse_nevra("firefox-120.0-1.mga9.x86_64"),
            (
                "firefox".to_string(),
                "120.0".to_string(),
                "1.mga9".to_string(),
                "x86_64".to_string()
            )
        );
        assert_eq!(
            parse_nevra("perl-File-Copy-2.0-3.mga9.noarch"),
            (
                "perl-File-Copy".to_string(),
                "2.0".to_string(),
                "3.mga9".to_string(),
                "noarch".to_string()
            )
        );
    }

    #[test]
    fn test_split_on_at_plain() {
        let parts = split_on_at("@info@vim-9.0-1.mga9.x86_64@0@9000000@Editors");
        assert_eq!(
            parts,
            vec![
                "",
                "info",
                "vim-9.0-1.mga9.x86_64",
                "0",
                "9000000",
                "Editors"
            ]
        );
    }

    #[test]
    fn test_split_on_at_nested_parens() {
        let parts = split_on_at("@provides@bundled(npm(@xterm/addon-canvas))@foo");
        assert_eq!(
            parts,
            vec!["", "provides", "bundled(npm(@xterm/addon-canvas))", "foo"]
        );
    }

    #[test]
    fn test_split_on_at_rich_boolean() {
        let parts = split_on_at("@requires@(pkgA or pkgB)@other");
        assert_eq!(parts, vec!["", "requires", "(pkgA or pkgB)", "other"]);
    }

    #[test]
    fn test_parse_synthesis_counts() {
        let packages: Vec<_> = parse_synthesis(SYNTHESIS_FIXTURE).collect();
        assert_eq!(packages.len(), 3);

        let vim = &packages[0];
        assert_eq!(vim.name, "vim");
        assert_eq!(vim.nevra, "vim-9.0-1.mga9.x86_64");
        assert_eq!(vim.arch, "x86_64");
        assert_eq!(vim.size, 9000000);
        assert_eq!(vim.filesize, 3200000);
        assert_eq!(vim.group, "Editors");
        assert_eq!(vim.summary, "Vi IMproved");
        assert_eq!(vim.provides, vec!["vim[== 9.0-1.mga9]", "vim-enhanced"]);

        let firefox = &packages[1];
        assert_eq!(firefox.requires, vec!["glibc[>= 2.38]", "libgtk3"]);
        assert_eq!(firefox.recommends, vec!["firefox-fr"]);
        assert_eq!(firefox.suggests, vec!["hunspell-en"]);
    }

    #[test]
    fn test_tags_reset_between_packages() {
        let packages: Vec<_> = parse_synthesis(SYNTHESIS_FIXTURE).collect();
        // glibc has no requires of its own, nothing may leak from firefox
        assert!(packages[2].requires.is_empty());
        assert!(packages[2].recommends.is_empty());
    }

    #[test]
    fn test_evr_formatting() {
        let mut pkg = PackageRecord {
            version: "8.4".to_string(),
            release: "1.mga9".to_string(),
            ..Default::default()
        };
        assert_eq!(pkg.evr(), "8.4-1.mga9");
        pkg.epoch = 3;
        assert_eq!(pkg.evr(), "3:8.4-1.mga9");
    }
}
