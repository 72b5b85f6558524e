use crate::errors::*;
use crate::synthesis::PackageRecord;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Query format emitting the same tagged-line shape the synthesis parser
/// works with: one @info line per package, then one line per dependency.
const QUERY_FORMAT: &str = "@info\t%{NAME}\t%{EPOCHNUM}\t%{VERSION}\t%{RELEASE}\t%{ARCH}\t%{SIZE}\n\
[@provides\t%{PROVIDENEVRS}\n]\
[@requires\t%{REQUIRENEVRS}\n]\
[@conflicts\t%{CONFLICTNEVRS}\n]\
[@obsoletes\t%{OBSOLETENEVRS}\n]\
[@recommends\t%{RECOMMENDNEVRS}\n]\
[@suggests\t%{SUGGESTNEVRS}\n]";

/// Load the installed package set by walking the RPM database.
///
/// The native rpmdb readers do not honor a root-dir override, so both the
/// live system and chroot cases go through `rpm -qa` against the requested
/// root.
pub async fn load_installed(root: Option<&Path>) -> Result<Vec<PackageRecord>> {
    let mut cmd = Command::new("rpm");
    if let Some(root) = root {
        cmd.arg("--root").arg(root);
    }
    cmd.arg("-qa")
        .arg("--queryformat")
        .arg(QUERY_FORMAT)
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(Error::ChildExit(output.status));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let records = parse_query_output(&text);
    debug!("Loaded {} installed packages from rpmdb", records.len());
    Ok(records)
}

pub fn parse_query_output(text: &str) -> Vec<PackageRecord> {
    let mut records: Vec<PackageRecord> = Vec::new();

    for line in text.lines() {
        let mut fields = line.split('\t');
        let Some(tag) = fields.next() else { continue };

        if tag == "@info" {
            let name = fields.next().unwrap_or_default().to_string();
            let epoch = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let version = fields.next().unwrap_or_default().to_string();
            let release = fields.next().unwrap_or_default().to_string();
            let arch = match fields.next() {
                Some("(none)") | Some("") | None => "noarch".to_string(),
                Some(arch) => arch.to_string(),
            };
            let size = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);

            // gpg-pubkey pseudo-packages are not part of the installed set
            if name == "gpg-pubkey" {
                continue;
            }

            let evr = if epoch > 0 {
                format!("{epoch}:{version}-{release}")
            } else {
                format!("{version}-{release}")
            };
            records.push(PackageRecord {
                nevra: format!("{name}-{evr}.{arch}"),
                name,
                epoch,
                version,
                release,
                arch,
                size,
                ..Default::default()
            });
        } else if let Some(pkg) = records.last_mut() {
            let Some(cap) = fields.next() else { continue };
            if cap.is_empty() {
                continue;
            }
            match tag {
                "@provides" => pkg.provides.push(cap.to_string()),
                "@requires" => pkg.requires.push(cap.to_string()),
                "@conflicts" => pkg.conflicts.push(cap.to_string()),
                "@obsoletes" => pkg.obsoletes.push(cap.to_string()),
                "@recommends" => pkg.recommends.push(cap.to_string()),
                "@suggests" => pkg.suggests.push(cap.to_string()),
                _ => (),
            }
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_output() {
        let text = "\
@info\tfirefox\t0\t120.0\t1.mga9\tx86_64\t250000000\n\
@provides\tfirefox = 120.0-1.mga9\n\
@provides\twebclient\n\
@requires\tglibc >= 2.38\n\
@requires\tlibgtk3\n\
@info\tgpg-pubkey\t0\t80420f66\t62ccc5c1\t(none)\t0\n\
@info\tglibc\t0\t2.38\t1.mga9\tx86_64\t15000000\n\
@provides\tglibc = 2.38-1.mga9\n";

        let records = parse_query_output(text);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "firefox");
        assert_eq!(records[0].nevra, "firefox-120.0-1.mga9.x86_64");
        assert_eq!(
            records[0].provides,
            vec!["firefox = 120.0-1.mga9", "webclient"]
        );
        assert_eq!(records[0].requires, vec!["glibc >= 2.38", "libgtk3"]);
        assert_eq!(records[1].name, "glibc");
    }

    #[test]
    fn test_parse_query_output_epoch() {
        let text = "@info\tphp-common\t3\t8.4.2\t1.mga9\tx86_64\t1000\n";
        let records = parse_query_output(text);
        assert_eq!(records[0].evr(), "3:8.4.2-1.mga9");
        assert_eq!(records[0].nevra, "php-common-3:8.4.2-1.mga9.x86_64");
    }
}
