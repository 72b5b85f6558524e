use crate::chksums::Hasher;
use crate::compression;
use crate::config::{self, Context};
use crate::db::{Database, Media, Server};
use crate::errors::*;
use crate::synthesis::parse_synthesis;
use crate::utils::{self, IpMode};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const SYNTHESIS_PATH: &str = "media_info/synthesis.hdlist.cz";
pub const HDLIST_PATH: &str = "media_info/hdlist.cz";
pub const MD5SUM_PATH: &str = "media_info/MD5SUM";

const SYNC_WORKERS: usize = 4;

/// `(media_name, stage, current, total)`
pub type ProgressFn = Arc<dyn Fn(&str, &str, u64, u64) + Send + Sync>;

#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    pub packages: usize,
    pub skipped: bool,
    pub synthesis_downloaded: bool,
    pub hdlist_downloaded: bool,
}

/// Parse a MD5SUM file: `<md5>  <filename>` per line, `./` prefixes and
/// comment lines tolerated.
pub fn parse_md5sum(content: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(md5), Some(filename)) = (fields.next(), fields.next()) else {
            continue;
        };
        let filename = filename.trim_start_matches("./");
        result.insert(filename.to_string(), md5.to_lowercase());
    }
    result
}

/// Parse a mirrorlist: comma-separated `key=value` pairs per line, the
/// mirror address in the `url=` field.
pub fn parse_mirrorlist(content: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        for pair in line.split(',') {
            if let Some((key, value)) = pair.split_once('=') {
                if key.trim() == "url" && !value.trim().is_empty() {
                    urls.push(value.trim().to_string());
                }
            }
        }
    }
    urls
}

/// Filename a package downloads as (no epoch in rpm file names).
pub fn rpm_filename(name: &str, version: &str, release: &str, arch: &str) -> String {
    format!("{name}-{version}-{release}.{arch}.rpm")
}

fn report_progress(progress: &Option<ProgressFn>, media: &str, stage: &str, cur: u64, total: u64) {
    if let Some(cb) = progress {
        cb(media, stage, cur, total);
    }
}

/// Pick the download base for a media: first enabled server in priority
/// order, joined with the media's relative path.
pub async fn media_base_url(db: &Database, media: &Media) -> Result<(Server, String)> {
    let relative_path = media
        .relative_path
        .as_deref()
        .ok_or_else(|| Error::NoServer(media.name.clone()))?;
    let servers = db.servers_for_media(media.id).await?;
    let server = servers
        .into_iter()
        .next()
        .ok_or_else(|| Error::NoServer(media.name.clone()))?;
    let url = server.media_url(relative_path);
    Ok((server, url))
}

async fn download_to_scratch(
    client: &utils::HttpClient,
    url: &str,
    dest: &PathBuf,
) -> Result<crate::chksums::Checksums> {
    let reader = client.fetch(url).await?;
    let mut hasher = Hasher::new(reader);
    let mut file = tokio::fs::File::create(dest).await?;
    tokio::io::copy(&mut hasher, &mut file).await?;
    file.flush().await?;
    let (_, chksums) = hasher.digests();
    Ok(chksums)
}

/// Synchronize one media: MD5-gated synthesis fetch, parse, atomic
/// clear-and-reimport, canonical cache copy, media row update.
pub async fn sync_media(
    ctx: &Context,
    db: &Database,
    media_name: &str,
    force: bool,
    with_hdlist: bool,
    progress: Option<ProgressFn>,
) -> Result<SyncReport> {
    let media = db
        .get_media(media_name)
        .await?
        .ok_or_else(|| Error::MediaNotFound(media_name.to_string()))?;
    if !media.enabled {
        return Err(Error::MediaDisabled(media_name.to_string()));
    }

    let (server, base_url) = media_base_url(db, &media).await?;
    let hostname = config::hostname_from_url(&base_url);
    let client = utils::http_client(IpMode::parse(&server.ip_mode))?;

    // MD5 gate: unchanged synthesis means nothing to do
    report_progress(&progress, media_name, "checking", 0, 0);
    let md5sums = match client.fetch_bytes(&format!("{base_url}/{MD5SUM_PATH}")).await {
        Ok(bytes) => parse_md5sum(&String::from_utf8_lossy(&bytes)),
        Err(err) => {
            debug!("No MD5SUM for {media_name}: {err}, forcing refresh");
            HashMap::new()
        }
    };
    let expected_md5 = md5sums.get("synthesis.hdlist.cz").cloned();
    if !force {
        if let (Some(expected), Some(stored)) = (&expected_md5, &media.synthesis_md5) {
            if expected == stored {
                report_progress(&progress, media_name, "up-to-date", 0, 0);
                return Ok(SyncReport {
                    skipped: true,
                    ..Default::default()
                });
            }
        }
    }

    // Synthesis to a scratch path, hashed as it streams
    report_progress(&progress, media_name, "downloading synthesis", 0, 0);
    let scratch = ctx.scratch_dir();
    tokio::fs::create_dir_all(&scratch).await?;
    // unique per concurrent sync worker
    let token = format!("{}-{:08x}", std::process::id(), fastrand::u32(..));
    let scratch_synthesis = scratch.join(format!("urpm-synthesis-{token}.cz"));
    let chksums =
        download_to_scratch(&client, &format!("{base_url}/{SYNTHESIS_PATH}"), &scratch_synthesis)
            .await?;

    if let Some(expected) = &expected_md5 {
        if expected != &chksums.md5 {
            tokio::fs::remove_file(&scratch_synthesis).await.ok();
            return Err(Error::Md5Mismatch {
                path: SYNTHESIS_PATH.to_string(),
                expected: expected.clone(),
                actual: chksums.md5,
            });
        }
    }

    // Optional hdlist alongside
    let mut hdlist_downloaded = false;
    let scratch_hdlist = scratch.join(format!("urpm-hdlist-{token}.cz"));
    if with_hdlist {
        report_progress(&progress, media_name, "downloading hdlist", 0, 0);
        match download_to_scratch(&client, &format!("{base_url}/{HDLIST_PATH}"), &scratch_hdlist)
            .await
        {
            Ok(_) => hdlist_downloaded = true,
            Err(err) => warn!("hdlist fetch failed for {media_name}: {err}"),
        }
    }

    // Parse before touching the store so a corrupt synthesis aborts cleanly
    report_progress(&progress, media_name, "parsing synthesis", 0, 0);
    let text = compression::decompress_to_string(&scratch_synthesis).await?;
    let packages: Vec<_> = parse_synthesis(&text).collect();
    let total = packages.len() as u64;

    report_progress(&progress, media_name, "importing", 0, total);
    let count = db
        .replace_media_packages(media.id, "synthesis", &packages)
        .await?;
    report_progress(&progress, media_name, "importing", total, total);

    // Canonical cache copy: <base>/medias/<hostname>/<media>/media_info/
    let media_info = ctx.media_dir(&hostname, &media.name).join("media_info");
    tokio::fs::create_dir_all(&media_info).await?;
    tokio::fs::copy(&scratch_synthesis, media_info.join("synthesis.hdlist.cz")).await?;
    tokio::fs::remove_file(&scratch_synthesis).await.ok();
    if hdlist_downloaded {
        tokio::fs::copy(&scratch_hdlist, media_info.join("hdlist.cz")).await?;
        tokio::fs::remove_file(&scratch_hdlist).await.ok();
    }
    if !md5sums.is_empty() {
        if let Ok(bytes) = client.fetch_bytes(&format!("{base_url}/{MD5SUM_PATH}")).await {
            tokio::fs::write(media_info.join("MD5SUM"), bytes).await?;
        }
    }

    // Reference bits follow the new synthesis
    let current: HashSet<String> = packages
        .iter()
        .map(|p| rpm_filename(&p.name, &p.version, &p.release, &p.arch))
        .collect();
    db.mark_cache_files_unreferenced(media.id, &current).await?;

    db.update_media_sync(media.id, &chksums.md5).await?;
    report_progress(&progress, media_name, "done", total, total);

    Ok(SyncReport {
        packages: count,
        skipped: false,
        synthesis_downloaded: true,
        hdlist_downloaded,
    })
}

/// Media the current version policy allows syncing and resolving against.
pub async fn accepted_media(db: &Database) -> Result<Vec<Media>> {
    let media_list = db.list_media().await?;
    let enabled_versions: BTreeSet<String> = media_list
        .iter()
        .filter(|m| m.enabled)
        .filter_map(|m| m.mageia_version.clone())
        .collect();

    // explicit override first (chroot targeting), then the host os-release
    let system = match db.get_config("system-version").await? {
        Some(v) => v,
        None => config::system_version(None).unwrap_or_else(|| "cauldron".to_string()),
    };
    let version_mode = db.get_config("version-mode").await?;
    let accepted =
        config::accepted_versions(&system, &enabled_versions, version_mode.as_deref())?;

    Ok(media_list
        .into_iter()
        .filter(|m| m.enabled)
        .filter(|m| match &m.mageia_version {
            Some(v) => accepted.contains(v),
            None => true,
        })
        .collect())
}

/// Sync every enabled media in the accepted-versions set over a bounded
/// worker pool.
pub async fn sync_all_media(
    ctx: &Context,
    db: &Database,
    force: bool,
    progress: Option<ProgressFn>,
) -> Result<Vec<(String, Result<SyncReport>)>> {
    let media_list = accepted_media(db).await?;

    let semaphore = Arc::new(Semaphore::new(SYNC_WORKERS));
    let mut set = JoinSet::new();
    for media in media_list {
        let ctx = ctx.clone();
        let db = db.clone();
        let progress = progress.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            let report = sync_media(&ctx, &db, &media.name, force, false, progress).await;
            (media.name, report)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (name, report) = joined?;
        if let Err(err) = &report {
            error!("Sync failed for {name}: {err}");
        }
        results.push((name, report));
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewMedia;

    #[test]
    fn test_parse_md5sum() {
        let content = "\
d41d8cd98f00b204e9800998ecf8427e  synthesis.hdlist.cz
0cc175b9c0f1b6a831c399e269772661  ./hdlist.cz
# a comment
";
        let sums = parse_md5sum(content);
        assert_eq!(
            sums.get("synthesis.hdlist.cz").unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            sums.get("hdlist.cz").unwrap(),
            "0cc175b9c0f1b6a831c399e269772661"
        );
        assert_eq!(sums.len(), 2);
    }

    #[test]
    fn test_parse_mirrorlist() {
        let content = "\
country=FR,continent=EU,url=http://mirror.fr.example.org/mageia
country=DE,continent=EU,url=https://mirror.de.example.org/mageia
bogus line without fields
";
        let urls = parse_mirrorlist(content);
        assert_eq!(
            urls,
            vec![
                "http://mirror.fr.example.org/mageia",
                "https://mirror.de.example.org/mageia",
            ]
        );
    }

    #[test]
    fn test_rpm_filename() {
        assert_eq!(
            rpm_filename("vim", "9.0", "1.mga9", "x86_64"),
            "vim-9.0-1.mga9.x86_64.rpm"
        );
    }

    /// End-to-end sync against a file:// server (scenario: fresh store, one
    /// media with three packages).
    #[tokio::test]
    async fn test_sync_media_from_file_server() {
        use async_compression::tokio::bufread::GzipEncoder;
        use tokio::io::AsyncReadExt;

        let synthesis = "\
@summary@Vi IMproved@
@provides@vim[== 9.0-1.mga9]
@filesize@3200000
@info@vim-9.0-1.mga9.x86_64@0@9000000@Editors
@summary@Mozilla Firefox
@provides@firefox[== 120.0-1.mga9]@webclient
@requires@glibc[>= 2.38]@libgtk3
@filesize@60000000
@info@firefox-120.0-1.mga9.x86_64@0@250000000@Networking/WWW
@summary@The GNU libc
@provides@glibc[== 2.38-1.mga9]
@filesize@5000000
@info@glibc-2.38-1.mga9.x86_64@0@15000000@System/Libraries
";

        // Lay out a mirror tree under a temp dir
        let mirror = tempfile::tempdir().unwrap();
        let media_info = mirror
            .path()
            .join("9/x86_64/media/core/release/media_info");
        tokio::fs::create_dir_all(&media_info).await.unwrap();

        let mut encoder = GzipEncoder::new(synthesis.as_bytes());
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).await.unwrap();
        let md5 = crate::chksums::md5_hex(&compressed);
        tokio::fs::write(media_info.join("synthesis.hdlist.cz"), &compressed)
            .await
            .unwrap();
        tokio::fs::write(
            media_info.join("MD5SUM"),
            format!("{md5}  synthesis.hdlist.cz\n"),
        )
        .await
        .unwrap();

        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let db = Database::open_memory().await.unwrap();
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
        let server_id = db
            .add_server(
                "local",
                "file",
                "",
                mirror.path().to_str().unwrap(),
                false,
                50,
            )
            .await
            .unwrap();
        db.link_media_server(media_id, server_id).await.unwrap();

        let report = sync_media(&ctx, &db, "Core Release", false, false, None)
            .await
            .unwrap();
        assert_eq!(report.packages, 3);
        assert!(!report.skipped);

        let stats = db.get_stats().await.unwrap();
        assert_eq!(stats.packages, 3);
        assert!(stats.provides >= 3);
        assert_eq!(stats.media, 1);

        // Canonical cache copy landed
        let cached = ctx
            .media_dir("local", "Core Release")
            .join("media_info/synthesis.hdlist.cz");
        assert!(cached.exists());

        // Second sync is gated by the MD5SUM
        let report = sync_media(&ctx, &db, "Core Release", false, false, None)
            .await
            .unwrap();
        assert!(report.skipped);

        // Forced sync runs the import again
        let report = sync_media(&ctx, &db, "Core Release", true, false, None)
            .await
            .unwrap();
        assert_eq!(report.packages, 3);
    }

    #[tokio::test]
    async fn test_sync_unknown_media() {
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let db = Database::open_memory().await.unwrap();
        assert!(sync_media(&ctx, &db, "Nope", false, false, None)
            .await
            .is_err());
    }
}
