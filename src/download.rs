use crate::chksums::Hasher;
use crate::config::{self, Context};
use crate::db::Database;
use crate::discovery::Peer;
use crate::errors::*;
use crate::resolver::{Resolver, TransactionType};
use crate::sync::rpm_filename;
use crate::utils::{self, IpMode};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const DOWNLOAD_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub name: String,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub filename: String,
    pub media_id: i64,
    pub media_name: String,
    pub relative_path: String,
    pub hostname: String,
    pub is_official: bool,
    /// (base url of the media on a server, its ip mode), priority order
    pub servers: Vec<(String, String)>,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub use_peers: bool,
    pub only_peers: bool,
    pub verify_signatures: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        DownloadOptions {
            use_peers: true,
            only_peers: false,
            verify_signatures: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct PeerTransferStats {
    pub files: usize,
    pub bytes: i64,
}

#[derive(Debug, Default)]
pub struct DownloadOutcome {
    /// per item: filename and where it ended up (or why it did not)
    pub results: Vec<(String, Result<PathBuf>)>,
    pub downloaded: usize,
    pub cached: usize,
    pub peer_stats: PeerTransferStats,
}

impl DownloadOutcome {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.results
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok().cloned())
            .collect()
    }

    pub fn failures(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Build the download list for a transaction. Actions backed by local
/// .rpm files skip the downloader and contribute their path directly.
pub async fn build_download_items(
    db: &Database,
    resolver: &Resolver,
    actions: &[crate::resolver::PackageAction],
) -> Result<(Vec<DownloadItem>, Vec<PathBuf>)> {
    let mut items = Vec::new();
    let mut local_paths = Vec::new();

    for action in actions {
        if !matches!(
            action.action,
            TransactionType::Install
                | TransactionType::Upgrade
                | TransactionType::Downgrade
                | TransactionType::Reinstall
        ) {
            continue;
        }

        if action.media_name == "@LocalRPMs" {
            if let Some(pool) = resolver.pool() {
                let path = pool
                    .by_name(&action.name)
                    .iter()
                    .filter_map(|&id| pool.get(id).local_path.clone())
                    .next();
                if let Some(path) = path {
                    local_paths.push(path);
                }
            }
            continue;
        }

        let Some(media) = db.get_media(&action.media_name).await? else {
            return Err(Error::MediaNotFound(action.media_name.clone()));
        };
        let relative_path = media.relative_path.clone().unwrap_or_default();
        let servers = db.servers_for_media(media.id).await?;
        if servers.is_empty() {
            return Err(Error::NoServer(media.name.clone()));
        }

        let server_urls: Vec<(String, String)> = servers
            .iter()
            .map(|s| (s.media_url(&relative_path), s.ip_mode.clone()))
            .collect();
        let hostname = config::hostname_from_url(&server_urls[0].0);

        // rpm file names carry version-release without the epoch
        let (version, release) = match action.evr.split_once(':') {
            Some((_, vr)) => match vr.split_once('-') {
                Some((v, r)) => (v.to_string(), r.to_string()),
                None => (vr.to_string(), String::new()),
            },
            None => match action.evr.split_once('-') {
                Some((v, r)) => (v.to_string(), r.to_string()),
                None => (action.evr.clone(), String::new()),
            },
        };

        items.push(DownloadItem {
            filename: rpm_filename(&action.name, &version, &release, &action.arch),
            name: action.name.clone(),
            version,
            release,
            arch: action.arch.clone(),
            media_id: media.id,
            media_name: media.name.clone(),
            relative_path,
            hostname,
            is_official: media.official,
            servers: server_urls,
            size: action.filesize,
        });
    }

    Ok((items, local_paths))
}

/// Verify a package against the RPM GPG keyring.
pub async fn verify_signature(path: &PathBuf) -> Result<()> {
    let output = Command::new("rpmkeys")
        .arg("--checksig")
        .arg("--")
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::BadSignature(path.display().to_string()));
    }
    Ok(())
}

async fn fetch_to_part(
    client: &utils::HttpClient,
    url: &str,
    part: &PathBuf,
) -> Result<crate::chksums::Checksums> {
    let reader = client.fetch(url).await?;
    let mut hasher = Hasher::new(reader);
    let mut file = tokio::fs::File::create(part).await?;
    let copied = tokio::io::copy(&mut hasher, &mut file).await;
    file.flush().await.ok();
    if let Err(err) = copied {
        // cancelled or broken stream: do not leave partial files behind
        tokio::fs::remove_file(part).await.ok();
        return Err(err.into());
    }
    let (_, chksums) = hasher.digests();
    Ok(chksums)
}

async fn download_one(
    ctx: Context,
    db: Database,
    peers: Arc<Vec<Peer>>,
    item: DownloadItem,
    opts: DownloadOptions,
) -> (String, Result<PathBuf>, bool, bool, i64) {
    let dest_dir = ctx.media_dir(&item.hostname, &item.media_name);
    let dest = dest_dir.join(&item.filename);
    let rel_path = format!("{}/{}/{}", item.hostname, item.media_name, item.filename);

    // already cached: touch for LRU and reuse
    if dest.exists() {
        db.touch_cache_file(&item.filename, item.media_id).await.ok();
        return (item.filename, Ok(dest), false, true, 0);
    }
    if let Err(err) = tokio::fs::create_dir_all(&dest_dir).await {
        return (item.filename, Err(err.into()), false, false, 0);
    }
    let part = dest.with_extension("part");

    let mut last_error: Option<Error> = None;

    // peer-first routing
    if opts.use_peers || opts.only_peers {
        for peer in peers.iter() {
            if db
                .is_peer_blacklisted(&peer.host, peer.port)
                .await
                .unwrap_or(false)
            {
                continue;
            }
            let url = format!(
                "http://{}:{}/medias/{}/{}/{}",
                peer.host, peer.port, item.hostname, item.media_name, item.filename
            );
            let client = match utils::http_client(IpMode::Auto) {
                Ok(c) => c,
                Err(err) => return (item.filename, Err(err), false, false, 0),
            };
            match fetch_to_part(&client, &url, &part).await {
                Ok(chksums) => {
                    if item.size > 0 && chksums.size as i64 != item.size {
                        debug!("Peer {url} size mismatch, trying next source");
                        tokio::fs::remove_file(&part).await.ok();
                        last_error = Some(Error::Sha256Mismatch {
                            path: item.filename.clone(),
                        });
                        continue;
                    }
                    if opts.verify_signatures {
                        if let Err(err) = verify_signature(&part).await {
                            warn!("Peer-served package failed signature check: {url}");
                            tokio::fs::remove_file(&part).await.ok();
                            last_error = Some(err);
                            continue;
                        }
                    }
                    if let Err(err) = tokio::fs::rename(&part, &dest).await {
                        return (item.filename, Err(err.into()), false, false, 0);
                    }
                    db.register_cache_file(
                        &item.filename,
                        item.media_id,
                        &rel_path,
                        chksums.size as i64,
                    )
                    .await
                    .ok();
                    db.record_peer_download(
                        &item.filename,
                        &rel_path,
                        &peer.host,
                        peer.port,
                        Some(chksums.size as i64),
                        Some(&chksums.sha256),
                        opts.verify_signatures,
                    )
                    .await
                    .ok();
                    let size = chksums.size as i64;
                    return (item.filename, Ok(dest), true, false, size);
                }
                Err(err) => {
                    debug!("Peer fetch failed ({url}): {err}");
                    last_error = Some(err);
                }
            }
        }
        if opts.only_peers {
            let err = last_error
                .unwrap_or_else(|| Error::HttpStatus(404, format!("no peer had {}", item.filename)));
            return (item.filename, Err(err), false, false, 0);
        }
    }

    // mirrors in priority order
    for (base_url, ip_mode) in &item.servers {
        let url = format!("{base_url}/{}", item.filename);
        let client = match utils::http_client(IpMode::parse(ip_mode)) {
            Ok(c) => c,
            Err(err) => return (item.filename, Err(err), false, false, 0),
        };
        match fetch_to_part(&client, &url, &part).await {
            Ok(chksums) => {
                if item.size > 0 && chksums.size as i64 != item.size {
                    tokio::fs::remove_file(&part).await.ok();
                    last_error = Some(Error::Sha256Mismatch {
                        path: item.filename.clone(),
                    });
                    continue;
                }
                if opts.verify_signatures {
                    if let Err(err) = verify_signature(&part).await {
                        tokio::fs::remove_file(&part).await.ok();
                        // a bad signature from a mirror is never skipped
                        return (item.filename, Err(err), false, false, 0);
                    }
                }
                if let Err(err) = tokio::fs::rename(&part, &dest).await {
                    return (item.filename, Err(err.into()), false, false, 0);
                }
                db.register_cache_file(
                    &item.filename,
                    item.media_id,
                    &rel_path,
                    chksums.size as i64,
                )
                .await
                .ok();
                return (item.filename, Ok(dest), false, false, 0);
            }
            Err(err) => {
                info!("Mirror failed ({url}): {err}, trying next");
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or_else(|| Error::HttpStatus(404, item.filename.clone()));
    (item.filename, Err(err), false, false, 0)
}

/// Download every item over a bounded worker pool, peers first when
/// enabled, mirrors in priority order as fallback. Failures are per item;
/// the caller decides whether to abort.
pub async fn download_all(
    ctx: &Context,
    db: &Database,
    peers: Vec<Peer>,
    items: Vec<DownloadItem>,
    opts: &DownloadOptions,
) -> Result<DownloadOutcome> {
    let semaphore = Arc::new(Semaphore::new(DOWNLOAD_WORKERS));
    let peers = Arc::new(peers);
    let mut set = JoinSet::new();

    for item in items {
        let ctx = ctx.clone();
        let db = db.clone();
        let peers = peers.clone();
        let opts = opts.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            download_one(ctx, db, peers, item, opts).await
        });
    }

    let mut outcome = DownloadOutcome::default();
    while let Some(joined) = set.join_next().await {
        let (filename, result, from_peer, cached, peer_bytes) = joined?;
        if result.is_ok() {
            if cached {
                outcome.cached += 1;
            } else {
                outcome.downloaded += 1;
            }
            if from_peer {
                outcome.peer_stats.files += 1;
                outcome.peer_stats.bytes += peer_bytes;
            }
        }
        outcome.results.push((filename, result));
    }
    outcome.results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewMedia;
    use crate::resolver::{InstallReason, PackageAction};

    fn action(name: &str, evr: &str, media: &str) -> PackageAction {
        PackageAction {
            action: TransactionType::Install,
            name: name.to_string(),
            evr: evr.to_string(),
            arch: "x86_64".to_string(),
            nevra: format!("{name}-{evr}.x86_64"),
            size: 4000,
            filesize: 1000,
            media_name: media.to_string(),
            reason: InstallReason::Explicit,
            from_evr: String::new(),
        }
    }

    async fn db_with_media() -> (Database, i64) {
        let db = Database::open_memory().await.unwrap();
        let media_id = db
            .add_media(&NewMedia {
                name: "Core Release".to_string(),
                mageia_version: Some("9".to_string()),
                architecture: Some("x86_64".to_string()),
                relative_path: Some("9/x86_64/media/core/release".to_string()),
                enabled: true,
                priority: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        let server_id = db
            .add_server("mirror", "https", "mirror.example.org", "/mageia", true, 50)
            .await
            .unwrap();
        db.link_media_server(media_id, server_id).await.unwrap();
        (db, media_id)
    }

    #[tokio::test]
    async fn test_build_download_items() {
        let (db, _) = db_with_media().await;
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let resolver = Resolver::new(
            ctx,
            db.clone(),
            crate::resolver::ResolverOptions::default(),
        );

        let actions = vec![
            action("vim", "9.0-1.mga9", "Core Release"),
            {
                let mut remove = action("old", "1.0-1.mga9", "@System");
                remove.action = TransactionType::Remove;
                remove
            },
        ];
        let (items, local) = build_download_items(&db, &resolver, &actions).await.unwrap();
        assert!(local.is_empty());
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.filename, "vim-9.0-1.mga9.x86_64.rpm");
        assert_eq!(item.media_name, "Core Release");
        assert_eq!(item.hostname, "mirror.example.org");
        assert_eq!(
            item.servers[0].0,
            "https://mirror.example.org/mageia/9/x86_64/media/core/release"
        );
    }

    #[tokio::test]
    async fn test_build_download_items_epoch_stripped() {
        let (db, _) = db_with_media().await;
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let resolver = Resolver::new(
            ctx,
            db.clone(),
            crate::resolver::ResolverOptions::default(),
        );
        let actions = vec![action("php-common", "3:8.4.2-1.mga9", "Core Release")];
        let (items, _) = build_download_items(&db, &resolver, &actions).await.unwrap();
        assert_eq!(items[0].filename, "php-common-8.4.2-1.mga9.x86_64.rpm");
    }

    #[tokio::test]
    async fn test_download_from_file_server_and_cache_hit() {
        // file:// server backed by a temp dir stands in for a mirror
        let mirror = tempfile::tempdir().unwrap();
        let pkg_dir = mirror.path().join("9/x86_64/media/core/release");
        tokio::fs::create_dir_all(&pkg_dir).await.unwrap();
        tokio::fs::write(pkg_dir.join("vim-9.0-1.mga9.x86_64.rpm"), b"rpmbytes")
            .await
            .unwrap();

        let db = Database::open_memory().await.unwrap();
        let media_id = db
            .add_media(&NewMedia {
                name: "Core Release".to_string(),
                relative_path: Some("9/x86_64/media/core/release".to_string()),
                enabled: true,
                priority: 50,
                ..Default::default()
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

        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let item = DownloadItem {
            name: "vim".to_string(),
            version: "9.0".to_string(),
            release: "1.mga9".to_string(),
            arch: "x86_64".to_string(),
            filename: "vim-9.0-1.mga9.x86_64.rpm".to_string(),
            media_id,
            media_name: "Core Release".to_string(),
            relative_path: "9/x86_64/media/core/release".to_string(),
            hostname: "local".to_string(),
            is_official: false,
            servers: vec![(
                format!(
                    "file://{}/9/x86_64/media/core/release",
                    mirror.path().display()
                ),
                "auto".to_string(),
            )],
            size: 8,
        };
        let opts = DownloadOptions {
            use_peers: false,
            only_peers: false,
            verify_signatures: false,
        };

        let outcome = download_all(&ctx, &db, vec![], vec![item.clone()], &opts)
            .await
            .unwrap();
        assert_eq!(outcome.downloaded, 1);
        assert_eq!(outcome.cached, 0);
        let path = outcome.results[0].1.as_ref().unwrap();
        assert!(path.exists());
        assert!(db
            .get_cache_file("vim-9.0-1.mga9.x86_64.rpm", media_id)
            .await
            .unwrap()
            .is_some());

        // second run comes from the cache
        let outcome = download_all(&ctx, &db, vec![], vec![item], &opts)
            .await
            .unwrap();
        assert_eq!(outcome.downloaded, 0);
        assert_eq!(outcome.cached, 1);
    }

    #[tokio::test]
    async fn test_download_size_mismatch_fails_item() {
        let mirror = tempfile::tempdir().unwrap();
        let pkg_dir = mirror.path().join("m");
        tokio::fs::create_dir_all(&pkg_dir).await.unwrap();
        tokio::fs::write(pkg_dir.join("a.rpm"), b"short").await.unwrap();

        let db = Database::open_memory().await.unwrap();
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let item = DownloadItem {
            name: "a".to_string(),
            version: "1".to_string(),
            release: "1".to_string(),
            arch: "x86_64".to_string(),
            filename: "a.rpm".to_string(),
            media_id: 1,
            media_name: "m".to_string(),
            relative_path: "m".to_string(),
            hostname: "local".to_string(),
            is_official: false,
            servers: vec![(
                format!("file://{}/m", mirror.path().display()),
                "auto".to_string(),
            )],
            size: 999,
        };
        let opts = DownloadOptions {
            use_peers: false,
            only_peers: false,
            verify_signatures: false,
        };
        let outcome = download_all(&ctx, &db, vec![], vec![item], &opts)
            .await
            .unwrap();
        assert!(outcome.results[0].1.is_err());
        assert_eq!(outcome.failures(), vec!["a.rpm"]);
    }
}
