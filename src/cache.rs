//! Cache accounting: quotas, retention, LRU eviction and reconciliation
//! between the cache_files table and what is actually on disk.

use crate::config::{self, Context};
use crate::db::{CacheFile, Database, Media};
use crate::errors::*;
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct EvictionReport {
    pub unreferenced_deleted: usize,
    pub unreferenced_bytes: i64,
    pub retention_deleted: usize,
    pub retention_bytes: i64,
    pub quota_deleted: usize,
    pub quota_bytes: i64,
    pub errors: Vec<String>,
}

impl EvictionReport {
    pub fn total_deleted(&self) -> usize {
        self.unreferenced_deleted + self.retention_deleted + self.quota_deleted
    }

    pub fn total_bytes(&self) -> i64 {
        self.unreferenced_bytes + self.retention_bytes + self.quota_bytes
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ReconcileReport {
    pub orphan_records_removed: usize,
    pub untracked_files_added: usize,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ScanReport {
    pub found: usize,
    pub registered: usize,
    pub already_tracked: usize,
}

pub struct CacheManager {
    ctx: Context,
    db: Database,
}

impl CacheManager {
    pub fn new(ctx: Context, db: Database) -> CacheManager {
        CacheManager { ctx, db }
    }

    fn full_path(&self, cache_file: &CacheFile) -> PathBuf {
        self.ctx.medias_dir().join(&cache_file.file_path)
    }

    async fn media_local_dir(&self, media: &Media) -> Option<PathBuf> {
        let servers = self.db.servers_for_media(media.id).await.ok()?;
        let server = servers.first()?;
        let relative_path = media.relative_path.as_deref()?;
        let hostname = config::hostname_from_url(&server.media_url(relative_path));
        Some(self.ctx.media_dir(&hostname, &media.name))
    }

    async fn delete_file(&self, cache_file: &CacheFile, dry_run: bool) -> bool {
        let path = self.full_path(cache_file);
        if dry_run {
            debug!("Would delete {}", path.display());
            return true;
        }
        if path.exists() {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!("Failed to delete {}: {err}", path.display());
                return false;
            }
        }
        // record goes away with the file, peer provenance included
        let _ = self
            .db
            .delete_cache_file(&cache_file.filename, cache_file.media_id)
            .await;
        let _ = self.db.delete_peer_download_by_path(&cache_file.file_path).await;
        true
    }

    pub async fn media_usage(&self, media_id: i64) -> Result<i64> {
        Ok(self.db.cache_usage(Some(media_id)).await?.0)
    }

    pub async fn total_usage(&self) -> Result<i64> {
        Ok(self.db.cache_usage(None).await?.0)
    }

    /// Enforce every policy, in order: unreferenced files, per-media
    /// retention, per-media quotas, global quota.
    pub async fn enforce_quotas(&self, dry_run: bool) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();

        // 1. unreferenced files go first
        for file in self.db.list_cache_files(None).await? {
            if file.is_referenced {
                continue;
            }
            if self.delete_file(&file, dry_run).await {
                report.unreferenced_deleted += 1;
                report.unreferenced_bytes += file.file_size;
            } else {
                report.errors.push(file.file_path.clone());
            }
        }

        let media_list = self.db.list_media().await?;

        // 2. retention: unreferenced-only age limit per media
        for media in &media_list {
            let Some(retention_days) = media.retention_days else {
                continue;
            };
            if retention_days <= 0 {
                continue;
            }
            let old = self
                .db
                .files_to_evict(Some(media.id), Some(retention_days), None)
                .await?;
            for file in old {
                if file.is_referenced {
                    continue;
                }
                if self.delete_file(&file, dry_run).await {
                    report.retention_deleted += 1;
                    report.retention_bytes += file.file_size;
                }
            }
        }

        // 3. per-media quotas, LRU, referenced files included
        for media in &media_list {
            let Some(quota_mb) = media.quota_mb else { continue };
            let quota_bytes = quota_mb * 1024 * 1024;
            let current = self.media_usage(media.id).await?;
            if current <= quota_bytes {
                continue;
            }
            let excess = current - quota_bytes;
            for file in self
                .db
                .files_to_evict(Some(media.id), None, Some(excess))
                .await?
            {
                if self.delete_file(&file, dry_run).await {
                    report.quota_deleted += 1;
                    report.quota_bytes += file.file_size;
                }
            }
        }

        // 4. global quota, same policy at global scope
        if let Some(global_mb) = self
            .db
            .get_config("global_quota_mb")
            .await?
            .and_then(|v| v.parse::<i64>().ok())
        {
            let quota_bytes = global_mb * 1024 * 1024;
            let current = self.total_usage().await?;
            if current > quota_bytes {
                let excess = current - quota_bytes;
                for file in self.db.files_to_evict(None, None, Some(excess)).await? {
                    if self.delete_file(&file, dry_run).await {
                        report.quota_deleted += 1;
                        report.quota_bytes += file.file_size;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Free space ahead of a download, preferring the owning media.
    pub async fn evict_for_space(
        &self,
        needed_bytes: i64,
        media_id: Option<i64>,
        dry_run: bool,
    ) -> Result<(bool, i64)> {
        let mut freed = 0;

        if let Some(media_id) = media_id {
            for file in self
                .db
                .files_to_evict(Some(media_id), None, Some(needed_bytes))
                .await?
            {
                if self.delete_file(&file, dry_run).await {
                    freed += file.file_size;
                    if freed >= needed_bytes {
                        return Ok((true, freed));
                    }
                }
            }
        }

        let remaining = needed_bytes - freed;
        if remaining > 0 {
            for file in self.db.files_to_evict(None, None, Some(remaining)).await? {
                if self.delete_file(&file, dry_run).await {
                    freed += file.file_size;
                    if freed >= needed_bytes {
                        return Ok((true, freed));
                    }
                }
            }
        }

        Ok((freed >= needed_bytes, freed))
    }

    pub async fn mark_unreferenced(
        &self,
        media_id: i64,
        current_filenames: &HashSet<String>,
    ) -> Result<usize> {
        self.db
            .mark_cache_files_unreferenced(media_id, current_filenames)
            .await
    }

    /// Register any untracked .rpm files found under a media directory.
    pub async fn scan_media_directory(
        &self,
        media_id: i64,
        media_path: &PathBuf,
    ) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        if !media_path.exists() {
            return Ok(report);
        }

        let medias_dir = self.ctx.medias_dir();
        let mut stack = vec![media_path.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().map(|e| e != "rpm").unwrap_or(true) {
                    continue;
                }
                report.found += 1;
                let filename = entry.file_name().to_string_lossy().into_owned();
                if self.db.get_cache_file(&filename, media_id).await?.is_some() {
                    report.already_tracked += 1;
                    continue;
                }
                let Ok(rel_path) = path.strip_prefix(&medias_dir) else {
                    continue;
                };
                let size = entry.metadata().await?.len() as i64;
                self.db
                    .register_cache_file(
                        &filename,
                        media_id,
                        &rel_path.to_string_lossy(),
                        size,
                    )
                    .await?;
                report.registered += 1;
            }
        }
        Ok(report)
    }

    /// Make the table and the filesystem agree: rows without files go
    /// away, files without rows get registered.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for cache_file in self.db.list_cache_files(None).await? {
            if !self.full_path(&cache_file).exists() {
                self.db
                    .delete_cache_file(&cache_file.filename, cache_file.media_id)
                    .await?;
                self.db
                    .delete_peer_download_by_path(&cache_file.file_path)
                    .await?;
                report.orphan_records_removed += 1;
            }
        }

        for media in self.db.list_media().await? {
            let Some(media_path) = self.media_local_dir(&media).await else {
                continue;
            };
            let scan = self.scan_media_directory(media.id, &media_path).await?;
            report.untracked_files_added += scan.registered;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewMedia;

    async fn setup() -> (Context, Database, i64, tempfile::TempDir) {
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
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
            .add_server("local", "file", "", "/srv/mirror", false, 50)
            .await
            .unwrap();
        db.link_media_server(media_id, server_id).await.unwrap();
        (ctx, db, media_id, base)
    }

    async fn put_file(ctx: &Context, rel: &str, size: usize) {
        let path = ctx.medias_dir().join(rel);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, vec![0u8; size]).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreferenced_pass() {
        let (ctx, db, media_id, _base) = setup().await;
        let manager = CacheManager::new(ctx.clone(), db.clone());

        put_file(&ctx, "local/Core Release/a.rpm", 100).await;
        put_file(&ctx, "local/Core Release/b.rpm", 200).await;
        db.register_cache_file("a.rpm", media_id, "local/Core Release/a.rpm", 100)
            .await
            .unwrap();
        db.register_cache_file("b.rpm", media_id, "local/Core Release/b.rpm", 200)
            .await
            .unwrap();

        // only a.rpm is still in the synthesis
        let current: HashSet<String> = ["a.rpm".to_string()].into_iter().collect();
        manager.mark_unreferenced(media_id, &current).await.unwrap();

        let report = manager.enforce_quotas(false).await.unwrap();
        assert_eq!(report.unreferenced_deleted, 1);
        assert_eq!(report.unreferenced_bytes, 200);
        assert!(!ctx.medias_dir().join("local/Core Release/b.rpm").exists());
        assert!(ctx.medias_dir().join("local/Core Release/a.rpm").exists());
    }

    #[tokio::test]
    async fn test_quota_lru_eviction() {
        let (ctx, db, media_id, _base) = setup().await;
        let manager = CacheManager::new(ctx.clone(), db.clone());

        // 3 MiB of referenced files against a 2 MB quota
        for name in ["old.rpm", "mid.rpm", "new.rpm"] {
            let rel = format!("local/Core Release/{name}");
            put_file(&ctx, &rel, 1024 * 1024).await;
            db.register_cache_file(name, media_id, &rel, 1024 * 1024)
                .await
                .unwrap();
        }
        // old.rpm is the least recently used
        sqlx_touch(&db, media_id, "old.rpm", 1000).await;
        sqlx_touch(&db, media_id, "mid.rpm", 2000).await;
        sqlx_touch(&db, media_id, "new.rpm", 3000).await;
        db.set_media_quota("Core Release", Some(2), None)
            .await
            .unwrap();

        let report = manager.enforce_quotas(false).await.unwrap();
        assert_eq!(report.quota_deleted, 1);
        assert!(!ctx.medias_dir().join("local/Core Release/old.rpm").exists());
        assert!(ctx.medias_dir().join("local/Core Release/new.rpm").exists());
    }

    // backdate a cache row's access time for LRU ordering
    async fn sqlx_touch(db: &Database, media_id: i64, filename: &str, when: i64) {
        let file = db.get_cache_file(filename, media_id).await.unwrap().unwrap();
        db.backdate_cache_file(file.id, when).await.unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let (ctx, db, media_id, _base) = setup().await;
        let manager = CacheManager::new(ctx.clone(), db.clone());
        put_file(&ctx, "local/Core Release/a.rpm", 100).await;
        db.register_cache_file("a.rpm", media_id, "local/Core Release/a.rpm", 100)
            .await
            .unwrap();
        manager
            .mark_unreferenced(media_id, &HashSet::new())
            .await
            .unwrap();

        let report = manager.enforce_quotas(true).await.unwrap();
        assert_eq!(report.unreferenced_deleted, 1);
        assert!(ctx.medias_dir().join("local/Core Release/a.rpm").exists());
        assert!(db.get_cache_file("a.rpm", media_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reconcile() {
        let (ctx, db, media_id, _base) = setup().await;
        let manager = CacheManager::new(ctx.clone(), db.clone());

        // a row without a file
        db.register_cache_file("ghost.rpm", media_id, "local/Core Release/ghost.rpm", 10)
            .await
            .unwrap();
        // a file without a row, inside the media's directory
        put_file(&ctx, "local/Core Release/stray.rpm", 50).await;

        let report = manager.reconcile().await.unwrap();
        assert_eq!(report.orphan_records_removed, 1);
        assert_eq!(report.untracked_files_added, 1);
        assert!(db
            .get_cache_file("ghost.rpm", media_id)
            .await
            .unwrap()
            .is_none());
        assert!(db
            .get_cache_file("stray.rpm", media_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_evict_for_space() {
        let (ctx, db, media_id, _base) = setup().await;
        let manager = CacheManager::new(ctx.clone(), db.clone());
        for (name, when) in [("a.rpm", 1000), ("b.rpm", 2000)] {
            let rel = format!("local/Core Release/{name}");
            put_file(&ctx, &rel, 500).await;
            db.register_cache_file(name, media_id, &rel, 500)
                .await
                .unwrap();
            sqlx_touch(&db, media_id, name, when).await;
        }

        let (ok, freed) = manager.evict_for_space(400, Some(media_id), false).await.unwrap();
        assert!(ok);
        assert_eq!(freed, 500);
        // lru went first
        assert!(!ctx.medias_dir().join("local/Core Release/a.rpm").exists());
        assert!(ctx.medias_dir().join("local/Core Release/b.rpm").exists());
    }
}
