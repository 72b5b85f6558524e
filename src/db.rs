use crate::errors::*;
use crate::synthesis::PackageRecord;
use chrono::Utc;
use globset::GlobBuilder;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Current store schema. Bump together with a new entry in MIGRATIONS.
pub const SCHEMA_VERSION: i64 = 9;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_info (
    version INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS media (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    mageia_version TEXT,
    architecture TEXT,
    short_name TEXT,
    relative_path TEXT,
    official INTEGER DEFAULT 1,
    enabled INTEGER DEFAULT 1,
    update_media INTEGER DEFAULT 0,
    priority INTEGER DEFAULT 50,
    last_sync INTEGER,
    synthesis_md5 TEXT,
    replication TEXT DEFAULT 'none',
    seed_sections TEXT,
    shared INTEGER DEFAULT 1,
    quota_mb INTEGER,
    retention_days INTEGER,
    added_timestamp INTEGER
);

CREATE TABLE IF NOT EXISTS servers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    protocol TEXT NOT NULL,
    host TEXT NOT NULL,
    base_path TEXT NOT NULL,
    official INTEGER DEFAULT 1,
    enabled INTEGER DEFAULT 1,
    priority INTEGER DEFAULT 50,
    ip_mode TEXT DEFAULT 'auto',
    added_timestamp INTEGER,
    UNIQUE(protocol, host, base_path)
);

CREATE TABLE IF NOT EXISTS media_servers (
    media_id INTEGER NOT NULL,
    server_id INTEGER NOT NULL,
    PRIMARY KEY (media_id, server_id),
    FOREIGN KEY (media_id) REFERENCES media(id) ON DELETE CASCADE,
    FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS packages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_id INTEGER,
    name TEXT NOT NULL,
    epoch INTEGER DEFAULT 0,
    version TEXT NOT NULL,
    release TEXT NOT NULL,
    arch TEXT NOT NULL,
    name_lower TEXT NOT NULL,
    nevra TEXT NOT NULL,
    summary TEXT,
    description TEXT,
    size INTEGER DEFAULT 0,
    filesize INTEGER DEFAULT 0,
    group_name TEXT,
    url TEXT,
    license TEXT,
    source TEXT,
    pkg_hash TEXT,
    added_timestamp INTEGER,
    FOREIGN KEY (media_id) REFERENCES media(id) ON DELETE CASCADE,
    UNIQUE(nevra, media_id)
);

CREATE TABLE IF NOT EXISTS requires (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pkg_id INTEGER NOT NULL,
    capability TEXT NOT NULL,
    FOREIGN KEY (pkg_id) REFERENCES packages(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS provides (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pkg_id INTEGER NOT NULL,
    capability TEXT NOT NULL,
    FOREIGN KEY (pkg_id) REFERENCES packages(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pkg_id INTEGER NOT NULL,
    capability TEXT NOT NULL,
    FOREIGN KEY (pkg_id) REFERENCES packages(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS obsoletes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pkg_id INTEGER NOT NULL,
    capability TEXT NOT NULL,
    FOREIGN KEY (pkg_id) REFERENCES packages(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS recommends (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pkg_id INTEGER NOT NULL,
    capability TEXT NOT NULL,
    FOREIGN KEY (pkg_id) REFERENCES packages(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS suggests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pkg_id INTEGER NOT NULL,
    capability TEXT NOT NULL,
    FOREIGN KEY (pkg_id) REFERENCES packages(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS supplements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pkg_id INTEGER NOT NULL,
    capability TEXT NOT NULL,
    FOREIGN KEY (pkg_id) REFERENCES packages(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS enhances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pkg_id INTEGER NOT NULL,
    capability TEXT NOT NULL,
    FOREIGN KEY (pkg_id) REFERENCES packages(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS pins (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    package_pattern TEXT NOT NULL,
    media_pattern TEXT,
    priority INTEGER DEFAULT 100,
    version_pattern TEXT,
    comment TEXT,
    added_timestamp INTEGER
);

CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    action TEXT NOT NULL,
    status TEXT DEFAULT 'running',
    command TEXT,
    user TEXT,
    return_code INTEGER,
    undone_by INTEGER,
    FOREIGN KEY (undone_by) REFERENCES history(id)
);

CREATE TABLE IF NOT EXISTS history_packages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    history_id INTEGER NOT NULL,
    pkg_nevra TEXT NOT NULL,
    pkg_name TEXT NOT NULL,
    action TEXT NOT NULL,
    reason TEXT NOT NULL,
    previous_nevra TEXT,
    FOREIGN KEY (history_id) REFERENCES history(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT
);

CREATE TABLE IF NOT EXISTS cache_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    media_id INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    file_size INTEGER DEFAULT 0,
    is_referenced INTEGER DEFAULT 1,
    last_accessed INTEGER,
    added_timestamp INTEGER,
    UNIQUE(filename, media_id)
);

CREATE TABLE IF NOT EXISTS peer_downloads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    file_path TEXT NOT NULL,
    peer_host TEXT NOT NULL,
    peer_port INTEGER NOT NULL,
    download_time INTEGER NOT NULL,
    file_size INTEGER,
    checksum_sha256 TEXT,
    verified INTEGER DEFAULT 0,
    UNIQUE(file_path)
);

CREATE TABLE IF NOT EXISTS peer_blacklist (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_host TEXT NOT NULL,
    peer_port INTEGER,
    reason TEXT,
    blacklist_time INTEGER NOT NULL,
    UNIQUE(peer_host, peer_port)
);

CREATE INDEX IF NOT EXISTS idx_pkg_name_lower ON packages(name_lower);
CREATE INDEX IF NOT EXISTS idx_pkg_nevra ON packages(nevra);
CREATE INDEX IF NOT EXISTS idx_pkg_media ON packages(media_id);
CREATE INDEX IF NOT EXISTS idx_provides_cap ON provides(capability);
CREATE INDEX IF NOT EXISTS idx_provides_pkg ON provides(pkg_id);
CREATE INDEX IF NOT EXISTS idx_requires_cap ON requires(capability);
CREATE INDEX IF NOT EXISTS idx_requires_pkg ON requires(pkg_id);
CREATE INDEX IF NOT EXISTS idx_conflicts_pkg ON conflicts(pkg_id);
CREATE INDEX IF NOT EXISTS idx_obsoletes_pkg ON obsoletes(pkg_id);
CREATE INDEX IF NOT EXISTS idx_recommends_pkg ON recommends(pkg_id);
CREATE INDEX IF NOT EXISTS idx_suggests_pkg ON suggests(pkg_id);
CREATE INDEX IF NOT EXISTS idx_supplements_pkg ON supplements(pkg_id);
CREATE INDEX IF NOT EXISTS idx_enhances_pkg ON enhances(pkg_id);
CREATE INDEX IF NOT EXISTS idx_pins_pattern ON pins(package_pattern);
CREATE INDEX IF NOT EXISTS idx_history_timestamp ON history(timestamp);
CREATE INDEX IF NOT EXISTS idx_history_status ON history(status);
CREATE INDEX IF NOT EXISTS idx_history_pkg_name ON history_packages(pkg_name);
CREATE INDEX IF NOT EXISTS idx_cache_files_media ON cache_files(media_id);
CREATE INDEX IF NOT EXISTS idx_cache_files_accessed ON cache_files(last_accessed);
CREATE INDEX IF NOT EXISTS idx_peer_downloads_host ON peer_downloads(peer_host);
CREATE INDEX IF NOT EXISTS idx_peer_downloads_filename ON peer_downloads(filename);
"#;

/// Forward migrations, one entry per schema step. Each runs in its own
/// transaction and bumps schema_info on success.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        7,
        r#"
        CREATE TABLE IF NOT EXISTS peer_downloads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filename TEXT NOT NULL,
            file_path TEXT NOT NULL,
            peer_host TEXT NOT NULL,
            peer_port INTEGER NOT NULL,
            download_time INTEGER NOT NULL,
            file_size INTEGER,
            checksum_sha256 TEXT,
            verified INTEGER DEFAULT 0,
            UNIQUE(file_path)
        );
        CREATE INDEX IF NOT EXISTS idx_peer_downloads_host ON peer_downloads(peer_host);
        CREATE INDEX IF NOT EXISTS idx_peer_downloads_filename ON peer_downloads(filename);

        CREATE TABLE IF NOT EXISTS peer_blacklist (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            peer_host TEXT NOT NULL,
            peer_port INTEGER,
            reason TEXT,
            blacklist_time INTEGER NOT NULL,
            UNIQUE(peer_host, peer_port)
        );
        "#,
    ),
    (
        8,
        r#"
        CREATE TABLE IF NOT EXISTS cache_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filename TEXT NOT NULL,
            media_id INTEGER NOT NULL,
            file_path TEXT NOT NULL,
            file_size INTEGER DEFAULT 0,
            is_referenced INTEGER DEFAULT 1,
            last_accessed INTEGER,
            added_timestamp INTEGER,
            UNIQUE(filename, media_id)
        );
        CREATE INDEX IF NOT EXISTS idx_cache_files_media ON cache_files(media_id);
        CREATE INDEX IF NOT EXISTS idx_cache_files_accessed ON cache_files(last_accessed);
        ALTER TABLE media ADD COLUMN quota_mb INTEGER;
        ALTER TABLE media ADD COLUMN retention_days INTEGER;
        ALTER TABLE packages ADD COLUMN filesize INTEGER DEFAULT 0;
        "#,
    ),
    (
        9,
        r#"
        CREATE TABLE IF NOT EXISTS servers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            protocol TEXT NOT NULL,
            host TEXT NOT NULL,
            base_path TEXT NOT NULL,
            official INTEGER DEFAULT 1,
            enabled INTEGER DEFAULT 1,
            priority INTEGER DEFAULT 50,
            ip_mode TEXT DEFAULT 'auto',
            added_timestamp INTEGER,
            UNIQUE(protocol, host, base_path)
        );
        CREATE TABLE IF NOT EXISTS media_servers (
            media_id INTEGER NOT NULL,
            server_id INTEGER NOT NULL,
            PRIMARY KEY (media_id, server_id),
            FOREIGN KEY (media_id) REFERENCES media(id) ON DELETE CASCADE,
            FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE
        );
        ALTER TABLE media ADD COLUMN replication TEXT DEFAULT 'none';
        ALTER TABLE media ADD COLUMN seed_sections TEXT;
        ALTER TABLE media ADD COLUMN shared INTEGER DEFAULT 1;
        "#,
    ),
];

const DEP_TABLES: &[&str] = &[
    "requires",
    "provides",
    "conflicts",
    "obsoletes",
    "recommends",
    "suggests",
    "supplements",
    "enhances",
];

#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    path: PathBuf,
    pub read_only: bool,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct Media {
    pub id: i64,
    pub name: String,
    pub mageia_version: Option<String>,
    pub architecture: Option<String>,
    pub short_name: Option<String>,
    pub relative_path: Option<String>,
    pub official: bool,
    pub enabled: bool,
    pub update_media: bool,
    pub priority: i64,
    pub last_sync: Option<i64>,
    pub synthesis_md5: Option<String>,
    pub replication: Option<String>,
    pub seed_sections: Option<String>,
    pub shared: bool,
    pub quota_mb: Option<i64>,
    pub retention_days: Option<i64>,
}

#[derive(Debug, Default, Clone)]
pub struct NewMedia {
    pub name: String,
    pub mageia_version: Option<String>,
    pub architecture: Option<String>,
    pub short_name: Option<String>,
    pub relative_path: Option<String>,
    pub official: bool,
    pub enabled: bool,
    pub update_media: bool,
    pub priority: i64,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub protocol: String,
    pub host: String,
    pub base_path: String,
    pub official: bool,
    pub enabled: bool,
    pub priority: i64,
    pub ip_mode: String,
}

impl Server {
    /// Canonical base URL of a media on this server.
    pub fn media_url(&self, relative_path: &str) -> String {
        let base = self.base_path.trim_end_matches('/');
        let rel = relative_path.trim_start_matches('/');
        match self.protocol.as_str() {
            "file" => format!("file://{base}/{rel}"),
            proto => format!("{proto}://{}{base}/{rel}", self.host),
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Package {
    pub id: i64,
    pub media_id: Option<i64>,
    pub name: String,
    pub epoch: i64,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub nevra: String,
    pub summary: Option<String>,
    pub size: i64,
    pub filesize: i64,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Pin {
    pub id: i64,
    pub package_pattern: String,
    pub media_pattern: Option<String>,
    pub priority: i64,
    pub version_pattern: Option<String>,
    pub comment: Option<String>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct HistoryEntry {
    pub id: i64,
    pub timestamp: i64,
    pub action: String,
    pub status: String,
    pub command: Option<String>,
    pub user: Option<String>,
    pub return_code: Option<i64>,
    pub undone_by: Option<i64>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct HistoryPackage {
    pub id: i64,
    pub history_id: i64,
    pub pkg_nevra: String,
    pub pkg_name: String,
    pub action: String,
    pub reason: String,
    pub previous_nevra: Option<String>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct CacheFile {
    pub id: i64,
    pub filename: String,
    pub media_id: i64,
    pub file_path: String,
    pub file_size: i64,
    pub is_referenced: bool,
    pub last_accessed: Option<i64>,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct PeerDownload {
    pub id: i64,
    pub filename: String,
    pub file_path: String,
    pub peer_host: String,
    pub peer_port: i64,
    pub download_time: i64,
    pub file_size: Option<i64>,
    pub checksum_sha256: Option<String>,
    pub verified: bool,
}

#[derive(sqlx::FromRow, Debug, Clone, serde::Serialize)]
pub struct PeerStats {
    pub peer_host: String,
    pub peer_port: i64,
    pub download_count: i64,
    pub total_bytes: Option<i64>,
    pub first_download: i64,
    pub last_download: i64,
    pub verified_count: i64,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub package: Package,
    pub matched_provide: Option<String>,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct StoreStats {
    pub packages: i64,
    pub provides: i64,
    pub requires: i64,
    pub media: i64,
    pub db_size: u64,
    pub db_path: String,
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn glob_match(pattern: &str, value: &str) -> bool {
    GlobBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(|g| g.compile_matcher().is_match(value))
        .unwrap_or(false)
}

impl Database {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);
        Self::open_with(options, path.to_path_buf()).await
    }

    /// In-memory store, used by tests.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("valid memory dsn")
            .foreign_keys(true);
        Self::open_with(options, PathBuf::from(":memory:")).await
    }

    async fn open_with(options: SqliteConnectOptions, path: PathBuf) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let mut db = Database {
            pool,
            path,
            read_only: false,
        };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&mut self) -> Result<()> {
        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_info LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .unwrap_or(None)
            .unwrap_or(0);

        if current == 0 {
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(SCHEMA).execute(&mut *tx).await?;
            sqlx::query("INSERT OR REPLACE INTO schema_info (version) VALUES (?)")
                .bind(SCHEMA_VERSION)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        } else if current < SCHEMA_VERSION {
            self.apply_migrations(current).await?;
        } else if current > SCHEMA_VERSION {
            warn!(
                "Store schema version {current} is newer than supported {SCHEMA_VERSION}, opening read-only"
            );
            self.read_only = true;
        }
        Ok(())
    }

    async fn apply_migrations(&self, from: i64) -> Result<()> {
        let mut version = from;
        while version < SCHEMA_VERSION {
            let Some((to, script)) = MIGRATIONS.iter().find(|(to, _)| *to == version + 1) else {
                // Predates the migration registry. The index is a cache, so
                // rebuild instead of refusing to start.
                error!("No migration path from store schema v{version}, rebuilding schema");
                let mut tx = self.pool.begin().await?;
                for table in DEP_TABLES {
                    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                        .execute(&mut *tx)
                        .await?;
                }
                sqlx::raw_sql(
                    "DROP TABLE IF EXISTS packages;
                     DROP TABLE IF EXISTS media;
                     DROP TABLE IF EXISTS schema_info;",
                )
                .execute(&mut *tx)
                .await?;
                sqlx::raw_sql(SCHEMA).execute(&mut *tx).await?;
                sqlx::query("INSERT OR REPLACE INTO schema_info (version) VALUES (?)")
                    .bind(SCHEMA_VERSION)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                return Ok(());
            };

            info!("Migrating store schema v{version} -> v{to}");
            let mut tx = self.pool.begin().await?;
            let result: std::result::Result<_, sqlx::Error> = async {
                sqlx::raw_sql(script).execute(&mut *tx).await?;
                sqlx::query("UPDATE schema_info SET version = ?")
                    .bind(to)
                    .execute(&mut *tx)
                    .await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => tx.commit().await?,
                Err(source) => {
                    return Err(Error::Migration {
                        from: version,
                        to: *to,
                        source,
                    });
                }
            }
            version = *to;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    pub async fn add_media(&self, media: &NewMedia) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO media (name, mageia_version, architecture, short_name, relative_path,
                official, enabled, update_media, priority, added_timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&media.name)
        .bind(&media.mageia_version)
        .bind(&media.architecture)
        .bind(&media.short_name)
        .bind(&media.relative_path)
        .bind(media.official)
        .bind(media.enabled)
        .bind(media.update_media)
        .bind(media.priority)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn remove_media(&self, name: &str) -> Result<()> {
        let Some(media) = self.get_media(name).await? else {
            return Err(Error::MediaNotFound(name.to_string()));
        };
        self.clear_media_packages(media.id).await?;
        sqlx::query("DELETE FROM media WHERE id = ?")
            .bind(media.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_media(&self, name: &str) -> Result<Option<Media>> {
        let media = sqlx::query_as("SELECT * FROM media WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(media)
    }

    pub async fn get_media_by_id(&self, id: i64) -> Result<Option<Media>> {
        let media = sqlx::query_as("SELECT * FROM media WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(media)
    }

    /// Lookup by the `(mageia_version, arch, short_name)` triple.
    pub async fn get_media_by_triple(
        &self,
        version: &str,
        arch: &str,
        short_name: &str,
    ) -> Result<Option<Media>> {
        let media = sqlx::query_as(
            "SELECT * FROM media
            WHERE mageia_version = ? AND architecture = ? AND short_name = ?",
        )
        .bind(version)
        .bind(arch)
        .bind(short_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(media)
    }

    pub async fn list_media(&self) -> Result<Vec<Media>> {
        let media = sqlx::query_as("SELECT * FROM media ORDER BY priority DESC, name")
            .fetch_all(&self.pool)
            .await?;
        Ok(media)
    }

    pub async fn enable_media(&self, name: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE media SET enabled = ? WHERE name = ?")
            .bind(enabled)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_media_priority(&self, name: &str, priority: i64) -> Result<()> {
        sqlx::query("UPDATE media SET priority = ? WHERE name = ?")
            .bind(priority)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_media_quota(
        &self,
        name: &str,
        quota_mb: Option<i64>,
        retention_days: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE media SET quota_mb = ?, retention_days = ? WHERE name = ?")
            .bind(quota_mb)
            .bind(retention_days)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_media_replication(
        &self,
        name: &str,
        replication: &str,
        seed_sections: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE media SET replication = ?, seed_sections = ? WHERE name = ?")
            .bind(replication)
            .bind(seed_sections)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_media_sync(&self, media_id: i64, synthesis_md5: &str) -> Result<()> {
        sqlx::query("UPDATE media SET last_sync = ?, synthesis_md5 = ? WHERE id = ?")
            .bind(now())
            .bind(synthesis_md5)
            .bind(media_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Servers
    // ------------------------------------------------------------------

    pub async fn add_server(
        &self,
        name: &str,
        protocol: &str,
        host: &str,
        base_path: &str,
        official: bool,
        priority: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO servers (name, protocol, host, base_path, official, enabled, priority, added_timestamp)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(name)
        .bind(protocol)
        .bind(host)
        .bind(base_path)
        .bind(official)
        .bind(priority)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_server(&self, name: &str) -> Result<Option<Server>> {
        let server = sqlx::query_as("SELECT * FROM servers WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(server)
    }

    pub async fn list_servers(&self) -> Result<Vec<Server>> {
        let servers = sqlx::query_as("SELECT * FROM servers ORDER BY priority DESC, name")
            .fetch_all(&self.pool)
            .await?;
        Ok(servers)
    }

    pub async fn remove_server(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM servers WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn enable_server(&self, name: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE servers SET enabled = ? WHERE name = ?")
            .bind(enabled)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_server_priority(&self, name: &str, priority: i64) -> Result<()> {
        sqlx::query("UPDATE servers SET priority = ? WHERE name = ?")
            .bind(priority)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_server_ip_mode(&self, name: &str, ip_mode: &str) -> Result<()> {
        sqlx::query("UPDATE servers SET ip_mode = ? WHERE name = ?")
            .bind(ip_mode)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn link_media_server(&self, media_id: i64, server_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO media_servers (media_id, server_id) VALUES (?, ?)")
            .bind(media_id)
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn unlink_media_server(&self, media_id: i64, server_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM media_servers WHERE media_id = ? AND server_id = ?")
            .bind(media_id)
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Enabled servers carrying a media, best priority first.
    pub async fn servers_for_media(&self, media_id: i64) -> Result<Vec<Server>> {
        let servers = sqlx::query_as(
            "SELECT s.*
            FROM servers s
            JOIN media_servers ms ON ms.server_id = s.id
            WHERE ms.media_id = ? AND s.enabled = 1
            ORDER BY s.priority DESC, s.name",
        )
        .bind(media_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(servers)
    }

    // ------------------------------------------------------------------
    // Package import
    // ------------------------------------------------------------------

    /// Bulk-import a package set into a media, replacing dependency rows.
    ///
    /// Runs in a single transaction: multi-row upsert of packages keyed by
    /// `(nevra, media_id)`, id map query-back, then multi-row inserts into
    /// the capability tables. Child rows are deleted explicitly up front,
    /// which is much faster than cascading on large tables.
    pub async fn import_packages(
        &self,
        media_id: i64,
        source: &str,
        packages: &[PackageRecord],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for table in DEP_TABLES {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE pkg_id IN (SELECT id FROM packages WHERE media_id = ?)"
            ))
            .bind(media_id)
            .execute(&mut *tx)
            .await?;
        }
        let count = Self::import_into(&mut tx, media_id, source, packages).await?;
        tx.commit().await?;
        Ok(count)
    }

    async fn import_into(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        media_id: i64,
        source: &str,
        packages: &[PackageRecord],
    ) -> Result<usize> {
        let timestamp = now();

        for chunk in packages.chunks(500) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT OR REPLACE INTO packages
                (media_id, name, epoch, version, release, arch, name_lower, nevra,
                 summary, description, size, filesize, group_name, url, license,
                 source, pkg_hash, added_timestamp) ",
            );
            qb.push_values(chunk, |mut b, pkg| {
                let pkg_hash =
                    crate::chksums::sha256_hex(format!("{}|{}", pkg.nevra, pkg.summary).as_bytes());
                b.push_bind(media_id)
                    .push_bind(&pkg.name)
                    .push_bind(pkg.epoch)
                    .push_bind(&pkg.version)
                    .push_bind(&pkg.release)
                    .push_bind(&pkg.arch)
                    .push_bind(pkg.name.to_lowercase())
                    .push_bind(&pkg.nevra)
                    .push_bind(&pkg.summary)
                    .push_bind(&pkg.description)
                    .push_bind(pkg.size)
                    .push_bind(pkg.filesize)
                    .push_bind(&pkg.group)
                    .push_bind(&pkg.url)
                    .push_bind(&pkg.license)
                    .push_bind(source)
                    .push_bind(pkg_hash[..16].to_string())
                    .push_bind(timestamp);
            });
            qb.build().execute(&mut **tx).await?;
        }

        let rows = sqlx::query("SELECT id, nevra FROM packages WHERE media_id = ?")
            .bind(media_id)
            .fetch_all(&mut **tx)
            .await?;
        let nevra_to_id: HashMap<String, i64> = rows
            .into_iter()
            .map(|row| (row.get::<String, _>(1), row.get::<i64, _>(0)))
            .collect();

        type DepField = fn(&PackageRecord) -> &Vec<String>;
        let dep_fields: [(&str, DepField); 8] = [
            ("requires", |p| &p.requires),
            ("provides", |p| &p.provides),
            ("conflicts", |p| &p.conflicts),
            ("obsoletes", |p| &p.obsoletes),
            ("recommends", |p| &p.recommends),
            ("suggests", |p| &p.suggests),
            ("supplements", |p| &p.supplements),
            ("enhances", |p| &p.enhances),
        ];
        for (table, field) in dep_fields {
            let mut rows: Vec<(i64, &str)> = Vec::new();
            for pkg in packages {
                let Some(&pkg_id) = nevra_to_id.get(&pkg.nevra) else {
                    continue;
                };
                for cap in field(pkg) {
                    // rpmlib() internals never enter the index
                    if cap.starts_with("rpmlib(") {
                        continue;
                    }
                    rows.push((pkg_id, cap));
                }
            }
            for chunk in rows.chunks(5000) {
                let mut qb: QueryBuilder<Sqlite> =
                    QueryBuilder::new(format!("INSERT INTO {table} (pkg_id, capability) "));
                qb.push_values(chunk, |mut b, (pkg_id, cap)| {
                    b.push_bind(pkg_id).push_bind(*cap);
                });
                qb.build().execute(&mut **tx).await?;
            }
        }

        Ok(packages.len())
    }

    /// Atomic clear-and-reimport used by media sync: old capability rows,
    /// old package rows and the new set all land in one transaction.
    pub async fn replace_media_packages(
        &self,
        media_id: i64,
        source: &str,
        packages: &[PackageRecord],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for table in DEP_TABLES {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE pkg_id IN (SELECT id FROM packages WHERE media_id = ?)"
            ))
            .bind(media_id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM packages WHERE media_id = ?")
            .bind(media_id)
            .execute(&mut *tx)
            .await?;
        let count = Self::import_into(&mut tx, media_id, source, packages).await?;
        tx.commit().await?;
        Ok(count)
    }

    /// Remove all packages of a media and their capability rows.
    pub async fn clear_media_packages(&self, media_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in DEP_TABLES {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE pkg_id IN (SELECT id FROM packages WHERE media_id = ?)"
            ))
            .bind(media_id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM packages WHERE media_id = ?")
            .bind(media_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Package queries
    // ------------------------------------------------------------------

    /// Two-step search: name substring first, then provides substring for
    /// the remaining slots, deduplicated by package id.
    pub async fn search(
        &self,
        pattern: &str,
        limit: usize,
        search_provides: bool,
    ) -> Result<Vec<SearchHit>> {
        let like = format!("%{}%", pattern.to_lowercase());
        let mut hits = Vec::new();
        let mut seen: HashSet<i64> = HashSet::new();

        let rows: Vec<Package> = sqlx::query_as(
            "SELECT id, media_id, name, epoch, version, release, arch, nevra, summary, size, filesize
            FROM packages
            WHERE name_lower LIKE ?
            ORDER BY name_lower
            LIMIT ?",
        )
        .bind(&like)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        for package in rows {
            seen.insert(package.id);
            hits.push(SearchHit {
                package,
                matched_provide: None,
            });
        }

        if search_provides && hits.len() < limit {
            let rows = sqlx::query(
                "SELECT DISTINCT p.id, p.media_id, p.name, p.epoch, p.version, p.release,
                        p.arch, p.nevra, p.summary, p.size, p.filesize, pr.capability
                FROM packages p
                JOIN provides pr ON pr.pkg_id = p.id
                WHERE LOWER(pr.capability) LIKE ?
                ORDER BY p.name_lower
                LIMIT ?",
            )
            .bind(&like)
            .bind((limit + seen.len()) as i64)
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                let id: i64 = row.get(0);
                if !seen.insert(id) {
                    continue;
                }
                hits.push(SearchHit {
                    package: Package {
                        id,
                        media_id: row.get(1),
                        name: row.get(2),
                        epoch: row.get(3),
                        version: row.get(4),
                        release: row.get(5),
                        arch: row.get(6),
                        nevra: row.get(7),
                        summary: row.get(8),
                        size: row.get(9),
                        filesize: row.get(10),
                    },
                    matched_provide: Some(row.get(11)),
                });
                if hits.len() >= limit {
                    break;
                }
            }
        }

        Ok(hits)
    }

    /// Latest version of a package by name.
    pub async fn get_package(&self, name: &str) -> Result<Option<Package>> {
        let package = sqlx::query_as(
            "SELECT id, media_id, name, epoch, version, release, arch, nevra, summary, size, filesize
            FROM packages
            WHERE name_lower = ?
            ORDER BY epoch DESC, version DESC, release DESC
            LIMIT 1",
        )
        .bind(name.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(package)
    }

    pub async fn get_package_by_nevra(&self, nevra: &str) -> Result<Option<Package>> {
        let package = sqlx::query_as(
            "SELECT id, media_id, name, epoch, version, release, arch, nevra, summary, size, filesize
            FROM packages WHERE nevra = ? LIMIT 1",
        )
        .bind(nevra)
        .fetch_optional(&self.pool)
        .await?;
        Ok(package)
    }

    /// Lookup by name or NEVRA; identifiers that look like a NEVRA try the
    /// exact match first, then fall back to the name prefix.
    pub async fn get_package_smart(&self, identifier: &str) -> Result<Option<Package>> {
        let looks_like_nevra = regex::Regex::new(r"-\d+[.:]")
            .expect("static regex")
            .is_match(identifier);
        if looks_like_nevra {
            if let Some(package) = self.get_package_by_nevra(identifier).await? {
                return Ok(Some(package));
            }
            if let Some(m) = regex::Regex::new(r"^(.+?)-\d+[.:]")
                .expect("static regex")
                .captures(identifier)
            {
                return self.get_package(&m[1]).await;
            }
            Ok(None)
        } else {
            self.get_package(identifier).await
        }
    }

    pub async fn get_deps(&self, pkg_id: i64, table: &str) -> Result<Vec<String>> {
        debug_assert!(DEP_TABLES.contains(&table));
        let rows = sqlx::query(&format!(
            "SELECT capability FROM {table} WHERE pkg_id = ?"
        ))
        .bind(pkg_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    pub async fn whatprovides(&self, capability: &str) -> Result<Vec<Package>> {
        let rows = sqlx::query_as(
            "SELECT p.id, p.media_id, p.name, p.epoch, p.version, p.release, p.arch,
                    p.nevra, p.summary, p.size, p.filesize
            FROM packages p
            JOIN provides pr ON pr.pkg_id = p.id
            WHERE pr.capability = ?
            ORDER BY p.name_lower",
        )
        .bind(capability)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn whatdepends(
        &self,
        table: &str,
        capability: &str,
        limit: usize,
    ) -> Result<Vec<Package>> {
        debug_assert!(DEP_TABLES.contains(&table));
        let rows = sqlx::query_as(&format!(
            "SELECT p.id, p.media_id, p.name, p.epoch, p.version, p.release, p.arch,
                    p.nevra, p.summary, p.size, p.filesize
            FROM packages p
            JOIN {table} d ON d.pkg_id = p.id
            WHERE d.capability = ?
            ORDER BY p.name_lower
            LIMIT ?"
        ))
        .bind(capability)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn whatrequires(&self, capability: &str, limit: usize) -> Result<Vec<Package>> {
        self.whatdepends("requires", capability, limit).await
    }

    pub async fn whatrecommends(&self, capability: &str, limit: usize) -> Result<Vec<Package>> {
        self.whatdepends("recommends", capability, limit).await
    }

    pub async fn whatsuggests(&self, capability: &str, limit: usize) -> Result<Vec<Package>> {
        self.whatdepends("suggests", capability, limit).await
    }

    /// Stream all packages of a media for pool loading.
    pub async fn packages_for_media(&self, media_id: i64) -> Result<Vec<Package>> {
        let rows = sqlx::query_as(
            "SELECT id, media_id, name, epoch, version, release, arch, nevra, summary, size, filesize
            FROM packages WHERE media_id = ?",
        )
        .bind(media_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// All capability rows of one kind for a media, keyed by package id.
    pub async fn deps_for_media(&self, media_id: i64, table: &str) -> Result<Vec<(i64, String)>> {
        debug_assert!(DEP_TABLES.contains(&table));
        let rows = sqlx::query(&format!(
            "SELECT d.pkg_id, d.capability
            FROM {table} d
            JOIN packages pkg ON d.pkg_id = pkg.id
            WHERE pkg.media_id = ?"
        ))
        .bind(media_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect())
    }

    // ------------------------------------------------------------------
    // Pins
    // ------------------------------------------------------------------

    pub async fn add_pin(
        &self,
        package_pattern: &str,
        media_pattern: Option<&str>,
        priority: i64,
        version_pattern: Option<&str>,
        comment: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO pins (package_pattern, media_pattern, priority, version_pattern, comment, added_timestamp)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(package_pattern)
        .bind(media_pattern)
        .bind(priority)
        .bind(version_pattern)
        .bind(comment)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn remove_pin(&self, pin_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM pins WHERE id = ?")
            .bind(pin_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_pins(&self) -> Result<Vec<Pin>> {
        let pins = sqlx::query_as(
            "SELECT id, package_pattern, media_pattern, priority, version_pattern, comment
            FROM pins ORDER BY priority DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(pins)
    }

    /// Effective priority of a (package, media) pair: the highest matching
    /// pin wins, else the media's own priority.
    pub async fn pin_priority(&self, package_name: &str, media_name: &str) -> Result<i64> {
        for pin in self.list_pins().await? {
            let pkg_match = glob_match(&pin.package_pattern, package_name);
            let media_match = match &pin.media_pattern {
                None => true,
                Some(pattern) => glob_match(pattern, media_name),
            };
            if pkg_match && media_match {
                return Ok(pin.priority);
            }
        }
        let media = self.get_media(media_name).await?;
        Ok(media.map(|m| m.priority).unwrap_or(50))
    }

    // ------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO config (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn unset_config(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM config WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Held package name patterns (`held_packages` key, comma separated).
    pub async fn get_held_packages(&self) -> Result<Vec<String>> {
        let value = self.get_config("held_packages").await?.unwrap_or_default();
        Ok(value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn is_mirror_enabled(&self) -> Result<bool> {
        Ok(self
            .get_config("mirror_enabled")
            .await?
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false))
    }

    /// Background operations may not touch the rpmdb, they leave a one-shot
    /// note here instead; the next foreground command shows and clears it.
    pub async fn set_background_error(&self, message: &str) -> Result<()> {
        self.set_config("last_background_error", message).await
    }

    pub async fn take_background_error(&self) -> Result<Option<String>> {
        let value = self.get_config("last_background_error").await?;
        if value.is_some() {
            self.unset_config("last_background_error").await?;
        }
        Ok(value)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub async fn begin_history(&self, action: &str, command: Option<&str>) -> Result<i64> {
        let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
        let result = sqlx::query(
            "INSERT INTO history (timestamp, action, status, command, user)
            VALUES (?, ?, 'running', ?, ?)",
        )
        .bind(now())
        .bind(action)
        .bind(command)
        .bind(user)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn record_history_package(
        &self,
        history_id: i64,
        nevra: &str,
        name: &str,
        action: &str,
        reason: &str,
        previous_nevra: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO history_packages (history_id, pkg_nevra, pkg_name, action, reason, previous_nevra)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(history_id)
        .bind(nevra)
        .bind(name)
        .bind(action)
        .bind(reason)
        .bind(previous_nevra)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_history(&self, history_id: i64, return_code: i64) -> Result<()> {
        sqlx::query("UPDATE history SET status = 'complete', return_code = ? WHERE id = ?")
            .bind(return_code)
            .bind(history_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn abort_history(&self, history_id: i64) -> Result<()> {
        sqlx::query("UPDATE history SET status = 'interrupted', return_code = -1 WHERE id = ?")
            .bind(history_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_undone(&self, history_id: i64, undone_by: i64) -> Result<()> {
        sqlx::query("UPDATE history SET undone_by = ? WHERE id = ?")
            .bind(undone_by)
            .bind(history_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_history(
        &self,
        limit: usize,
        action_filter: Option<&str>,
    ) -> Result<Vec<HistoryEntry>> {
        let entries = match action_filter {
            Some(action) => {
                sqlx::query_as(
                    "SELECT * FROM history WHERE action = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
                )
                .bind(action)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM history ORDER BY timestamp DESC, id DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(entries)
    }

    pub async fn get_history(&self, history_id: i64) -> Result<Option<HistoryEntry>> {
        let entry = sqlx::query_as("SELECT * FROM history WHERE id = ?")
            .bind(history_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    pub async fn history_packages(&self, history_id: i64) -> Result<Vec<HistoryPackage>> {
        let packages = sqlx::query_as(
            "SELECT * FROM history_packages WHERE history_id = ? ORDER BY reason DESC, pkg_name",
        )
        .bind(history_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(packages)
    }

    pub async fn interrupted_history(&self) -> Result<Vec<HistoryEntry>> {
        let entries = sqlx::query_as(
            "SELECT * FROM history WHERE status = 'interrupted' ORDER BY timestamp DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Cache accounting
    // ------------------------------------------------------------------

    pub async fn register_cache_file(
        &self,
        filename: &str,
        media_id: i64,
        file_path: &str,
        file_size: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT OR REPLACE INTO cache_files
            (filename, media_id, file_path, file_size, is_referenced, last_accessed, added_timestamp)
            VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(filename)
        .bind(media_id)
        .bind(file_path)
        .bind(file_size)
        .bind(now())
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Touch a file's access time (LRU input).
    pub async fn touch_cache_file(&self, filename: &str, media_id: i64) -> Result<()> {
        sqlx::query("UPDATE cache_files SET last_accessed = ? WHERE filename = ? AND media_id = ?")
            .bind(now())
            .bind(filename)
            .bind(media_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_cache_file(&self, filename: &str, media_id: i64) -> Result<Option<CacheFile>> {
        let file = sqlx::query_as(
            "SELECT id, filename, media_id, file_path, file_size, is_referenced, last_accessed
            FROM cache_files WHERE filename = ? AND media_id = ?",
        )
        .bind(filename)
        .bind(media_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(file)
    }

    pub async fn list_cache_files(&self, media_id: Option<i64>) -> Result<Vec<CacheFile>> {
        let files = match media_id {
            Some(media_id) => {
                sqlx::query_as(
                    "SELECT id, filename, media_id, file_path, file_size, is_referenced, last_accessed
                    FROM cache_files WHERE media_id = ?",
                )
                .bind(media_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, filename, media_id, file_path, file_size, is_referenced, last_accessed
                    FROM cache_files",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(files)
    }

    pub async fn delete_cache_file(&self, filename: &str, media_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM cache_files WHERE filename = ? AND media_id = ?")
            .bind(filename)
            .bind(media_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// After a sync: any cached file of the media whose name is absent from
    /// the new synthesis loses its reference bit.
    pub async fn mark_cache_files_unreferenced(
        &self,
        media_id: i64,
        current_filenames: &HashSet<String>,
    ) -> Result<usize> {
        let files = self.list_cache_files(Some(media_id)).await?;
        let mut marked = 0;
        for file in files {
            let referenced = current_filenames.contains(&file.filename);
            if referenced != file.is_referenced {
                sqlx::query("UPDATE cache_files SET is_referenced = ? WHERE id = ?")
                    .bind(referenced)
                    .bind(file.id)
                    .execute(&self.pool)
                    .await?;
                if !referenced {
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    #[cfg(test)]
    pub async fn backdate_cache_file(&self, id: i64, when: i64) -> Result<()> {
        sqlx::query("UPDATE cache_files SET last_accessed = ? WHERE id = ?")
            .bind(when)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Eviction candidates, least recently accessed first.
    pub async fn files_to_evict(
        &self,
        media_id: Option<i64>,
        max_age_days: Option<i64>,
        max_bytes: Option<i64>,
    ) -> Result<Vec<CacheFile>> {
        let mut sql = String::from(
            "SELECT id, filename, media_id, file_path, file_size, is_referenced, last_accessed
            FROM cache_files WHERE 1=1",
        );
        if media_id.is_some() {
            sql.push_str(" AND media_id = ?");
        }
        if max_age_days.is_some() {
            sql.push_str(" AND last_accessed < ?");
        }
        sql.push_str(" ORDER BY last_accessed ASC");

        let mut query = sqlx::query_as::<_, CacheFile>(&sql);
        if let Some(media_id) = media_id {
            query = query.bind(media_id);
        }
        if let Some(days) = max_age_days {
            query = query.bind(now() - days * 86400);
        }
        let files = query.fetch_all(&self.pool).await?;

        if let Some(max_bytes) = max_bytes {
            let mut total = 0;
            let mut limited = Vec::new();
            for file in files {
                if total >= max_bytes {
                    break;
                }
                total += file.file_size;
                limited.push(file);
            }
            Ok(limited)
        } else {
            Ok(files)
        }
    }

    pub async fn cache_usage(&self, media_id: Option<i64>) -> Result<(i64, i64)> {
        let row = match media_id {
            Some(media_id) => {
                sqlx::query(
                    "SELECT COALESCE(SUM(file_size), 0), COUNT(*) FROM cache_files WHERE media_id = ?",
                )
                .bind(media_id)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT COALESCE(SUM(file_size), 0), COUNT(*) FROM cache_files")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok((row.get(0), row.get(1)))
    }

    // ------------------------------------------------------------------
    // Peer provenance and blacklist
    // ------------------------------------------------------------------

    pub async fn record_peer_download(
        &self,
        filename: &str,
        file_path: &str,
        peer_host: &str,
        peer_port: u16,
        file_size: Option<i64>,
        checksum_sha256: Option<&str>,
        verified: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO peer_downloads
            (filename, file_path, peer_host, peer_port, download_time, file_size, checksum_sha256, verified)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(filename)
        .bind(file_path)
        .bind(peer_host)
        .bind(peer_port as i64)
        .bind(now())
        .bind(file_size)
        .bind(checksum_sha256)
        .bind(verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_peer_downloads(
        &self,
        peer_host: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PeerDownload>> {
        let downloads = match peer_host {
            Some(host) => {
                sqlx::query_as(
                    "SELECT * FROM peer_downloads WHERE peer_host = ?
                    ORDER BY download_time DESC LIMIT ?",
                )
                .bind(host)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM peer_downloads ORDER BY download_time DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(downloads)
    }

    pub async fn get_peer_stats(&self) -> Result<Vec<PeerStats>> {
        let stats = sqlx::query_as(
            "SELECT peer_host, peer_port,
                    COUNT(*) as download_count,
                    SUM(file_size) as total_bytes,
                    MIN(download_time) as first_download,
                    MAX(download_time) as last_download,
                    SUM(CASE WHEN verified = 1 THEN 1 ELSE 0 END) as verified_count
            FROM peer_downloads
            GROUP BY peer_host, peer_port
            ORDER BY download_count DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(stats)
    }

    pub async fn delete_peer_downloads(&self, peer_host: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM peer_downloads WHERE peer_host = ?")
            .bind(peer_host)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_files_from_peer(&self, peer_host: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT file_path FROM peer_downloads WHERE peer_host = ?")
            .bind(peer_host)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    pub async fn delete_peer_download_by_path(&self, file_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM peer_downloads WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn blacklist_peer(
        &self,
        peer_host: &str,
        peer_port: Option<u16>,
        reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO peer_blacklist (peer_host, peer_port, reason, blacklist_time)
            VALUES (?, ?, ?, ?)",
        )
        .bind(peer_host)
        .bind(peer_port.map(|p| p as i64))
        .bind(reason)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unblacklist_peer(&self, peer_host: &str, peer_port: Option<u16>) -> Result<()> {
        match peer_port {
            Some(port) => {
                sqlx::query("DELETE FROM peer_blacklist WHERE peer_host = ? AND peer_port = ?")
                    .bind(peer_host)
                    .bind(port as i64)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM peer_blacklist WHERE peer_host = ?")
                    .bind(peer_host)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn is_peer_blacklisted(&self, peer_host: &str, peer_port: u16) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM peer_blacklist
            WHERE peer_host = ? AND (peer_port = ? OR peer_port IS NULL)",
        )
        .bind(peer_host)
        .bind(peer_port as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn list_blacklisted_peers(&self) -> Result<Vec<(String, Option<i64>, Option<String>)>> {
        let rows = sqlx::query(
            "SELECT peer_host, peer_port, reason FROM peer_blacklist ORDER BY blacklist_time DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get(0), row.get(1), row.get(2)))
            .collect())
    }

    // ------------------------------------------------------------------
    // Stats and maintenance
    // ------------------------------------------------------------------

    pub async fn get_stats(&self) -> Result<StoreStats> {
        let packages = sqlx::query_scalar("SELECT COUNT(*) FROM packages")
            .fetch_one(&self.pool)
            .await?;
        let provides = sqlx::query_scalar("SELECT COUNT(*) FROM provides")
            .fetch_one(&self.pool)
            .await?;
        let requires = sqlx::query_scalar("SELECT COUNT(*) FROM requires")
            .fetch_one(&self.pool)
            .await?;
        let media = sqlx::query_scalar("SELECT COUNT(*) FROM media")
            .fetch_one(&self.pool)
            .await?;
        let db_size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(StoreStats {
            packages,
            provides,
            requires,
            media,
            db_size,
            db_path: self.path.display().to_string(),
        })
    }

    /// Rebuild derived index structures, driven by POST /api/rebuild-fts.
    pub async fn rebuild_indexes(&self) -> Result<()> {
        sqlx::raw_sql("REINDEX; ANALYZE;").execute(&self.pool).await?;
        Ok(())
    }
}
