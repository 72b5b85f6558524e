//! Daemon HTTP surface: the discovery/announce contract, peer-facing
//! media file serving, and the cache index invalidation hook.

use crate::config::Context;
use crate::db::Database;
use crate::discovery::{AnnouncePayload, PeerDiscovery};
use crate::errors::*;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::Filter;

impl warp::reject::Reject for Error {}

fn with_db(db: Database) -> impl Filter<Extract = (Database,), Error = Infallible> + Clone {
    warp::any().map(move || db.clone())
}

fn with_discovery(
    discovery: Arc<PeerDiscovery>,
) -> impl Filter<Extract = (Arc<PeerDiscovery>,), Error = Infallible> + Clone {
    warp::any().map(move || discovery.clone())
}

async fn media_list(db: Database) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let media = db.list_media().await.map_err(warp::reject::custom)?;
    Ok(warp::reply::json(&json!({ "media": media })))
}

async fn announce(
    discovery: Arc<PeerDiscovery>,
    payload: AnnouncePayload,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    info!(
        "Announce from {}:{} ({} media)",
        payload.host,
        payload.port,
        payload.media.len()
    );
    discovery.register_peer(payload);
    Ok(warp::reply::json(
        &json!({ "status": "ok", "registered": true }),
    ))
}

async fn peer_list(
    discovery: Arc<PeerDiscovery>,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    Ok(warp::reply::json(
        &json!({ "peers": discovery.get_peers() }),
    ))
}

async fn rebuild_fts(db: Database) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    db.rebuild_indexes().await.map_err(warp::reject::custom)?;
    Ok(warp::reply::json(&json!({ "status": "ok" })))
}

async fn handle_rejection(
    err: warp::Rejection,
) -> std::result::Result<impl warp::Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(error) = err.find::<Error>() {
        error!("Request failed: {error}");
        (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    } else {
        (StatusCode::BAD_REQUEST, "bad request".to_string())
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": message })),
        code,
    ))
}

pub fn routes(
    ctx: Context,
    db: Database,
    discovery: Arc<PeerDiscovery>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
    let api_media = warp::get()
        .and(warp::path!("api" / "media"))
        .and(with_db(db.clone()))
        .and_then(media_list);

    let api_announce = warp::post()
        .and(warp::path!("api" / "announce"))
        .and(with_discovery(discovery.clone()))
        .and(warp::body::json())
        .and_then(announce);

    let api_peers = warp::get()
        .and(warp::path!("api" / "peers"))
        .and(with_discovery(discovery))
        .and_then(peer_list);

    let api_rebuild = warp::post()
        .and(warp::path!("api" / "rebuild-fts"))
        .and(with_db(db))
        .and_then(rebuild_fts);

    // the media cache tree, served to peers
    let medias = warp::path("medias").and(warp::fs::dir(ctx.medias_dir()));

    api_media
        .or(api_announce)
        .or(api_peers)
        .or(api_rebuild)
        .or(medias)
        .recover(handle_rejection)
}

/// Run the daemon HTTP endpoint; never returns under normal operation.
pub async fn run(ctx: &Context, db: Database, discovery: Arc<PeerDiscovery>) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], ctx.daemon_port).into();
    info!("Daemon listening on http://{addr}");
    warp::serve(routes(ctx.clone(), db, discovery)).run(addr).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewMedia;

    async fn test_state() -> (Context, Database, Arc<PeerDiscovery>, tempfile::TempDir) {
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let db = Database::open_memory().await.unwrap();
        db.add_media(&NewMedia {
            name: "Core Release".to_string(),
            mageia_version: Some("9".to_string()),
            enabled: true,
            priority: 50,
            ..Default::default()
        })
        .await
        .unwrap();
        let discovery = PeerDiscovery::new(ctx.clone(), db.clone(), ctx.daemon_port);
        (ctx, db, discovery, base)
    }

    #[tokio::test]
    async fn test_api_media() {
        let (ctx, db, discovery, _base) = test_state().await;
        let filter = routes(ctx.clone(), db, discovery);

        let resp = warp::test::request()
            .method("GET")
            .path("/api/media")
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["media"][0]["name"], "Core Release");
    }

    #[tokio::test]
    async fn test_api_announce_registers_peer() {
        let (ctx, db, discovery, _base) = test_state().await;
        let filter = routes(ctx.clone(), db, discovery.clone());

        let resp = warp::test::request()
            .method("POST")
            .path("/api/announce")
            .json(&serde_json::json!({
                "host": "192.168.1.20",
                "port": 9876,
                "media": ["Core Release"],
                "mirror_enabled": true,
                "local_version": "9",
                "local_arch": "x86_64",
                "served_media": [{"version": "9", "arch": "x86_64", "types": ["core-release"]}]
            }))
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 200);

        let peers = discovery.get_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].host, "192.168.1.20");
        assert!(peers[0].mirror_enabled);
        assert!(peers[0].serves_version("9", Some("x86_64")));

        let resp = warp::test::request()
            .method("GET")
            .path("/api/peers")
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["peers"][0]["host"], "192.168.1.20");
    }

    #[tokio::test]
    async fn test_medias_file_serving() {
        let (ctx, db, discovery, _base) = test_state().await;
        let dir = ctx.medias_dir().join("local/Core Release");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("vim-9.0-1.mga9.x86_64.rpm"), b"rpmbytes")
            .await
            .unwrap();
        let filter = routes(ctx.clone(), db, discovery);

        let resp = warp::test::request()
            .method("GET")
            .path("/medias/local/Core%20Release/vim-9.0-1.mga9.x86_64.rpm")
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body().as_ref(), b"rpmbytes");
    }

    #[tokio::test]
    async fn test_rebuild_fts() {
        let (ctx, db, discovery, _base) = test_state().await;
        let filter = routes(ctx.clone(), db, discovery);
        let resp = warp::test::request()
            .method("POST")
            .path("/api/rebuild-fts")
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 200);
    }
}
