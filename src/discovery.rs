//! LAN peer discovery: UDP broadcast announcements plus a bidirectional
//! HTTP announce exchange, so peers learn each other's served media and
//! can be used as download sources.

use crate::config::Context;
use crate::db::Database;
use crate::errors::*;
use crate::utils::{self, IpMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;

pub const DISCOVERY_MAGIC: &[u8] = b"URPMD1";
const MIN_BROADCAST_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct BroadcastMessage {
    pub host: String,
    pub port: u16,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServedMedia {
    pub version: String,
    pub arch: String,
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncePayload {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub mirror_enabled: bool,
    #[serde(default)]
    pub local_version: String,
    #[serde(default)]
    pub local_arch: String,
    #[serde(default)]
    pub served_media: Vec<ServedMedia>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    pub media: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub version: String,
    pub mirror_enabled: bool,
    pub local_version: String,
    pub local_arch: String,
    pub served_media: Vec<ServedMedia>,
}

impl Peer {
    pub fn is_alive(&self, timeout: Duration) -> bool {
        let age = Utc::now() - self.last_seen;
        age.num_seconds() >= 0 && (age.num_seconds() as u64) < timeout.as_secs()
    }

    pub fn serves_version(&self, version: &str, arch: Option<&str>) -> bool {
        self.served_media.iter().any(|sm| {
            sm.version == version && arch.map(|a| sm.arch == a).unwrap_or(true)
        })
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Encode a broadcast datagram: 6-byte magic followed by compact JSON.
pub fn encode_broadcast(message: &BroadcastMessage) -> Result<Vec<u8>> {
    let mut data = DISCOVERY_MAGIC.to_vec();
    data.extend(serde_json::to_vec(message)?);
    Ok(data)
}

/// Decode a broadcast datagram; anything without our magic is not for us.
pub fn decode_broadcast(data: &[u8]) -> Option<BroadcastMessage> {
    let payload = data.strip_prefix(DISCOVERY_MAGIC)?;
    serde_json::from_slice(payload).ok()
}

pub struct PeerDiscovery {
    ctx: Context,
    /// own store handle: discovery runs beside the main command path
    db: Database,
    daemon_port: u16,
    peers: Mutex<HashMap<String, Peer>>,
    local_arch: String,
}

impl PeerDiscovery {
    pub fn new(ctx: Context, db: Database, daemon_port: u16) -> Arc<PeerDiscovery> {
        Arc::new(PeerDiscovery {
            ctx,
            db,
            daemon_port,
            peers: Mutex::new(HashMap::new()),
            local_arch: std::env::consts::ARCH.to_string(),
        })
    }

    /// Known live peers; dead ones are purged lazily on each call.
    pub fn get_peers(&self) -> Vec<Peer> {
        let timeout = self.ctx.peer_timeout;
        let mut peers = self.peers.lock().expect("peer map poisoned");
        peers.retain(|key, peer| {
            let alive = peer.is_alive(timeout);
            if !alive {
                debug!("Removing dead peer: {key}");
            }
            alive
        });
        let mut list: Vec<Peer> = peers.values().cloned().collect();
        list.sort_by(|a, b| a.key().cmp(&b.key()));
        list
    }

    /// Register or refresh a peer from an announce payload.
    pub fn register_peer(&self, payload: AnnouncePayload) {
        let key = format!("{}:{}", payload.host, payload.port);
        let mut peers = self.peers.lock().expect("peer map poisoned");
        match peers.get_mut(&key) {
            Some(peer) => {
                peer.media = payload.media;
                peer.last_seen = Utc::now();
                peer.mirror_enabled = payload.mirror_enabled;
                peer.local_version = payload.local_version;
                peer.local_arch = payload.local_arch;
                peer.served_media = payload.served_media;
                debug!("Updated peer: {key}");
            }
            None => {
                info!(
                    "New peer discovered: {key} with {} media",
                    payload.media.len()
                );
                peers.insert(
                    key,
                    Peer {
                        host: payload.host,
                        port: payload.port,
                        media: payload.media,
                        last_seen: Utc::now(),
                        version: String::new(),
                        mirror_enabled: payload.mirror_enabled,
                        local_version: payload.local_version,
                        local_arch: payload.local_arch,
                        served_media: payload.served_media,
                    },
                );
            }
        }
    }

    /// Spawn the broadcast and listener loops.
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let broadcaster = self.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = broadcaster.broadcast_loop().await {
                error!("Discovery broadcast loop ended: {err}");
            }
        }));

        let listener = self.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = listener.listen_loop().await {
                error!("Discovery listener ended: {err}");
            }
        }));

        handles
    }

    async fn broadcast_loop(&self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;

        // initial random delay de-synchronizes a fleet booting together
        let interval = self.ctx.broadcast_interval.as_secs().max(2);
        let initial = fastrand::u64(1..=interval / 2);
        debug!("Discovery: first broadcast in {initial}s");
        tokio::time::sleep(Duration::from_secs(initial)).await;

        loop {
            let message = BroadcastMessage {
                host: local_ip(),
                port: self.daemon_port,
                version: env!("CARGO_PKG_VERSION").to_string(),
            };
            match encode_broadcast(&message) {
                Ok(data) => {
                    if let Err(err) = socket
                        .send_to(&data, ("255.255.255.255", self.ctx.discovery_port))
                        .await
                    {
                        debug!("Broadcast send failed: {err}");
                    }
                }
                Err(err) => debug!("Broadcast encode failed: {err}"),
            }

            // +-30% jitter keeps a LAN of peers from synchronizing
            let jitter = 1.0 + (fastrand::f64() * 0.6 - 0.3);
            let sleep = Duration::from_secs_f64(interval as f64 * jitter)
                .max(MIN_BROADCAST_INTERVAL);
            tokio::time::sleep(sleep).await;
        }
    }

    async fn listen_loop(&self) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.ctx.discovery_port)).await?;
        socket.set_broadcast(true)?;
        info!(
            "Peer discovery listening on UDP port {}",
            self.ctx.discovery_port
        );

        let mut buf = [0u8; 4096];
        loop {
            let (len, addr) = socket.recv_from(&mut buf).await?;
            self.handle_broadcast(&buf[..len], addr).await;
        }
    }

    async fn handle_broadcast(&self, data: &[u8], addr: SocketAddr) {
        let Some(message) = decode_broadcast(data) else {
            return;
        };
        let peer_host = if message.host.is_empty() {
            addr.ip().to_string()
        } else {
            message.host
        };
        if self.is_self(&peer_host, message.port) {
            return;
        }
        debug!("Received broadcast from {peer_host}:{}", message.port);
        self.contact_peer(&peer_host, message.port).await;
    }

    /// Fetch the peer's media list, register it, and announce ourselves
    /// back so the exchange is bidirectional.
    async fn contact_peer(&self, host: &str, port: u16) {
        let key = format!("{host}:{port}");
        {
            let peers = self.peers.lock().expect("peer map poisoned");
            if let Some(peer) = peers.get(&key) {
                // seen recently enough, skip the extra round trip
                let age = Utc::now() - peer.last_seen;
                if age.num_seconds() >= 0
                    && (age.num_seconds() as u64) < self.ctx.broadcast_interval.as_secs() / 2
                {
                    return;
                }
            }
        }

        let Ok(client) = utils::http_client(IpMode::Auto) else {
            return;
        };

        #[derive(Deserialize)]
        struct MediaList {
            media: Vec<MediaEntry>,
        }
        #[derive(Deserialize)]
        struct MediaEntry {
            name: String,
        }

        let url = format!("http://{host}:{port}/api/media");
        let media = match client.get_json::<MediaList>(&url).await {
            Ok(list) => list.media.into_iter().map(|m| m.name).collect(),
            Err(err) => {
                debug!("Could not contact peer {key}: {err}");
                return;
            }
        };

        self.register_peer(AnnouncePayload {
            host: host.to_string(),
            port,
            media,
            mirror_enabled: false,
            local_version: String::new(),
            local_arch: String::new(),
            served_media: Vec::new(),
        });

        match self.build_announce_payload().await {
            Ok(payload) => {
                let url = format!("http://{host}:{port}/api/announce");
                if let Err(err) = client.post_json(&url, &payload).await {
                    debug!("Could not announce to peer {key}: {err}");
                } else {
                    debug!("Announced to peer {key}");
                }
            }
            Err(err) => debug!("Could not build announce payload: {err}"),
        }
    }

    /// Our own announce payload: media names plus shared enabled media
    /// grouped by (version, arch) into served_media entries.
    pub async fn build_announce_payload(&self) -> Result<AnnouncePayload> {
        let mirror_enabled = self.db.is_mirror_enabled().await?;
        let media_list = self.db.list_media().await?;

        let mut media_names = Vec::new();
        let mut local_version = String::new();
        let mut groups: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();

        for media in media_list {
            media_names.push(media.name.clone());
            if local_version.is_empty() && media.enabled {
                if let Some(version) = &media.mageia_version {
                    local_version = version.clone();
                }
            }
            if mirror_enabled && media.shared && media.enabled {
                let key = (
                    media.mageia_version.clone().unwrap_or_default(),
                    media.architecture.clone().unwrap_or_default(),
                );
                groups
                    .entry(key)
                    .or_default()
                    .push(media.short_name.unwrap_or(media.name));
            }
        }

        let served_media = groups
            .into_iter()
            .map(|((version, arch), types)| ServedMedia {
                version,
                arch,
                types,
            })
            .collect();

        Ok(AnnouncePayload {
            host: local_ip(),
            port: self.daemon_port,
            media: media_names,
            mirror_enabled,
            local_version,
            local_arch: self.local_arch.clone(),
            served_media,
        })
    }

    fn is_self(&self, host: &str, port: u16) -> bool {
        if port != self.daemon_port {
            return false;
        }
        host == local_ip() || host == "127.0.0.1" || host == "localhost" || host == "::1"
    }
}

/// The address peers should reach us at: the source address of a dummy
/// outbound socket, falling back to loopback on isolated hosts.
pub fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewMedia;

    fn payload(host: &str, port: u16, media: &[&str]) -> AnnouncePayload {
        AnnouncePayload {
            host: host.to_string(),
            port,
            media: media.iter().map(|s| s.to_string()).collect(),
            mirror_enabled: false,
            local_version: String::new(),
            local_arch: String::new(),
            served_media: Vec::new(),
        }
    }

    #[test]
    fn test_broadcast_roundtrip() {
        let message = BroadcastMessage {
            host: "192.168.1.10".to_string(),
            port: 9876,
            version: "0.1.0".to_string(),
        };
        let data = encode_broadcast(&message).unwrap();
        assert!(data.starts_with(b"URPMD1"));
        let decoded = decode_broadcast(&data).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_rejects_foreign_datagrams() {
        assert!(decode_broadcast(b"NOTUS{\"host\":\"x\"}").is_none());
        assert!(decode_broadcast(b"URPMD1not json").is_none());
        assert!(decode_broadcast(b"").is_none());
    }

    #[tokio::test]
    async fn test_register_peer_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let db = Database::open_memory().await.unwrap();
        let discovery = PeerDiscovery::new(ctx, db, 9877);

        discovery.register_peer(payload("192.168.1.10", 9876, &["Core Release"]));
        let first_seen = discovery.get_peers()[0].last_seen;

        discovery.register_peer(payload(
            "192.168.1.10",
            9876,
            &["Core Release", "Core Updates"],
        ));
        let peers = discovery.get_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].media.len(), 2);
        assert!(peers[0].last_seen >= first_seen);
    }

    #[tokio::test]
    async fn test_dead_peers_purged() {
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let db = Database::open_memory().await.unwrap();
        let discovery = PeerDiscovery::new(ctx, db, 9877);

        discovery.register_peer(payload("192.168.1.10", 9876, &[]));
        {
            let mut peers = discovery.peers.lock().unwrap();
            let peer = peers.get_mut("192.168.1.10:9876").unwrap();
            peer.last_seen = Utc::now() - chrono::TimeDelta::seconds(3600);
        }
        assert!(discovery.get_peers().is_empty());
    }

    #[test]
    fn test_serves_version() {
        let mut peer = Peer {
            host: "10.0.0.2".to_string(),
            port: 9876,
            media: vec![],
            last_seen: Utc::now(),
            version: String::new(),
            mirror_enabled: true,
            local_version: "9".to_string(),
            local_arch: "x86_64".to_string(),
            served_media: vec![ServedMedia {
                version: "9".to_string(),
                arch: "x86_64".to_string(),
                types: vec!["core-release".to_string()],
            }],
        };
        assert!(peer.serves_version("9", None));
        assert!(peer.serves_version("9", Some("x86_64")));
        assert!(!peer.serves_version("9", Some("aarch64")));
        assert!(!peer.serves_version("cauldron", None));
        peer.served_media.clear();
        assert!(!peer.serves_version("9", None));
    }

    #[tokio::test]
    async fn test_announce_payload_served_media_grouping() {
        let base = tempfile::tempdir().unwrap();
        let ctx = Context::with_base_dir(base.path().to_path_buf(), true);
        let db = Database::open_memory().await.unwrap();
        db.set_config("mirror_enabled", "1").await.unwrap();
        for (name, short, version) in [
            ("Core Release", "core-release", "9"),
            ("Core Updates", "core-updates", "9"),
            ("Cauldron Core", "core-release", "cauldron"),
        ] {
            db.add_media(&NewMedia {
                name: name.to_string(),
                short_name: Some(short.to_string()),
                mageia_version: Some(version.to_string()),
                architecture: Some("x86_64".to_string()),
                enabled: true,
                priority: 50,
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let discovery = PeerDiscovery::new(ctx, db, 9877);
        let payload = discovery.build_announce_payload().await.unwrap();
        assert!(payload.mirror_enabled);
        assert_eq!(payload.media.len(), 3);
        assert_eq!(payload.served_media.len(), 2);
        let nine = payload
            .served_media
            .iter()
            .find(|sm| sm.version == "9")
            .unwrap();
        assert_eq!(nine.arch, "x86_64");
        assert_eq!(nine.types, vec!["core-release", "core-updates"]);
    }
}
