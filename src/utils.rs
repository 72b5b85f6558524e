use crate::errors::*;
use futures::TryStreamExt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::fs;
use tokio::io::{self, AsyncRead};
use tokio_util::io::StreamReader;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const USER_AGENT: &str = concat!("urpm/", env!("CARGO_PKG_VERSION"));

/// Connectivity-detected address family of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpMode {
    #[default]
    Auto,
    Ipv4,
    Ipv6,
    Dual,
}

impl IpMode {
    pub fn parse(s: &str) -> IpMode {
        match s {
            "ipv4" => IpMode::Ipv4,
            "ipv6" => IpMode::Ipv6,
            "dual" => IpMode::Dual,
            _ => IpMode::Auto,
        }
    }
}

pub fn http_client(ip_mode: IpMode) -> Result<HttpClient> {
    let mut http = reqwest::ClientBuilder::new();
    // Binding the local side to one family constrains name resolution to
    // addresses we can actually reach.
    match ip_mode {
        IpMode::Ipv4 => {
            http = http.local_address(Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        }
        IpMode::Ipv6 => {
            http = http.local_address(Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        }
        IpMode::Auto | IpMode::Dual => (),
    }
    let http = http
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .build()?;
    Ok(HttpClient { reqwest: http })
}

#[derive(Clone)]
pub struct HttpClient {
    reqwest: reqwest::Client,
}

impl HttpClient {
    /// Open a url as an async byte stream. `file://` urls read straight from
    /// disk so local mirrors work without a server.
    pub async fn fetch(&self, url: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        if let Some(path) = url.strip_prefix("file://") {
            let file = fs::File::open(path).await?;
            return Ok(Box::new(file));
        }
        let resp = self.reqwest.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::HttpStatus(resp.status().as_u16(), url.to_string()));
        }
        let stream = resp.bytes_stream();
        let stream = StreamReader::new(stream.map_err(io::Error::other));
        Ok(Box::new(stream))
    }

    /// Fetch a small resource fully into memory.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        use tokio::io::AsyncReadExt;
        let mut reader = self.fetch(url).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self.reqwest.get(url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn post_json<T: serde::Serialize>(&self, url: &str, body: &T) -> Result<()> {
        self.reqwest
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub fn format_size(size_bytes: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let size = size_bytes as f64;
    if size < KB {
        format!("{size_bytes} B")
    } else if size < MB {
        format!("{:.1} KB", size / KB)
    } else if size < GB {
        format!("{:.1} MB", size / MB)
    } else {
        format!("{:.2} GB", size / GB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_mode_parse() {
        assert_eq!(IpMode::parse("ipv4"), IpMode::Ipv4);
        assert_eq!(IpMode::parse("ipv6"), IpMode::Ipv6);
        assert_eq!(IpMode::parse("dual"), IpMode::Dual);
        assert_eq!(IpMode::parse("auto"), IpMode::Auto);
        assert_eq!(IpMode::parse("bogus"), IpMode::Auto);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[tokio::test]
    async fn test_fetch_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MD5SUM");
        tokio::fs::write(&path, b"abc  synthesis.hdlist.cz\n")
            .await
            .unwrap();
        let client = http_client(IpMode::Auto).unwrap();
        let url = format!("file://{}", path.display());
        let bytes = client.fetch_bytes(&url).await.unwrap();
        assert_eq!(bytes, b"abc  synthesis.hdlist.cz\n");
    }
}
