//! HTTP tracker client with query encoding and compact peer parsing

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;

use super::types::{AnnounceRequest, AnnounceResponse, TrackerClient};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// Size of one compact peer entry: IPv4 address plus port
pub const COMPACT_PEER_SIZE: usize = 6;

/// HTTP tracker client
#[derive(Debug, Clone)]
pub struct HttpTrackerClient {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates a client for `announce_url` using the configured timeout and user agent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UrlParsing` - If `announce_url` is not a valid URL
    /// - `TorrentError::Http` - If the HTTP client cannot be built
    pub fn new(announce_url: String, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let parsed = url::Url::parse(&announce_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TorrentError::TrackerConnectionFailed {
                url: format!("Unsupported tracker scheme in {announce_url}"),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            announce_url,
            client,
        })
    }

    /// Builds the GET URL. Parameters are encoded by hand so binary ids are
    /// not re-encoded by a URL library.
    pub(crate) fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let separator = if self.announce_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}",
            self.announce_url,
            separator,
            url_encode_bytes(request.info_hash.as_bytes()),
            url_encode_bytes(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(event) = request.event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }
        url
    }

    /// Decodes a bencoded announce reply.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerFailure` - Reply carries a `failure reason`
    /// - `TorrentError::ProtocolError` - Reply is not a dictionary or peers are malformed
    pub(crate) fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TorrentError> {
        let parsed = bencode_rs::Value::parse(body).map_err(|e| TorrentError::ProtocolError {
            message: format!("Failed to parse tracker response: {e:?}"),
        })?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(TorrentError::ProtocolError {
                message: "Invalid tracker response format".to_string(),
            });
        };

        if let Some(bencode_rs::Value::Bytes(reason)) = dict.get(b"failure reason".as_slice()) {
            return Err(TorrentError::TrackerFailure {
                reason: String::from_utf8_lossy(reason).into_owned(),
            });
        }

        let interval = match dict.get(b"interval".as_slice()) {
            Some(bencode_rs::Value::Integer(value)) => u32::try_from(*value).ok(),
            _ => None,
        };

        let peers = match dict.get(b"peers".as_slice()) {
            Some(bencode_rs::Value::Bytes(peer_data)) => parse_compact_peers(peer_data)?,
            _ => Vec::new(),
        };

        Ok(AnnounceResponse { interval, peers })
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(&request);
        tracing::debug!(
            "Announcing to {} (event: {:?}, left: {})",
            self.announce_url,
            request.event,
            request.left
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::warn!("HTTP request to {} failed: {}", self.announce_url, e);
            TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("Tracker {} returned status {}", self.announce_url, status);
            return Err(TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            });
        }

        let body = response.bytes().await?;
        let parsed = Self::parse_announce_response(&body)?;
        tracing::info!(
            "Tracker {} returned {} peers",
            self.announce_url,
            parsed.peers.len()
        );
        Ok(parsed)
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}

/// Percent-encodes bytes for a tracker query.
///
/// ASCII letters, digits and `_.*-/` pass through, a space becomes `+`,
/// everything else is `%XX` in upper-case hex.
pub fn url_encode_bytes(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'.' | b'*' | b'-' | b'/' => {
                encoded.push(byte as char);
            }
            b' ' => encoded.push('+'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Parses the compact `peers` string: 4 address bytes then a big-endian port.
///
/// # Errors
///
/// - `TorrentError::ProtocolError` - Length is not a multiple of 6
pub fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
    if peer_bytes.len() % COMPACT_PEER_SIZE != 0 {
        return Err(TorrentError::ProtocolError {
            message: "Invalid compact peer data length".to_string(),
        });
    }

    Ok(peer_bytes
        .chunks_exact(COMPACT_PEER_SIZE)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}
