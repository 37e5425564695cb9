use std::collections::HashMap;

use super::error::NetError;
use crate::protocol::base32_decode_loose;
use crate::treehash::TreeHash;

/// Transport a hub URL selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `adc://` - plain TCP.
    Adc,
    /// `adcs://` - TLS on the same port.
    Adcs,
}

/// A parsed `adc://` or `adcs://` hub address.
///
/// ```text
/// adc[s]://[user[:password]@]host:port[?kp=SHA256/<base32>]
/// ```
#[derive(Debug, Clone)]
pub struct HubUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Decoded SHA-256 certificate pin from the `kp` parameter.
    pub keyprint: Option<[u8; 32]>,
    /// Remaining query parameters, kept for URLs that embed file fields.
    query: HashMap<String, Vec<String>>,
}

impl HubUrl {
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| NetError::InvalidUrl(url.to_string()))?;
        let scheme = match scheme {
            "adc" => Scheme::Adc,
            "adcs" => Scheme::Adcs,
            other => return Err(NetError::UnknownScheme(other.to_string())),
        };

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, parse_query_string(query)),
            None => (rest, HashMap::new()),
        };
        let authority = authority.trim_end_matches('/');

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };
        let (username, password) = match userinfo {
            Some(userinfo) => match userinfo.split_once(':') {
                Some((user, pass)) => (Some(url_decode(user)), Some(url_decode(pass))),
                None => (Some(url_decode(userinfo)), None),
            },
            None => (None, None),
        };

        let (host, port) = if let Some(bracketed) = hostport.strip_prefix('[') {
            // [v6-address]:port
            let (host, rest) = bracketed
                .split_once(']')
                .ok_or_else(|| NetError::InvalidUrl(url.to_string()))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| NetError::InvalidUrl(url.to_string()))?;
            (host.to_string(), port)
        } else {
            let (host, port) = hostport
                .rsplit_once(':')
                .ok_or_else(|| NetError::InvalidUrl(url.to_string()))?;
            (host.to_string(), port)
        };
        let port: u16 = port
            .parse()
            .map_err(|_| NetError::InvalidUrl(url.to_string()))?;

        let keyprint = match query.get("kp").and_then(|v| v.first()) {
            Some(kp) => Some(parse_keyprint(kp)?),
            None => None,
        };

        Ok(Self {
            scheme,
            host,
            port,
            username,
            password,
            keyprint,
            query,
        })
    }

    /// First value of a raw query parameter.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    /// File fields (`dn`, `xl`, `xt`) embedded directly in the hub URL's
    /// query, as accepted alongside real magnet links.
    pub fn embedded_magnet(&self) -> Result<MagnetLink, NetError> {
        magnet_from_params(&self.query)
    }
}

/// Parses `SHA256/<base32>` into the pinned digest.
fn parse_keyprint(kp: &str) -> Result<[u8; 32], NetError> {
    let encoded = kp
        .strip_prefix("SHA256/")
        .ok_or_else(|| NetError::InvalidUrl(format!("keyprint {kp:?}")))?;
    let bytes = base32_decode_loose(encoded)
        .map_err(|_| NetError::InvalidUrl(format!("keyprint {kp:?}")))?;
    bytes
        .try_into()
        .map_err(|_| NetError::InvalidUrl(format!("keyprint {kp:?}")))
}

/// A parsed magnet URI for a tiger-tree-hashed file.
///
/// ```text
/// magnet:?dn=<name>&xl=<size>&xt=urn:tree:tiger:<base32-root>&xs=<hub-url>
/// ```
#[derive(Debug, Clone)]
pub struct MagnetLink {
    /// Suggested local filename.
    pub display_name: Option<String>,
    /// Exact length in bytes.
    pub length: Option<u64>,
    /// The file's tree hash root.
    pub tree_hash: Option<TreeHash>,
    /// Exact source: the adc/adcs hub to fetch through.
    pub source: Option<String>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self, NetError> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| NetError::InvalidMagnet("missing magnet:? prefix".to_string()))?;
        magnet_from_params(&parse_query_string(query))
    }

    /// Renders the URI back out, fields in canonical order.
    pub fn to_uri(&self) -> String {
        let mut uri = String::from("magnet:?");
        let mut sep = "";
        if let Some(ref name) = self.display_name {
            uri.push_str(&format!("dn={}", url_encode(name)));
            sep = "&";
        }
        if let Some(length) = self.length {
            uri.push_str(&format!("{sep}xl={length}"));
            sep = "&";
        }
        if let Some(ref hash) = self.tree_hash {
            uri.push_str(&format!("{sep}xt=urn:tree:tiger:{hash}"));
            sep = "&";
        }
        if let Some(ref source) = self.source {
            uri.push_str(&format!("{sep}xs={}", url_encode(source)));
        }
        uri
    }
}

fn magnet_from_params(params: &HashMap<String, Vec<String>>) -> Result<MagnetLink, NetError> {
    let tree_hash = match params.get("xt").and_then(|v| v.first()) {
        Some(xt) => {
            let encoded = xt.strip_prefix("urn:tree:tiger:").ok_or_else(|| {
                NetError::InvalidMagnet(format!("unsupported xt {xt:?}"))
            })?;
            Some(
                TreeHash::from_base32(encoded)
                    .map_err(|e| NetError::InvalidMagnet(e.to_string()))?,
            )
        }
        None => None,
    };

    let length = match params.get("xl").and_then(|v| v.first()) {
        Some(xl) => Some(
            xl.parse()
                .map_err(|_| NetError::InvalidMagnet(format!("bad length {xl:?}")))?,
        ),
        None => None,
    };

    Ok(MagnetLink {
        display_name: params
            .get("dn")
            .and_then(|v| v.first())
            .map(|s| url_decode(s)),
        length,
        tree_hash,
        source: params
            .get("xs")
            .and_then(|v| v.first())
            .map(|s| url_decode(s)),
    })
}

fn parse_query_string(query: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for part in query.split('&') {
        if let Some((key, value)) = part.split_once('=') {
            params.entry(key.to_string()).or_default().push(value.to_string());
        }
    }
    params
}

/// Percent-decodes a query value (`+` counts as space).
pub fn url_decode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if hex.len() == 2 {
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    result.push(byte as char);
                    continue;
                }
            }
            result.push('%');
            result.push_str(&hex);
        } else if c == '+' {
            result.push(' ');
        } else {
            result.push(c);
        }
    }

    result
}

/// Percent-encodes a query value.
pub fn url_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len() * 3);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{byte:02X}")),
        }
    }
    result
}
