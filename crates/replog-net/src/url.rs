//! Peer URL validation.
//!
//! Peer URLs are `tcp://<ip>:<port>` with an IP literal (v4, or v6 in
//! brackets), a port in `[1, 65535]`, and nothing else: no path, query,
//! fragment or userinfo, and no wildcard address.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

const SCHEME: &str = "tcp://";

/// A validated `tcp://ip:port` peer address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerUrl {
    addr: SocketAddr,
}

impl PeerUrl {
    /// Parses and validates a peer URL.
    pub fn parse(s: &str) -> NetResult<Self> {
        let rest = s.strip_prefix(SCHEME).ok_or_else(|| NetError::InvalidUrl {
            msg: format!("{s}: scheme must be tcp://"),
        })?;
        if rest.contains('/') || rest.contains('?') || rest.contains('#') || rest.contains('@') {
            return Err(NetError::InvalidUrl {
                msg: format!("{s}: path, query, fragment and userinfo are not allowed"),
            });
        }
        let addr = SocketAddr::from_str(rest).map_err(|_| NetError::InvalidUrl {
            msg: format!("{s}: host must be an IP literal with a port"),
        })?;
        if addr.port() == 0 {
            return Err(NetError::InvalidUrl {
                msg: format!("{s}: port 0 is not addressable"),
            });
        }
        let wildcard = match addr.ip() {
            IpAddr::V4(ip) => ip.is_unspecified(),
            IpAddr::V6(ip) => ip.is_unspecified(),
        };
        if wildcard {
            return Err(NetError::InvalidUrl {
                msg: format!("{s}: wildcard address is not a peer"),
            });
        }
        Ok(Self { addr })
    }

    /// The socket address this URL names.
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for PeerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}", self.addr)
    }
}

impl TryFrom<String> for PeerUrl {
    type Error = NetError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        PeerUrl::parse(&s)
    }
}

impl From<PeerUrl> for String {
    fn from(u: PeerUrl) -> String {
        u.to_string()
    }
}
