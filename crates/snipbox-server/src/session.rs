//! Caller identity used for quotas

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use snipbox::SessionId;

pub const SESSION_HEADER: &str = "x-session-id";

/// Longest accepted session header value
const MAX_SESSION_LEN: usize = 128;

/// Session of the caller: the `X-Session-Id` header when present, otherwise
/// the peer address. A header session also carries the peer address as its
/// origin, so bans and the in-flight cap follow the address.
#[derive(Debug, Clone)]
pub struct ClientSession(pub SessionId);

impl<S: Send + Sync> FromRequestParts<S> for ClientSession {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty() && value.len() <= MAX_SESSION_LEN);
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| format!("ip:{}", addr.ip()));

        let session = match (header, peer) {
            (Some(id), Some(peer)) => SessionId::new(format!("session:{id}")).with_origin(peer),
            (Some(id), None) => SessionId::new(format!("session:{id}")),
            (None, Some(peer)) => SessionId::new(peer),
            (None, None) => SessionId::new("anonymous"),
        };
        Ok(Self(session))
    }
}
