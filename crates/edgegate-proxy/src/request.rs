//! Inbound call descriptor

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, UPGRADE};
use http::{HeaderMap, Method, Request};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::upgrade::OnUpgrade;

/// Streaming body used on both sides of the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// A call to forward to an environment's backend
pub struct ProxyRequest {
    pub method: Method,
    /// Backend-relative path and query, e.g. `/containers/json?all=1`
    pub path: String,
    pub headers: HeaderMap,
    pub body: ProxyBody,
    /// Caller side of a protocol upgrade, resolved once the 101 reaches the caller
    pub upgrade: Option<OnUpgrade>,
}

impl std::fmt::Debug for ProxyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: empty_body(),
            upgrade: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = full_body(body);
        self
    }

    /// Take a request received by a hyper server, addressed to `path` on the backend
    pub fn from_hyper<B>(mut request: Request<B>, path: impl Into<String>) -> Self
    where
        B: hyper::body::Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let upgrade = if is_upgrade_request(request.headers()) {
            Some(hyper::upgrade::on(&mut request))
        } else {
            None
        };

        let (parts, body) = request.into_parts();
        Self {
            method: parts.method,
            path: path.into(),
            headers: parts.headers,
            body: body.boxed(),
            upgrade,
        }
    }

    /// Requested upgrade protocol, when the caller can actually be upgraded
    pub fn upgrade_protocol(&self) -> Option<&HeaderValue> {
        self.upgrade.as_ref()?;
        self.headers.get(UPGRADE)
    }
}

/// `Connection: upgrade` together with an `Upgrade` header
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE) && connection_tokens(headers).iter().any(|t| t == "upgrade")
}

/// Lowercased tokens listed in `Connection` headers
pub(crate) fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}
