//! HTTP front for proxied environment calls
//!
//! `/api/endpoints/{id}/docker/*` and `/api/endpoints/{id}/kubernetes/*` are
//! handed to the router with the prefix stripped. Everything else is `404`.

use edgegate_environment::ApiFamily;
use edgegate_proxy::{full_body, ProxyBody, ProxyError, ProxyRequest};
use http::header::CONTENT_TYPE;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::AppContext;

const ENDPOINTS_PREFIX: &str = "/api/endpoints/";

/// A request addressed to one environment's API
#[derive(Debug, PartialEq, Eq)]
pub struct EndpointCall<'a> {
    pub environment_id: &'a str,
    pub api: ApiFamily,
    /// Backend path with its query, always starting with `/`
    pub path: String,
}

/// Split `/api/endpoints/{id}/{docker|kubernetes}/{rest}` into its parts
pub fn parse_endpoint_path<'a>(path: &'a str, query: Option<&str>) -> Option<EndpointCall<'a>> {
    let rest = path.strip_prefix(ENDPOINTS_PREFIX)?;
    let (environment_id, rest) = rest.split_once('/')?;
    if environment_id.is_empty() {
        return None;
    }

    let (family, remainder) = match rest.split_once('/') {
        Some((family, remainder)) => (family, remainder),
        None => (rest, ""),
    };
    let api = match family {
        "docker" => ApiFamily::Docker,
        "kubernetes" => ApiFamily::Kubernetes,
        _ => return None,
    };

    let mut path = format!("/{}", remainder);
    if let Some(query) = query {
        path.push('?');
        path.push_str(query);
    }

    Some(EndpointCall {
        environment_id,
        api,
        path,
    })
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
    details: String,
}

fn error_response(status: StatusCode, message: &str, details: String) -> Response<ProxyBody> {
    let body = serde_json::to_vec(&ErrorBody { message, details }).unwrap_or_default();
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
    response
}

fn proxy_error_response(err: &ProxyError) -> Response<ProxyBody> {
    let message = match err {
        ProxyError::EnvironmentNotFound(_) => "Environment not found",
        ProxyError::EnvironmentUnreachable { .. } => "Environment is unreachable",
        ProxyError::SubConnectionFailed { .. } => "Unable to reach the environment through its tunnel",
        ProxyError::ConfigInvalid(_) => "Invalid environment configuration",
        ProxyError::InvalidRequest(_) => "Invalid request",
        ProxyError::UpstreamProtocolError(_) => "Invalid response from the environment",
        ProxyError::UpgradeFailed(_) => "Unable to upgrade the connection",
        ProxyError::Timeout(_) => "The environment did not answer in time",
        ProxyError::Store(_) => "Unable to read the environment",
    };
    error_response(err.status_code(), message, err.to_string())
}

async fn handle(
    ctx: Arc<AppContext>,
    request: Request<Incoming>,
    cancel: CancellationToken,
) -> Response<ProxyBody> {
    let uri = request.uri().clone();
    let Some(call) = parse_endpoint_path(uri.path(), uri.query()) else {
        return error_response(
            StatusCode::NOT_FOUND,
            "Not found",
            format!("No route for {}", uri.path()),
        );
    };

    match ctx.registry.get(call.environment_id).await {
        Ok(Some(env)) if env.kind.api != call.api => {
            let err = ProxyError::InvalidRequest(format!(
                "environment {} does not serve this API",
                env.id
            ));
            return proxy_error_response(&err);
        }
        Ok(_) => {}
        Err(e) => return proxy_error_response(&ProxyError::Store(e)),
    }

    debug!(
        environment_id = %call.environment_id,
        "{} {}", request.method(), call.path
    );
    let proxied = ProxyRequest::from_hyper(request, call.path);
    match ctx.router.route(call.environment_id, proxied, cancel).await {
        Ok(response) => response,
        Err(e) => {
            debug!(environment_id = %call.environment_id, "Proxied call failed: {}", e);
            proxy_error_response(&e)
        }
    }
}

/// Accept API connections until `shutdown` fires
pub async fn serve(ctx: Arc<AppContext>, listener: TcpListener, shutdown: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!("API listening on {}", addr),
        Err(_) => info!("API listening"),
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept API connection: {}", e);
                continue;
            }
        };

        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            // Upgraded sessions outlive the connection, so every call gets its
            // own token tied to server shutdown only
            let service = service_fn(move |request: Request<Incoming>| {
                let ctx = ctx.clone();
                let cancel = shutdown.child_token();
                async move { Ok::<_, Infallible>(handle(ctx, request, cancel).await) }
            });

            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!("API connection from {} ended: {}", peer, e);
            }
        });
    }

    info!("API server stopped");
}
