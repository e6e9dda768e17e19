//! Downstream routes: public hostnames pointing at a tunnel proxy
//!
//! Routes live in an external reverse proxy configured through its admin
//! API. [`HttpRouteApi`] speaks a Caddy style JSON admin API: a route is
//! `PUT` in front of the first server's route list and deleted by its `@id`.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use revtun_proto::join_host_port;
use serde_json::json;
use std::fmt::Debug;
use thiserror::Error;
use tracing::{debug, info};

/// Admin API path new routes are inserted at
pub const NEW_ROUTE_PATH: &str = "/config/apps/http/servers/srv0/routes/0";

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route API url: {0}")]
    InvalidUrl(String),

    #[error("route API request failed: {0}")]
    Request(String),

    #[error("route API answered {status}: {body}")]
    Status { status: u16, body: String },
}

/// One public hostname routed to a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoute {
    pub route_id: String,
    pub subdomain: String,
    pub target_host: String,
    pub target_port: u16,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DownstreamRouteApi: Send + Sync + Debug {
    async fn add_route(&self, route: NewRoute) -> Result<(), RouteError>;

    async fn delete_route(&self, route_id: String) -> Result<(), RouteError>;
}

#[derive(Debug, Clone)]
pub struct HttpRouteApi {
    base: Uri,
    base_domain: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpRouteApi {
    /// `admin_url` is the admin API root, e.g. `http://127.0.0.1:2019`
    pub fn new(admin_url: &str, base_domain: impl Into<String>) -> Result<Self, RouteError> {
        let base: Uri = admin_url
            .trim_end_matches('/')
            .parse()
            .map_err(|e: http::uri::InvalidUri| RouteError::InvalidUrl(e.to_string()))?;
        if base.scheme_str() != Some("http") || base.authority().is_none() {
            return Err(RouteError::InvalidUrl(format!(
                "{} (expected http://host:port)",
                admin_url
            )));
        }

        Ok(Self {
            base,
            base_domain: base_domain.into(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    /// Public hostname of a subdomain
    pub fn hostname(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.base_domain)
    }

    fn route_body(&self, route: &NewRoute) -> serde_json::Value {
        json!({
            "@id": route.route_id,
            "match": [{ "host": [self.hostname(&route.subdomain)] }],
            "handle": [{
                "handler": "reverse_proxy",
                "transport": {
                    "protocol": "http",
                    "tls": { "insecure_skip_verify": true }
                },
                "upstreams": [{ "dial": join_host_port(&route.target_host, route.target_port) }]
            }],
            "terminal": true
        })
    }

    async fn send(&self, method: Method, path: &str, body: Option<Bytes>) -> Result<(), RouteError> {
        let authority = self
            .base
            .authority()
            .map(|a| a.as_str())
            .unwrap_or_default();
        let uri = format!("http://{}{}", authority, path);

        let request = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| RouteError::Request(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| RouteError::Request(e.to_string()))?;

        let status = response.status();
        debug!(%method, %uri, status = status.as_u16(), "Route API call");
        if status == StatusCode::OK {
            return Ok(());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
            .unwrap_or_default();
        Err(RouteError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl DownstreamRouteApi for HttpRouteApi {
    async fn add_route(&self, route: NewRoute) -> Result<(), RouteError> {
        let body = serde_json::to_vec(&self.route_body(&route))
            .map_err(|e| RouteError::Request(e.to_string()))?;
        self.send(Method::PUT, NEW_ROUTE_PATH, Some(Bytes::from(body)))
            .await?;
        info!(
            route_id = %route.route_id,
            host = %self.hostname(&route.subdomain),
            "Downstream route added"
        );
        Ok(())
    }

    async fn delete_route(&self, route_id: String) -> Result<(), RouteError> {
        self.send(Method::DELETE, &format!("/id/{}", route_id), None)
            .await?;
        info!(route_id = %route_id, "Downstream route removed");
        Ok(())
    }
}
