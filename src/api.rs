//! Control-plane HTTP API
//!
//! Admin endpoints (`/render`, `/deploy`, `/deployments`, `/edge/nodes`)
//! take the admin bearer token. Node endpoints under `/edge/` take the
//! shared edge secret. `/health` and `/version` are open.

use crate::auth::{bearer_token, check_bearer};
use crate::compiler::{RenderReport, TenantFailure};
use crate::deploy::{DeployError, DeployRequest};
use crate::error::{json_error_response, ApiErrorCode};
use crate::fleet::{FleetError, Heartbeat};
use crate::model::RenderedFile;
use crate::pipeline::ControlPlane;
use anyhow::Result;
use chrono::Utc;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Largest request body accepted
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub const DEFAULT_DEPLOYMENTS_LIMIT: usize = 50;
pub const MAX_DEPLOYMENTS_LIMIT: usize = 500;

type ApiResponse = Response<Full<Bytes>>;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub admin_token: String,
}

/// Body of `/render` and `/edge/render-all`
#[derive(Debug, Serialize)]
pub struct RenderResponse {
    /// "ok", or "partial" when some tenants were rejected
    pub status: &'static str,
    pub hash: String,
    pub files: Vec<RenderedFile>,
    pub errors: Vec<TenantFailure>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unrouted: Vec<String>,
}

impl From<RenderReport> for RenderResponse {
    fn from(report: RenderReport) -> Self {
        Self {
            status: if report.is_complete() { "ok" } else { "partial" },
            hash: report.hash,
            files: report.files,
            errors: report.failures,
            unrouted: report.unrouted,
        }
    }
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    status: &'static str,
    hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub struct ApiServer {
    config: ApiConfig,
    plane: Arc<ControlPlane>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, plane: Arc<ControlPlane>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            config,
            plane,
            shutdown_rx,
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "Control-plane API listening");
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control-plane API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, _addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { Ok::<_, Infallible>(api.handle_request(req).await) }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    pub async fn handle_request<B>(self: Arc<Self>, req: Request<B>) -> ApiResponse
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        let response = match (&method, path.as_str()) {
            (&Method::GET, "/health") => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
            (&Method::GET, "/version") => {
                let version = serde_json::json!({
                    "name": crate::PKG_NAME,
                    "version": crate::VERSION,
                });
                Ok(json_response(StatusCode::OK, version.to_string()))
            }

            (&Method::POST, "/render") => match self.require_admin(&req) {
                Some(denied) => Ok(denied),
                None => self.render(),
            },
            (&Method::POST, "/deploy") => match self.require_admin(&req) {
                Some(denied) => Ok(denied),
                None => self.deploy(req).await,
            },
            (&Method::GET, "/deployments") => match self.require_admin(&req) {
                Some(denied) => Ok(denied),
                None => self.list_deployments(req.uri().query()),
            },
            (&Method::GET, "/edge/nodes") => match self.require_admin(&req) {
                Some(denied) => Ok(denied),
                None => self.list_nodes(),
            },

            (&Method::POST, "/edge/heartbeat") => match self.require_edge(&req) {
                Some(denied) => Ok(denied),
                None => self.heartbeat(req).await,
            },
            (&Method::POST, "/edge/render-all") => match self.require_edge(&req) {
                Some(denied) => Ok(denied),
                None => self.render(),
            },
            (&Method::GET, p) if p.starts_with("/edge/lookup/") => match self.require_edge(&req) {
                Some(denied) => Ok(denied),
                None => Ok(self.lookup(p.trim_start_matches("/edge/lookup/"))),
            },

            (_, "/health" | "/version" | "/render" | "/deploy" | "/deployments")
            | (_, "/edge/nodes" | "/edge/heartbeat" | "/edge/render-all") => Ok(json_error_response(
                ApiErrorCode::MethodNotAllowed,
                format!("{} not allowed on {}", method, path),
            )),

            _ => Ok(json_error_response(
                ApiErrorCode::NotFound,
                format!("No route for {} {}", method, path),
            )),
        };

        response.unwrap_or_else(|e| {
            error!(%path, error = %e, "API error");
            json_error_response(ApiErrorCode::InternalError, format!("Internal error: {:#}", e))
        })
    }

    fn require_admin<B>(&self, req: &Request<B>) -> Option<ApiResponse> {
        if check_bearer(req.headers(), &self.config.admin_token) {
            return None;
        }
        warn!(path = %req.uri().path(), "Unauthorized admin request");
        Some(json_error_response(ApiErrorCode::Unauthorized, "unauthorized"))
    }

    fn require_edge<B>(&self, req: &Request<B>) -> Option<ApiResponse> {
        if self.plane.fleet().authorize(bearer_token(req.headers())) {
            return None;
        }
        warn!(path = %req.uri().path(), "Unauthorized edge request");
        Some(json_error_response(ApiErrorCode::Unauthorized, "unauthorized"))
    }

    fn render(&self) -> Result<ApiResponse> {
        let report = self.plane.render_all()?;
        if !report.is_complete() {
            warn!(failures = report.failures.len(), "Render rejected some tenants");
        }
        let body = serde_json::to_string(&RenderResponse::from(report))?;
        Ok(json_response(StatusCode::OK, body))
    }

    async fn deploy<B>(&self, req: Request<B>) -> Result<ApiResponse>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let request: DeployRequest = match read_json(req).await {
            Ok(r) => r,
            Err(response) => return Ok(response),
        };

        info!(hash = %request.hash, files = request.files.len(), "Deploy requested");

        let result = match self.plane.try_deploy(request).await {
            Ok(result) => result,
            Err(DeployError::InProgress) => {
                return Ok(json_error_response(
                    ApiErrorCode::DeploymentInProgress,
                    "deployment in progress",
                ));
            }
            Err(e) => return Ok(json_error_response(ApiErrorCode::BadRequest, e.to_string())),
        };

        if result.ledger_id.is_none() {
            error!(hash = %result.hash, "Deployment outcome was not recorded");
            return Ok(json_error_response(
                ApiErrorCode::InternalError,
                result
                    .error
                    .unwrap_or_else(|| "deployment was not recorded".to_string()),
            ));
        }

        let (status, body) = if result.is_success() {
            (
                StatusCode::OK,
                DeployResponse {
                    status: "deployed",
                    hash: result.hash,
                    error: None,
                },
            )
        } else {
            (
                StatusCode::BAD_REQUEST,
                DeployResponse {
                    status: "failed",
                    hash: result.hash,
                    error: Some(result.error.unwrap_or_else(|| "deployment failed".to_string())),
                },
            )
        };
        Ok(json_response(status, serde_json::to_string(&body)?))
    }

    fn list_deployments(&self, query: Option<&str>) -> Result<ApiResponse> {
        let limit = match parse_limit(query) {
            Ok(limit) => limit,
            Err(msg) => return Ok(json_error_response(ApiErrorCode::BadRequest, msg)),
        };
        let entries = self.plane.ledger().list(limit)?;
        Ok(json_response(StatusCode::OK, serde_json::to_string(&entries)?))
    }

    fn list_nodes(&self) -> Result<ApiResponse> {
        let nodes = self.plane.fleet().list_nodes(Utc::now())?;
        Ok(json_response(StatusCode::OK, serde_json::to_string(&nodes)?))
    }

    async fn heartbeat<B>(&self, req: Request<B>) -> Result<ApiResponse>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let bearer = bearer_token(req.headers()).map(str::to_string);
        let heartbeat: Heartbeat = match read_json(req).await {
            Ok(h) => h,
            Err(response) => return Ok(response),
        };

        match self.plane.fleet().heartbeat(bearer.as_deref(), &heartbeat) {
            Ok(_) => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
            Err(FleetError::Unauthorized) => {
                Ok(json_error_response(ApiErrorCode::Unauthorized, "unauthorized"))
            }
            Err(FleetError::Storage(e)) => Err(e),
            Err(e) => Ok(json_error_response(ApiErrorCode::BadRequest, e.to_string())),
        }
    }

    fn lookup(&self, hostname: &str) -> ApiResponse {
        match self.plane.hosts().resolve(hostname) {
            Some(tenant) => {
                let body = serde_json::json!({
                    "hostname": hostname.to_ascii_lowercase(),
                    "tenant": tenant,
                });
                json_response(StatusCode::OK, body.to_string())
            }
            None => json_error_response(
                ApiErrorCode::NotFound,
                format!("No tenant serves {}", hostname),
            ),
        }
    }
}

/// Read a size-limited JSON body, or the error response to send instead
async fn read_json<T, B>(req: Request<B>) -> std::result::Result<T, ApiResponse>
where
    T: DeserializeOwned,
    B: Body + Send,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Err(json_error_response(
                ApiErrorCode::PayloadTooLarge,
                format!("Request body exceeds {} bytes", MAX_BODY_BYTES),
            ));
        }
        Err(e) => {
            return Err(json_error_response(
                ApiErrorCode::BadRequest,
                format!("Failed to read request body: {}", e),
            ));
        }
    };

    serde_json::from_slice(&body).map_err(|e| {
        json_error_response(ApiErrorCode::BadRequest, format!("Invalid request body: {}", e))
    })
}

fn parse_limit(query: Option<&str>) -> std::result::Result<usize, String> {
    let value = query
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "limit")
        .map(|(_, value)| value);

    match value {
        None => Ok(DEFAULT_DEPLOYMENTS_LIMIT),
        Some(v) => match v.parse::<usize>() {
            Ok(0) | Err(_) => Err(format!("Invalid limit: {:?}", v)),
            Ok(n) => Ok(n.min(MAX_DEPLOYMENTS_LIMIT)),
        },
    }
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> ApiResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CommandControl;
    use crate::db::Database;
    use crate::deploy::Deployer;
    use crate::error::ERROR_HEADER;
    use crate::fleet::{FleetRegistry, DEFAULT_STALE_AFTER_SECS};
    use crate::host_lookup::InMemoryHostLookup;
    use crate::ledger::Ledger;
    use crate::model::{Target, Tenant, UpstreamPool};
    use crate::pipeline::RenderSettings;
    use std::time::Duration;
    use tempfile::TempDir;

    const ADMIN: &str = "admin-secret";
    const EDGE: &str = "edge-secret";

    fn server(tmp: &TempDir) -> Arc<ApiServer> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let control = CommandControl::new("true", "true", Duration::from_secs(5)).unwrap();
        let deployer = Arc::new(Deployer::new(
            tmp.path().join("conf.d"),
            tmp.path().join("backups"),
            Arc::new(control),
            Ledger::new(db.clone()),
        ));
        let fleet = FleetRegistry::new(db.clone(), EDGE, DEFAULT_STALE_AFTER_SECS);
        let plane = Arc::new(ControlPlane::new(
            db,
            deployer,
            Arc::new(InMemoryHostLookup::new()),
            fleet,
            RenderSettings::default(),
        ));
        let (_tx, rx) = watch::channel(false);
        Arc::new(ApiServer::new(
            ApiConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                admin_token: ADMIN.to_string(),
            },
            plane,
            rx,
        ))
    }

    fn request(method: Method, uri: &str, token: Option<&str>, body: &str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
    }

    async fn body_json(response: ApiResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn seed(api: &ApiServer) {
        api.plane
            .db()
            .save_tenant(&Tenant {
                id: "t1".to_string(),
                name: "Acme".to_string(),
                slug: "acme".to_string(),
                created_at: String::new(),
                domains: vec!["acme.example.com".to_string()],
                pools: vec![UpstreamPool {
                    name: "main".to_string(),
                    targets: vec![Target::new("10.0.0.5", 8080)],
                }],
                policy: None,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let tmp = TempDir::new().unwrap();
        let api = server(&tmp);

        let response = api.handle_request(request(Method::GET, "/health", None, "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_admin_routes_require_token() {
        let tmp = TempDir::new().unwrap();
        let api = server(&tmp);

        let response = api
            .clone()
            .handle_request(request(Method::POST, "/render", None, ""))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(ERROR_HEADER).unwrap(), "UNAUTHORIZED");

        // The edge secret is not an admin token
        let response = api
            .handle_request(request(Method::POST, "/render", Some(EDGE), ""))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_render_then_deploy() {
        let tmp = TempDir::new().unwrap();
        let api = server(&tmp);
        seed(&api);

        let response = api
            .clone()
            .handle_request(request(Method::POST, "/render", Some(ADMIN), ""))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let render = body_json(response).await;
        assert_eq!(render["status"], "ok");
        assert_eq!(render["files"][0]["filename"], "acme_acme.example.com.conf");

        let deploy_body = serde_json::json!({
            "files": render["files"],
            "hash": render["hash"],
        });
        let response = api
            .clone()
            .handle_request(request(Method::POST, "/deploy", Some(ADMIN), &deploy_body.to_string()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let deployed = body_json(response).await;
        assert_eq!(deployed["status"], "deployed");
        assert_eq!(deployed["hash"], render["hash"]);

        let response = api
            .handle_request(request(Method::GET, "/edge/lookup/ACME.example.com", Some(EDGE), ""))
            .await;
        assert_eq!(body_json(response).await["tenant"], "acme");
    }

    #[tokio::test]
    async fn test_deploy_hash_mismatch_is_400() {
        let tmp = TempDir::new().unwrap();
        let api = server(&tmp);

        let body = r#"{"files":[{"filename":"acme_acme.io.conf","content":"x"}],"hash":"deadbeef"}"#;
        let response = api
            .handle_request(request(Method::POST, "/deploy", Some(ADMIN), body))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["status"], "failed");
        assert_eq!(json["hash"], "deadbeef");
        assert!(json["error"].as_str().unwrap().contains("hash"));
    }

    #[tokio::test]
    async fn test_deploy_rejects_malformed_body() {
        let tmp = TempDir::new().unwrap();
        let api = server(&tmp);

        let response = api
            .handle_request(request(Method::POST, "/deploy", Some(ADMIN), "{not json"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get(ERROR_HEADER).unwrap(), "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_heartbeat_auth_and_listing() {
        let tmp = TempDir::new().unwrap();
        let api = server(&tmp);
        let body = r#"{"clusterId":"eu-west","hostname":"edge-1","ipAddress":"10.1.0.4","version":"1.2.0","status":"HEALTHY"}"#;

        let response = api
            .clone()
            .handle_request(request(Method::POST, "/edge/heartbeat", Some("wrong"), body))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = api
            .clone()
            .handle_request(request(Method::POST, "/edge/heartbeat", Some(EDGE), body))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");

        let response = api
            .handle_request(request(Method::GET, "/edge/nodes", Some(ADMIN), ""))
            .await;
        let nodes = body_json(response).await;
        assert_eq!(nodes.as_array().unwrap().len(), 1);
        assert_eq!(nodes[0]["hostname"], "edge-1");
        assert_eq!(nodes[0]["stale"], false);
    }

    #[tokio::test]
    async fn test_heartbeat_invalid_field_is_400() {
        let tmp = TempDir::new().unwrap();
        let api = server(&tmp);
        let body = r#"{"clusterId":"eu-west","hostname":"edge-1","ipAddress":"not-an-ip","version":"1.2.0","status":"HEALTHY"}"#;

        let response = api
            .handle_request(request(Method::POST, "/edge/heartbeat", Some(EDGE), body))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_route_and_wrong_method() {
        let tmp = TempDir::new().unwrap();
        let api = server(&tmp);

        let response = api
            .clone()
            .handle_request(request(Method::GET, "/nope", Some(ADMIN), ""))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = api
            .handle_request(request(Method::GET, "/deploy", Some(ADMIN), ""))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(None), Ok(DEFAULT_DEPLOYMENTS_LIMIT));
        assert_eq!(parse_limit(Some("limit=5")), Ok(5));
        assert_eq!(parse_limit(Some("x=1&limit=9000")), Ok(MAX_DEPLOYMENTS_LIMIT));
        assert!(parse_limit(Some("limit=0")).is_err());
        assert!(parse_limit(Some("limit=abc")).is_err());
    }
}
