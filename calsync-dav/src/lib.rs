//! calsync CalDAV/HTTP Protocol Implementation
//!
//! A minimal CalDAV dispatcher in front of the synchronization backend:
//! Basic authentication, method routing, precondition headers and
//! multistatus encoding. All storage work runs on blocking workers.

pub mod auth;
pub mod backend;
pub mod handlers;
pub mod path;
pub mod xml;

pub use auth::{AuthProvider, AuthResult, StaticAuthProvider};
pub use backend::{
    CalendarBackend, CalendarObject, EntityTag, Preconditions, PutOutcome, RequestContext,
    TimeRange,
};
pub use path::{PathError, ResourcePath, Target};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, error, warn};
use crate::xml::XmlError;

/// Response type produced by the dispatcher
pub type DavResponse = Response<Full<Bytes>>;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Mount point of the CalDAV tree
    pub prefix: String,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Username of the single account
    pub username: String,
    /// Password of the single account
    pub password: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: "/dav".to_string(),
            max_body_size: 10 * 1024 * 1024, // 10 MB
            username: "testuser".to_string(),
            password: "testpass".to_string(),
        }
    }
}

/// An authenticated request with its body already read
#[derive(Debug)]
pub struct DavRequest {
    pub method: Method,
    /// Full request path, prefix included
    pub path: String,
    pub target: Target,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl DavRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// CalDAV request handler
pub struct DavHandler {
    backend: Arc<CalendarBackend>,
    auth: Arc<dyn AuthProvider>,
    config: Config,
}

impl DavHandler {
    /// Create a handler authenticating against the configured credentials
    pub fn new(backend: Arc<CalendarBackend>, config: Config) -> Self {
        let auth = Arc::new(StaticAuthProvider::new(
            config.username.clone(),
            &config.password,
        ));
        Self::with_auth(backend, auth, config)
    }

    pub fn with_auth(
        backend: Arc<CalendarBackend>,
        auth: Arc<dyn AuthProvider>,
        config: Config,
    ) -> Self {
        Self {
            backend,
            auth,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<CalendarBackend> {
        &self.backend
    }

    /// Handle an incoming HTTP request. Errors are rendered as responses.
    pub async fn handle<B>(&self, req: Request<B>) -> DavResponse
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.dispatch(req).await {
            Ok(response) => response,
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    error!("Request failed: {}", e);
                } else if status == StatusCode::UNAUTHORIZED {
                    debug!("Request failed: {}", e);
                } else {
                    warn!("Request failed: {}", e);
                }
                e.into_response()
            }
        }
    }

    async fn dispatch<B>(&self, req: Request<B>) -> Result<DavResponse, DavError>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        debug!("CalDAV request: {} {}", method, path);

        // Endpoints outside the protocol tree need no credentials
        match path.as_str() {
            "/.well-known/caldav" | "/.well-known/caldav/" => {
                return handlers::well_known(&self.config);
            }
            "/health" => return handlers::health(),
            "/" if method == Method::GET || method == Method::HEAD => {
                return handlers::index();
            }
            _ => {}
        }

        let Some(rest) = self.strip_prefix(&path) else {
            return Err(DavError::NotFound(path));
        };
        let target = Target::classify(rest);

        if method == Method::OPTIONS {
            return handlers::options();
        }

        let (parts, body) = req.into_parts();
        let ctx = self.authenticate(&parts.headers).await?;
        // cancels the request's storage work if this future is dropped
        let _cancel_on_drop = ctx.cancel.clone().drop_guard();

        let body = read_body(body, self.config.max_body_size).await?;
        let request = DavRequest {
            method,
            path,
            target,
            headers: parts.headers,
            body,
        };

        match request.method.as_str() {
            "GET" => handlers::get(self, &ctx, &request, true).await,
            "HEAD" => handlers::get(self, &ctx, &request, false).await,
            "PUT" => handlers::put(self, &ctx, &request).await,
            "DELETE" => handlers::delete(self, &ctx, &request).await,
            "PROPFIND" => handlers::propfind(self, &ctx, &request).await,
            "PROPPATCH" => handlers::proppatch(&request),
            "REPORT" => handlers::report(self, &ctx, &request).await,
            "MKCALENDAR" => handlers::mkcalendar(self, &ctx, &request).await,
            other => Err(DavError::MethodNotAllowed(other.to_string())),
        }
    }

    fn strip_prefix<'a>(&self, path: &'a str) -> Option<&'a str> {
        let prefix = self.config.prefix.trim_end_matches('/');
        let rest = path.strip_prefix(prefix)?;
        (rest.is_empty() || rest.starts_with('/')).then_some(rest)
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<RequestContext, DavError> {
        let (username, password) = headers
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(auth::parse_basic_auth)
            .ok_or(DavError::Unauthorized)?;

        match self.auth.authenticate(&username, &password).await {
            AuthResult::Success(username) => {
                let backend = self.backend.clone();
                let lookup = tokio::task::spawn_blocking(move || backend.find_user(&username))
                    .await
                    .map_err(|e| DavError::Internal(format!("blocking task failed: {}", e)))?;
                match lookup {
                    Ok(user) => Ok(RequestContext::new(user)),
                    Err(calsync_core::Error::NotFound(msg)) => {
                        warn!("Authenticated user has no account: {}", msg);
                        Err(DavError::Unauthorized)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            AuthResult::Failed => {
                debug!("Rejected credentials for {}", username);
                Err(DavError::Unauthorized)
            }
            AuthResult::Error(msg) => Err(DavError::Internal(msg)),
        }
    }

    /// Run backend work on a blocking worker.
    pub(crate) async fn run_blocking<T, F>(&self, ctx: &RequestContext, f: F) -> Result<T, DavError>
    where
        F: FnOnce(&CalendarBackend, &RequestContext) -> calsync_core::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let backend = self.backend.clone();
        let ctx = ctx.clone();
        let result = tokio::task::spawn_blocking(move || f(&backend, &ctx))
            .await
            .map_err(|e| DavError::Internal(format!("blocking task failed: {}", e)))?;
        Ok(result?)
    }
}

async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, DavError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(DavError::PayloadTooLarge(limit))
        }
        Err(e) => Err(DavError::Http(e.to_string())),
    }
}

/// CalDAV errors
#[derive(Debug, thiserror::Error)]
pub enum DavError {
    #[error(transparent)]
    Core(#[from] calsync_core::Error),

    #[error("XML parsing error: {0}")]
    Xml(#[from] XmlError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Request body larger than {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<hyper::http::Error> for DavError {
    fn from(err: hyper::http::Error) -> Self {
        DavError::Http(err.to_string())
    }
}

impl DavError {
    pub fn status(&self) -> StatusCode {
        use calsync_core::Error as Core;
        match self {
            DavError::Core(Core::NotFound(_)) | DavError::NotFound(_) => StatusCode::NOT_FOUND,
            DavError::Core(Core::Conflict(_)) => StatusCode::CONFLICT,
            DavError::Core(Core::PreconditionFailed(_)) => StatusCode::PRECONDITION_FAILED,
            DavError::Core(Core::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            DavError::Core(Core::BadRequest(_)) | DavError::Xml(_) => StatusCode::BAD_REQUEST,
            DavError::Core(Core::Internal(_)) | DavError::Http(_) | DavError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            DavError::Unauthorized => StatusCode::UNAUTHORIZED,
            DavError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            DavError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            DavError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// Render as a plain-text response.
    pub fn into_response(self) -> DavResponse {
        let status = self.status();
        let mut response = Response::new(Full::new(Bytes::from(self.to_string())));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        match self {
            DavError::Unauthorized => {
                if let Ok(value) = HeaderValue::from_str(&auth::challenge()) {
                    headers.insert(WWW_AUTHENTICATE, value);
                }
            }
            DavError::MethodNotAllowed(_) => {
                headers.insert(hyper::header::ALLOW, HeaderValue::from_static(handlers::ALLOW_METHODS));
            }
            _ => {}
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        use calsync_core::Error as Core;
        let cases = [
            (DavError::Core(Core::NotFound("x".into())), 404),
            (DavError::Core(Core::Conflict("x".into())), 409),
            (DavError::Core(Core::PreconditionFailed("x".into())), 412),
            (DavError::Core(Core::Validation("x".into())), 422),
            (DavError::Core(Core::BadRequest("x".into())), 400),
            (DavError::Core(Core::Internal("x".into())), 500),
            (DavError::Unauthorized, 401),
            (DavError::PayloadTooLarge(1), 413),
            (DavError::Xml(XmlError::Parse("x".into())), 400),
        ];
        for (err, code) in cases {
            assert_eq!(err.status().as_u16(), code, "{}", err);
        }
    }

    #[test]
    fn test_unauthorized_response_carries_challenge() {
        let response = DavError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"CalDAV\""
        );
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.prefix, "/dav");
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);
    }
}
