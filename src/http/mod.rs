mod responses;

pub use responses::status_for;

use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::{header, Method, Request, Response, StatusCode};
use tracing::{info_span, warn, Instrument};

use crate::auth::Identity;
use crate::engine::{Released, StateEngine};
use crate::metrics::Operation;
use crate::state_id::StateId;

const STATES_ROUTE: &str = "/states";

/// Largest request body accepted for a state or lock record.
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Route a request resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Health,
    List,
    ReadState(StateId),
    WriteState(StateId),
    DeleteState(StateId),
    Lock(StateId),
    Unlock(StateId),
    NotFound,
}

fn route(method: &Method, path: &str) -> Route {
    if path == "/health" {
        return if method == Method::GET {
            Route::Health
        } else {
            Route::NotFound
        };
    }

    let rest = match path.strip_prefix(STATES_ROUTE) {
        Some(rest) => rest,
        None => return Route::NotFound,
    };
    if rest.is_empty() || rest == "/" {
        return if method == Method::GET {
            Route::List
        } else {
            Route::NotFound
        };
    }

    let raw_id = match rest.strip_prefix('/') {
        Some(raw_id) => raw_id,
        None => return Route::NotFound,
    };
    let id = match urlencoding::decode(raw_id)
        .ok()
        .and_then(|decoded| StateId::parse(&decoded).ok())
    {
        Some(id) => id,
        None => return Route::NotFound,
    };

    match method.as_str() {
        "GET" => Route::ReadState(id),
        "POST" | "PUT" => Route::WriteState(id),
        "DELETE" => Route::DeleteState(id),
        "LOCK" => Route::Lock(id),
        "UNLOCK" => Route::Unlock(id),
        _ => Route::NotFound,
    }
}

fn identity<B>(req: &Request<B>) -> Identity {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(Identity::from_authorization)
        .unwrap_or_default()
}

/// HTTP front of the state engine, speaking the Terraform `http` backend protocol.
#[derive(Clone)]
pub struct StateService {
    engine: StateEngine,
    max_body_size: usize,
}

impl StateService {
    pub fn new(engine: StateEngine) -> Self {
        Self {
            engine,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Main request handler
    pub async fn handle_request<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let span = info_span!(
            "request",
            request_id = %uuid::Uuid::new_v4(),
            method = %req.method(),
            path = %req.uri().path(),
        );
        let response = self.route_request(req).instrument(span.clone()).await;
        span.in_scope(|| tracing::debug!(status = response.status().as_u16(), "request done"));
        Ok(response)
    }

    async fn route_request<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let identity = identity(&req);
        let challenge = self.engine.auth().challenge();

        let result = match route(req.method(), req.uri().path()) {
            Route::Health => {
                let health = serde_json::json!({ "status": "healthy" });
                return responses::json_response(StatusCode::OK, &health);
            }
            Route::NotFound => return responses::not_found(),
            Route::List => self
                .engine
                .list(&identity)
                .await
                .map(|listing| responses::json_response(StatusCode::OK, &listing)),
            Route::ReadState(id) => self.engine.read_state(&identity, &id).await.map(|state| {
                match state {
                    Some(data) => responses::bytes_response(StatusCode::OK, data),
                    None => responses::not_found(),
                }
            }),
            Route::WriteState(id) => {
                let body = match self.admit_body(req, &identity, Operation::WriteState, &id).await {
                    Ok(body) => body,
                    Err(resp) => return resp,
                };
                self.engine
                    .write_state(&identity, &id, body)
                    .await
                    .map(|()| responses::empty_response(StatusCode::OK))
            }
            Route::DeleteState(id) => self
                .engine
                .delete_state(&identity, &id)
                .await
                .map(|()| responses::empty_response(StatusCode::OK)),
            Route::Lock(id) => {
                let body = match self.admit_body(req, &identity, Operation::AcquireLock, &id).await {
                    Ok(body) => body,
                    Err(resp) => return resp,
                };
                self.engine
                    .acquire_lock(&identity, &id, body)
                    .await
                    .map(|record| responses::raw_json_response(StatusCode::OK, record))
            }
            Route::Unlock(id) => {
                let body = match self.admit_body(req, &identity, Operation::ReleaseLock, &id).await {
                    Ok(body) => body,
                    Err(resp) => return resp,
                };
                self.engine
                    .release_lock(&identity, &id, &body)
                    .await
                    .map(|released| match released {
                        Released::Forced => responses::empty_response(StatusCode::OK),
                        Released::Owned(record) => {
                            responses::raw_json_response(StatusCode::OK, record)
                        }
                    })
            }
        };

        result.unwrap_or_else(|err| responses::error_response(err, challenge))
    }

    /// Authorizes a write and only then reads the body, up to `max_body_size`.
    async fn admit_body<B>(
        &self,
        req: Request<B>,
        identity: &Identity,
        op: Operation,
        id: &StateId,
    ) -> Result<Bytes, Response<Full<Bytes>>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        if let Err(err) = self.engine.authorize_write(identity, op, id) {
            return Err(responses::error_response(err, self.engine.auth().challenge()));
        }
        read_body(req, self.max_body_size).await
    }
}

async fn read_body<B>(req: Request<B>, limit: usize) -> Result<Bytes, Response<Full<Bytes>>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    match Limited::new(req.into_body(), limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => {
            warn!(limit, "request body too large");
            Err(responses::text_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
            ))
        }
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            Err(responses::text_response(
                StatusCode::BAD_REQUEST,
                "Invalid request body",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> StateId {
        StateId::parse(raw).unwrap()
    }

    fn method(name: &str) -> Method {
        Method::from_bytes(name.as_bytes()).unwrap()
    }

    #[test]
    fn test_route_listing() {
        assert_eq!(route(&Method::GET, "/states"), Route::List);
        assert_eq!(route(&Method::GET, "/states/"), Route::List);
        assert_eq!(route(&Method::POST, "/states"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/health"), Route::Health);
        assert_eq!(route(&Method::GET, "/"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/statesx"), Route::NotFound);
    }

    #[test]
    fn test_route_state_methods() {
        assert_eq!(route(&Method::GET, "/states/a"), Route::ReadState(id("a")));
        assert_eq!(route(&Method::POST, "/states/a"), Route::WriteState(id("a")));
        assert_eq!(route(&Method::PUT, "/states/a"), Route::WriteState(id("a")));
        assert_eq!(
            route(&Method::DELETE, "/states/a.tfstate"),
            Route::DeleteState(id("a"))
        );
        assert_eq!(route(&method("LOCK"), "/states/a"), Route::Lock(id("a")));
        assert_eq!(route(&method("UNLOCK"), "/states/a"), Route::Unlock(id("a")));
        assert_eq!(route(&Method::PATCH, "/states/a"), Route::NotFound);
    }

    #[test]
    fn test_route_rejects_bad_ids() {
        assert_eq!(route(&Method::GET, "/states/.hidden"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/states/a/b"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/states/a%2Fb"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/states/%E2%9C%93"), Route::NotFound);
        assert_eq!(route(&Method::GET, "/states/my%2Dstate"), Route::ReadState(id("my-state")));
    }
}
