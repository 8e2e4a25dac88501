//! Fake API server for tests of the kube-backed collaborators

use http::{Method, Request, Response, StatusCode};
use hyper::Body;
use kube::Client;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tower_test::mock::{self, Handle};

pub type ApiServerHandle = Handle<Request<Body>, Response<Body>>;

/// Client talking to an in-process mock service
pub fn mock_client() -> (Client, ApiServerHandle) {
    let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, "default"), handle)
}

/// One request the fake server expects and the response it sends back
pub struct Exchange {
    method: Method,
    path: String,
    status: StatusCode,
    response: Value,
}

impl Exchange {
    pub fn new(method: Method, path: &str, status: StatusCode, response: Value) -> Self {
        Self {
            method,
            path: path.to_string(),
            status,
            response,
        }
    }

    pub fn ok(method: Method, path: &str, response: Value) -> Self {
        Self::new(method, path, StatusCode::OK, response)
    }
}

/// A request received by the fake server
#[derive(Debug)]
pub struct Received {
    pub query: String,
    pub body: Value,
}

/// Answer `exchanges` in order, asserting each request's method and path.
///
/// Panics when the client stops before every exchange was served.
pub fn serve(mut handle: ApiServerHandle, exchanges: Vec<Exchange>) -> JoinHandle<Vec<Received>> {
    tokio::spawn(async move {
        let mut received = Vec::new();
        for exchange in exchanges {
            let (request, send) = handle
                .next_request()
                .await
                .expect("service not called");
            assert_eq!(request.method(), exchange.method);
            assert_eq!(request.uri().path(), exchange.path);

            let query = request.uri().query().unwrap_or_default().to_string();
            let bytes = hyper::body::to_bytes(request.into_body()).await.unwrap();
            let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            received.push(Received { query, body });

            let response = serde_json::to_vec(&exchange.response).unwrap();
            send.send_response(
                Response::builder()
                    .status(exchange.status)
                    .body(Body::from(response))
                    .unwrap(),
            );
        }
        received
    })
}

/// Body of an API error response
pub fn status_body(code: u16, reason: &str, message: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code
    })
}

pub fn not_found(message: &str) -> Value {
    status_body(404, "NotFound", message)
}

pub fn conflict() -> Value {
    status_body(
        409,
        "Conflict",
        "the object has been modified; please apply your changes to the latest version and try again",
    )
}
