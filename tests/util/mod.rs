//! Shared test helpers

use axum::http::{Request, Response};
use kube::client::Body;

/// A kube client over a service that answers 404 to everything.
///
/// Good enough for code paths that only need a client value, and for apis
/// where "not found" is a well-defined answer.
pub fn fake_client() -> kube::Client {
    let service = tower::service_fn(|_request: Request<Body>| async {
        let response = Response::builder()
            .status(404)
            .header("content-type", "application/json")
            .body(Body::from(
                br#"{"kind":"Status","apiVersion":"v1","status":"Failure","reason":"NotFound","code":404}"#
                    .to_vec(),
            ))
            .unwrap();
        Ok::<_, std::convert::Infallible>(response)
    });
    kube::Client::new(service, "default")
}
