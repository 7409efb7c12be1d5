use futures::future;
use hyper::{Body, Request, Response};
use maesh_controller_core::DynamicConfiguration;
use maesh_controller_k8s_index::DeployLog;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument};

/// Serves the read-only mesh API: readiness, the last deployed configuration,
/// and the deploy log.
#[instrument(skip_all, fields(port = %addr.port()))]
pub async fn serve(
    addr: SocketAddr,
    ready: watch::Receiver<bool>,
    config: Arc<RwLock<Option<DynamicConfiguration>>>,
    deploy_log: Arc<DeployLog>,
) -> Result<(), hyper::Error> {
    let server =
        hyper::server::Server::bind(&addr).serve(hyper::service::make_service_fn(move |_conn| {
            let ready = ready.clone();
            let config = config.clone();
            let deploy_log = deploy_log.clone();
            future::ok::<_, hyper::Error>(hyper::service::service_fn(
                move |req: Request<Body>| {
                    let rsp = match *req.method() {
                        hyper::Method::GET | hyper::Method::HEAD => match req.uri().path() {
                            "/api/status/readiness" => handle_readiness(&ready),
                            "/api/configuration/current" => json_response(&*config.read()),
                            "/api/log/deploylog" => json_response(&deploy_log.snapshot()),
                            _ => hyper::Response::builder()
                                .status(hyper::StatusCode::NOT_FOUND)
                                .body(Body::default())
                                .unwrap(),
                        },
                        _ => hyper::Response::builder()
                            .status(hyper::StatusCode::METHOD_NOT_ALLOWED)
                            .body(Body::default())
                            .unwrap(),
                    };
                    future::ok::<_, hyper::Error>(rsp)
                },
            ))
        }));
    let addr = server.local_addr();
    info!(%addr, "Mesh API server listening");
    server.await
}

fn handle_readiness(ready: &watch::Receiver<bool>) -> Response<Body> {
    if *ready.borrow() {
        Response::builder()
            .status(hyper::StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body("ready\n".into())
            .unwrap()
    } else {
        Response::builder()
            .status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body("not ready\n".into())
            .unwrap()
    }
}

fn json_response<T: serde::Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(hyper::StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap(),
        Err(error) => Response::builder()
            .status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from(error.to_string()))
            .unwrap(),
    }
}
