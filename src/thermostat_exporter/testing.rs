// thermostat_exporter - Netatmo thermostat metrics exporter for Prometheus
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

#![cfg(test)]

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub(crate) const HOMES_DATA: &str = r#"{
    "body": {
        "homes": [
            {"id": "H1", "name": "Casa", "altitude": 12},
            {"id": "H2", "name": "Cabin"}
        ]
    },
    "status": "ok"
}"#;

pub(crate) const HOME_STATUS_H1: &str = r#"{
    "body": {
        "home": {
            "id": "H1",
            "name": "Casa",
            "rooms": [
                {
                    "id": "R1",
                    "name": "",
                    "therm_measured_temperature": 17.9,
                    "therm_setpoint_temperature": 20.0,
                    "reachable": true
                }
            ],
            "modules": [
                {"id": "M1", "type": "NATherm1", "room_id": "R1", "boiler_status": false},
                {"id": "M2", "type": "NAPlug", "room_id": "", "boiler_status": true}
            ]
        }
    },
    "status": "ok"
}"#;

/// Detailed status without its own ID or name, and no boiler reporting.
pub(crate) const HOME_STATUS_H2: &str = r#"{
    "body": {
        "home": {
            "id": "",
            "rooms": [
                {"id": "R9", "name": "Loft", "therm_measured_temperature": 12.5}
            ],
            "modules": [
                {"id": "M9", "type": "NRV", "room_id": "R9"}
            ]
        }
    },
    "status": "ok"
}"#;

/// Canned response for a request path (including the query string).
#[derive(Debug, Clone)]
pub(crate) struct Route {
    path_and_query: String,
    status: StatusCode,
    body: String,
    delay: Option<Duration>,
}

impl Route {
    pub(crate) fn new(path_and_query: &str, status: StatusCode, body: &str) -> Self {
        Self {
            path_and_query: path_and_query.to_owned(),
            status,
            body: body.to_owned(),
            delay: None,
        }
    }

    pub(crate) fn ok(path_and_query: &str, body: &str) -> Self {
        Self::new(path_and_query, StatusCode::OK, body)
    }

    /// Wait this long before responding.
    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub(crate) path_and_query: String,
    pub(crate) authorization: Option<String>,
}

/// HTTP server bound to a random local port that serves canned Netatmo API
/// responses and keeps track of the requests it received. Requests for paths
/// without a route get a 404. The server is stopped when dropped.
pub(crate) struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub(crate) async fn start(routes: Vec<Route>) -> Self {
        let routes = Arc::new(routes);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel::<()>();

        let svc_routes = routes.clone();
        let svc_requests = requests.clone();
        let make_svc = make_service_fn(move |_| {
            let routes = svc_routes.clone();
            let requests = svc_requests.clone();

            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let routes = routes.clone();
                    let requests = requests.clone();
                    async move { Ok::<_, Infallible>(respond(req, &routes, &requests).await) }
                }))
            }
        });

        let server = Server::try_bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
            .unwrap()
            .serve(make_svc);
        let addr = server.local_addr();

        tokio::spawn(server.with_graceful_shutdown(async {
            let _ = rx.await;
        }));

        Self {
            addr,
            requests,
            shutdown: Some(tx),
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests received with the given path, ignoring the query string
    pub(crate) fn count(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.path_and_query.split('?').next() == Some(path))
            .count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn respond(req: Request<Body>, routes: &[Route], requests: &Mutex<Vec<RecordedRequest>>) -> Response<Body> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_default();

    let authorization = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned());

    requests.lock().unwrap().push(RecordedRequest {
        path_and_query: path_and_query.clone(),
        authorization,
    });

    match routes.iter().find(|r| r.path_and_query == path_and_query) {
        Some(route) => {
            if let Some(delay) = route.delay {
                tokio::time::sleep(delay).await;
            }

            Response::builder()
                .status(route.status)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(route.body.clone()))
                .unwrap()
        }
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap(),
    }
}
