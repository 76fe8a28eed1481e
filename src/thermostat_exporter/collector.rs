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

use crate::aggregate::{home_samples, MetricSample};
use crate::client::{ApiClient, ClientError, ClientErrorKind};
use crate::credential::{CredentialError, CredentialSource};
use futures_util::future;
use std::error::Error;
use std::fmt;
use tokio::time::Instant;
use tracing::Instrument;

/// Kinds of errors that cause an entire collection to be aborted
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum CollectErrorKind {
    Credential,
    Client,
    ListHomes,
}

impl CollectErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            CollectErrorKind::Credential => "credential",
            CollectErrorKind::Client => "client",
            CollectErrorKind::ListHomes => "list_homes",
        }
    }
}

/// Error that prevented any thermostat readings from being collected.
#[derive(Debug)]
pub enum CollectError {
    Credential(CredentialError),
    Client(ClientError),
    ListHomes(ClientError),
}

impl CollectError {
    pub fn kind(&self) -> CollectErrorKind {
        match self {
            CollectError::Credential(_) => CollectErrorKind::Credential,
            CollectError::Client(_) => CollectErrorKind::Client,
            CollectError::ListHomes(_) => CollectErrorKind::ListHomes,
        }
    }
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectError::Credential(e) => write!(f, "unable to get credential: {}", e),
            CollectError::Client(e) => write!(f, "unable to create API client: {}", e),
            CollectError::ListHomes(e) => write!(f, "unable to list homes: {}", e),
        }
    }
}

impl Error for CollectError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CollectError::Credential(e) => Some(e),
            CollectError::Client(e) => Some(e),
            CollectError::ListHomes(e) => Some(e),
        }
    }
}

/// How a collection ended.
#[derive(Debug)]
pub enum Outcome {
    /// No valid credential was available, nothing was fetched.
    Skipped,
    /// Nothing could be fetched because of an error.
    Aborted(CollectError),
    /// The list of homes was fetched. Status for `failed` out of `homes` could not be.
    Done { homes: usize, failed: usize },
}

/// Samples emitted by a single collection and how the collection ended.
///
/// Samples may be empty even for a collection that is `Done`, e.g. when all
/// homes failed or there are no homes.
#[derive(Debug)]
pub struct Collection {
    pub samples: Vec<MetricSample>,
    pub outcome: Outcome,
}

impl Collection {
    fn empty(outcome: Outcome) -> Self {
        Self {
            samples: Vec::new(),
            outcome,
        }
    }
}

/// Fetches the state of all homes the current credential has access to and
/// converts it to thermostat samples.
///
/// Each collection uses its own API client, created with whatever credential
/// is current when the collection starts. Collections don't share any state
/// and may run concurrently.
#[derive(Debug)]
pub struct ThermostatCollector<C> {
    credentials: C,
    api_url: String,
}

impl<C> ThermostatCollector<C>
where
    C: CredentialSource,
{
    pub fn new<S>(credentials: C, api_url: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            credentials,
            api_url: api_url.into(),
        }
    }

    /// Run a single collection, giving up on any requests still outstanding at
    /// `deadline`. Errors are logged and reflected in the outcome, never returned.
    pub async fn collect(&self, deadline: Instant) -> Collection {
        let credential = match self.credentials.credential() {
            Ok(Some(c)) if c.is_valid() => c,
            Ok(_) => {
                tracing::debug!(message = "credential not available or invalid, skipping collection");
                return Collection::empty(Outcome::Skipped);
            }
            Err(e) => {
                tracing::error!(message = "error getting credential", error = %e);
                return Collection::empty(Outcome::Aborted(CollectError::Credential(e)));
            }
        };

        let client = match ApiClient::new(self.api_url.clone(), credential) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(message = "error creating API client", error = %e);
                return Collection::empty(Outcome::Aborted(CollectError::Client(e)));
            }
        };

        let homes = match client.list_homes(deadline).await {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(message = "error fetching homesdata", error = %e);
                return Collection::empty(Outcome::Aborted(CollectError::ListHomes(e)));
            }
        };

        // Fetch all homes concurrently. Each result is handled on its own so that
        // one home failing doesn't affect any of the others.
        let client = &client;
        let results = future::join_all(homes.iter().map(|home| {
            async move {
                if home.id.is_empty() {
                    return (home, Err(ClientError::KindMsg(ClientErrorKind::Decode, "home without an ID")));
                }

                (home, client.home_status(&home.id, deadline).await)
            }
            .instrument(tracing::debug_span!("home_status", home_id = %home.id))
        }))
        .await;

        let mut samples = Vec::new();
        let mut failed = 0;

        for (home, res) in results {
            match res {
                Ok(status) => {
                    let emitted = home_samples(home, &status);
                    for s in emitted.iter() {
                        tracing::trace!(message = "collected sample", sample = %s);
                    }

                    samples.extend(emitted);
                }
                Err(e) => {
                    tracing::error!(
                        message = "error fetching homestatus",
                        home_id = %home.id,
                        home_name = %home.name,
                        error = %e,
                    );
                    failed += 1;
                }
            }
        }

        tracing::debug!(
            message = "finished collection",
            num_homes = homes.len(),
            num_failed = failed,
            num_samples = samples.len(),
        );

        Collection {
            samples,
            outcome: Outcome::Done {
                homes: homes.len(),
                failed,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::{CollectErrorKind, Outcome, ThermostatCollector};
    use crate::aggregate::{Labels, MetricKind, MetricSample};
    use crate::credential::{Credential, CredentialError, CredentialSource, StaticCredential};
    use crate::testing::{Route, TestServer, HOMES_DATA, HOME_STATUS_H1, HOME_STATUS_H2};
    use hyper::StatusCode;
    use std::io;
    use std::time::{Duration, SystemTime};
    use tokio::time::Instant;

    struct ExpiredCredential;

    impl CredentialSource for ExpiredCredential {
        fn credential(&self) -> Result<Option<Credential>, CredentialError> {
            let expiry = SystemTime::now() - Duration::from_secs(3600);
            Ok(Some(Credential::new("expired-token", Some(expiry))))
        }
    }

    struct MissingCredential;

    impl CredentialSource for MissingCredential {
        fn credential(&self) -> Result<Option<Credential>, CredentialError> {
            Ok(None)
        }
    }

    struct BrokenCredential;

    impl CredentialSource for BrokenCredential {
        fn credential(&self) -> Result<Option<Credential>, CredentialError> {
            Err(CredentialError::MsgCause(
                "unable to read token file",
                Box::new(io::Error::new(io::ErrorKind::PermissionDenied, "denied")),
            ))
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn labels(home_id: &str, home_name: &str, room_id: &str, room_name: &str) -> Labels {
        Labels {
            home_id: home_id.to_owned(),
            home_name: home_name.to_owned(),
            room_id: room_id.to_owned(),
            room_name: room_name.to_owned(),
        }
    }

    fn sample(kind: MetricKind, value: f64, labels: Labels) -> MetricSample {
        MetricSample { kind, value, labels }
    }

    fn all_routes() -> Vec<Route> {
        vec![
            Route::ok("/api/homesdata", HOMES_DATA),
            Route::ok("/api/homestatus?home_id=H1", HOME_STATUS_H1),
            Route::ok("/api/homestatus?home_id=H2", HOME_STATUS_H2),
        ]
    }

    fn h1_samples() -> Vec<MetricSample> {
        vec![
            sample(MetricKind::Temperature, 17.9, labels("H1", "Casa", "R1", "")),
            sample(MetricKind::Setpoint, 20.0, labels("H1", "Casa", "R1", "")),
            sample(MetricKind::BoilerStatus, 0.0, labels("H1", "Casa", "R1", "")),
            sample(MetricKind::BoilerStatus, 1.0, labels("H1", "Casa", "", "")),
        ]
    }

    fn h2_samples() -> Vec<MetricSample> {
        vec![sample(MetricKind::Temperature, 12.5, labels("H2", "Cabin", "R9", "Loft"))]
    }

    #[tokio::test]
    async fn test_collect_all_homes() {
        let server = TestServer::start(all_routes()).await;
        let collector = ThermostatCollector::new(StaticCredential::new("token"), server.url());
        let collection = collector.collect(deadline()).await;

        let mut expected = h1_samples();
        expected.extend(h2_samples());

        assert_eq!(expected, collection.samples);
        assert!(matches!(collection.outcome, Outcome::Done { homes: 2, failed: 0 }));
    }

    #[tokio::test]
    async fn test_collect_idempotent() {
        let server = TestServer::start(all_routes()).await;
        let collector = ThermostatCollector::new(StaticCredential::new("token"), server.url());

        let first = collector.collect(deadline()).await;
        let second = collector.collect(deadline()).await;

        assert_eq!(first.samples, second.samples);
    }

    #[tokio::test]
    async fn test_collect_concurrent_invocations() {
        let server = TestServer::start(all_routes()).await;
        let collector = ThermostatCollector::new(StaticCredential::new("token"), server.url());

        let (first, second) = tokio::join!(collector.collect(deadline()), collector.collect(deadline()));

        assert_eq!(5, first.samples.len());
        assert_eq!(first.samples, second.samples);
    }

    #[tokio::test]
    async fn test_collect_expired_credential() {
        let server = TestServer::start(all_routes()).await;
        let collector = ThermostatCollector::new(ExpiredCredential, server.url());
        let collection = collector.collect(deadline()).await;

        assert!(collection.samples.is_empty());
        assert!(matches!(collection.outcome, Outcome::Skipped));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_collect_missing_credential() {
        let server = TestServer::start(all_routes()).await;
        let collector = ThermostatCollector::new(MissingCredential, server.url());
        let collection = collector.collect(deadline()).await;

        assert!(collection.samples.is_empty());
        assert!(matches!(collection.outcome, Outcome::Skipped));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_collect_credential_error() {
        let server = TestServer::start(all_routes()).await;
        let collector = ThermostatCollector::new(BrokenCredential, server.url());
        let collection = collector.collect(deadline()).await;

        assert!(collection.samples.is_empty());
        match collection.outcome {
            Outcome::Aborted(e) => assert_eq!(CollectErrorKind::Credential, e.kind()),
            o => panic!("unexpected outcome: {:?}", o),
        }
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_collect_list_homes_error() {
        let server = TestServer::start(vec![
            Route::new("/api/homesdata", StatusCode::INTERNAL_SERVER_ERROR, ""),
            Route::ok("/api/homestatus?home_id=H1", HOME_STATUS_H1),
            Route::ok("/api/homestatus?home_id=H2", HOME_STATUS_H2),
        ])
        .await;
        let collector = ThermostatCollector::new(StaticCredential::new("token"), server.url());
        let collection = collector.collect(deadline()).await;

        assert!(collection.samples.is_empty());
        match collection.outcome {
            Outcome::Aborted(e) => assert_eq!(CollectErrorKind::ListHomes, e.kind()),
            o => panic!("unexpected outcome: {:?}", o),
        }
        assert_eq!(1, server.count("/api/homesdata"));
        assert_eq!(0, server.count("/api/homestatus"));
    }

    #[tokio::test]
    async fn test_collect_one_home_fails() {
        let server = TestServer::start(vec![
            Route::ok("/api/homesdata", HOMES_DATA),
            Route::new("/api/homestatus?home_id=H1", StatusCode::BAD_GATEWAY, ""),
            Route::ok("/api/homestatus?home_id=H2", HOME_STATUS_H2),
        ])
        .await;
        let collector = ThermostatCollector::new(StaticCredential::new("token"), server.url());
        let collection = collector.collect(deadline()).await;

        assert_eq!(h2_samples(), collection.samples);
        assert!(matches!(collection.outcome, Outcome::Done { homes: 2, failed: 1 }));
        assert_eq!(2, server.count("/api/homestatus"));
    }

    #[tokio::test]
    async fn test_collect_home_without_id() {
        let server = TestServer::start(vec![
            Route::ok(
                "/api/homesdata",
                r#"{"body": {"homes": [{"id": null, "name": "Casa"}, {"id": "H2", "name": "Cabin"}]}}"#,
            ),
            Route::ok("/api/homestatus?home_id=H2", HOME_STATUS_H2),
        ])
        .await;
        let collector = ThermostatCollector::new(StaticCredential::new("token"), server.url());
        let collection = collector.collect(deadline()).await;

        assert_eq!(h2_samples(), collection.samples);
        assert!(matches!(collection.outcome, Outcome::Done { homes: 2, failed: 1 }));
        assert_eq!(1, server.count("/api/homestatus"));
    }

    #[tokio::test]
    async fn test_collect_all_homes_fail() {
        let server = TestServer::start(vec![
            Route::ok("/api/homesdata", HOMES_DATA),
            Route::ok("/api/homestatus?home_id=H1", "not json"),
        ])
        .await;
        let collector = ThermostatCollector::new(StaticCredential::new("token"), server.url());
        let collection = collector.collect(deadline()).await;

        assert!(collection.samples.is_empty());
        assert!(matches!(collection.outcome, Outcome::Done { homes: 2, failed: 2 }));
    }

    #[tokio::test]
    async fn test_collect_deadline_partial_results() {
        let server = TestServer::start(vec![
            Route::ok("/api/homesdata", HOMES_DATA),
            Route::ok("/api/homestatus?home_id=H1", HOME_STATUS_H1),
            Route::ok("/api/homestatus?home_id=H2", HOME_STATUS_H2).delay(Duration::from_secs(10)),
        ])
        .await;
        let collector = ThermostatCollector::new(StaticCredential::new("token"), server.url());
        let collection = collector
            .collect(Instant::now() + Duration::from_millis(500))
            .await;

        assert_eq!(h1_samples(), collection.samples);
        assert!(matches!(collection.outcome, Outcome::Done { homes: 2, failed: 1 }));
    }
}
