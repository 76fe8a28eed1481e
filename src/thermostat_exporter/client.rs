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

use crate::credential::Credential;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::error::Error;
use std::fmt::{self, Formatter};
use tokio::time::Instant;

pub const DEFAULT_API_URL: &str = "https://api.netatmo.com";

/// Deserialize a string that might be `null` as an empty string.
fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Deserialize a list that might be `null` as an empty list.
fn nullable_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Summary of a home from the `homesdata` endpoint.
///
/// A home without an ID can't have its status fetched. It's kept here so that
/// it fails on its own instead of failing the entire listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HomeSummary {
    #[serde(default, deserialize_with = "nullable_string")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub name: String,
}

/// Detailed state of a home from the `homestatus` endpoint.
///
/// The ID and name may be missing here, in which case those from the
/// `HomeSummary` should be used.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HomeStatus {
    #[serde(default, deserialize_with = "nullable_string")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub rooms: Vec<RoomStatus>,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub modules: Vec<ModuleStatus>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoomStatus {
    #[serde(deserialize_with = "nullable_string")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub name: String,
    #[serde(rename = "therm_measured_temperature", default)]
    pub measured_temperature: Option<f64>,
    #[serde(rename = "therm_setpoint_temperature", default)]
    pub setpoint_temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModuleStatus {
    #[serde(deserialize_with = "nullable_string")]
    pub id: String,
    #[serde(rename = "type", default, deserialize_with = "nullable_string")]
    pub module_type: String,
    /// Room this module is part of, empty if it isn't tied to a particular room.
    #[serde(default, deserialize_with = "nullable_string")]
    pub room_id: String,
    #[serde(default)]
    pub boiler_status: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct HomesDataResponse {
    body: HomesDataBody,
}

#[derive(Debug, Deserialize)]
struct HomesDataBody {
    #[serde(default, deserialize_with = "nullable_vec")]
    homes: Vec<HomeSummary>,
}

#[derive(Debug, Deserialize)]
struct HomeStatusResponse {
    body: HomeStatusBody,
}

#[derive(Debug, Deserialize)]
struct HomeStatusBody {
    home: HomeStatus,
}

/// Kinds of errors that can be encountered making requests to the Netatmo API
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum ClientErrorKind {
    Request,
    HttpStatus,
    Decode,
}

impl ClientErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            ClientErrorKind::Request => "request",
            ClientErrorKind::HttpStatus => "http_status",
            ClientErrorKind::Decode => "decode",
        }
    }
}

/// Error building, sending, or decoding the response of a Netatmo API request.
#[derive(Debug)]
pub enum ClientError {
    Status(&'static str, StatusCode),
    KindMsg(ClientErrorKind, &'static str),
    KindMsgCause(ClientErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl ClientError {
    pub fn kind(&self) -> ClientErrorKind {
        match self {
            ClientError::Status(_, _) => ClientErrorKind::HttpStatus,
            ClientError::KindMsg(kind, _) => *kind,
            ClientError::KindMsgCause(kind, _, _) => *kind,
        }
    }

    /// HTTP status of the response, if the request failed due to a non-success status
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status(_, status) => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Status(msg, status) => write!(f, "{}: status {}", msg, status),
            ClientError::KindMsg(_, msg) => msg.fmt(f),
            ClientError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Read-only client for the Netatmo Energy API bound to a single credential.
///
/// A new client is meant to be created for each collection using whatever
/// credential is current at the time. No retries are performed, failed requests
/// are returned to the caller as-is.
#[derive(Debug)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credential: Credential,
}

impl ApiClient {
    pub fn new<S>(base_url: S, credential: Credential) -> Result<Self, ClientError>
    where
        S: Into<String>,
    {
        let client = Client::builder()
            .user_agent(concat!("thermostat_exporter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                ClientError::KindMsgCause(ClientErrorKind::Request, "unable to build HTTP client", Box::new(e))
            })?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self {
            client,
            base_url,
            credential,
        })
    }

    /// List all homes the credential has access to.
    pub async fn list_homes(&self, deadline: Instant) -> Result<Vec<HomeSummary>, ClientError> {
        let url = format!("{}{}", self.base_url, Endpoint::HomesData.path());
        let req = self.client.get(url).bearer_auth(self.credential.access_token());

        let res: HomesDataResponse = fetch(req, Endpoint::HomesData, deadline).await?;
        tracing::debug!(message = "fetched homes", num_homes = res.body.homes.len());
        Ok(res.body.homes)
    }

    /// Fetch the current state of all rooms and modules of a particular home.
    pub async fn home_status(&self, home_id: &str, deadline: Instant) -> Result<HomeStatus, ClientError> {
        let url = format!("{}{}", self.base_url, Endpoint::HomeStatus.path());
        let req = self
            .client
            .get(url)
            .bearer_auth(self.credential.access_token())
            .query(&[("home_id", home_id)]);

        let res: HomeStatusResponse = fetch(req, Endpoint::HomeStatus, deadline).await?;
        tracing::debug!(
            message = "fetched home status",
            home_id = home_id,
            num_rooms = res.body.home.rooms.len(),
            num_modules = res.body.home.modules.len(),
        );
        Ok(res.body.home)
    }
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    HomesData,
    HomeStatus,
}

impl Endpoint {
    fn path(&self) -> &'static str {
        match self {
            Endpoint::HomesData => "/api/homesdata",
            Endpoint::HomeStatus => "/api/homestatus",
        }
    }

    fn request_msg(&self) -> &'static str {
        match self {
            Endpoint::HomesData => "executing homesdata request",
            Endpoint::HomeStatus => "executing homestatus request",
        }
    }

    fn status_msg(&self) -> &'static str {
        match self {
            Endpoint::HomesData => "homesdata request failed",
            Endpoint::HomeStatus => "homestatus request failed",
        }
    }

    fn decode_msg(&self) -> &'static str {
        match self {
            Endpoint::HomesData => "decoding homesdata response",
            Endpoint::HomeStatus => "decoding homestatus response",
        }
    }

    fn timeout_msg(&self) -> &'static str {
        match self {
            Endpoint::HomesData => "deadline exceeded for homesdata request",
            Endpoint::HomeStatus => "deadline exceeded for homestatus request",
        }
    }
}

/// Send a request and decode the JSON response, giving up once `deadline` has passed.
async fn fetch<T>(req: RequestBuilder, endpoint: Endpoint, deadline: Instant) -> Result<T, ClientError>
where
    T: DeserializeOwned,
{
    let fut = async {
        let res = req.send().await.map_err(|e| {
            ClientError::KindMsgCause(ClientErrorKind::Request, endpoint.request_msg(), Box::new(e))
        })?;

        let status = res.status();
        if !status.is_success() {
            return Err(ClientError::Status(endpoint.status_msg(), status));
        }

        let bytes = res.bytes().await.map_err(|e| {
            ClientError::KindMsgCause(ClientErrorKind::Request, endpoint.request_msg(), Box::new(e))
        })?;

        serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::KindMsgCause(ClientErrorKind::Decode, endpoint.decode_msg(), Box::new(e)))
    };

    match tokio::time::timeout_at(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(ClientError::KindMsg(ClientErrorKind::Request, endpoint.timeout_msg())),
    }
}
