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

use serde::Deserialize;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Credentials this close to expiring are treated as already expired so that a
/// token doesn't expire in the middle of a collection.
const EXPIRY_DELTA: Duration = Duration::from_secs(10);

/// Bearer credential used to authenticate requests to the Netatmo API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    expires_at: Option<SystemTime>,
}

impl Credential {
    pub fn new<S>(access_token: S, expires_at: Option<SystemTime>) -> Self
    where
        S: Into<String>,
    {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// Return true if the credential has a token and won't expire in the next
    /// few seconds, relative to `now`. Credentials without an expiry never expire.
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        if self.access_token.is_empty() {
            return false;
        }

        match self.expires_at {
            Some(expiry) => expiry
                .checked_sub(EXPIRY_DELTA)
                .map(|cutoff| cutoff > now)
                .unwrap_or(false),
            None => true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }
}

// Keep tokens out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Error retrieving a credential, distinct from a credential simply not being
/// available yet.
#[derive(Debug)]
pub enum CredentialError {
    MsgCause(&'static str, Box<dyn Error + Send + Sync>),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::MsgCause(msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for CredentialError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CredentialError::MsgCause(_, ref e) => Some(e.as_ref()),
        }
    }
}

/// Something that can produce a bearer credential on demand.
///
/// `Ok(None)` means no credential is available right now (e.g. the user hasn't
/// authorized the exporter yet). This is not an error, collections are skipped
/// until one shows up.
pub trait CredentialSource: Send + Sync {
    fn credential(&self) -> Result<Option<Credential>, CredentialError>;
}

impl<T> CredentialSource for Box<T>
where
    T: CredentialSource + ?Sized,
{
    fn credential(&self) -> Result<Option<Credential>, CredentialError> {
        T::credential(self)
    }
}

/// Fixed access token, usually supplied on the command line or via the environment.
#[derive(Debug, Clone)]
pub struct StaticCredential {
    credential: Credential,
}

impl StaticCredential {
    pub fn new<S>(access_token: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            credential: Credential::new(access_token, None),
        }
    }
}

impl CredentialSource for StaticCredential {
    fn credential(&self) -> Result<Option<Credential>, CredentialError> {
        Ok(Some(self.credential.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct TokenFileContents {
    access_token: String,
    #[serde(default)]
    expires_at: Option<u64>,
}

/// Access token stored as JSON on disk, maintained by some external process.
///
/// The file is read again for every call so that tokens refreshed by that
/// process are picked up without restarting the exporter. Expected format:
///
/// ```text
/// {"access_token": "abc|123", "expires_at": 1650000000}
/// ```
///
/// `expires_at` is a UNIX timestamp in seconds and is optional.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialSource for TokenFile {
    fn credential(&self) -> Result<Option<Credential>, CredentialError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CredentialError::MsgCause("unable to read token file", Box::new(e))),
        };

        let contents: TokenFileContents = serde_json::from_slice(&bytes)
            .map_err(|e| CredentialError::MsgCause("unable to parse token file", Box::new(e)))?;

        let expires_at = match contents.expires_at {
            Some(secs) => Some(UNIX_EPOCH.checked_add(Duration::from_secs(secs)).ok_or_else(|| {
                CredentialError::MsgCause(
                    "invalid expiry in token file",
                    Box::new(io::Error::new(io::ErrorKind::InvalidData, "expires_at out of range")),
                )
            })?),
            None => None,
        };

        Ok(Some(Credential::new(contents.access_token, expires_at)))
    }
}
