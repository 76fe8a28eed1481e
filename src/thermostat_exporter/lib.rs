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

//! Export Netatmo Energy thermostat readings as Prometheus metrics.
//!
//! ## Features
//!
//! `thermostat_exporter` periodically fetches the state of every home an access token has
//! access to from the [Netatmo Energy API] and emits the temperature, setpoint, and boiler
//! state of each room as Prometheus metrics. Values are only emitted when the API reports
//! them: a room without a setpoint doesn't get a setpoint metric (rather than a value of `0`).
//!
//! The following metrics are exported, all labeled with `home_id`, `home_name`, `room_id`,
//! and `room_name`.
//!
//! * `netatmo_thermostat_temperature` - Measured room temperature, in degrees celsius.
//! * `netatmo_thermostat_setpoint` - Target room temperature, in degrees celsius.
//! * `netatmo_thermostat_boiler_status` - Boiler status, `1` for on and `0` for off. Emitted
//!   per-room when a module in that room reports the boiler status. Also emitted per-home
//!   with empty `room_id` and `room_name` labels, on if any module of the home reports the
//!   boiler as on.
//!
//! The following metrics about the exporter itself are exported as well.
//!
//! * `netatmo_exporter_collections_total` - Number of attempts to fetch readings from the API.
//! * `netatmo_exporter_errors_total{kind=$KIND}` - Errors fetching readings by kind.
//! * `netatmo_exporter_last_collection_timestamp` - UNIX timestamp of the last collection that
//!   was able to list homes.
//!
//! [Netatmo Energy API]: https://dev.netatmo.com/apidocumentation/energy
//!
//! ## Build
//!
//! `thermostat_exporter` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Access token
//!
//! Requests to the Netatmo API require an OAuth access token with the `read_thermostat` scope.
//! `thermostat_exporter` doesn't acquire or refresh tokens itself. Either pass a token directly
//! (via `--access-token` or the `NETATMO_ACCESS_TOKEN` environment variable) or point it at a
//! JSON file kept up to date by some other process via `--token-file`. The file is read before
//! every collection and must look like the example below. `expires_at` is a UNIX timestamp in
//! seconds and is optional.
//!
//! ```text
//! {"access_token": "abc|123", "expires_at": 1650000000}
//! ```
//!
//! Collections are skipped (without any errors) while the file doesn't exist or the token in
//! it has expired.
//!
//! ### Run
//!
//! ```text
//! ./thermostat_exporter --token-file /var/lib/thermostat_exporter/token.json
//! ```
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `9210` at `/metrics`. Readings are fetched from the
//! API every `60s` by default, in the background (*not* in response to Prometheus scrapes).
//! Readings older than `--stale-secs` are no longer exposed.
//!
//! ```yaml
//! # Sample config for Prometheus.
//!
//! scrape_configs:
//!   - job_name: thermostat_exporter
//!     static_configs:
//!       - targets: ['example:9210']
//! ```
//!

pub mod aggregate;
pub mod cache;
pub mod client;
pub mod collector;
pub mod credential;
pub mod http;
pub mod metrics;
mod testing;
