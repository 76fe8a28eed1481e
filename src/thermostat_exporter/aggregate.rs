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

use crate::client::{HomeStatus, HomeSummary, ModuleStatus};
use std::collections::HashMap;
use std::fmt;

/// Which of the thermostat gauges a sample belongs to
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy, PartialOrd, Ord)]
pub enum MetricKind {
    Temperature,
    Setpoint,
    BoilerStatus,
}

/// Labels attached to every thermostat sample. Samples for an entire home
/// instead of a single room use empty strings for the room ID and name.
#[derive(PartialEq, Eq, Debug, Hash, Clone, PartialOrd, Ord)]
pub struct Labels {
    pub home_id: String,
    pub home_name: String,
    pub room_id: String,
    pub room_name: String,
}

impl Labels {
    /// Label values in the same order as the label names of each gauge.
    pub fn values(&self) -> [&str; 4] {
        [
            self.home_id.as_str(),
            self.home_name.as_str(),
            self.room_id.as_str(),
            self.room_name.as_str(),
        ]
    }
}

/// A single value for one of the thermostat gauges.
#[derive(PartialEq, Debug, Clone)]
pub struct MetricSample {
    pub kind: MetricKind,
    pub value: f64,
    pub labels: Labels,
}

impl fmt::Display for MetricSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [home_id, home_name, room_id, room_name] = self.labels.values();
        write!(
            f,
            "{:?}{{home_id={:?}, home_name={:?}, room_id={:?}, room_name={:?}}} {}",
            self.kind, home_id, home_name, room_id, room_name, self.value
        )
    }
}

/// ID and name of a home used for labels.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct HomeIdentity {
    pub id: String,
    pub name: String,
}

impl HomeIdentity {
    /// Merge the summary and detailed forms of a home, field by field. Values from
    /// the detailed status are preferred when they are non-empty.
    pub fn merge(summary: &HomeSummary, status: &HomeStatus) -> Self {
        Self {
            id: prefer_non_empty(&status.id, &summary.id).to_owned(),
            name: prefer_non_empty(&status.name, &summary.name).to_owned(),
        }
    }

    fn room_labels(&self, room_id: &str, room_name: &str) -> Labels {
        Labels {
            home_id: self.id.clone(),
            home_name: self.name.clone(),
            room_id: room_id.to_owned(),
            room_name: room_name.to_owned(),
        }
    }

    fn home_labels(&self) -> Labels {
        self.room_labels("", "")
    }
}

fn prefer_non_empty<'a>(preferred: &'a str, fallback: &'a str) -> &'a str {
    if preferred.is_empty() {
        fallback
    } else {
        preferred
    }
}

/// Boiler state per room and for an entire home, derived from whichever
/// modules of the home report a boiler status.
///
/// Some installations report the boiler relay state on a module tied to a room,
/// others only on a module shared by the whole home. Room values are available
/// when there's a module for that room. The home value is on if any module
/// reports the boiler as on.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct BoilerRollup {
    by_room: HashMap<String, f64>,
    home: Option<f64>,
}

impl BoilerRollup {
    pub fn from_modules<'a, I>(modules: I) -> Self
    where
        I: IntoIterator<Item = &'a ModuleStatus>,
    {
        modules
            .into_iter()
            .filter_map(|m| m.boiler_status.map(|on| (m.room_id.as_str(), boiler_value(on))))
            .fold(Self::default(), |mut acc, (room_id, v)| {
                // Last module for a room wins, they aren't expected to disagree.
                if !room_id.is_empty() {
                    acc.by_room.insert(room_id.to_owned(), v);
                }

                acc.home = match acc.home {
                    Some(current) if current >= v => Some(current),
                    _ => Some(v),
                };

                acc
            })
    }

    /// Boiler value for a room, `None` if no module reports it (not the same as off).
    pub fn room(&self, room_id: &str) -> Option<f64> {
        self.by_room.get(room_id).copied()
    }

    /// Boiler value for the entire home, `None` if no module reports it.
    pub fn home(&self) -> Option<f64> {
        self.home
    }
}

fn boiler_value(on: bool) -> f64 {
    if on {
        1.0
    } else {
        0.0
    }
}

/// Convert the status of a single home into thermostat samples.
///
/// Rooms emit temperature and setpoint samples only for values that were
/// reported and a boiler sample only if a module reports the boiler state for
/// that room. A home level boiler sample is emitted last if any module of the
/// home reported a boiler state.
pub fn home_samples(summary: &HomeSummary, status: &HomeStatus) -> Vec<MetricSample> {
    let home = HomeIdentity::merge(summary, status);
    let boiler = BoilerRollup::from_modules(&status.modules);
    let mut samples = Vec::with_capacity(status.rooms.len() * 3 + 1);

    for room in &status.rooms {
        let labels = home.room_labels(&room.id, &room.name);
        let values = [
            (MetricKind::Temperature, room.measured_temperature),
            (MetricKind::Setpoint, room.setpoint_temperature),
            (MetricKind::BoilerStatus, boiler.room(&room.id)),
        ];

        samples.extend(values.into_iter().filter_map(|(kind, value)| {
            value.map(|value| MetricSample {
                kind,
                value,
                labels: labels.clone(),
            })
        }));
    }

    if let Some(value) = boiler.home() {
        samples.push(MetricSample {
            kind: MetricKind::BoilerStatus,
            value,
            labels: home.home_labels(),
        });
    }

    samples
}
