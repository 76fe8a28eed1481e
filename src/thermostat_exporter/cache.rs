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

use crate::aggregate::MetricSample;
use crate::collector::{Collection, Outcome};
use crate::metrics::ThermostatDescriptors;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Snapshot {
    samples: Vec<MetricSample>,
    collected: Instant,
}

#[derive(Debug)]
struct Inner {
    descriptors: ThermostatDescriptors,
    max_age: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

/// Most recent thermostat samples, exposed as a Prometheus `Collector`.
///
/// Collections from the Netatmo API happen in the background on their own
/// schedule, independent of scrapes. Samples older than `max_age` are never
/// exposed so that Prometheus doesn't keep ingesting readings from a collection
/// that hasn't worked for a while. Clones share the same samples.
#[derive(Debug, Clone)]
pub struct SampleCache {
    inner: Arc<Inner>,
}

impl SampleCache {
    pub fn new(descriptors: ThermostatDescriptors, max_age: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                descriptors,
                max_age,
                snapshot: RwLock::new(None),
            }),
        }
    }

    /// Replace the cached samples with those of a collection that fetched the
    /// list of homes. Skipped or aborted collections leave the cache untouched
    /// and the existing samples age out.
    pub fn update(&self, collection: Collection) {
        if let Outcome::Done { .. } = collection.outcome {
            self.store(collection.samples, Instant::now());
        }
    }

    fn store(&self, samples: Vec<MetricSample>, collected: Instant) {
        let mut snapshot = self.inner.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *snapshot = Some(Snapshot { samples, collected });
    }

    /// Cached samples, if they are younger than `max_age` relative to `now`.
    pub fn fresh(&self, now: Instant) -> Option<Vec<MetricSample>> {
        let snapshot = self.inner.snapshot.read().unwrap_or_else(|e| e.into_inner());

        match snapshot.as_ref() {
            Some(s) if now.saturating_duration_since(s.collected) <= self.inner.max_age => Some(s.samples.clone()),
            Some(s) => {
                tracing::debug!(
                    message = "dropping stale thermostat samples",
                    age_secs = now.saturating_duration_since(s.collected).as_secs(),
                    max_age_secs = self.inner.max_age.as_secs(),
                );
                None
            }
            None => None,
        }
    }
}

impl Collector for SampleCache {
    fn desc(&self) -> Vec<&Desc> {
        self.inner.descriptors.descs()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.fresh(Instant::now())
            .map(|samples| self.inner.descriptors.families(&samples))
            .unwrap_or_default()
    }
}
