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

use crate::aggregate::{MetricKind, MetricSample};
use crate::collector::Outcome;
use prometheus::core::Desc;
use prometheus::proto::{self, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task;
use tracing::Instrument;

pub const NAMESPACE: &str = "netatmo";

/// Label names shared by all thermostat gauges, sorted by name.
pub const LABEL_NAMES: [&str; 4] = ["home_id", "home_name", "room_id", "room_name"];

/// Descriptors of the thermostat gauges.
///
/// The descriptors are declared once and never change. Values are emitted as new
/// metric families each time they're requested, so there's no state shared
/// between concurrent collections.
#[derive(Debug, Clone)]
pub struct ThermostatDescriptors {
    temperature: Desc,
    setpoint: Desc,
    boiler_status: Desc,
}

impl ThermostatDescriptors {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            temperature: gauge_desc(
                "thermostat_temperature",
                "Netatmo Energy measured room temperature in degrees Celsius.",
            )?,
            setpoint: gauge_desc(
                "thermostat_setpoint",
                "Netatmo Energy target setpoint temperature in degrees Celsius.",
            )?,
            boiler_status: gauge_desc(
                "thermostat_boiler_status",
                "Netatmo Energy boiler status (1=on, 0=off). Per-room when possibile, otherwise per-home.",
            )?,
        })
    }

    pub fn descs(&self) -> Vec<&Desc> {
        vec![&self.temperature, &self.setpoint, &self.boiler_status]
    }

    fn desc(&self, kind: MetricKind) -> &Desc {
        match kind {
            MetricKind::Temperature => &self.temperature,
            MetricKind::Setpoint => &self.setpoint,
            MetricKind::BoilerStatus => &self.boiler_status,
        }
    }

    /// Build gauge metric families from thermostat samples. Families without any
    /// samples are omitted.
    pub fn families(&self, samples: &[MetricSample]) -> Vec<MetricFamily> {
        let mut by_kind: BTreeMap<MetricKind, Vec<Metric>> = BTreeMap::new();
        for s in samples {
            by_kind.entry(s.kind).or_default().push(gauge_metric(s));
        }

        by_kind
            .into_iter()
            .map(|(kind, metrics)| {
                let desc = self.desc(kind);
                let mut mf = MetricFamily::default();
                mf.set_name(desc.fq_name.clone());
                mf.set_help(desc.help.clone());
                mf.set_field_type(MetricType::GAUGE);
                mf.set_metric(metrics.into());
                mf
            })
            .collect()
    }
}

fn gauge_desc(name: &str, help: &str) -> Result<Desc, prometheus::Error> {
    Desc::new(
        format!("{}_{}", NAMESPACE, name),
        help.to_owned(),
        LABEL_NAMES.iter().map(|l| (*l).to_owned()).collect(),
        HashMap::new(),
    )
}

fn gauge_metric(sample: &MetricSample) -> Metric {
    let pairs: Vec<LabelPair> = LABEL_NAMES
        .iter()
        .zip(sample.labels.values())
        .map(|(name, value)| {
            let mut pair = LabelPair::default();
            pair.set_name((*name).to_owned());
            pair.set_value(value.to_owned());
            pair
        })
        .collect();

    let mut gauge = proto::Gauge::default();
    gauge.set_value(sample.value);

    let mut m = Metric::default();
    m.set_label(pairs.into());
    m.set_gauge(gauge);
    m
}

/// Metrics about the exporter refreshing thermostat readings in the background.
#[derive(Debug, Clone)]
pub struct RefreshMetrics {
    collections: IntCounter,
    errors: IntCounterVec,
    last_success: Gauge,
}

impl RefreshMetrics {
    pub fn new(reg: &Registry) -> Result<Self, prometheus::Error> {
        let collections = IntCounter::with_opts(
            Opts::new("collections_total", "Number of attempted collections")
                .namespace(NAMESPACE)
                .subsystem("exporter"),
        )?;
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Number of collection errors by type")
                .namespace(NAMESPACE)
                .subsystem("exporter"),
            &["kind"],
        )?;
        let last_success = Gauge::with_opts(
            Opts::new(
                "last_collection_timestamp",
                "Timestamp of the last collection that fetched the list of homes",
            )
            .namespace(NAMESPACE)
            .subsystem("exporter"),
        )?;

        reg.register(Box::new(collections.clone()))?;
        reg.register(Box::new(errors.clone()))?;
        reg.register(Box::new(last_success.clone()))?;

        Ok(Self {
            collections,
            errors,
            last_success,
        })
    }

    pub fn update(&self, outcome: &Outcome) {
        self.collections.inc();

        match outcome {
            Outcome::Skipped => {}
            Outcome::Aborted(e) => {
                self.errors.with_label_values(&[e.kind().as_label()]).inc();
            }
            Outcome::Done { failed, .. } => {
                if *failed > 0 {
                    self.errors.with_label_values(&["home_status"]).inc_by(*failed as u64);
                }

                // If we can't get the number of seconds since the epoch, skip the update
                let _ = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| self.last_success.set(d.as_secs_f64()));
            }
        }
    }
}

/// Error rendering the contents of a registry for a scrape.
#[derive(Debug)]
pub enum ExpositionError {
    /// The blocking task gathering metrics panicked or was cancelled.
    Gather(task::JoinError),
    Encode(prometheus::Error),
}

impl fmt::Display for ExpositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpositionError::Gather(e) => write!(f, "unable to gather Prometheus metrics: {}", e),
            ExpositionError::Encode(e) => write!(f, "unable to encode Prometheus metrics: {}", e),
        }
    }
}

impl Error for ExpositionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExpositionError::Gather(e) => Some(e),
            ExpositionError::Encode(e) => Some(e),
        }
    }
}

/// Renders everything in a registry (thermostat samples, exporter counters, and
/// process metrics) in the Prometheus text exposition format.
#[derive(Debug)]
pub struct MetricsExposition {
    registry: Registry,
}

impl MetricsExposition {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub async fn encoded_text(&self) -> Result<Vec<u8>, ExpositionError> {
        let registry = self.registry.clone();

        // Process metrics are read from /proc and the sample cache takes a lock,
        // neither of which should block a thread serving HTTP requests.
        task::spawn_blocking(move || encode_text(&registry))
            .instrument(tracing::debug_span!("thermostat_exporter_gather"))
            .await
            .map_err(ExpositionError::Gather)?
    }
}

fn encode_text(registry: &Registry) -> Result<Vec<u8>, ExpositionError> {
    let families = registry.gather();
    tracing::debug!(message = "encoding metric families", num_families = families.len());

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buffer)
        .map_err(ExpositionError::Encode)?;
    Ok(buffer)
}

#[cfg(test)]
mod test {
    use super::{MetricsExposition, RefreshMetrics, ThermostatDescriptors, LABEL_NAMES};
    use crate::aggregate::{Labels, MetricKind, MetricSample};
    use crate::client::{ClientError, ClientErrorKind};
    use crate::collector::{CollectError, Outcome};
    use prometheus::proto::MetricType;
    use prometheus::Registry;

    fn sample(kind: MetricKind, value: f64, room_id: &str) -> MetricSample {
        MetricSample {
            kind,
            value,
            labels: Labels {
                home_id: "H1".to_owned(),
                home_name: "Casa".to_owned(),
                room_id: room_id.to_owned(),
                room_name: "".to_owned(),
            },
        }
    }

    #[test]
    fn test_descriptors() {
        let descriptors = ThermostatDescriptors::new().unwrap();
        let names: Vec<&str> = descriptors.descs().iter().map(|d| d.fq_name.as_str()).collect();

        assert_eq!(
            vec![
                "netatmo_thermostat_temperature",
                "netatmo_thermostat_setpoint",
                "netatmo_thermostat_boiler_status",
            ],
            names
        );

        for desc in descriptors.descs() {
            assert_eq!(LABEL_NAMES.to_vec(), desc.variable_labels);
        }
    }

    #[test]
    fn test_descriptors_help() {
        let descriptors = ThermostatDescriptors::new().unwrap();
        let help: Vec<&str> = descriptors.descs().iter().map(|d| d.help.as_str()).collect();

        assert_eq!(
            vec![
                "Netatmo Energy measured room temperature in degrees Celsius.",
                "Netatmo Energy target setpoint temperature in degrees Celsius.",
                "Netatmo Energy boiler status (1=on, 0=off). Per-room when possibile, otherwise per-home.",
            ],
            help
        );
    }

    #[test]
    fn test_families_empty() {
        let descriptors = ThermostatDescriptors::new().unwrap();
        assert!(descriptors.families(&[]).is_empty());
    }

    #[test]
    fn test_families_grouped_by_kind() {
        let descriptors = ThermostatDescriptors::new().unwrap();
        let families = descriptors.families(&[
            sample(MetricKind::Temperature, 17.9, "R1"),
            sample(MetricKind::BoilerStatus, 0.0, "R1"),
            sample(MetricKind::BoilerStatus, 1.0, ""),
        ]);

        assert_eq!(2, families.len());

        let temperature = &families[0];
        assert_eq!("netatmo_thermostat_temperature", temperature.get_name());
        assert_eq!(MetricType::GAUGE, temperature.get_field_type());
        assert_eq!(1, temperature.get_metric().len());
        assert_eq!(17.9, temperature.get_metric()[0].get_gauge().get_value());

        let boiler = &families[1];
        assert_eq!("netatmo_thermostat_boiler_status", boiler.get_name());
        assert_eq!(2, boiler.get_metric().len());

        let home_level = &boiler.get_metric()[1];
        let labels: Vec<(&str, &str)> = home_level
            .get_label()
            .iter()
            .map(|p| (p.get_name(), p.get_value()))
            .collect();
        assert_eq!(
            vec![("home_id", "H1"), ("home_name", "Casa"), ("room_id", ""), ("room_name", "")],
            labels
        );
        assert_eq!(1.0, home_level.get_gauge().get_value());
    }

    #[test]
    fn test_refresh_metrics_update() {
        let reg = Registry::new();
        let metrics = RefreshMetrics::new(&reg).unwrap();

        metrics.update(&Outcome::Skipped);
        metrics.update(&Outcome::Done { homes: 3, failed: 2 });
        metrics.update(&Outcome::Aborted(CollectError::ListHomes(ClientError::KindMsg(
            ClientErrorKind::Request,
            "test",
        ))));

        assert_eq!(3, metrics.collections.get());
        assert_eq!(2, metrics.errors.with_label_values(&["home_status"]).get());
        assert_eq!(1, metrics.errors.with_label_values(&["list_homes"]).get());
        assert!(metrics.last_success.get() > 0.0);
    }

    #[tokio::test]
    async fn test_encoded_text() {
        let reg = Registry::new();
        let metrics = RefreshMetrics::new(&reg).unwrap();
        metrics.update(&Outcome::Skipped);

        let exposition = MetricsExposition::new(reg);
        let text = String::from_utf8(exposition.encoded_text().await.unwrap()).unwrap();

        assert!(text.contains("# TYPE netatmo_exporter_collections_total counter"));
        assert!(text.contains("netatmo_exporter_collections_total 1"));
    }
}
