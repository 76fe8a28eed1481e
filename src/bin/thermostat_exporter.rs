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

use clap::{crate_version, ArgGroup, Parser};
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{io, process};
use thermostat_exporter::cache::SampleCache;
use thermostat_exporter::client::DEFAULT_API_URL;
use thermostat_exporter::collector::ThermostatCollector;
use thermostat_exporter::credential::{CredentialSource, StaticCredential, TokenFile};
use thermostat_exporter::http::{http_route, RequestContext};
use thermostat_exporter::metrics::{MetricsExposition, RefreshMetrics, ThermostatDescriptors};
use tokio::signal::unix::{self, SignalKind};
use tokio::task;
use tracing::{Instrument, Level};

const DEFAULT_REFRESH_SECS: u64 = 60;
const DEFAULT_STALE_SECS: u64 = 300;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9210);

/// Expose Netatmo Energy thermostat readings as Prometheus metrics
///
/// Fetch the temperature, setpoint, and boiler state of every room of every
/// home an access token has access to from the Netatmo API and expose them as
/// Prometheus metrics. Readings are fetched in the background, independent of
/// Prometheus scrapes.
///
/// The exporter doesn't acquire or refresh access tokens. Either provide a token
/// directly or provide the path to a JSON file that another process keeps up to
/// date.
#[derive(Debug, Parser)]
#[clap(name = "thermostat_exporter", version = crate_version!())]
#[clap(group(ArgGroup::new("credentials").required(true).args(&["access-token", "token-file"])))]
struct ThermostatExporterApplication {
    /// Access token used to make requests to the Netatmo API
    #[clap(long, env = "NETATMO_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Path to a JSON file containing an access token, read before each collection
    #[clap(long)]
    token_file: Option<PathBuf>,

    /// Base URL of the Netatmo API
    #[clap(long, default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Fetch readings from the Netatmo API at this interval, in seconds (at least 1)
    #[clap(long, default_value_t = DEFAULT_REFRESH_SECS, value_parser = clap::value_parser!(u64).range(1..))]
    refresh_secs: u64,

    /// Stop exposing readings that are older than this, in seconds
    #[clap(long, default_value_t = DEFAULT_STALE_SECS)]
    stale_secs: u64,

    /// Give up on requests to the Netatmo API that take longer than this, in seconds
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to. By default, thermostat_exporter will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another agent for
    /// ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = ThermostatExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let credentials: Box<dyn CredentialSource> = match (&opts.access_token, &opts.token_file) {
        (_, Some(path)) => Box::new(TokenFile::new(path)),
        (Some(token), None) => Box::new(StaticCredential::new(token.clone())),
        (None, None) => {
            tracing::error!(message = "one of --access-token or --token-file is required");
            process::exit(1)
        }
    };

    let descriptors = ThermostatDescriptors::new().unwrap_or_else(|e| {
        tracing::error!(message = "failed to declare thermostat metrics", error = %e);
        process::exit(1)
    });

    let registry = prometheus::default_registry().clone();
    let cache = SampleCache::new(descriptors, Duration::from_secs(opts.stale_secs));
    registry.register(Box::new(cache.clone())).unwrap_or_else(|e| {
        tracing::error!(message = "failed to register thermostat metric collector", error = %e);
        process::exit(1)
    });

    let refresh_metrics = RefreshMetrics::new(&registry).unwrap_or_else(|e| {
        tracing::error!(message = "failed to register exporter metrics", error = %e);
        process::exit(1)
    });

    let collector = ThermostatCollector::new(credentials, opts.api_url.clone());
    let refresh = Duration::from_secs(opts.refresh_secs);
    let timeout = Duration::from_secs(opts.timeout_secs);

    // Periodically fetch readings from the API and update the cached samples.
    task::spawn(async move {
        let mut interval = tokio::time::interval(refresh);

        loop {
            let _ = interval.tick().await;
            let deadline = tokio::time::Instant::now() + timeout;

            let collection = collector
                .collect(deadline)
                .instrument(tracing::span!(Level::DEBUG, "thermostat_collect"))
                .await;

            refresh_metrics.update(&collection.outcome);
            cache.update(collection);
        }
    });

    let context = Arc::new(RequestContext::new(MetricsExposition::new(registry)));
    let service = make_service_fn(move |_| {
        let context = context.clone();

        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                http_route(req, context.clone()).instrument(tracing::span!(Level::DEBUG, "thermostat_request"))
            }))
        }
    });

    let server = Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "error starting server", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(message = "starting server", address = %opts.bind, api_url = %opts.api_url);

    server
        .serve(service)
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    tracing::info!("server shutdown");
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod test {
    use super::ThermostatExporterApplication;
    use clap::Parser;

    #[test]
    fn test_refresh_secs_default() {
        let opts =
            ThermostatExporterApplication::try_parse_from(&["thermostat_exporter", "--access-token", "abc"]).unwrap();
        assert_eq!(60, opts.refresh_secs);
    }

    #[test]
    fn test_refresh_secs_zero_rejected() {
        let res = ThermostatExporterApplication::try_parse_from(&[
            "thermostat_exporter",
            "--access-token",
            "abc",
            "--refresh-secs",
            "0",
        ]);
        assert!(res.is_err());
    }
}
