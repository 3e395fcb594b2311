// bme680_exporter - Environmental sensor metrics exporter for Prometheus
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

use crate::metrics::{MetricsExposition, SensorMetrics};
use crate::sampling::{ReadingSink, SamplingLoop, SinkError};
use crate::sensor::{Reading, Sensor};
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, StatusCode, Uri};
use prometheus::TEXT_FORMAT;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Level};

pub const DEFAULT_PUSH_TIMEOUT_SECS: u64 = 10;

/// Error delivering metrics to a remote collector
#[derive(Debug)]
pub enum PushError {
    UnsupportedScheme(Uri),
    Request(hyper::http::Error),
    Transport(hyper::Error),
    Timeout(Duration),
    Status(Method, StatusCode),
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::UnsupportedScheme(uri) => write!(f, "unsupported URL {}, only http is supported", uri),
            PushError::Request(e) => write!(f, "unable to build request: {}", e),
            PushError::Transport(e) => write!(f, "unable to send request: {}", e),
            PushError::Timeout(d) => write!(f, "request timed out after {:?}", d),
            PushError::Status(method, status) => write!(f, "unexpected status for {}: {}", method, status),
        }
    }
}

impl Error for PushError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PushError::Request(e) => Some(e),
            PushError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Client for submitting rendered metrics to a single collector URL, usually a
/// Prometheus Pushgateway group like `http://example:9091/metrics/job/bme680`.
#[derive(Debug)]
pub struct PushClient {
    client: Client<HttpConnector>,
    url: Uri,
    timeout: Duration,
}

impl PushClient {
    pub fn new(url: Uri, timeout: Duration) -> Result<Self, PushError> {
        if url.scheme_str() != Some("http") || url.host().is_none() {
            return Err(PushError::UnsupportedScheme(url));
        }

        Ok(Self {
            client: Client::new(),
            url,
            timeout,
        })
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// Submit metrics in the text exposition format.
    pub async fn push(&self, body: Vec<u8>) -> Result<(), PushError> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(self.url.clone())
            .header(CONTENT_TYPE, TEXT_FORMAT)
            .body(Body::from(body))
            .map_err(PushError::Request)?;

        self.send(req).instrument(tracing::span!(Level::DEBUG, "push")).await
    }

    /// Ask the collector to drop all series previously pushed.
    pub async fn deregister(&self) -> Result<(), PushError> {
        let req = Request::builder()
            .method(Method::DELETE)
            .uri(self.url.clone())
            .body(Body::empty())
            .map_err(PushError::Request)?;

        self.send(req).instrument(tracing::span!(Level::DEBUG, "deregister")).await
    }

    async fn send(&self, req: Request<Body>) -> Result<(), PushError> {
        let method = req.method().clone();
        let res = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| PushError::Timeout(self.timeout))?
            .map_err(PushError::Transport)?;

        let status = res.status();
        tracing::debug!(message = "collector responded", method = %method, status = %status);

        if status.is_success() {
            Ok(())
        } else {
            Err(PushError::Status(method, status))
        }
    }
}

/// Sink that records each reading as metrics and then pushes every metric in the
/// registry to a collector. A failed push is returned to the sampling loop as an error.
pub struct PushSink {
    metrics: SensorMetrics,
    exposition: MetricsExposition,
    client: Arc<PushClient>,
}

impl PushSink {
    pub fn new(metrics: SensorMetrics, exposition: MetricsExposition, client: Arc<PushClient>) -> Self {
        Self {
            metrics,
            exposition,
            client,
        }
    }
}

impl ReadingSink for PushSink {
    async fn accept(&self, reading: Reading) -> Result<(), SinkError> {
        self.metrics.observe(&reading);
        let body = self.exposition.encoded_text().await?;
        self.client.push(body).await?;
        Ok(())
    }
}

/// Run the sampling loop in the current task until `shutdown` completes, then
/// deregister from the collector.
///
/// The stop request is only noticed at the start of the next cycle so deregistration
/// happens after the last push has completed.
pub async fn run_until_shutdown<S, K, F>(
    sampling: SamplingLoop<S, K>,
    client: Arc<PushClient>,
    shutdown: F,
) -> Result<(), PushError>
where
    S: Sensor + Send + 'static,
    K: ReadingSink,
    F: Future<Output = ()> + Send + 'static,
{
    let stop = sampling.stop_handle();
    tokio::spawn(async move {
        shutdown.await;
        tracing::info!(message = "stopping sampling loop");
        stop.stop();
    });

    sampling.run().await;

    tracing::info!(message = "removing metrics from collector", url = %client.url());
    client.deregister().await
}

#[cfg(test)]
mod test {
    use super::{run_until_shutdown, PushClient, PushError, PushSink};
    use crate::metrics::{Labels, MetricsExposition, MotionMetrics, ReadMetrics, SensorMetrics};
    use crate::sampling::{ReadingSink, SamplingLoop};
    use crate::sensor::test::{eventually, reading, ScriptedSensor};
    use crate::sensor::SensorSettings;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Method, Request, Response, Server, StatusCode, Uri};
    use prometheus::Registry;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    type Recorded = Arc<Mutex<Vec<(Method, String)>>>;

    /// Start a local HTTP server that records the method and body of every request
    /// and responds with the given status.
    fn collector(status: StatusCode) -> (Uri, Recorded) {
        let recorded: Recorded = Default::default();
        let requests = recorded.clone();

        let service = make_service_fn(move |_| {
            let requests = requests.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let requests = requests.clone();
                    async move {
                        let method = req.method().clone();
                        let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
                        requests
                            .lock()
                            .unwrap()
                            .push((method, String::from_utf8(body.to_vec()).unwrap()));

                        let mut res = Response::new(Body::empty());
                        *res.status_mut() = status;
                        Ok::<_, Infallible>(res)
                    }
                }))
            }
        });

        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(service);
        let url = format!("http://{}/metrics/job/test", server.local_addr()).parse().unwrap();
        tokio::spawn(server);

        (url, recorded)
    }

    fn sample_line<'a>(body: &'a str, name: &str) -> &'a str {
        body.lines()
            .find(|l| l.starts_with(name))
            .unwrap_or_else(|| panic!("missing {} in {}", name, body))
    }

    #[test]
    fn test_push_client_rejects_https() {
        let url: Uri = "https://example.com/metrics/job/test".parse().unwrap();
        let res = PushClient::new(url, Duration::from_secs(1));

        assert!(matches!(res, Err(PushError::UnsupportedScheme(_))));
    }

    #[tokio::test]
    async fn test_push_client_error_status() {
        let (url, recorded) = collector(StatusCode::BAD_REQUEST);
        let client = PushClient::new(url, Duration::from_secs(5)).unwrap();

        let res = client.push(b"something 1\n".to_vec()).await;

        match res {
            Err(PushError::Status(method, status)) => {
                assert_eq!(Method::POST, method);
                assert_eq!(StatusCode::BAD_REQUEST, status);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(1, recorded.lock().unwrap().len());
    }

    #[tokio::test]
    async fn test_push_client_timeout() {
        // Accept connections but never respond to any requests
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url: Uri = format!("http://{}/metrics/job/test", listener.local_addr().unwrap())
            .parse()
            .unwrap();
        tokio::spawn(async move {
            let mut connections = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                connections.push(socket);
            }
        });

        let timeout = Duration::from_millis(50);
        let client = PushClient::new(url, timeout).unwrap();

        match client.push(b"something 1\n".to_vec()).await {
            Err(PushError::Timeout(d)) => assert_eq!(timeout, d),
            other => panic!("unexpected result: {:?}", other),
        }

        match client.deregister().await {
            Err(PushError::Timeout(d)) => assert_eq!(timeout, d),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_push_sink_failure_is_returned() {
        let (url, _recorded) = collector(StatusCode::INTERNAL_SERVER_ERROR);
        let registry = Registry::new();
        let metrics = SensorMetrics::new("test", &Labels::new(), &registry).unwrap();
        let client = Arc::new(PushClient::new(url, Duration::from_secs(5)).unwrap());
        let sink = PushSink::new(metrics, MetricsExposition::new(registry), client);

        let res = sink.accept(reading(21.5, true)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_run_until_shutdown_pushes_then_deregisters() {
        let (url, recorded) = collector(StatusCode::OK);
        let registry = Registry::new();
        let labels = Labels::new().with("room", "a");
        let metrics = SensorMetrics::new("test", &labels, &registry).unwrap();
        let read_metrics = ReadMetrics::new("test", &labels, &registry).unwrap();
        let motion = MotionMetrics::new("test", &labels, &registry).unwrap();
        motion.observe(2);

        let client = Arc::new(PushClient::new(url, Duration::from_secs(5)).unwrap());
        let sink = PushSink::new(metrics, MetricsExposition::new(registry), client.clone());
        let sensor = ScriptedSensor::new(vec![Ok(reading(20.0, true)), Ok(reading(21.5, true))]);
        let reads = sensor.reads();

        let sampling = SamplingLoop::new(
            sensor,
            &SensorSettings::default(),
            sink,
            Duration::from_millis(1),
            read_metrics,
        )
        .unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(run_until_shutdown(sampling, client, async move {
            let _ = rx.await;
        }));

        // Wait for a cycle past the two scripted readings so both pushes are done
        eventually(|| *reads.lock().unwrap() >= 3).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        let recorded = recorded.lock().unwrap();
        let methods: Vec<Method> = recorded.iter().map(|(m, _)| m.clone()).collect();
        assert_eq!(vec![Method::POST, Method::POST, Method::DELETE], methods);

        let first = sample_line(&recorded[0].1, "sensor_test_temperature{");
        let second = sample_line(&recorded[1].1, "sensor_test_temperature{");
        assert!(first.ends_with(" 20"), "unexpected first push: {}", first);
        assert!(second.ends_with(" 21.5"), "unexpected second push: {}", second);
        assert!(sample_line(&recorded[1].1, "sensor_test_motion_total{").ends_with(" 2"));
        assert!(recorded[2].1.is_empty());
    }
}
