use crate::bridge::metrics::MetricsHandle;
use crate::stats::{HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED};
use reqwest::{Method, RequestBuilder, Response};
use std::time::{Duration, Instant};

/// Connection-pooled client shared by every VU of a run.
#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_pool_size(500)
    }

    pub fn with_pool_size(pool_size: usize) -> Result<Self, reqwest::Error> {
        let inner = reqwest::Client::builder()
            .pool_max_idle_per_host(pool_size)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;
        Ok(Self { inner })
    }

    /// Roughly one idle connection per 5 VUs.
    pub fn for_workers(total_workers: usize) -> Result<Self, reqwest::Error> {
        Self::with_pool_size((total_workers / 5).clamp(500, 2000))
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }
}

/// Request facility for one iteration. Every request sent through it is
/// timed and recorded under the built-in `http_*` metrics.
pub struct Http<'a> {
    client: &'a HttpClient,
    metrics: &'a MetricsHandle,
}

impl<'a> Http<'a> {
    pub(crate) fn new(client: &'a HttpClient, metrics: &'a MetricsHandle) -> Self {
        Self { client, metrics }
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.inner.request(method, url)
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Send a prepared request. Transport errors and statuses >= 400 count
    /// toward `http_req_failed`; the response is returned either way.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, reqwest::Error> {
        let start = Instant::now();
        let result = request.send().await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let failed = match &result {
            Ok(response) => response.status().as_u16() >= 400,
            Err(e) => {
                tracing::debug!(error = %e, "request failed");
                true
            }
        };
        self.metrics.counter(HTTP_REQS, 1.0);
        self.metrics.trend(HTTP_REQ_DURATION, elapsed_ms);
        self.metrics.rate(HTTP_REQ_FAILED, failed);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ShardedAggregator;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "{}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                    status_line
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_send_records_success() {
        let url = serve_once("HTTP/1.1 200 OK").await;
        let agg = Arc::new(ShardedAggregator::new(1));
        let metrics = MetricsHandle::new(agg.clone(), 1);
        let client = HttpClient::new().unwrap();
        let http = Http::new(&client, &metrics);

        let response = http.send(http.get(&url)).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let snap = agg.snapshot();
        assert_eq!(snap.counter(HTTP_REQS), 1.0);
        assert_eq!(snap.rate(HTTP_REQ_FAILED), 0.0);
        assert_eq!(snap.trend(HTTP_REQ_DURATION).unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_error_status_counts_as_failed() {
        let url = serve_once("HTTP/1.1 500 Internal Server Error").await;
        let agg = Arc::new(ShardedAggregator::new(1));
        let metrics = MetricsHandle::new(agg.clone(), 1);
        let client = HttpClient::new().unwrap();
        let http = Http::new(&client, &metrics);

        let response = http.send(http.post(&url).body("{}")).await.unwrap();
        assert_eq!(response.status().as_u16(), 500);
        assert_eq!(agg.snapshot().rate(HTTP_REQ_FAILED), 1.0);
    }

    #[tokio::test]
    async fn test_transport_error_counts_as_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let agg = Arc::new(ShardedAggregator::new(1));
        let metrics = MetricsHandle::new(agg.clone(), 1);
        let client = HttpClient::new().unwrap();
        let http = Http::new(&client, &metrics);

        assert!(http.send(http.get(&format!("http://{}/", addr))).await.is_err());
        let snap = agg.snapshot();
        assert_eq!(snap.counter(HTTP_REQS), 1.0);
        assert_eq!(snap.rate(HTTP_REQ_FAILED), 1.0);
    }
}
