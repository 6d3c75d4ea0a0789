//! HTTP(S) transport with `Range` based resume.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use tokio_util::sync::CancellationToken;

use super::{OnProgress, PartialArtifact, ResumableTransfer, TransferOutcome, TransferRequest};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::integrity::IntegrityValidator;
use crate::stats::TransferTracker;

fn build_http_client(timeout: Option<Duration>) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build()
}

/// The `S-E/T` or `*/T` part of a `Content-Range: bytes ...` header.
fn content_range(response: &reqwest::Response) -> Option<&str> {
    response
        .headers()
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes ")
}

/// First byte position of a partial response.
fn range_start(response: &reqwest::Response) -> Option<u64> {
    content_range(response)?
        .split_once('-')?
        .0
        .trim()
        .parse()
        .ok()
}

/// Total length of the resource, from `Content-Range` or `Content-Length`.
fn expected_total(response: &reqwest::Response, offset: u64) -> Option<u64> {
    content_range(response)
        .and_then(|range| range.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse().ok())
        .or_else(|| response.content_length().map(|len| len + offset))
}

async fn discard(partial: &Path) -> Result<()> {
    match tokio::fs::remove_file(partial).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn canceled(file_name: &str, received: u64) -> TransferOutcome {
    log::info!("Transfer of {file_name} canceled at {received} bytes");
    TransferOutcome::Canceled
}

/// Streams files over HTTP into `.partial` artifacts.
#[derive(Clone)]
pub struct HttpTransfer {
    client: reqwest::Client,
    validator: Arc<dyn IntegrityValidator>,
}

impl HttpTransfer {
    /// Creates a transport with the default client settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(validator: Arc<dyn IntegrityValidator>) -> Result<Self> {
        Ok(Self::with_client(build_http_client(None)?, validator))
    }

    /// Creates a transport honoring the configured request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(
        config: &EngineConfig,
        validator: Arc<dyn IntegrityValidator>,
    ) -> Result<Self> {
        Ok(Self::with_client(
            build_http_client(config.request_timeout())?,
            validator,
        ))
    }

    /// Creates a transport around an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, validator: Arc<dyn IntegrityValidator>) -> Self {
        Self { client, validator }
    }

    /// Sends the request, giving up when `cancel` fires before the origin answers.
    async fn get(
        &self,
        url: &reqwest::Url,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<reqwest::Response>> {
        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(None),
            response = request.send() => Ok(Some(response?)),
        }
    }

    async fn run(
        &self,
        request: &TransferRequest,
        on_progress: &OnProgress,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| Error::InvalidDescriptor(format!("{}: {e}", request.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidDescriptor(format!(
                "{}: unsupported scheme {}",
                request.file_name,
                url.scheme()
            )));
        }
        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = request.partial_path();
        let mut offset = PartialArtifact::existing_len(&partial).await;
        let Some(mut response) = self.get(&url, offset, cancel).await? else {
            return Ok(canceled(&request.file_name, offset));
        };
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            if expected_total(&response, 0) == Some(offset) {
                log::debug!(
                    "{} is already complete in its partial artifact",
                    request.file_name
                );
                on_progress(offset, Some(offset));
                return self
                    .complete(request, TransferTracker::start(offset), offset)
                    .await;
            }
            log::warn!(
                "{} rejected resume at byte {offset}, discarding partial",
                request.file_name
            );
            discard(&partial).await?;
            offset = 0;
            let Some(retry) = self.get(&url, 0, cancel).await? else {
                return Ok(canceled(&request.file_name, 0));
            };
            response = retry;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                url: request.url.clone(),
                status: status.as_u16(),
            });
        }

        let mut tracker = TransferTracker::start(offset);
        let partial_start = (status == StatusCode::PARTIAL_CONTENT).then(|| range_start(&response));
        let resume = offset > 0 && partial_start == Some(Some(offset));
        if resume {
            log::debug!(
                "Resuming {} from byte {}",
                request.file_name,
                tracker.resumed_from()
            );
        } else if let Some(start) = partial_start.filter(|&start| start != Some(0)) {
            log::warn!(
                "Origin answered {} at byte {start:?} instead of {offset}, discarding partial",
                request.file_name
            );
            discard(&partial).await?;
            return Err(Error::RangeMismatch { offset, start });
        } else if offset > 0 {
            log::warn!(
                "Origin ignored range for {}, restarting from zero",
                request.file_name
            );
            tracker.restarted();
        }

        let total = expected_total(&response, if resume { offset } else { 0 });
        let mut artifact = PartialArtifact::open(&partial, resume).await?;

        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    artifact.flush().await?;
                    return Ok(canceled(&request.file_name, artifact.len()));
                }
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else { break };
            artifact.append(&chunk).await?;
            on_progress(artifact.len(), total);
        }

        let received = artifact.finish().await?;
        if let Some(expected) = total.filter(|&expected| expected != received) {
            return Err(Error::Incomplete { expected, received });
        }
        self.complete(request, tracker, received).await
    }

    async fn complete(
        &self,
        request: &TransferRequest,
        tracker: TransferTracker,
        received: u64,
    ) -> Result<TransferOutcome> {
        let stats = super::finalize(self.validator.as_ref(), request, tracker, received).await?;
        log::debug!(
            "Finished {}: {} bytes at {} B/s",
            request.file_name,
            stats.bytes_transferred,
            stats.average_speed()
        );
        Ok(TransferOutcome::Success {
            path: request.destination.clone(),
            stats,
        })
    }
}

#[async_trait]
impl ResumableTransfer for HttpTransfer {
    async fn transfer(
        &self,
        request: &TransferRequest,
        on_progress: &OnProgress,
        cancel: &CancellationToken,
    ) -> TransferOutcome {
        if let Some(outcome) = super::preflight(self.validator.as_ref(), request).await {
            return outcome;
        }
        match self.run(request, on_progress, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Transfer of {} failed: {e}", request.file_name);
                TransferOutcome::from_error(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::FileDescriptor;
    use crate::integrity::{ChecksumValidator, digest_hex};
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Clone)]
    struct Origin {
        body: Arc<Vec<u8>>,
        honor_range: bool,
        // Serve every range from this byte instead of the requested one.
        misplaced_start: Option<usize>,
        // The first request never gets an answer.
        stall_first: bool,
        hits: Arc<AtomicUsize>,
        ranges: Arc<Mutex<Vec<String>>>,
    }

    impl Origin {
        fn new(len: usize, honor_range: bool) -> Self {
            #[allow(clippy::cast_possible_truncation)]
            let body = (0..len).map(|i| (i % 251) as u8).collect();
            Self {
                body: Arc::new(body),
                honor_range,
                misplaced_start: None,
                stall_first: false,
                hits: Arc::new(AtomicUsize::new(0)),
                ranges: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn misplacing_ranges_at(mut self, start: usize) -> Self {
            self.misplaced_start = Some(start);
            self
        }

        fn stalling_first_request(mut self) -> Self {
            self.stall_first = true;
            self
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }

        fn checksum(&self) -> String {
            digest_hex(&self.body)
        }
    }

    async fn serve_file(State(origin): State<Origin>, headers: HeaderMap) -> Response {
        let hit = origin.hits.fetch_add(1, Ordering::SeqCst);
        if origin.stall_first && hit == 0 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let len = origin.body.len();
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(range) = &range {
            origin.ranges.lock().unwrap().push(range.clone());
        }
        let start = range
            .as_deref()
            .filter(|_| origin.honor_range)
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.strip_suffix('-'))
            .and_then(|v| v.parse::<usize>().ok())
            .map(|start| origin.misplaced_start.unwrap_or(start));

        match start {
            Some(start) if start >= len => (
                axum::http::StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{len}"))],
            )
                .into_response(),
            Some(start) => (
                axum::http::StatusCode::PARTIAL_CONTENT,
                [(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{}/{len}", len - 1),
                )],
                origin.body[start..].to_vec(),
            )
                .into_response(),
            None => (axum::http::StatusCode::OK, origin.body.to_vec()).into_response(),
        }
    }

    async fn spawn_origin(origin: Origin) -> String {
        let app = Router::new()
            .route("/file.bin", get(serve_file))
            .with_state(origin);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn transport() -> HttpTransfer {
        HttpTransfer::new(Arc::new(ChecksumValidator::new())).unwrap()
    }

    fn request(dir: &Path, url: &str, checksum: &str) -> TransferRequest {
        TransferRequest::for_file(&FileDescriptor::new("file.bin", url, checksum), dir, false)
    }

    fn no_progress(_: u64, _: Option<u64>) {}

    #[tokio::test]
    async fn downloads_full_file() {
        let origin = Origin::new(200_000, true);
        let base = spawn_origin(origin.clone()).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/file.bin"), &origin.checksum());

        let last = Arc::new(Mutex::new((0, None)));
        let seen = Arc::clone(&last);
        let outcome = transport()
            .transfer(
                &req,
                &move |done, total| *seen.lock().unwrap() = (done, total),
                &CancellationToken::new(),
            )
            .await;

        let TransferOutcome::Success { path, stats } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(path, req.destination);
        assert_eq!(stats.bytes_transferred, 200_000);
        assert_eq!(stats.resumed_from, 0);
        assert_eq!(*last.lock().unwrap(), (200_000, Some(200_000)));
        assert_eq!(std::fs::read(&req.destination).unwrap(), *origin.body);
        assert!(!req.partial_path().exists());
    }

    #[tokio::test]
    async fn resumes_from_partial_artifact() {
        let origin = Origin::new(100_000, true);
        let base = spawn_origin(origin.clone()).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/file.bin"), &origin.checksum());
        std::fs::write(req.partial_path(), &origin.body[..40_000]).unwrap();

        let outcome = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;

        let TransferOutcome::Success { stats, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(stats.resumed_from, 40_000);
        assert_eq!(stats.bytes_transferred, 60_000);
        assert_eq!(
            *origin.ranges.lock().unwrap(),
            vec!["bytes=40000-".to_string()]
        );
        assert_eq!(std::fs::read(&req.destination).unwrap(), *origin.body);
    }

    #[tokio::test]
    async fn ignored_range_restarts_from_zero() {
        let origin = Origin::new(50_000, false);
        let base = spawn_origin(origin.clone()).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/file.bin"), &origin.checksum());
        std::fs::write(req.partial_path(), b"stale bytes from another version").unwrap();

        let outcome = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;

        let TransferOutcome::Success { stats, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(stats.resumed_from, 0);
        assert_eq!(stats.bytes_transferred, 50_000);
        assert_eq!(std::fs::read(&req.destination).unwrap(), *origin.body);
    }

    #[tokio::test]
    async fn missing_resource_fails() {
        let origin = Origin::new(10, true);
        let base = spawn_origin(origin).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/missing.bin"), "");

        let outcome = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;

        let TransferOutcome::Failed { reason, retryable } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("404"), "{reason}");
        assert!(!retryable);
        assert!(!req.destination.exists());
    }

    #[tokio::test]
    async fn checksum_mismatch_deletes_destination() {
        let origin = Origin::new(4_096, true);
        let base = spawn_origin(origin).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/file.bin"), "00ff");

        let outcome = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;

        let TransferOutcome::Failed { reason, retryable } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.starts_with("checksum mismatch: expected 00ff actual "));
        assert!(!retryable);
        assert!(!req.destination.exists());
        assert!(!req.partial_path().exists());
    }

    #[tokio::test]
    async fn valid_destination_skips_network() {
        let origin = Origin::new(8_192, true);
        let base = spawn_origin(origin.clone()).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/file.bin"), &origin.checksum());
        let transport = transport();

        let first = transport
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;
        assert!(first.is_success());
        assert_eq!(origin.hits(), 1);

        let second = transport
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;
        let TransferOutcome::Success { stats, .. } = second else {
            panic!("expected success, got {second:?}");
        };
        assert!(stats.already_present);
        assert_eq!(origin.hits(), 1);
    }

    #[tokio::test]
    async fn cancellation_keeps_partial_artifact() {
        let origin = Origin::new(500_000, true);
        let base = spawn_origin(origin.clone()).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/file.bin"), &origin.checksum());

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let outcome = transport()
            .transfer(&req, &move |_, _| token.cancel(), &cancel)
            .await;

        assert_eq!(outcome, TransferOutcome::Canceled);
        assert!(!req.destination.exists());
        assert!(req.partial_path().exists());

        let resumed = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;
        assert!(resumed.is_success());
        assert_eq!(std::fs::read(&req.destination).unwrap(), *origin.body);
    }

    #[tokio::test]
    async fn unsupported_scheme_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), "ftp://example.com/file.bin", "");

        let outcome = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;

        assert!(matches!(
            outcome,
            TransferOutcome::Failed {
                retryable: false,
                ..
            }
        ));
        assert!(!req.partial_path().exists());
    }

    #[tokio::test]
    async fn cancellation_while_waiting_for_origin() {
        let origin = Origin::new(1_000, true).stalling_first_request();
        let base = spawn_origin(origin.clone()).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/file.bin"), &origin.checksum());

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            transport().transfer(&req, &no_progress, &cancel),
        )
        .await
        .expect("transfer ignored cancellation while the origin stalled");
        assert_eq!(outcome, TransferOutcome::Canceled);
        assert_eq!(origin.hits(), 1);

        let retried = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;
        assert!(retried.is_success());
        assert_eq!(std::fs::read(&req.destination).unwrap(), *origin.body);
    }

    #[tokio::test]
    async fn range_answered_from_zero_restarts_cleanly() {
        let origin = Origin::new(1_000, true).misplacing_ranges_at(0);
        let base = spawn_origin(origin.clone()).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/file.bin"), &origin.checksum());
        std::fs::write(req.partial_path(), &origin.body[..400]).unwrap();

        let outcome = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;

        let TransferOutcome::Success { stats, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(stats.resumed_from, 0);
        assert_eq!(stats.bytes_transferred, 1_000);
        assert_eq!(*origin.ranges.lock().unwrap(), vec!["bytes=400-".to_string()]);
        assert_eq!(std::fs::read(&req.destination).unwrap(), *origin.body);
    }

    #[tokio::test]
    async fn misplaced_range_discards_partial() {
        let origin = Origin::new(1_000, true).misplacing_ranges_at(100);
        let base = spawn_origin(origin.clone()).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/file.bin"), &origin.checksum());
        std::fs::write(req.partial_path(), &origin.body[..400]).unwrap();

        let outcome = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;

        let TransferOutcome::Failed { reason, retryable } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("instead of 400"), "{reason}");
        assert!(retryable);
        assert!(!req.partial_path().exists());
        assert!(!req.destination.exists());

        let retried = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;
        assert!(retried.is_success());
        assert_eq!(std::fs::read(&req.destination).unwrap(), *origin.body);
    }

    #[tokio::test]
    async fn complete_partial_is_finalized_on_unsatisfiable_range() {
        let origin = Origin::new(2_048, true);
        let base = spawn_origin(origin.clone()).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/file.bin"), &origin.checksum());
        std::fs::write(req.partial_path(), origin.body.as_slice()).unwrap();

        let outcome = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;

        let TransferOutcome::Success { stats, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(stats.bytes_transferred, 0);
        assert_eq!(stats.resumed_from, 2_048);
        assert_eq!(origin.hits(), 1);
        assert!(!req.partial_path().exists());
        assert_eq!(std::fs::read(&req.destination).unwrap(), *origin.body);
    }

    #[tokio::test]
    async fn oversized_partial_is_discarded_on_unsatisfiable_range() {
        let origin = Origin::new(2_048, true);
        let base = spawn_origin(origin.clone()).await;
        let dir = TempDir::new().unwrap();
        let req = request(dir.path(), &format!("{base}/file.bin"), &origin.checksum());
        std::fs::write(req.partial_path(), vec![7u8; 3_000]).unwrap();

        let outcome = transport()
            .transfer(&req, &no_progress, &CancellationToken::new())
            .await;

        let TransferOutcome::Success { stats, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(stats.bytes_transferred, 2_048);
        assert_eq!(origin.hits(), 2);
        assert_eq!(std::fs::read(&req.destination).unwrap(), *origin.body);
    }
}
