//! Tracking of server-side background operations.
//!
//! Mutating calls that the server runs in the background answer with an
//! operation reference instead of a result. [`OperationTracker`] wraps that
//! reference and can wait for it to finish, refresh it or cancel it.
//!
//! Waiting prefers the server's long-poll endpoint
//! (`GET /1.0/operations/{id}/wait?timeout=N`). Transports that cannot hold
//! a request open fall back to polling `GET /1.0/operations/{id}` with an
//! immediate first check and capped exponential backoff (see
//! [`PollPolicy`](incus_core::client::PollPolicy)).
//!
//! Dropping a tracker, or the future returned by [`OperationTracker::wait`],
//! never cancels the server-side operation.

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use incus_core::query::encode_segment;
use incus_core::transport::ApiRequest;
use incus_core::types::OPERATIONS_PATH;
use incus_core::{ApiResponse, Error, Operation, OperationStatus};

use crate::client::{Client, WeakClient};
use crate::Result;

/// Slack added to the HTTP timeout of a long-poll request.
const LONG_POLL_GRACE: Duration = Duration::from_secs(5);

/// Handle to one background operation.
#[derive(Debug, Clone)]
pub struct OperationTracker {
    client: WeakClient,
    operation: Operation,
}

impl OperationTracker {
    pub(crate) fn new(client: &Client, operation: Operation) -> Self {
        Self {
            client: client.downgrade(),
            operation,
        }
    }

    /// Wrap the operation referenced by an asynchronous response. No request
    /// is made.
    pub(crate) fn from_response(client: &Client, response: &ApiResponse) -> Result<Self> {
        let operation = Operation::from_response(response)?;
        debug!(operation = %operation.id, "Server started background operation");
        Ok(Self::new(client, operation))
    }

    /// Operation identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.operation.id
    }

    /// Last observed state of the operation.
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Last observed status.
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        self.operation.status
    }

    /// Whether the last observed state allows cancellation.
    #[must_use]
    pub fn may_cancel(&self) -> bool {
        self.operation.may_cancel
    }

    /// Returns true once a terminal status has been observed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.operation.is_terminal()
    }

    /// Consume the tracker, returning the last observed state.
    #[must_use]
    pub fn into_operation(self) -> Operation {
        self.operation
    }

    /// Re-fetch the operation without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] once the server has forgotten the
    /// operation, or transport errors.
    pub async fn refresh(&mut self) -> Result<&Operation> {
        let client = self.client.upgrade()?;
        let latest = self.fetch(&client).await?;
        self.observe(latest);
        Ok(&self.operation)
    }

    /// Wait until the operation reaches a terminal status.
    ///
    /// Without an explicit `timeout` the client's default operation timeout
    /// applies; with neither, waiting is unbounded. A terminal `Failure` or
    /// `Cancelled` operation is returned as `Ok`; use
    /// [`OperationTracker::wait_success`] to turn those into errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationTimeout`] with the last observed status when
    /// the deadline passes (the operation keeps running), or transport
    /// errors.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<Operation> {
        if self.operation.is_terminal() {
            return Ok(self.operation.clone());
        }

        let client = self.client.upgrade()?;
        let limit = timeout.or_else(|| client.operation_timeout());
        let started = Instant::now();
        let deadline = limit.map(|limit| started + limit);
        let long_poll = client.supports_long_poll();
        let policy = client.poll_policy();
        let mut poll = 0;

        debug!(operation = %self.operation.id, ?limit, long_poll, "Waiting for operation");

        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.timed_out(started));
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let round_started = Instant::now();
            let latest = if long_poll {
                self.long_poll(&client, policy.long_poll_window, remaining)
                    .await?
            } else {
                let mut delay = policy.delay_before_poll(poll);
                poll = poll.saturating_add(1);
                if let Some(remaining) = remaining {
                    delay = delay.min(remaining);
                }
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                Some(self.fetch(&client).await?)
            };

            if let Some(latest) = latest {
                self.observe(latest);
            }

            if self.operation.is_terminal() {
                info!(
                    operation = %self.operation.id,
                    status = %self.operation.status,
                    "Operation finished"
                );
                return Ok(self.operation.clone());
            }

            // A long poll that ends before its window gets the polling
            // backoff before the next round.
            if long_poll && round_started.elapsed() < policy.long_poll_window {
                poll = poll.saturating_add(1);
                let mut delay = policy.delay_before_poll(poll);
                if let Some(deadline) = deadline {
                    delay = delay.min(deadline.saturating_duration_since(Instant::now()));
                }
                if !delay.is_zero() {
                    debug!(operation = %self.operation.id, ?delay, "Long poll ended early");
                    sleep(delay).await;
                }
            }
        }
    }

    /// Wait like [`OperationTracker::wait`], turning a terminal `Failure` or
    /// `Cancelled` status into [`Error::Operation`].
    ///
    /// # Errors
    ///
    /// See [`OperationTracker::wait`]; additionally fails when the operation
    /// did not succeed.
    pub async fn wait_success(&mut self, timeout: Option<Duration>) -> Result<Operation> {
        let operation = self.wait(timeout).await?;
        if operation.is_success() {
            Ok(operation)
        } else {
            Err(Error::Operation(Box::new(operation)))
        }
    }

    /// Ask the server to cancel the operation. Does not wait for it to stop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationNotCancellable`] without issuing a request
    /// when the last observed state does not allow cancellation.
    pub async fn cancel(&self) -> Result<()> {
        if !self.operation.may_cancel {
            return Err(Error::OperationNotCancellable(self.operation.id.clone()));
        }

        let client = self.client.upgrade()?;
        info!(operation = %self.operation.id, "Cancelling operation");
        let request = client.scoped(ApiRequest::delete(self.path()), true);
        client.call(request).await?;
        Ok(())
    }

    fn path(&self) -> String {
        format!("{OPERATIONS_PATH}/{}", encode_segment(&self.operation.id))
    }

    fn observe(&mut self, latest: Operation) {
        let previous = self.operation.status;
        if !self.operation.advance(latest) {
            debug!(operation = %self.operation.id, status = %previous, "Ignored stale operation update");
        }
    }

    fn timed_out(&self, started: Instant) -> Error {
        warn!(
            operation = %self.operation.id,
            status = %self.operation.status,
            "Timed out waiting for operation"
        );
        Error::OperationTimeout {
            id: self.operation.id.clone(),
            last_status: self.operation.status,
            waited: started.elapsed(),
        }
    }

    async fn fetch(&self, client: &Client) -> Result<Operation> {
        let request = client.scoped(ApiRequest::get(self.path()), true);
        client.get_metadata(request).await
    }

    /// One long-poll round. `None` means the round ended without news.
    async fn long_poll(
        &self,
        client: &Client,
        window: Duration,
        remaining: Option<Duration>,
    ) -> Result<Option<Operation>> {
        let window = remaining.map_or(window, |remaining| window.min(remaining));
        let secs = window.as_secs().max(1);
        let request = client.scoped(
            ApiRequest::get(format!("{}/wait", self.path()))
                .with_query([("timeout", secs.to_string())])
                .with_timeout(Duration::from_secs(secs) + LONG_POLL_GRACE)
                .without_retry(),
            true,
        );

        let round = client.get_metadata::<Operation>(request);
        let result = match remaining {
            Some(remaining) => match timeout(remaining, round).await {
                Ok(result) => result,
                Err(_) => return Ok(None),
            },
            None => round.await,
        };

        match result {
            Ok(operation) => Ok(Some(operation)),
            // the server ends an unfinished wait with a gateway timeout
            Err(err) if matches!(err.status(), Some(504 | 408)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Result of an action that may run in the background.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The server answered synchronously with this metadata.
    Sync(Value),
    /// The action ran as a background operation that has finished.
    Completed(Operation),
    /// The action is still running in the background.
    Pending(OperationTracker),
}

impl Outcome {
    /// Returns true if a background operation may still be running.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// The background operation, if the action produced one.
    #[must_use]
    pub fn operation(&self) -> Option<&Operation> {
        match self {
            Self::Sync(_) => None,
            Self::Completed(operation) => Some(operation),
            Self::Pending(tracker) => Some(tracker.operation()),
        }
    }

    /// Metadata of the synchronous answer or the finished operation.
    #[must_use]
    pub fn metadata(&self) -> Option<&Value> {
        match self {
            Self::Sync(value) => Some(value),
            Self::Completed(operation) => Some(&operation.metadata),
            Self::Pending(_) => None,
        }
    }

    /// Take the tracker of a still-running operation.
    #[must_use]
    pub fn into_tracker(self) -> Option<OperationTracker> {
        match self {
            Self::Pending(tracker) => Some(tracker),
            _ => None,
        }
    }

    /// Fail if the action finished in `Failure` or `Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Operation`] for unsuccessful terminal operations.
    pub fn into_success(self) -> Result<Self> {
        match self {
            Self::Completed(operation) if !operation.is_success() => {
                Err(Error::Operation(Box::new(operation)))
            }
            other => Ok(other),
        }
    }
}

/// Endpoint for `/1.0/operations`.
#[derive(Debug, Clone, Copy)]
pub struct Operations<'a> {
    client: &'a Client,
}

impl<'a> Operations<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// List known operations, flattening the status-grouped answer.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn list(&self) -> Result<Vec<Operation>> {
        let request = self.client.scoped(
            ApiRequest::get(OPERATIONS_PATH).with_query([("recursion", "1".to_string())]),
            true,
        );
        let grouped: Option<HashMap<String, Vec<Operation>>> =
            self.client.get_metadata(request).await?;
        let mut operations: Vec<Operation> = grouped
            .unwrap_or_default()
            .into_values()
            .flatten()
            .collect();
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(operations)
    }

    /// Fetch an operation and return a tracker primed with its state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown identifiers.
    pub async fn get(&self, id: &str) -> Result<OperationTracker> {
        let mut tracker = self.tracker(id);
        tracker.refresh().await?;
        Ok(tracker)
    }

    /// Wrap a known identifier without contacting the server.
    #[must_use]
    pub fn tracker(&self, id: &str) -> OperationTracker {
        OperationTracker::new(self.client, Operation::pending(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{client_with, operation_json, sync_response, MockTransport};
    use incus_core::client::PollPolicy;
    use incus_core::transport::RawResponse;
    use mockall::Sequence;
    use reqwest::StatusCode;
    use serde_json::json;

    fn polling_transport() -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_supports_long_poll().return_const(false);
        transport
    }

    #[tokio::test]
    async fn cancel_without_may_cancel_sends_nothing() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(0);
        let client = client_with(transport);

        let tracker = client.operations().tracker("abc");
        let err = tracker.cancel().await.unwrap_err();
        assert!(matches!(err, Error::OperationNotCancellable(ref id) if id == "abc"));
    }

    #[tokio::test]
    async fn cancel_issues_delete() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .withf(|request| request.method == reqwest::Method::GET)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                let mut op = operation_json("abc", "Running", 103);
                op["may_cancel"] = json!(true);
                Ok(sync_response(op))
            });
        transport
            .expect_send()
            .withf(|request| {
                request.method == reqwest::Method::DELETE && request.path == "/1.0/operations/abc"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(sync_response(Value::Null)));
        let client = client_with(transport);

        let tracker = client.operations().get("abc").await.unwrap();
        assert!(tracker.may_cancel());
        tracker.cancel().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn polling_wait_returns_failure_without_error() {
        let mut transport = polling_transport();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(sync_response(operation_json("abc", "Running", 103))));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                let mut op = operation_json("abc", "Failure", 400);
                op["err"] = json!("Failed creating instance record");
                Ok(sync_response(op))
            });
        let client = client_with(transport);

        let mut tracker = client.operations().tracker("abc");
        let operation = tracker.wait(Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(operation.status, OperationStatus::Failure);
        assert_eq!(operation.err, "Failed creating instance record");
        assert!(tracker.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_success_raises_operation_error() {
        let mut transport = polling_transport();
        transport
            .expect_send()
            .returning(|_| Ok(sync_response(operation_json("abc", "Cancelled", 401))));
        let client = client_with(transport);

        let mut tracker = client.operations().tracker("abc");
        let err = tracker.wait_success(None).await.unwrap_err();
        match err {
            Error::Operation(operation) => assert_eq!(operation.status, OperationStatus::Cancelled),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polling_wait_times_out_with_last_status() {
        let mut transport = polling_transport();
        transport
            .expect_send()
            .returning(|_| Ok(sync_response(operation_json("abc", "Running", 103))));
        let client = client_with(transport);

        let limit = Duration::from_secs(3);
        let started = Instant::now();
        let mut tracker = client.operations().tracker("abc");
        let err = tracker.wait(Some(limit)).await.unwrap_err();

        match err {
            Error::OperationTimeout {
                id, last_status, ..
            } => {
                assert_eq!(id, "abc");
                assert_eq!(last_status, OperationStatus::Running);
            }
            other => panic!("unexpected error: {other}"),
        }
        let waited = started.elapsed();
        assert!(waited >= limit);
        assert!(waited <= limit + PollPolicy::new().max_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_backs_off_between_checks() {
        let mut transport = polling_transport();
        let calls = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let started = Instant::now();
        transport.expect_send().returning(move |_| {
            let mut calls = recorded.lock().unwrap();
            calls.push(started.elapsed());
            let body = if calls.len() < 4 {
                operation_json("abc", "Running", 103)
            } else {
                operation_json("abc", "Success", 200)
            };
            Ok(sync_response(body))
        });
        let client = client_with(transport);

        let mut tracker = client.operations().tracker("abc");
        tracker.wait(None).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], Duration::ZERO);
        assert_eq!(calls[1], Duration::from_millis(250));
        assert_eq!(calls[2], Duration::from_millis(750));
        assert_eq!(calls[3], Duration::from_millis(1750));
    }

    #[tokio::test]
    async fn long_poll_uses_wait_endpoint() {
        let mut transport = MockTransport::new();
        transport.expect_supports_long_poll().return_const(true);
        transport
            .expect_send()
            .withf(|request| {
                request.path == "/1.0/operations/abc/wait"
                    && request.query_value("timeout") == Some("30")
                    && !request.retry
            })
            .times(1)
            .returning(|_| Ok(sync_response(operation_json("abc", "Success", 200))));
        let client = client_with(transport);

        let mut tracker = client.operations().tracker("abc");
        let operation = tracker.wait(None).await.unwrap();
        assert!(operation.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_gateway_timeout_keeps_waiting() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport.expect_supports_long_poll().return_const(true);
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(RawResponse::json(
                    StatusCode::GATEWAY_TIMEOUT,
                    &json!({"type": "error", "error": "Operation wait timed out", "error_code": 504}),
                ))
            });
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(sync_response(operation_json("abc", "Success", 200))));
        let client = client_with(transport);

        let mut tracker = client.operations().tracker("abc");
        assert!(tracker.wait(None).await.unwrap().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_answering_early_backs_off() {
        let mut transport = MockTransport::new();
        transport.expect_supports_long_poll().return_const(true);
        let calls = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let started = Instant::now();
        transport.expect_send().returning(move |_| {
            recorded.lock().unwrap().push(started.elapsed());
            Ok(sync_response(operation_json("abc", "Running", 103)))
        });
        let client = client_with(transport);

        let mut tracker = client.operations().tracker("abc");
        let err = tracker.wait(Some(Duration::from_secs(3))).await.unwrap_err();
        assert!(matches!(err, Error::OperationTimeout { .. }));

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                Duration::ZERO,
                Duration::from_millis(250),
                Duration::from_millis(750),
                Duration::from_millis(1750),
            ]
        );
    }

    #[tokio::test]
    async fn wait_on_terminal_tracker_sends_nothing() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(0);
        let client = client_with(transport);

        let mut done = Operation::pending("abc");
        done.status = OperationStatus::Success;
        let mut tracker = OperationTracker::new(&client, done);
        assert!(tracker.wait(None).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn tracker_outliving_client_reports_closed() {
        let client = client_with(MockTransport::new());
        let mut tracker = client.operations().tracker("abc");
        drop(client);

        assert!(matches!(tracker.refresh().await, Err(Error::ClientClosed)));
    }

    #[tokio::test]
    async fn refresh_ignores_regressions() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(sync_response(operation_json("abc", "Running", 103))));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(sync_response(operation_json("abc", "Pending", 105))));
        let client = client_with(transport);

        let mut tracker = client.operations().tracker("abc");
        tracker.refresh().await.unwrap();
        tracker.refresh().await.unwrap();
        assert_eq!(tracker.status(), OperationStatus::Running);
    }

    #[tokio::test]
    async fn list_flattens_status_groups() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|request| {
                request.path == "/1.0/operations" && request.query_value("recursion") == Some("1")
            })
            .returning(|_| {
                Ok(sync_response(json!({
                    "running": [operation_json("b", "Running", 103)],
                    "success": [operation_json("a", "Success", 200)],
                    "failure": []
                })))
            });
        let client = client_with(transport);

        let operations = client.operations().list().await.unwrap();
        let ids: Vec<&str> = operations.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn outcome_into_success() {
        let mut failed = Operation::pending("abc");
        failed.status = OperationStatus::Failure;

        assert!(Outcome::Sync(Value::Null).into_success().is_ok());
        assert!(matches!(
            Outcome::Completed(failed).into_success(),
            Err(Error::Operation(_))
        ));
    }
}
