//! Outstanding task requests awaiting their terminal result.

use std::collections::HashMap;

use hsp_protocol::{AgentId, HspError, HspResult, MessageId, RequestId, TaskResult};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Completion = oneshot::Sender<HspResult<TaskResult>>;

struct PendingEntry {
    message_id: MessageId,
    target: Option<AgentId>,
    completion: Completion,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PendingState {
    entries: HashMap<RequestId, PendingEntry>,
    by_message: HashMap<MessageId, RequestId>,
}

impl PendingState {
    fn take(&mut self, request_id: &RequestId) -> Option<PendingEntry> {
        let entry = self.entries.remove(request_id)?;
        self.by_message.remove(&entry.message_id);
        Some(entry)
    }
}

/// `request_id -> completion`, one entry per outstanding request.
#[derive(Default)]
pub(crate) struct PendingTable {
    state: Mutex<PendingState>,
}

/// Who the settled request was sent to.
pub(crate) struct Settled {
    pub target: Option<AgentId>,
}

impl PendingTable {
    /// Claim `request_id`. Fails if it is already outstanding.
    pub fn reserve(
        &self,
        request_id: RequestId,
        message_id: MessageId,
        target: Option<AgentId>,
    ) -> HspResult<oneshot::Receiver<HspResult<TaskResult>>> {
        let mut state = self.state.lock();
        if state.entries.contains_key(&request_id) {
            return Err(HspError::DuplicateRequest(request_id));
        }
        let (completion, receiver) = oneshot::channel();
        state.by_message.insert(message_id.clone(), request_id.clone());
        state.entries.insert(
            request_id,
            PendingEntry {
                message_id,
                target,
                completion,
                timer: None,
            },
        );
        Ok(receiver)
    }

    /// Attach the timeout task. Aborts it if the request already settled.
    pub fn arm(&self, request_id: &RequestId, timer: JoinHandle<()>) {
        let mut state = self.state.lock();
        match state.entries.get_mut(request_id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Drop a reservation whose request never left the process.
    pub fn discard(&self, request_id: &RequestId) {
        if let Some(entry) = self.state.lock().take(request_id)
            && let Some(timer) = entry.timer
        {
            timer.abort();
        }
    }

    fn settle(
        &self,
        request_id: &RequestId,
        outcome: HspResult<TaskResult>,
        stop_timer: bool,
    ) -> Option<Settled> {
        let entry = self.state.lock().take(request_id)?;
        if stop_timer && let Some(timer) = entry.timer {
            timer.abort();
        }
        if entry.completion.send(outcome).is_err() {
            debug!(request_id = %request_id, "requester stopped waiting");
        }
        Some(Settled {
            target: entry.target,
        })
    }

    /// Resolve with a terminal result. A result whose correlation id is
    /// missing or does not name the original request message is ignored.
    pub fn complete(
        &self,
        result: TaskResult,
        correlation_id: Option<&MessageId>,
    ) -> Option<Settled> {
        {
            let state = self.state.lock();
            let expected = &state.entries.get(&result.request_id)?.message_id;
            if correlation_id != Some(expected) {
                warn!(
                    request_id = %result.request_id,
                    correlation_id = ?correlation_id,
                    "result correlation does not match the request message"
                );
                return None;
            }
        }
        let request_id = result.request_id.clone();
        self.settle(&request_id, Ok(result), true)
    }

    /// Fail the request whose envelope carried `message_id`.
    pub fn fail_by_message(&self, message_id: &MessageId, error: HspError) -> Option<RequestId> {
        let request_id = self.state.lock().by_message.get(message_id).cloned()?;
        self.settle(&request_id, Err(error), true)?;
        Some(request_id)
    }

    /// Timeout path, called from the request's own timer task.
    pub fn expire(&self, request_id: &RequestId) -> Option<Settled> {
        self.settle(
            request_id,
            Err(HspError::Timeout(request_id.clone())),
            false,
        )
    }

    /// Idempotent: false when nothing was outstanding.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        self.settle(
            request_id,
            Err(HspError::Cancelled(request_id.clone())),
            true,
        )
        .is_some()
    }

    pub fn close(&self) {
        let drained: Vec<(RequestId, PendingEntry)> = {
            let mut state = self.state.lock();
            state.by_message.clear();
            state.entries.drain().collect()
        };
        for (request_id, entry) in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.completion.send(Err(HspError::Closed(format!(
                "connector closed before {request_id} completed"
            ))));
        }
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.state.lock().entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

/// Handle to an outstanding task request.
pub struct PendingTask {
    request_id: RequestId,
    message_id: MessageId,
    receiver: oneshot::Receiver<HspResult<TaskResult>>,
}

impl PendingTask {
    pub(crate) fn new(
        request_id: RequestId,
        message_id: MessageId,
        receiver: oneshot::Receiver<HspResult<TaskResult>>,
    ) -> Self {
        Self {
            request_id,
            message_id,
            receiver,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Id of the envelope that carried the request.
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Wait for the terminal result, a NACK, the timeout or cancellation.
    pub async fn wait(self) -> HspResult<TaskResult> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(HspError::Cancelled(self.request_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use hsp_protocol::ErrorCode;
    use serde_json::json;

    use super::*;

    fn reserve(table: &PendingTable, id: &str) -> oneshot::Receiver<HspResult<TaskResult>> {
        table
            .reserve(RequestId::from(id), MessageId::from(format!("m-{id}")), None)
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_reservation_is_rejected() {
        let table = PendingTable::default();
        let _first = reserve(&table, "r1");
        let error = table
            .reserve(RequestId::from("r1"), MessageId::from("other"), None)
            .err()
            .unwrap();
        assert_eq!(error.code(), ErrorCode::DuplicateRequest);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn only_first_terminal_result_completes() {
        let table = PendingTable::default();
        let receiver = reserve(&table, "r1");
        let correlation = MessageId::from("m-r1");
        let first = TaskResult::success("r1", "A", json!({"value": 4}));
        let second = TaskResult::success("r1", "A", json!({"value": 5}));

        assert!(table.complete(first, Some(&correlation)).is_some());
        assert!(table.complete(second, Some(&correlation)).is_none());
        let result = receiver.await.unwrap().unwrap();
        assert_eq!(result.payload, Some(json!({"value": 4})));
        assert!(!table.contains(&RequestId::from("r1")));
    }

    #[tokio::test]
    async fn mismatched_correlation_is_ignored() {
        let table = PendingTable::default();
        let _receiver = reserve(&table, "r1");
        let result = TaskResult::success("r1", "A", json!(null));
        assert!(table.complete(result, Some(&MessageId::from("bogus"))).is_none());
        assert!(table.contains(&RequestId::from("r1")));
    }

    #[tokio::test]
    async fn uncorrelated_result_is_ignored() {
        let table = PendingTable::default();
        let _receiver = reserve(&table, "r1");
        let forged = TaskResult::success("r1", "mallory", json!({"value": 5}));
        assert!(table.complete(forged, None).is_none());
        assert!(table.contains(&RequestId::from("r1")));

        let genuine = TaskResult::success("r1", "A", json!({"value": 4}));
        assert!(table.complete(genuine, Some(&MessageId::from("m-r1"))).is_some());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let table = PendingTable::default();
        let receiver = reserve(&table, "r1");
        assert!(table.cancel(&RequestId::from("r1")));
        assert!(!table.cancel(&RequestId::from("r1")));
        let error = receiver.await.unwrap().unwrap_err();
        assert_eq!(error.code(), ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn nack_fails_request_by_message_id() {
        let table = PendingTable::default();
        let receiver = reserve(&table, "r1");
        let failed = table.fail_by_message(
            &MessageId::from("m-r1"),
            HspError::Nacked {
                code: "HSP_HANDLER_FAILED".to_owned(),
                message: "boom".to_owned(),
            },
        );
        assert_eq!(failed, Some(RequestId::from("r1")));
        assert_eq!(receiver.await.unwrap().unwrap_err().code(), ErrorCode::Nacked);
    }

    #[tokio::test]
    async fn close_fails_everything() {
        let table = PendingTable::default();
        let receiver = reserve(&table, "r1");
        table.close();
        assert_eq!(table.len(), 0);
        assert_eq!(receiver.await.unwrap().unwrap_err().code(), ErrorCode::Closed);
    }
}
