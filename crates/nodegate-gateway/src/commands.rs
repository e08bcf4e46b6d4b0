//! Command dispatch and response correlation.
//!
//! Each command gets a fresh id, is persisted as `pending`, handed to the
//! node's connection, and marked `sent`. Every command holds an entry in the
//! in-flight table while it is dispatched. An awaited command keeps its
//! entry until exactly one of {response, deadline, send failure} claims it
//! by removing it under the table lock.
//!
//! Until an awaited command's deadline is armed the dispatching task owns
//! persistence of the record, so store writes happen in lifecycle order.
//! After that, whoever claims the entry stores the terminal record. The
//! deadline runs in its own task and fires even if the caller goes away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use nodegate_core::config::CommandsConfig;
use nodegate_core::error::{NodeGateError, Result};
use nodegate_core::protocol::{CommandResponseFrame, OutboundFrame};
use nodegate_core::records::{CommandRecord, CommandStatus};
use nodegate_core::store::RecordStore;

use crate::events::{EventBus, GatewayEvent};
use crate::registry::ConnectionRegistry;
use crate::{metrics, persist};

/// Parameters for one command dispatch.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub node_id: String,
    pub command_type: String,
    pub parameters: Value,
    pub initiated_by: String,
    pub wait_for_response: bool,
    /// Overrides the per-type default from [`CommandsConfig`].
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(node_id: impl Into<String>, command_type: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            command_type: command_type.into(),
            parameters: json!({}),
            initiated_by: "system".to_string(),
            wait_for_response: false,
            timeout: None,
        }
    }

    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn initiated_by(mut self, initiated_by: impl Into<String>) -> Self {
        self.initiated_by = initiated_by.into();
        self
    }

    /// Wait for the node's response, optionally with an explicit timeout.
    pub fn wait(mut self, timeout: Option<Duration>) -> Self {
        self.wait_for_response = true;
        self.timeout = timeout;
        self
    }
}

struct InFlight {
    record: CommandRecord,
    waiter: Option<oneshot::Sender<CommandRecord>>,
    /// Set once the deadline task owns the entry.
    deadline: Option<AbortHandle>,
    /// The deadline fired and the timeout is being stored.
    expiring: bool,
}

type InFlightTable = Mutex<HashMap<String, InFlight>>;

/// Outcome of arming an awaited command's deadline.
enum Armed {
    Waiting,
    /// A response completed the entry before the deadline was armed.
    Settled(CommandRecord),
    Gone,
}

/// In-flight table plus the sinks a settled command is reported to.
///
/// Shared with deadline tasks, which outlive the dispatching future.
struct Ledger {
    inflight: InFlightTable,
    store: Arc<dyn RecordStore>,
    events: EventBus,
}

impl Ledger {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand an unarmed entry to a deadline task, or take it if already complete.
    fn arm(self: &Arc<Self>, command_id: &str, timeout: Duration) -> Armed {
        let mut table = self.lock();
        match table.get(command_id).map(|entry| entry.record.status.is_terminal()) {
            None => Armed::Gone,
            Some(true) => match table.remove(command_id) {
                Some(entry) => Armed::Settled(entry.record),
                None => Armed::Gone,
            },
            Some(false) => {
                // The task cannot claim the entry before this lock is released
                let task = tokio::spawn(self.clone().expire(command_id.to_string(), timeout));
                if let Some(entry) = table.get_mut(command_id) {
                    entry.deadline = Some(task.abort_handle());
                }
                Armed::Waiting
            }
        }
    }

    async fn expire(self: Arc<Self>, command_id: String, timeout: Duration) {
        tokio::time::sleep(timeout).await;
        let timeout_ms = timeout.as_millis() as u64;

        // The entry stays in the table until the timeout is stored, so a
        // response landing meanwhile completes it in place
        let (record, waiter) = {
            let mut table = self.lock();
            let Some(entry) = table.get_mut(&command_id) else {
                return;
            };
            entry.expiring = true;
            match entry.record.status {
                // The dispatching future was dropped before the frame was queued
                CommandStatus::Pending => {
                    entry
                        .record
                        .mark_send_failed("Command dispatch abandoned", Utc::now());
                }
                CommandStatus::Sent => {
                    entry
                        .record
                        .mark_timeout(format!("No response within {timeout_ms}ms"), Utc::now());
                }
                _ => {}
            }
            (entry.record.clone(), entry.waiter.take())
        };

        warn!(
            command_id = %command_id,
            node_id = %record.node_id,
            status = %record.status,
            timeout_ms,
            "Command timed out"
        );
        self.persist_settled(&record).await;

        let claimed = self.lock().remove(&command_id);
        if let Some(entry) = claimed {
            if entry.record.status != record.status {
                info!(command_id = %command_id, status = %entry.record.status, "Recorded late command response");
                self.persist_settled(&entry.record).await;
            }
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(record);
        }
    }

    async fn persist_settled(&self, record: &CommandRecord) {
        persist::save_command(self.store.as_ref(), record).await;
        self.settled(record);
    }

    fn settled(&self, record: &CommandRecord) {
        metrics::record_command(&record.status.to_string());
        self.events.publish(GatewayEvent::CommandCompleted {
            command_id: record.command_id.clone(),
            node_id: record.node_id.clone(),
            status: record.status,
        });
    }
}

/// Releases the in-flight entry if the dispatching future is dropped early.
///
/// An awaited command keeps its entry and gets its deadline armed instead,
/// so the record still reaches a terminal status.
struct SlotGuard {
    ledger: Arc<Ledger>,
    command_id: String,
    timeout: Option<Duration>,
    released: bool,
}

impl SlotGuard {
    fn release(&mut self) {
        self.released = true;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let timeout = self
            .timeout
            .filter(|_| tokio::runtime::Handle::try_current().is_ok());
        let Some(timeout) = timeout else {
            self.ledger.lock().remove(&self.command_id);
            return;
        };
        if let Armed::Settled(record) = self.ledger.arm(&self.command_id, timeout) {
            let ledger = self.ledger.clone();
            tokio::spawn(async move { ledger.persist_settled(&record).await });
        }
    }
}

pub struct CommandEngine {
    registry: Arc<ConnectionRegistry>,
    config: CommandsConfig,
    ledger: Arc<Ledger>,
}

impl CommandEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn RecordStore>,
        events: EventBus,
        config: CommandsConfig,
    ) -> Self {
        Self {
            registry,
            config,
            ledger: Arc::new(Ledger {
                inflight: Mutex::new(HashMap::new()),
                store,
                events,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Number of commands currently awaiting settlement.
    pub fn in_flight(&self) -> usize {
        self.ledger.lock().len()
    }

    /// Dispatch a command to a connected node.
    ///
    /// Without `wait_for_response` this returns the `sent` record as soon as
    /// the frame is queued. With it, the returned record is `successful` or
    /// `failed` with the node's result, or the call fails with
    /// [`NodeGateError::CommandTimedOut`]. Dropping the returned future does
    /// not cancel the deadline.
    pub async fn send_command(&self, request: CommandRequest) -> Result<CommandRecord> {
        if !self.registry.is_connected(&request.node_id).await {
            debug!(node_id = %request.node_id, command = %request.command_type, "Node not connected");
            return Err(NodeGateError::NodeNotConnected(request.node_id));
        }

        let timeout = request
            .timeout
            .unwrap_or_else(|| self.config.timeout_for(&request.command_type));
        let command_id = Uuid::new_v4().to_string();
        let mut record = CommandRecord::new(
            &command_id,
            &request.node_id,
            &request.command_type,
            request.parameters.clone(),
            &request.initiated_by,
            Utc::now(),
        );

        let (waiter, rx) = if request.wait_for_response {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        // Registered before transmission so a fast response finds its entry
        self.ledger.lock().insert(
            command_id.clone(),
            InFlight {
                record: record.clone(),
                waiter,
                deadline: None,
                expiring: false,
            },
        );
        let mut guard = SlotGuard {
            ledger: self.ledger.clone(),
            command_id: command_id.clone(),
            timeout: request.wait_for_response.then_some(timeout),
            released: false,
        };
        persist::save_command(self.ledger.store.as_ref(), &record).await;

        let frame = OutboundFrame::Command {
            command_id: command_id.clone(),
            command: request.command_type.clone(),
            parameters: request.parameters,
            timestamp: Utc::now(),
        };

        if !self.registry.send(&request.node_id, &frame).await {
            self.ledger.lock().remove(&command_id);
            guard.release();
            record.mark_send_failed("Failed to send command to node", Utc::now());
            self.ledger.persist_settled(&record).await;
            warn!(command_id = %command_id, node_id = %request.node_id, "Command transmission failed");
            return Err(NodeGateError::CommandSendFailed {
                command_id,
                node_id: request.node_id,
            });
        }

        let sent_at = Utc::now();
        record.mark_sent(sent_at);
        if let Some(entry) = self.ledger.lock().get_mut(&command_id) {
            if entry.record.status == CommandStatus::Pending {
                entry.record.mark_sent(sent_at);
            }
        }
        persist::save_command(self.ledger.store.as_ref(), &record).await;
        info!(
            command_id = %command_id,
            node_id = %request.node_id,
            command = %request.command_type,
            wait = request.wait_for_response,
            "Command sent"
        );

        let Some(rx) = rx else {
            guard.release();
            return Ok(self.settle_unwaited(record).await);
        };

        let armed = self.ledger.arm(&command_id, timeout);
        guard.release();
        match armed {
            Armed::Waiting => self.await_response(record, rx, timeout).await,
            Armed::Settled(completed) => {
                self.ledger.persist_settled(&completed).await;
                Ok(completed)
            }
            Armed::Gone => Err(NodeGateError::Gateway(format!(
                "in-flight entry for {command_id} vanished"
            ))),
        }
    }

    /// Release a fire-and-forget command's entry now that `sent` is stored.
    ///
    /// A response that raced in while the entry was held is persisted here.
    async fn settle_unwaited(&self, record: CommandRecord) -> CommandRecord {
        let entry = self.ledger.lock().remove(&record.command_id);
        match entry {
            Some(entry) if entry.record.status.is_terminal() => {
                self.ledger.persist_settled(&entry.record).await;
                entry.record
            }
            _ => record,
        }
    }

    /// Wait for whichever of response or deadline claims the entry.
    ///
    /// The claimant has already stored the terminal record.
    async fn await_response(
        &self,
        record: CommandRecord,
        rx: oneshot::Receiver<CommandRecord>,
        timeout: Duration,
    ) -> Result<CommandRecord> {
        let completed = rx.await.map_err(|_| {
            NodeGateError::Gateway(format!("response slot for {} dropped", record.command_id))
        })?;
        if completed.status == CommandStatus::Timeout {
            return Err(NodeGateError::CommandTimedOut {
                command_id: record.command_id,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(completed)
    }

    /// Apply a `command_response` frame from `node_id`.
    ///
    /// Responses for commands nobody is waiting on (fire-and-forget, or
    /// arriving after a timeout) are applied to the stored record.
    pub async fn on_command_response(
        &self,
        node_id: &str,
        response: CommandResponseFrame,
    ) -> Result<CommandRecord> {
        let now = Utc::now();
        let command_id = response.command_id.clone();

        let resolved = {
            let mut table = self.ledger.lock();
            match table.get_mut(&command_id) {
                Some(entry) if entry.record.node_id != node_id => {
                    warn!(
                        command_id = %command_id,
                        node_id,
                        owner = %entry.record.node_id,
                        "Response from a node that does not own the command"
                    );
                    return Err(NodeGateError::UnknownCommandResponse(command_id));
                }
                Some(entry) => {
                    // A response proves delivery even if `sent` has not been recorded yet
                    if entry.record.status == CommandStatus::Pending {
                        entry.record.mark_sent(now);
                    }
                    if !entry.record.complete(
                        response.success,
                        response.result.clone(),
                        response.error.clone(),
                        now,
                    ) {
                        return Err(NodeGateError::UnknownCommandResponse(command_id));
                    }
                    if entry.deadline.is_some() && !entry.expiring {
                        table.remove(&command_id).map(|entry| {
                            if let Some(deadline) = &entry.deadline {
                                deadline.abort();
                            }
                            (entry.record, entry.waiter)
                        })
                    } else {
                        // The dispatcher or the expiring deadline still owns the entry and stores it
                        return Ok(entry.record.clone());
                    }
                }
                None => None,
            }
        };

        match resolved {
            Some((record, waiter)) => {
                debug!(command_id = %command_id, status = %record.status, "Resolved waiting command");
                self.ledger.persist_settled(&record).await;
                if let Some(waiter) = waiter {
                    // The caller may have gone away; the record is stored either way
                    let _ = waiter.send(record.clone());
                }
                Ok(record)
            }
            None => self.apply_untracked_response(node_id, response, now).await,
        }
    }

    async fn apply_untracked_response(
        &self,
        node_id: &str,
        response: CommandResponseFrame,
        now: chrono::DateTime<Utc>,
    ) -> Result<CommandRecord> {
        let command_id = response.command_id;
        let mut record = match self.ledger.store.find_command(&command_id).await? {
            Some(record) if record.node_id == node_id => record,
            _ => {
                warn!(command_id = %command_id, node_id, "Response for unknown command");
                return Err(NodeGateError::UnknownCommandResponse(command_id));
            }
        };

        let previous = record.status;
        if previous == CommandStatus::Pending {
            record.mark_sent(now);
        }
        if !record.complete(response.success, response.result, response.error, now) {
            return Err(NodeGateError::UnknownCommandResponse(command_id));
        }

        self.ledger.persist_settled(&record).await;
        if previous == CommandStatus::Timeout {
            info!(command_id = %command_id, status = %record.status, "Recorded late command response");
        } else {
            debug!(command_id = %command_id, status = %record.status, "Recorded command response");
        }
        Ok(record)
    }
}
