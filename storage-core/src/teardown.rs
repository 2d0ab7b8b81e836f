// SPDX-License-Identifier: GPL-3.0-only

//! Freeing a device for an action and bringing its users back afterwards.
//!
//! [`Teardown::around`] tears down every user in a [`UsageList`] from the
//! deepest layer to the shallowest, runs the action, and then restores what
//! the request marked temporary. When the teardown or the action fails,
//! everything already torn down is restored in reverse order and the
//! original error is returned.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use storage_contracts::{
    OperationEvent, OperationId, OperationKind, OperationProgress, StorageError,
};
use storage_types::{
    ConfigEntry, ConfigKind, InterfaceKind, MountEntry, ObjectPath, ProcessRef, TeardownVerb,
    UsageEntry, UsageList,
};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::index::Index;
use crate::locks::DeviceLocks;
use crate::runner::{StepExecutor, StepFailure, run_steps};
use crate::service::Collaborators;

const UNLOCK_REASON: &str = "Unlocking the disk is needed to restore it.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownState {
    Idle,
    UsageResolved,
    TornDown,
    ActionInFlight,
    Succeeded,
    Failed,
    Restored,
    RestoreAttempted,
    Cancelled,
}

impl fmt::Display for TeardownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::UsageResolved => "usage-resolved",
            Self::TornDown => "torn-down",
            Self::ActionInFlight => "action-in-flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Restored => "restored",
            Self::RestoreAttempted => "restore-attempted",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of a successful action.
#[derive(Debug)]
pub struct TeardownOutcome<T> {
    pub value: T,
    pub state: TeardownState,
    /// Users that could not be brought back; the action itself succeeded.
    pub restore_failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownStep {
    StopProcesses {
        block: ObjectPath,
        directory: String,
        processes: Vec<ProcessRef>,
    },
    Unmount {
        block: ObjectPath,
        directory: String,
        /// Options to mount it again with.
        options: String,
        temporary: bool,
    },
    RemoveFstab {
        directory: String,
        temporary: bool,
    },
    RemoveCrypttab {
        block: ObjectPath,
        entry: ConfigEntry,
        temporary: bool,
    },
    SwapOff { block: ObjectPath, temporary: bool },
    Lock {
        block: ObjectPath,
        cleartext: Option<ObjectPath>,
        temporary: bool,
    },
    RemoveFromGroup { block: ObjectPath, group: ObjectPath },
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopProcesses {
                directory,
                processes,
                ..
            } => write!(f, "stop {} processes using {directory}", processes.len()),
            Self::Unmount {
                block, directory, ..
            } => write!(f, "unmount {} from {directory}", block.basename()),
            Self::RemoveFstab { directory, .. } => {
                write!(f, "remove mount configuration for {directory}")
            }
            Self::RemoveCrypttab { block, .. } => {
                write!(f, "remove encryption configuration of {}", block.basename())
            }
            Self::SwapOff { block, .. } => write!(f, "stop swap on {}", block.basename()),
            Self::Lock { block, .. } => write!(f, "lock {}", block.basename()),
            Self::RemoveFromGroup { block, group } => write!(
                f,
                "move data off {} and remove it from {}",
                block.basename(),
                group.basename()
            ),
        }
    }
}

/// How to bring back one torn-down user.
#[derive(Debug, Clone, PartialEq, Eq)]
enum UndoAction {
    Mount {
        block: ObjectPath,
        directory: String,
        options: String,
    },
    AddFstab(MountEntry),
    AddCrypttab { block: ObjectPath, entry: ConfigEntry },
    SwapOn { block: ObjectPath },
    Unlock {
        block: ObjectPath,
        cleartext: Option<ObjectPath>,
    },
}

impl fmt::Display for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mount {
                block, directory, ..
            } => write!(f, "mount {} at {directory}", block.basename()),
            Self::AddFstab(entry) => write!(f, "add mount configuration for {}", entry.directory),
            Self::AddCrypttab { block, .. } => {
                write!(f, "add encryption configuration of {}", block.basename())
            }
            Self::SwapOn { block } => write!(f, "start swap on {}", block.basename()),
            Self::Unlock { block, .. } => write!(f, "unlock {}", block.basename()),
        }
    }
}

#[derive(Debug)]
struct Undo {
    action: UndoAction,
    temporary: bool,
}

fn crypttab_item(entry: &ConfigEntry) -> Value {
    json!(["crypttab", {"options": entry.options}])
}

/// Teardown steps for `entry`, in verb order.
fn entry_steps(index: &Index, entry: &UsageEntry) -> Vec<TeardownStep> {
    let mut verbs = entry.verbs.clone();
    verbs.sort();
    let block = &entry.block;
    let temporary = entry.temporary;

    let mut steps = Vec::new();
    for verb in verbs {
        match verb {
            TeardownVerb::StopProcesses => steps.push(TeardownStep::StopProcesses {
                block: block.clone(),
                directory: entry.location.clone().unwrap_or_default(),
                processes: entry.processes.clone(),
            }),
            TeardownVerb::Unmount => {
                let directory = entry.location.clone().unwrap_or_default();
                let options = index
                    .blocks
                    .get(block)
                    .and_then(|device| {
                        device
                            .fstab_entries()
                            .find(|config| config.directory.as_deref() == Some(directory.as_str()))
                    })
                    .map(|config| config.options.clone())
                    .unwrap_or_default();
                steps.push(TeardownStep::Unmount {
                    block: block.clone(),
                    directory,
                    options,
                    temporary,
                });
            }
            TeardownVerb::RemoveConfig => {
                for config in &entry.configs {
                    match config.kind {
                        ConfigKind::Fstab => {
                            if let Some(directory) = &config.directory {
                                steps.push(TeardownStep::RemoveFstab {
                                    directory: directory.clone(),
                                    temporary,
                                });
                            }
                        }
                        ConfigKind::Crypttab => steps.push(TeardownStep::RemoveCrypttab {
                            block: block.clone(),
                            entry: config.clone(),
                            temporary,
                        }),
                    }
                }
            }
            TeardownVerb::SwapOff => steps.push(TeardownStep::SwapOff {
                block: block.clone(),
                temporary,
            }),
            TeardownVerb::Lock => steps.push(TeardownStep::Lock {
                block: block.clone(),
                cleartext: index.blocks_cleartext.get(block).cloned(),
                temporary,
            }),
            TeardownVerb::RemoveFromGroup => {
                match index.pvols.get(block).and_then(|pvol| pvol.group.clone()) {
                    Some(group) => steps.push(TeardownStep::RemoveFromGroup {
                        block: block.clone(),
                        group,
                    }),
                    None => tracing::warn!(%block, "physical volume without a group"),
                }
            }
        }
    }
    steps
}

/// All teardown steps for `usage`, deepest users first.
pub fn teardown_steps(index: &Index, usage: &UsageList) -> Vec<TeardownStep> {
    usage
        .teardown_order()
        .into_iter()
        .flat_map(|entry| entry_steps(index, entry))
        .collect()
}

struct TeardownExecutor<'a> {
    collab: &'a Collaborators,
    stop_grace: Duration,
    undo: Mutex<Vec<Undo>>,
}

impl TeardownExecutor<'_> {
    fn remember(&self, action: UndoAction, temporary: bool) {
        self.undo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Undo { action, temporary });
    }

    fn take_undo(&self) -> Vec<Undo> {
        std::mem::take(
            &mut *self
                .undo
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    async fn call(
        &self,
        path: &ObjectPath,
        interface: InterfaceKind,
        method: &str,
        args: Value,
    ) -> std::result::Result<Value, StorageError> {
        self.collab
            .objects
            .call_method(path, interface, method, args)
            .await
    }
}

#[async_trait]
impl StepExecutor<TeardownStep> for TeardownExecutor<'_> {
    async fn execute(&self, step: &TeardownStep) -> Result<()> {
        match step {
            TeardownStep::StopProcesses { processes, .. } => {
                self.collab.mounts.stop_users(processes).await?;
                if !self.stop_grace.is_zero() {
                    tokio::time::sleep(self.stop_grace).await;
                }
            }
            TeardownStep::Unmount {
                block,
                directory,
                options,
                temporary,
            } => {
                self.collab.mounts.unmount(block, directory).await?;
                self.remember(
                    UndoAction::Mount {
                        block: block.clone(),
                        directory: directory.clone(),
                        options: options.clone(),
                    },
                    *temporary,
                );
            }
            TeardownStep::RemoveFstab {
                directory,
                temporary,
            } => {
                let entries = self.collab.mount_table.entries().await?;
                let Some(entry) = entries.into_iter().find(|entry| entry.directory == *directory)
                else {
                    tracing::warn!(directory, "no mount table entry to remove");
                    return Ok(());
                };
                self.collab.mount_table.remove_entry(&entry).await?;
                self.remember(UndoAction::AddFstab(entry), *temporary);
            }
            TeardownStep::RemoveCrypttab {
                block,
                entry,
                temporary,
            } => {
                self.call(
                    block,
                    InterfaceKind::Block,
                    "RemoveConfigurationItem",
                    json!({"item": crypttab_item(entry), "options": {}}),
                )
                .await?;
                self.remember(
                    UndoAction::AddCrypttab {
                        block: block.clone(),
                        entry: entry.clone(),
                    },
                    *temporary,
                );
            }
            TeardownStep::SwapOff { block, temporary } => {
                self.call(block, InterfaceKind::Swapspace, "Stop", json!({"options": {}}))
                    .await?;
                self.remember(
                    UndoAction::SwapOn {
                        block: block.clone(),
                    },
                    *temporary,
                );
            }
            TeardownStep::Lock {
                block,
                cleartext,
                temporary,
            } => {
                self.call(block, InterfaceKind::Encrypted, "Lock", json!({"options": {}}))
                    .await?;
                self.remember(
                    UndoAction::Unlock {
                        block: block.clone(),
                        cleartext: cleartext.clone(),
                    },
                    *temporary,
                );
            }
            TeardownStep::RemoveFromGroup { block, group } => {
                self.call(
                    group,
                    InterfaceKind::VolumeGroup,
                    "EmptyDevice",
                    json!({"block": block, "options": {}}),
                )
                .await?;
                self.call(
                    group,
                    InterfaceKind::VolumeGroup,
                    "RemoveDevice",
                    json!({"block": block, "wipe": true, "options": {}}),
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// One teardown-then-action run.
pub struct Teardown<'a> {
    collab: &'a Collaborators,
    index: &'a Index,
    config: &'a CoreConfig,
    locks: &'a DeviceLocks,
    events: Option<mpsc::UnboundedSender<OperationEvent>>,
    cancel: CancellationToken,
    operation_id: OperationId,
    operation: OperationKind,
    extra_locks: Vec<ObjectPath>,
}

impl<'a> Teardown<'a> {
    pub fn new(
        collab: &'a Collaborators,
        index: &'a Index,
        config: &'a CoreConfig,
        locks: &'a DeviceLocks,
    ) -> Self {
        Self {
            collab,
            index,
            config,
            locks,
            events: None,
            cancel: CancellationToken::new(),
            operation_id: OperationId::new(),
            operation: OperationKind::Teardown,
            extra_locks: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Option<mpsc::UnboundedSender<OperationEvent>>) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Kind reported in the operation events.
    pub fn with_operation(mut self, operation: OperationKind) -> Self {
        self.operation = operation;
        self
    }

    /// Also hold `path` for the whole run, e.g. a volume object next to its block.
    pub fn with_lock(mut self, path: ObjectPath) -> Self {
        self.extra_locks.push(path);
        self
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    fn emit(&self, event: OperationEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = events.send(event);
        }
    }

    fn enter(&self, state: &mut TeardownState, next: TeardownState, done: usize, total: usize) {
        tracing::debug!(
            operation = %self.operation_id,
            from = %state,
            to = %next,
            "teardown state"
        );
        *state = next;
        self.emit(OperationEvent::Progress(OperationProgress {
            operation_id: self.operation_id,
            operation: self.operation,
            phase: next.to_string(),
            steps_done: done as u32,
            steps_total: Some(total as u32),
            at: Utc::now(),
        }));
    }

    fn fail(&self, error: &CoreError) {
        self.emit(OperationEvent::Failed {
            operation_id: self.operation_id,
            operation: self.operation,
            error: error.to_storage_error(),
        });
    }

    /// Tear down `usage`, run `action`, and restore.
    pub async fn around<T, F, Fut>(&self, usage: &UsageList, action: F) -> Result<TeardownOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = TeardownState::Idle;
        let steps = teardown_steps(self.index, usage);
        let total = steps.len();
        self.enter(&mut state, TeardownState::UsageResolved, 0, total);

        if usage.blocking() {
            let error = CoreError::blocked(usage.clone());
            tracing::debug!(%error, "usage blocks the action");
            self.fail(&error);
            return Err(error);
        }

        let paths = std::iter::once(usage.target.path().clone())
            .chain(self.extra_locks.iter().cloned())
            .chain(usage.entries.iter().map(|entry| entry.block.clone()));
        let _guard = match self.locks.try_lock(paths) {
            Ok(guard) => guard,
            Err(error) => {
                self.fail(&error);
                return Err(error);
            }
        };

        let executor = TeardownExecutor {
            collab: self.collab,
            stop_grace: Duration::from_millis(self.config.stop_grace_ms),
            undo: Mutex::new(Vec::new()),
        };

        if let Err(StepFailure { failed_at, error }) =
            run_steps(&steps, 0, &executor, &self.cancel).await
        {
            if matches!(error, CoreError::Cancelled) {
                self.enter(&mut state, TeardownState::Cancelled, failed_at, total);
                self.fail(&error);
                return Err(error);
            }
            tracing::debug!(step = failed_at, %error, "teardown failed");
            self.enter(&mut state, TeardownState::Failed, failed_at, total);
            self.restore(executor.take_undo(), false).await;
            self.enter(&mut state, TeardownState::RestoreAttempted, failed_at, total);
            self.fail(&error);
            return Err(error);
        }
        self.enter(&mut state, TeardownState::TornDown, total, total);

        if self.cancel.is_cancelled() {
            self.enter(&mut state, TeardownState::Cancelled, total, total);
            self.fail(&CoreError::Cancelled);
            return Err(CoreError::Cancelled);
        }

        self.enter(&mut state, TeardownState::ActionInFlight, total, total);
        match action().await {
            Ok(value) => {
                self.enter(&mut state, TeardownState::Succeeded, total, total);
                let restore_failures = self.restore(executor.take_undo(), true).await;
                self.enter(&mut state, TeardownState::Restored, total, total);
                self.emit(OperationEvent::Completed {
                    operation_id: self.operation_id,
                    operation: self.operation,
                });
                Ok(TeardownOutcome {
                    value,
                    state,
                    restore_failures,
                })
            }
            Err(error) => {
                tracing::debug!(%error, "action failed, restoring");
                self.enter(&mut state, TeardownState::Failed, total, total);
                self.restore(executor.take_undo(), false).await;
                self.enter(&mut state, TeardownState::RestoreAttempted, total, total);
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// Undo in reverse order, returning what could not be restored.
    async fn restore(&self, undo: Vec<Undo>, only_temporary: bool) -> Vec<String> {
        let mut failures = Vec::new();
        let mut renamed: BTreeMap<ObjectPath, ObjectPath> = BTreeMap::new();
        for Undo { action, temporary } in undo.into_iter().rev() {
            if only_temporary && !temporary {
                continue;
            }
            tracing::info!("restoring: {action}");
            if let Err(error) = self.undo(&action, &mut renamed).await {
                tracing::warn!("failed to {action}: {error}");
                failures.push(format!("failed to {action}: {error}"));
            }
        }
        failures
    }

    async fn undo(
        &self,
        action: &UndoAction,
        renamed: &mut BTreeMap<ObjectPath, ObjectPath>,
    ) -> Result<()> {
        match action {
            UndoAction::Mount {
                block,
                directory,
                options,
            } => {
                let block = renamed.get(block).unwrap_or(block);
                self.collab.mounts.mount(block, directory, options).await?;
            }
            UndoAction::AddFstab(entry) => self.collab.mount_table.add_entry(entry).await?,
            UndoAction::AddCrypttab { block, entry } => {
                self.collab
                    .objects
                    .call_method(
                        block,
                        InterfaceKind::Block,
                        "AddConfigurationItem",
                        json!({"item": crypttab_item(entry), "options": {}}),
                    )
                    .await?;
            }
            UndoAction::SwapOn { block } => {
                self.collab
                    .objects
                    .call_method(block, InterfaceKind::Swapspace, "Start", json!({"options": {}}))
                    .await?;
            }
            UndoAction::Unlock { block, cleartext } => {
                let reply = self.unlock(block).await?;
                if let (Some(old), Some(new)) =
                    (cleartext, reply.as_str().and_then(ObjectPath::from_ref))
                    && *old != new
                {
                    tracing::debug!(%old, %new, "cleartext device moved");
                    renamed.insert(old.clone(), new);
                }
            }
        }
        Ok(())
    }

    /// Unlock with stored keys first, then ask for a passphrase once.
    async fn unlock(&self, block: &ObjectPath) -> Result<Value> {
        let objects = &self.collab.objects;
        match objects
            .call_method(block, InterfaceKind::Encrypted, "Unlock", json!({"options": {}}))
            .await
        {
            Ok(reply) => Ok(reply),
            Err(error) if error.is_auth_failure() => {
                let Some(passphrase) = self
                    .collab
                    .passphrases
                    .request_passphrase(block, UNLOCK_REASON)
                    .await
                else {
                    return Err(error.into());
                };
                Ok(objects
                    .call_method(
                        block,
                        InterfaceKind::Encrypted,
                        "Unlock",
                        json!({"passphrase": passphrase, "options": {}}),
                    )
                    .await?)
            }
            Err(error) => Err(error.into()),
        }
    }
}
