// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use storage_contracts::{StorageError, StorageErrorKind};
use storage_types::{InterfaceKind, ObjectPath};

use crate::error::Result;
use crate::runner::{StepExecutor, StepFailure, run_steps};
use crate::service::Collaborators;

use super::plan::{ResizePlan, Step};

const PASSPHRASE_REASON: &str =
    "Resizing an encrypted filesystem requires unlocking the disk. Please provide a current disk passphrase.";

/// Runs resize steps against the collaborators.
pub struct ResizeExecutor<'a> {
    collab: &'a Collaborators,
    passphrase: Option<String>,
}

impl<'a> ResizeExecutor<'a> {
    pub fn new(collab: &'a Collaborators, passphrase: Option<String>) -> Self {
        Self { collab, passphrase }
    }

    async fn call(
        &self,
        path: &ObjectPath,
        interface: InterfaceKind,
        method: &str,
        args: Value,
    ) -> Result<Value> {
        tracing::info!(%path, ?interface, method, "calling");
        Ok(self
            .collab
            .objects
            .call_method(path, interface, method, args)
            .await?)
    }
}

/// Stratis replies `[result, return_code, message]`; a non-zero code is a failure.
fn check_stratis_reply(reply: &Value) -> Result<()> {
    let Some(code) = reply.get(1).and_then(Value::as_u64) else {
        return Ok(());
    };
    if code == 0 {
        return Ok(());
    }
    let message = reply
        .get(2)
        .and_then(Value::as_str)
        .unwrap_or("Stratis request failed");
    Err(StorageError::new(StorageErrorKind::Internal, format!("{message} ({code})")).into())
}

#[async_trait]
impl StepExecutor<Step> for ResizeExecutor<'_> {
    async fn execute(&self, step: &Step) -> Result<()> {
        match step {
            Step::RepairIfOffline { block } => {
                // The mount state may have changed since planning.
                if !self.collab.mounts.is_mounted(block).await? {
                    tracing::info!(%block, "filesystem is not mounted, repairing first");
                    self.collab.filesystems.repair(block).await?;
                }
            }
            Step::ResizeFilesystem { block, target } => {
                tracing::info!(%block, ?target, "resizing filesystem");
                self.collab.filesystems.resize(block, *target).await?;
            }
            Step::ResizeCrypto { block, target } => {
                let mut options = json!({});
                if let Some(passphrase) = &self.passphrase {
                    options["passphrase"] = json!(passphrase);
                }
                self.call(
                    block,
                    InterfaceKind::Encrypted,
                    "Resize",
                    json!({"size": target.as_wire(), "options": options}),
                )
                .await?;
            }
            Step::ResizeLogicalVolume { lvol, size, pvs } => {
                let mut options = json!({});
                if let Some(pvs) = pvs {
                    options["pvs"] = json!(pvs);
                }
                self.call(
                    lvol,
                    InterfaceKind::LogicalVolume,
                    "Resize",
                    json!({"size": size, "options": options}),
                )
                .await?;
            }
            Step::ResizePartition { block, size } => {
                self.call(
                    block,
                    InterfaceKind::Partition,
                    "Resize",
                    json!({"size": size, "options": {}}),
                )
                .await?;
            }
            Step::GrowVdo { vdo } => {
                self.call(vdo, InterfaceKind::Vdo, "GrowPhysical", json!({}))
                    .await?;
            }
            Step::GrowStratisBlockdev { pool, uuid } => {
                let reply = self
                    .call(
                        pool,
                        InterfaceKind::StratisPool,
                        "GrowPhysicalDevice",
                        json!({"uuid": uuid}),
                    )
                    .await?;
                check_stratis_reply(&reply)?;
            }
        }
        Ok(())
    }
}

/// Run a resize plan.
///
/// When the encryption resize fails for lack of a passphrase and none was
/// given, the user is asked once and the plan resumes at that step.
pub async fn execute(
    collab: &Collaborators,
    plan: &ResizePlan,
    passphrase: Option<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut executor = ResizeExecutor::new(collab, passphrase);
    let mut start = 0;
    let mut prompted = false;

    loop {
        let StepFailure { failed_at, error } =
            match run_steps(&plan.steps, start, &executor, cancel).await {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };

        let at_crypto = matches!(plan.steps.get(failed_at), Some(Step::ResizeCrypto { .. }));
        if prompted || executor.passphrase.is_some() || !at_crypto || !error.is_auth_failure() {
            return Err(error);
        }
        let Some(block) = &plan.crypto_block else {
            return Err(error);
        };

        prompted = true;
        tracing::debug!(%block, "encryption resize needs a passphrase");
        let Some(passphrase) = collab
            .passphrases
            .request_passphrase(block, PASSPHRASE_REASON)
            .await
        else {
            tracing::debug!(%block, "passphrase prompt dismissed");
            return Err(error);
        };
        executor.passphrase = Some(passphrase);
        start = failed_at;
    }
}
