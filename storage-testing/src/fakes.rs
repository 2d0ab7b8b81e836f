// SPDX-License-Identifier: GPL-3.0-only

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::Value;
use tokio::sync::mpsc;

use storage_contracts::{
    ChangeStream, FilesystemHelper, FormatRequest, MountHelper, MountTable, ObjectSource,
    PassphraseSource, StorageError, StorageErrorKind,
};
use storage_types::{
    BtrfsSubvolume, ChangeNotification, InterfaceKind, MountEntry, ObjectPath, ObjectSnapshot,
    ProcessRef, Properties, ResizeSupport, ResizeTarget,
};

use crate::ledger::{Call, CallLedger};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory remote object system serving a snapshot.
pub struct FakeObjectSource {
    ledger: CallLedger,
    snapshot: Mutex<ObjectSnapshot>,
    replies: Mutex<BTreeMap<String, Value>>,
    sender: mpsc::UnboundedSender<ChangeNotification>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ChangeNotification>>>,
}

impl FakeObjectSource {
    pub fn new(ledger: CallLedger, snapshot: ObjectSnapshot) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            ledger,
            snapshot: Mutex::new(snapshot),
            replies: Mutex::new(BTreeMap::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn set_snapshot(&self, snapshot: ObjectSnapshot) {
        *guard(&self.snapshot) = snapshot;
    }

    /// Reply returned by every call of `method`.
    pub fn reply_with(&self, method: &str, reply: Value) {
        guard(&self.replies).insert(method.to_string(), reply);
    }

    /// Push a change notification to the subscriber.
    pub fn notify(&self, notification: ChangeNotification) {
        // Without a subscriber the notification is simply dropped.
        let _ = self.sender.send(notification);
    }
}

#[async_trait]
impl ObjectSource for FakeObjectSource {
    async fn list_objects(&self, kind: InterfaceKind) -> Result<Vec<ObjectPath>, StorageError> {
        Ok(guard(&self.snapshot).paths_with(kind).cloned().collect())
    }

    async fn get_properties(
        &self,
        path: &ObjectPath,
        kind: InterfaceKind,
    ) -> Result<Properties, StorageError> {
        guard(&self.snapshot)
            .interface(path, kind)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("{path} has no {kind:?} interface")))
    }

    async fn call_method(
        &self,
        path: &ObjectPath,
        kind: InterfaceKind,
        method: &str,
        args: Value,
    ) -> Result<Value, StorageError> {
        self.ledger.record(Call::Method {
            path: path.clone(),
            interface: kind,
            method: method.to_string(),
            args,
        })?;
        Ok(guard(&self.replies)
            .get(method)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn subscribe(&self) -> Result<ChangeStream, StorageError> {
        let receiver = guard(&self.receiver).take().ok_or_else(|| {
            StorageError::new(StorageErrorKind::Conflict, "already subscribed")
        })?;
        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|notification| (notification, receiver))
        })
        .boxed())
    }
}

#[derive(Default)]
pub struct FakeFilesystemHelper {
    ledger: CallLedger,
    support: Mutex<BTreeMap<String, ResizeSupport>>,
    subvolumes: Mutex<BTreeMap<ObjectPath, Vec<BtrfsSubvolume>>>,
}

impl FakeFilesystemHelper {
    pub fn new(ledger: CallLedger) -> Self {
        Self {
            ledger,
            ..Default::default()
        }
    }

    pub fn set_resize_support(&self, fs_type: &str, support: ResizeSupport) {
        guard(&self.support).insert(fs_type.to_string(), support);
    }

    pub fn set_subvolumes(&self, block: ObjectPath, subvolumes: Vec<BtrfsSubvolume>) {
        guard(&self.subvolumes).insert(block, subvolumes);
    }
}

#[async_trait]
impl FilesystemHelper for FakeFilesystemHelper {
    async fn format(
        &self,
        block: &ObjectPath,
        request: &FormatRequest,
    ) -> Result<(), StorageError> {
        self.ledger.record(Call::Format {
            block: block.clone(),
            fs_type: request.fs_type.clone(),
        })
    }

    async fn resize(&self, block: &ObjectPath, target: ResizeTarget) -> Result<(), StorageError> {
        self.ledger.record(Call::ResizeFilesystem {
            block: block.clone(),
            target,
        })
    }

    async fn repair(&self, block: &ObjectPath) -> Result<(), StorageError> {
        self.ledger.record(Call::Repair {
            block: block.clone(),
        })
    }

    async fn resize_support(&self, fs_type: &str) -> Result<Option<ResizeSupport>, StorageError> {
        Ok(guard(&self.support).get(fs_type).copied())
    }

    async fn btrfs_subvolumes(
        &self,
        block: &ObjectPath,
    ) -> Result<Vec<BtrfsSubvolume>, StorageError> {
        self.ledger.record(Call::PollSubvolumes {
            block: block.clone(),
        })?;
        Ok(guard(&self.subvolumes)
            .get(block)
            .cloned()
            .unwrap_or_default())
    }
}

/// Tracks mounts and the processes using them.
#[derive(Default)]
pub struct FakeMountHelper {
    ledger: CallLedger,
    mounted: Mutex<BTreeSet<ObjectPath>>,
    users: Mutex<BTreeMap<String, Vec<ProcessRef>>>,
}

impl FakeMountHelper {
    pub fn new(ledger: CallLedger) -> Self {
        Self {
            ledger,
            ..Default::default()
        }
    }

    pub fn set_mounted(&self, block: ObjectPath, mounted: bool) {
        let mut set = guard(&self.mounted);
        if mounted {
            set.insert(block);
        } else {
            set.remove(&block);
        }
    }

    pub fn set_users(&self, directory: &str, processes: Vec<ProcessRef>) {
        guard(&self.users).insert(directory.to_string(), processes);
    }
}

#[async_trait]
impl MountHelper for FakeMountHelper {
    async fn mount(
        &self,
        block: &ObjectPath,
        directory: &str,
        options: &str,
    ) -> Result<(), StorageError> {
        self.ledger.record(Call::Mount {
            block: block.clone(),
            directory: directory.to_string(),
            options: options.to_string(),
        })?;
        guard(&self.mounted).insert(block.clone());
        Ok(())
    }

    async fn unmount(&self, block: &ObjectPath, directory: &str) -> Result<(), StorageError> {
        self.ledger.record(Call::Unmount {
            block: block.clone(),
            directory: directory.to_string(),
        })?;
        guard(&self.mounted).remove(block);
        Ok(())
    }

    async fn find_users(&self, directory: &str) -> Result<Vec<ProcessRef>, StorageError> {
        Ok(guard(&self.users)
            .get(directory)
            .cloned()
            .unwrap_or_default())
    }

    async fn stop_users(&self, processes: &[ProcessRef]) -> Result<(), StorageError> {
        self.ledger.record(Call::StopUsers {
            pids: processes.iter().map(|process| process.pid).collect(),
        })?;
        let stopped: BTreeSet<i32> = processes.iter().map(|process| process.pid).collect();
        for list in guard(&self.users).values_mut() {
            list.retain(|process| !stopped.contains(&process.pid));
        }
        Ok(())
    }

    async fn is_mounted(&self, block: &ObjectPath) -> Result<bool, StorageError> {
        Ok(guard(&self.mounted).contains(block))
    }
}

#[derive(Default)]
pub struct FakeMountTable {
    ledger: CallLedger,
    entries: Mutex<Vec<MountEntry>>,
}

impl FakeMountTable {
    pub fn new(ledger: CallLedger) -> Self {
        Self {
            ledger,
            ..Default::default()
        }
    }

    pub fn set_entries(&self, entries: Vec<MountEntry>) {
        *guard(&self.entries) = entries;
    }

    pub fn current(&self) -> Vec<MountEntry> {
        guard(&self.entries).clone()
    }
}

#[async_trait]
impl MountTable for FakeMountTable {
    async fn entries(&self) -> Result<Vec<MountEntry>, StorageError> {
        Ok(self.current())
    }

    async fn add_entry(&self, entry: &MountEntry) -> Result<(), StorageError> {
        self.ledger.record(Call::AddEntry(entry.clone()))?;
        guard(&self.entries).push(entry.clone());
        Ok(())
    }

    async fn update_entry(&self, old: &MountEntry, new: &MountEntry) -> Result<(), StorageError> {
        self.ledger.record(Call::UpdateEntry {
            old: old.clone(),
            new: new.clone(),
        })?;
        let mut entries = guard(&self.entries);
        let slot = entries
            .iter_mut()
            .find(|entry| entry.key() == old.key())
            .ok_or_else(|| StorageError::not_found(format!("no entry for {}", old.directory)))?;
        *slot = new.clone();
        Ok(())
    }

    async fn remove_entry(&self, entry: &MountEntry) -> Result<(), StorageError> {
        self.ledger.record(Call::RemoveEntry(entry.clone()))?;
        guard(&self.entries).retain(|candidate| candidate.key() != entry.key());
        Ok(())
    }
}

/// Answers passphrase prompts from a queue; an empty queue means "dismissed".
#[derive(Default)]
pub struct FakePassphrase {
    ledger: CallLedger,
    answers: Mutex<VecDeque<String>>,
}

impl FakePassphrase {
    pub fn new(ledger: CallLedger) -> Self {
        Self {
            ledger,
            ..Default::default()
        }
    }

    pub fn push_answer(&self, passphrase: &str) {
        guard(&self.answers).push_back(passphrase.to_string());
    }
}

#[async_trait]
impl PassphraseSource for FakePassphrase {
    async fn request_passphrase(&self, block: &ObjectPath, _reason: &str) -> Option<String> {
        self.ledger
            .record(Call::Passphrase {
                block: block.clone(),
            })
            .ok()?;
        guard(&self.answers).pop_front()
    }
}

/// Every fake wired to one ledger.
pub struct Fakes {
    pub ledger: CallLedger,
    pub objects: Arc<FakeObjectSource>,
    pub filesystems: Arc<FakeFilesystemHelper>,
    pub mounts: Arc<FakeMountHelper>,
    pub mount_table: Arc<FakeMountTable>,
    pub passphrases: Arc<FakePassphrase>,
}

impl Fakes {
    pub fn new(snapshot: ObjectSnapshot) -> Self {
        let ledger = CallLedger::new();
        Self {
            objects: Arc::new(FakeObjectSource::new(ledger.clone(), snapshot)),
            filesystems: Arc::new(FakeFilesystemHelper::new(ledger.clone())),
            mounts: Arc::new(FakeMountHelper::new(ledger.clone())),
            mount_table: Arc::new(FakeMountTable::new(ledger.clone())),
            passphrases: Arc::new(FakePassphrase::new(ledger.clone())),
            ledger,
        }
    }
}
