// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use storage_contracts::StorageError;
use storage_types::{InterfaceKind, MountEntry, ObjectPath, ResizeTarget};

/// A mutating call made against one of the fakes.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Method {
        path: ObjectPath,
        interface: InterfaceKind,
        method: String,
        args: Value,
    },
    Format {
        block: ObjectPath,
        fs_type: String,
    },
    ResizeFilesystem {
        block: ObjectPath,
        target: ResizeTarget,
    },
    Repair {
        block: ObjectPath,
    },
    Mount {
        block: ObjectPath,
        directory: String,
        options: String,
    },
    Unmount {
        block: ObjectPath,
        directory: String,
    },
    StopUsers {
        pids: Vec<i32>,
    },
    AddEntry(MountEntry),
    UpdateEntry {
        old: MountEntry,
        new: MountEntry,
    },
    RemoveEntry(MountEntry),
    Passphrase {
        block: ObjectPath,
    },
    PollSubvolumes {
        block: ObjectPath,
    },
}

impl fmt::Display for Call {
    /// Compact form used in ordering assertions, e.g. `Encrypted.Lock sda2`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Method {
                path,
                interface,
                method,
                ..
            } => write!(f, "{interface:?}.{method} {}", path.basename()),
            Self::Format { block, fs_type } => write!(f, "format {} {fs_type}", block.basename()),
            Self::ResizeFilesystem { block, target } => match target {
                ResizeTarget::Fill => write!(f, "fs-resize {} fill", block.basename()),
                ResizeTarget::Bytes(bytes) => {
                    write!(f, "fs-resize {} {bytes}", block.basename())
                }
            },
            Self::Repair { block } => write!(f, "repair {}", block.basename()),
            Self::Mount {
                block, directory, ..
            } => write!(f, "mount {} {directory}", block.basename()),
            Self::Unmount { block, directory } => {
                write!(f, "unmount {} {directory}", block.basename())
            }
            Self::StopUsers { pids } => write!(f, "stop-users {pids:?}"),
            Self::AddEntry(entry) => write!(f, "fstab-add {}", entry.directory),
            Self::UpdateEntry { new, .. } => write!(f, "fstab-update {}", new.directory),
            Self::RemoveEntry(entry) => write!(f, "fstab-remove {}", entry.directory),
            Self::Passphrase { block } => write!(f, "passphrase {}", block.basename()),
            Self::PollSubvolumes { block } => write!(f, "poll-subvolumes {}", block.basename()),
        }
    }
}

type Matcher = Box<dyn Fn(&Call) -> bool + Send>;

struct ScriptedFailure {
    matcher: Matcher,
    error: StorageError,
    /// `None` fails every matching call.
    remaining: Option<u32>,
}

#[derive(Default)]
struct LedgerState {
    calls: Vec<Call>,
    failures: Vec<ScriptedFailure>,
}

/// Shared record of calls plus scripted failures, cloned into every fake.
#[derive(Clone, Default)]
pub struct CallLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl CallLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        // A test that panicked while holding the lock already failed.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `call`, then fail it if a scripted failure matches.
    pub fn record(&self, call: Call) -> Result<(), StorageError> {
        let mut state = self.state();
        let failure = state.failures.iter_mut().find(|failure| {
            (failure.matcher)(&call) && failure.remaining.is_none_or(|left| left > 0)
        });
        let outcome = match failure {
            Some(failure) => {
                if let Some(left) = failure.remaining.as_mut() {
                    *left -= 1;
                }
                Err(failure.error.clone())
            }
            None => Ok(()),
        };
        state.calls.push(call);
        outcome
    }

    /// Fail the next call accepted by `matcher`.
    pub fn fail_once(
        &self,
        matcher: impl Fn(&Call) -> bool + Send + 'static,
        error: StorageError,
    ) {
        self.state().failures.push(ScriptedFailure {
            matcher: Box::new(matcher),
            error,
            remaining: Some(1),
        });
    }

    /// Fail every call accepted by `matcher`.
    pub fn fail_always(
        &self,
        matcher: impl Fn(&Call) -> bool + Send + 'static,
        error: StorageError,
    ) {
        self.state().failures.push(ScriptedFailure {
            matcher: Box::new(matcher),
            error,
            remaining: None,
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.state().calls)
    }

    /// Calls in their compact display form.
    pub fn summaries(&self) -> Vec<String> {
        self.state().calls.iter().map(Call::to_string).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state().calls.is_empty()
    }
}

/// Matcher for a bus method by name, e.g. `method("Resize")`.
pub fn method(name: &'static str) -> impl Fn(&Call) -> bool + Send + 'static {
    move |call| matches!(call, Call::Method { method, .. } if method == name)
}

#[cfg(test)]
mod tests {
    use storage_contracts::StorageErrorKind;

    use super::*;

    fn lock(path: &str) -> Call {
        Call::Method {
            path: ObjectPath::new(path),
            interface: InterfaceKind::Encrypted,
            method: "Lock".to_string(),
            args: Value::Null,
        }
    }

    #[test]
    fn one_shot_failure_fires_once_and_still_records() {
        let ledger = CallLedger::new();
        ledger.fail_once(
            method("Lock"),
            StorageError::new(StorageErrorKind::Busy, "in use"),
        );

        assert!(ledger.record(lock("/b/sda2")).is_err());
        assert!(ledger.record(lock("/b/sda2")).is_ok());
        assert_eq!(ledger.summaries(), vec!["Encrypted.Lock sda2"; 2]);
    }

    #[test]
    fn take_calls_drains() {
        let ledger = CallLedger::new();
        ledger
            .record(Call::Repair {
                block: ObjectPath::new("/b/sda1"),
            })
            .expect("record");
        assert_eq!(ledger.take_calls().len(), 1);
        assert!(ledger.is_empty());
    }
}
