// SPDX-License-Identifier: GPL-3.0-only

use async_trait::async_trait;

use storage_types::ObjectPath;

/// Asks the user for the passphrase of an encrypted device.
#[async_trait]
pub trait PassphraseSource: Send + Sync {
    /// `None` when the user dismissed the prompt.
    async fn request_passphrase(&self, block: &ObjectPath, reason: &str) -> Option<String>;
}
