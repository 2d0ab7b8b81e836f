// SPDX-License-Identifier: GPL-3.0-only

pub mod filesystem;
pub mod mount;
pub mod objects;
pub mod passphrase;

pub use filesystem::{FilesystemHelper, FormatRequest};
pub use mount::{MountHelper, MountTable};
pub use objects::{ChangeStream, ObjectSource};
pub use passphrase::PassphraseSource;
