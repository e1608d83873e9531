//! Bridge subprocess management.
//!
//! A bridge adapts an external messaging channel (Telegram, Feishu, ...)
//! to the gateway's WebSocket protocol. Each bridge ships a manifest
//! describing how to run it; the manager starts the processes with the
//! gateway's URL and token in the environment so they can connect back.

mod manager;
mod manifest;

pub use manager::{BridgeManager, InstanceStatus};
pub use manifest::{EnvSchemaEntry, Manifest, ManifestError, MANIFEST_NAME};
