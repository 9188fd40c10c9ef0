//! Engine error kinds.
//!
//! One enum per failure family so the command surface can map kinds to exit
//! behavior (`Noop` is not an error to the operator, `Busy` gets a dedicated
//! message). Everything is carried through `anyhow` and downcast at the edge.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The lock file exists; another operation is in progress.
    #[error("another hammer operation is in progress")]
    Busy,

    /// The host does not satisfy an environmental precondition.
    #[error("{0}")]
    Env(String),

    /// A btrfs CLI invocation failed.
    #[error("btrfs {stage} failed: {detail}")]
    Btrfs { stage: &'static str, detail: String },

    /// A mount/umount invocation failed.
    #[error("mount {stage} failed: {detail}")]
    Mount { stage: &'static str, detail: String },

    /// A command run inside the chroot exited non-zero.
    #[error("chroot step '{stage}' failed: {detail}")]
    Chroot { stage: String, detail: String },

    /// The new deployment failed a pre-seal sanity check.
    #[error("sanity check failed: {0}")]
    Sanity(String),

    /// meta.json is missing or malformed where it is required.
    #[error("metadata error: {0}")]
    Meta(String),

    /// A named deployment, rollback index, or package does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The requested package change is already in effect.
    #[error("{0}")]
    Noop(String),
}
