//! Shipflow Git
//!
//! リモートリポジトリの HEAD 取得・差分計算・クローンと、
//! ポーリングによるコミット検知を提供する。

pub mod cli;
pub mod error;
pub mod transport;
pub mod watcher;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cli::GitCli;
pub use error::{GitError, Result};
pub use transport::{CommitDetails, Credentials, GitRef, GitTransport};
pub use watcher::{CommitEvent, CommitListener, RepoWatcher, Repository};
