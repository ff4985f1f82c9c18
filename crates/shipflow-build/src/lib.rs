//! Shipflow Image Build
//!
//! ソース（ローカルパス・Git・アーカイブ URL）からのイメージビルドと、
//! コンテナレジストリへのプッシュを提供する。
//! ビルドはローカルのコンテナエンジンか、クラスタ内のビルドジョブで実行する。

pub mod auth;
pub mod builder;
pub mod context;
pub mod engine;
pub mod error;
pub mod job;
pub mod pusher;
pub mod registry;
pub mod source;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use auth::DockerConfigAuth;
pub use builder::{BuildConfig, BuildResult, BuildStrategy, ImageBuilder};
pub use context::ContextBuilder;
pub use engine::{ContainerEngine, DockerEngine, EngineBuildRequest, ImageDetails, ImageSummary};
pub use error::{BuildError, Result};
pub use job::{JobClient, JobOutcome, JobRef, JobState, KubeJobClient};
pub use pusher::{PushConfig, PushResult, RegistryPusher, validate_tag};
pub use registry::{RegistryProfile, RegistryStore};
pub use source::{PreparedSource, SourceFetcher, SourceType};
