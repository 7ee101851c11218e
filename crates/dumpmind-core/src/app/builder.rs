//! OrchestratorBuilder - TaskOrchestrator の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - task store, kernel builder, mounter は必須
//! - build() 時に不足と不正な設定をまとめて検出する
//!
//! ```ignore
//! let orchestrator = OrchestratorBuilder::from_settings(&settings)
//!     .store(Arc::new(InMemoryTaskStore::new()))
//!     .mounter(Arc::new(LoopMounter::new()))
//!     .build()?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::app::orchestrator::TaskOrchestrator;
use crate::build::MakeKernelBuilder;
use crate::config::Settings;
use crate::extract::ArtifactExtractor;
use crate::impls::{CommandReproducer, HttpFetcher};
use crate::mount::MountManager;
use crate::ports::{
    Clock, IdGenerator, KernelBuilder, Mounter, Reproducer, SourceFetcher, SystemClock, TaskStore,
    UlidGenerator,
};
use crate::toolchain::{PackageSet, ToolchainResolver};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing components: {0:?}")]
    MissingComponents(Vec<&'static str>),

    #[error("build timeout must be positive")]
    ZeroBuildTimeout,

    #[error("workspace root must not be empty")]
    EmptyWorkspaceRoot,
}

pub struct OrchestratorBuilder {
    store: Option<Arc<dyn TaskStore>>,
    builder: Option<Arc<dyn KernelBuilder>>,
    mounter: Option<Arc<dyn Mounter>>,
    reproducer: Option<Arc<dyn Reproducer>>,
    fetcher: Option<Arc<dyn SourceFetcher>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    resolver: Option<ToolchainResolver>,
    extractor: ArtifactExtractor,
    workspace_root: PathBuf,
    template_image: Option<PathBuf>,
    build_timeout: Duration,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            builder: None,
            mounter: None,
            reproducer: None,
            fetcher: None,
            clock: Arc::new(SystemClock),
            ids: None,
            resolver: None,
            extractor: ArtifactExtractor::default(),
            workspace_root: PathBuf::from("workspace"),
            template_image: None,
            build_timeout: Settings::default().build_timeout(),
        }
    }

    /// Everything that comes from configuration. Store and mounter still
    /// have to be supplied.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut b = Self::new()
            .workspace_root(settings.workspace_root.clone())
            .template_image(Some(settings.template_image.clone()))
            .build_timeout(settings.build_timeout())
            .resolver(ToolchainResolver::detect(settings.toolchains.clone()))
            .extractor(ArtifactExtractor::new(settings.trigger_home.clone()))
            .kernel_builder(Arc::new(
                MakeKernelBuilder::new()
                    .with_shell_nix(settings.shell_nix.clone())
                    .with_kconfig(settings.kconfig.clone()),
            ));
        if let Some(r) = &settings.reproducer {
            b = b.reproducer(Arc::new(CommandReproducer::new(
                r.program.clone(),
                r.args.clone(),
                r.timeout(),
            )));
        }
        match HttpFetcher::new(&settings.sources) {
            Ok(fetcher) => b = b.fetcher(Arc::new(fetcher)),
            Err(e) => warn!(error = %e, "downloads disabled"),
        }
        b
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn kernel_builder(mut self, builder: Arc<dyn KernelBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = Some(mounter);
        self
    }

    pub fn reproducer(mut self, reproducer: Arc<dyn Reproducer>) -> Self {
        self.reproducer = Some(reproducer);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn resolver(mut self, resolver: ToolchainResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn extractor(mut self, extractor: ArtifactExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Template copied to each task's `debian.img`. `None`: the image is
    /// expected to be in place already.
    pub fn template_image(mut self, template: Option<PathBuf>) -> Self {
        self.template_image = template;
        self
    }

    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TaskOrchestrator, BuildError> {
        let mut missing = Vec::new();
        if self.store.is_none() {
            missing.push("task store");
        }
        if self.builder.is_none() {
            missing.push("kernel builder");
        }
        if self.mounter.is_none() {
            missing.push("mounter");
        }
        let (Some(store), Some(builder), Some(mounter)) = (self.store, self.builder, self.mounter)
        else {
            return Err(BuildError::MissingComponents(missing));
        };
        if self.build_timeout.is_zero() {
            return Err(BuildError::ZeroBuildTimeout);
        }
        if self.workspace_root.as_os_str().is_empty() {
            return Err(BuildError::EmptyWorkspaceRoot);
        }

        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&self.clock))));
        Ok(TaskOrchestrator {
            store,
            clock: self.clock,
            ids,
            resolver: self
                .resolver
                .unwrap_or_else(|| ToolchainResolver::detect(PackageSet::default())),
            builder,
            mounts: MountManager::new(mounter),
            extractor: self.extractor,
            reproducer: self.reproducer,
            fetcher: self.fetcher,
            workspace_root: self.workspace_root,
            template_image: self.template_image,
            build_timeout: self.build_timeout,
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryMountTable, InMemoryTaskStore};

    #[test]
    fn missing_components_are_listed() {
        let err = OrchestratorBuilder::new()
            .store(Arc::new(InMemoryTaskStore::new()))
            .build()
            .err()
            .unwrap();
        match err {
            BuildError::MissingComponents(missing) => {
                assert_eq!(missing, vec!["kernel builder", "mounter"]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = OrchestratorBuilder::new()
            .store(Arc::new(InMemoryTaskStore::new()))
            .kernel_builder(Arc::new(MakeKernelBuilder::new()))
            .mounter(Arc::new(InMemoryMountTable::new()))
            .build_timeout(Duration::ZERO)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::ZeroBuildTimeout));
    }

    #[test]
    fn from_settings_wires_everything_but_store_and_mounter() {
        let settings = Settings {
            workspace_root: PathBuf::from("/srv/ws"),
            ..Settings::default()
        };
        let orchestrator = OrchestratorBuilder::from_settings(&settings)
            .store(Arc::new(InMemoryTaskStore::new()))
            .mounter(Arc::new(InMemoryMountTable::new()))
            .build()
            .unwrap();

        assert_eq!(orchestrator.workspace_root, PathBuf::from("/srv/ws"));
        assert_eq!(orchestrator.build_timeout, settings.build_timeout());
        assert!(orchestrator.reproducer.is_none());
        assert!(orchestrator.fetcher.is_some());
    }

    #[test]
    fn unusable_proxy_leaves_downloads_off() {
        let mut settings = Settings::default();
        settings.sources.proxy = Some("not a url".into());
        let orchestrator = OrchestratorBuilder::from_settings(&settings)
            .store(Arc::new(InMemoryTaskStore::new()))
            .mounter(Arc::new(InMemoryMountTable::new()))
            .build()
            .unwrap();

        assert!(orchestrator.fetcher.is_none());
    }
}
