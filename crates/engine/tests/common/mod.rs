//! Shared test harness: a registry over the in-memory backend.

pub mod fixtures;

use std::sync::Arc;
use stevedore_core::config::{EngineConfig, PushCompatibility};
use stevedore_core::repository::RepositoryName;
use stevedore_engine::Registry;
use stevedore_storage::{MemoryBackend, ObjectStore};

/// A registry plus direct access to its backing store.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestRegistry {
    pub registry: Registry,
    pub store: Arc<dyn ObjectStore>,
}

/// Chunk bounds scaled down so multi-part scenarios stay cheap. The ratios
/// mirror the real constants: min is a quarter of max.
#[allow(dead_code)]
pub fn scaled_config(mode: PushCompatibility) -> EngineConfig {
    EngineConfig {
        push_compatibility: mode,
        min_chunk: 4096,
        max_chunk: 16384,
        max_upload_chunk: 16384,
        ..EngineConfig::default()
    }
}

#[allow(dead_code)]
pub fn registry_with(config: EngineConfig) -> TestRegistry {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());
    let registry = Registry::new(store.clone(), config).expect("config should be valid");
    TestRegistry { registry, store }
}

#[allow(dead_code)]
pub fn registry(mode: PushCompatibility) -> TestRegistry {
    registry_with(scaled_config(mode))
}

#[allow(dead_code)]
pub fn repo(name: &str) -> RepositoryName {
    RepositoryName::parse(name).expect("test repository name should be valid")
}
