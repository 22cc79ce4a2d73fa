//! Manifest, layer, mount, and catalog scenarios.

mod common;

use bytes::Bytes;
use common::fixtures::{body, collect, seeded_bytes};
use common::{registry, repo};
use stevedore_core::config::PushCompatibility;
use stevedore_core::digest::Digest;
use stevedore_core::repository::Reference;
use stevedore_engine::{EngineError, Registry, SYMLINK_META_KEY};
use stevedore_storage::PutOptions;

const MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const INDEX_TYPE: &str = "application/vnd.oci.image.index.v1+json";

async fn push_blob(registry: &Registry, name: &str, seed: u64, len: usize) -> Digest {
    let data = seeded_bytes(seed, len);
    let digest = Digest::compute(&data);
    registry
        .monolithic_upload(&repo(name), &digest, body(&data), Some(len as u64))
        .await
        .expect("blob push should work");
    digest
}

fn v2_manifest(config: &Digest, layers: &[Digest]) -> Bytes {
    let layers: Vec<String> = layers
        .iter()
        .map(|d| format!(r#"{{"digest":"{d}"}}"#))
        .collect();
    Bytes::from(format!(
        r#"{{"schemaVersion":2,"config":{{"digest":"{config}"}},"layers":[{}]}}"#,
        layers.join(",")
    ))
}

fn index_manifest(children: &[Digest]) -> Bytes {
    let children: Vec<String> = children
        .iter()
        .map(|d| format!(r#"{{"digest":"{d}"}}"#))
        .collect();
    Bytes::from(format!(
        r#"{{"schemaVersion":2,"manifests":[{}]}}"#,
        children.join(",")
    ))
}

#[tokio::test]
async fn test_put_get_head_manifest_by_tag() {
    let harness = registry(PushCompatibility::Off);
    let name = repo("lib/app");

    let config = push_blob(&harness.registry, "lib/app", 1, 256).await;
    let layer = push_blob(&harness.registry, "lib/app", 2, 2048).await;
    let manifest = v2_manifest(&config, &[layer]);
    let digest = Digest::compute(&manifest);

    let placed = harness
        .registry
        .put_manifest(
            &name,
            &Reference::Tag("latest".to_string()),
            manifest.clone(),
            MANIFEST_TYPE,
            true,
        )
        .await
        .unwrap();
    assert_eq!(placed.digest, digest);

    // Fetchable both by tag and by digest.
    for reference in [
        Reference::Tag("latest".to_string()),
        Reference::Digest(digest),
    ] {
        let fetched = harness
            .registry
            .get_manifest(&name, &reference)
            .await
            .unwrap();
        assert_eq!(fetched.digest, digest);
        assert_eq!(fetched.size, manifest.len() as u64);
        assert_eq!(fetched.content_type.as_deref(), Some(MANIFEST_TYPE));
        assert_eq!(collect(fetched.content).await, manifest);
    }

    let head = harness
        .registry
        .manifest_exists(&name, &Reference::Tag("latest".to_string()))
        .await
        .unwrap()
        .expect("manifest should exist");
    assert_eq!(head.digest, digest);
    assert_eq!(head.size, manifest.len() as u64);

    assert!(
        harness
            .registry
            .manifest_exists(&name, &Reference::Tag("missing".to_string()))
            .await
            .unwrap()
            .is_none()
    );
    assert!(matches!(
        harness
            .registry
            .get_manifest(&name, &Reference::Tag("missing".to_string()))
            .await,
        Err(EngineError::ManifestUnknown(_))
    ));
}

#[tokio::test]
async fn test_put_manifest_rejects_missing_layer() {
    let harness = registry(PushCompatibility::Off);
    let name = repo("lib/app");

    let config = push_blob(&harness.registry, "lib/app", 3, 128).await;
    let missing = Digest::compute(b"never pushed");
    let manifest = v2_manifest(&config, &[missing]);

    let result = harness
        .registry
        .put_manifest(
            &name,
            &Reference::Tag("latest".to_string()),
            manifest,
            MANIFEST_TYPE,
            true,
        )
        .await;
    assert!(matches!(result, Err(EngineError::BlobUnknown(_))));
}

#[tokio::test]
async fn test_put_manifest_rejects_garbage() {
    let harness = registry(PushCompatibility::Off);
    let name = repo("lib/app");

    let result = harness
        .registry
        .put_manifest(
            &name,
            &Reference::Tag("latest".to_string()),
            Bytes::from_static(b"{\"not\": \"a manifest\"}"),
            MANIFEST_TYPE,
            false,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Manifest(_))));
}

#[tokio::test]
async fn test_put_manifest_by_digest_must_match_body() {
    let harness = registry(PushCompatibility::Off);
    let name = repo("lib/app");

    let config = push_blob(&harness.registry, "lib/app", 4, 128).await;
    let manifest = v2_manifest(&config, &[]);
    let wrong = Digest::compute(b"different");

    let result = harness
        .registry
        .put_manifest(
            &name,
            &Reference::Digest(wrong),
            manifest.clone(),
            MANIFEST_TYPE,
            false,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Client(_))));

    // Under the true digest only one copy is written.
    let digest = Digest::compute(&manifest);
    harness
        .registry
        .put_manifest(
            &name,
            &Reference::Digest(digest),
            manifest,
            MANIFEST_TYPE,
            false,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_index_verifies_children_by_digest() {
    let harness = registry(PushCompatibility::Off);
    let name = repo("lib/app");

    let config = push_blob(&harness.registry, "lib/app", 5, 128).await;
    let child = v2_manifest(&config, &[]);
    let child_digest = Digest::compute(&child);
    harness
        .registry
        .put_manifest(
            &name,
            &Reference::Digest(child_digest),
            child,
            MANIFEST_TYPE,
            true,
        )
        .await
        .unwrap();

    harness
        .registry
        .put_manifest(
            &name,
            &Reference::Tag("multi".to_string()),
            index_manifest(&[child_digest]),
            INDEX_TYPE,
            true,
        )
        .await
        .unwrap();

    let unknown_child = Digest::compute(b"unknown child");
    let result = harness
        .registry
        .put_manifest(
            &name,
            &Reference::Tag("broken".to_string()),
            index_manifest(&[unknown_child]),
            INDEX_TYPE,
            true,
        )
        .await;
    assert!(matches!(result, Err(EngineError::ManifestUnknown(_))));
}

#[tokio::test]
async fn test_cross_repo_mount() {
    let harness = registry(PushCompatibility::Off);
    let source = repo("lib/a");
    let dest = repo("lib/b");

    let data = seeded_bytes(6, 4096);
    let digest = Digest::compute(&data);
    harness
        .registry
        .monolithic_upload(&source, &digest, body(&data), Some(data.len() as u64))
        .await
        .unwrap();

    let mounted = harness
        .registry
        .mount_layer(&source, &digest, &dest)
        .await
        .unwrap();
    assert_eq!(mounted.digest, digest);

    // The destination resolves through the symlink to the same bytes.
    let head = harness
        .registry
        .layer_exists(&dest, &digest)
        .await
        .unwrap()
        .expect("mounted layer should exist");
    assert_eq!(head.size, data.len() as u64);

    let layer = harness.registry.get_layer(&dest, &digest).await.unwrap();
    assert_eq!(collect(layer.content).await, data);

    // On disk the destination is a pointer, not a copy.
    let meta = harness.store.head(&dest.blob_key(&digest)).await.unwrap();
    assert_eq!(
        meta.custom.get(SYMLINK_META_KEY).map(String::as_str),
        Some("lib/a")
    );
    let link_body = harness
        .store
        .get_bytes(&dest.blob_key(&digest))
        .await
        .unwrap();
    assert_eq!(link_body, Bytes::from(source.blob_key(&digest)));
}

#[tokio::test]
async fn test_mount_flattens_symlink_chains() {
    let harness = registry(PushCompatibility::Off);
    let origin = repo("lib/a");
    let first = repo("lib/b");
    let second = repo("lib/c");

    let digest = push_blob(&harness.registry, "lib/a", 7, 1024).await;
    harness
        .registry
        .mount_layer(&origin, &digest, &first)
        .await
        .unwrap();
    harness
        .registry
        .mount_layer(&first, &digest, &second)
        .await
        .unwrap();

    // Mounting from a symlink re-resolves the origin: links never chain.
    let meta = harness.store.head(&second.blob_key(&digest)).await.unwrap();
    assert_eq!(
        meta.custom.get(SYMLINK_META_KEY).map(String::as_str),
        Some("lib/a")
    );

    let layer = harness.registry.get_layer(&second, &digest).await.unwrap();
    assert_eq!(layer.size, 1024);
}

#[tokio::test]
async fn test_mount_onto_same_repository_is_rejected() {
    let harness = registry(PushCompatibility::Off);
    let name = repo("lib/a");
    let digest = push_blob(&harness.registry, "lib/a", 8, 512).await;

    let result = harness.registry.mount_layer(&name, &digest, &name).await;
    assert!(matches!(result, Err(EngineError::Client(_))));
}

#[tokio::test]
async fn test_mount_missing_source_is_not_found() {
    let harness = registry(PushCompatibility::Off);
    let digest = Digest::compute(b"absent");

    let result = harness
        .registry
        .mount_layer(&repo("lib/a"), &digest, &repo("lib/b"))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn test_symlink_self_loop_returns_blob_unknown() {
    let harness = registry(PushCompatibility::Off);
    let name = repo("lib/x");
    let digest = Digest::compute(b"looped");

    // A symlink pointing at its own repository can only come from
    // corruption; reads must not recurse into it.
    let key = name.blob_key(&digest);
    harness
        .store
        .put(
            &key,
            Bytes::from(key.clone()),
            PutOptions::default().with_custom(SYMLINK_META_KEY, name.as_str()),
        )
        .await
        .unwrap();

    assert!(matches!(
        harness.registry.get_layer(&name, &digest).await,
        Err(EngineError::BlobUnknown(_))
    ));
    assert!(
        harness
            .registry
            .layer_exists(&name, &digest)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_list_repositories_pages_through_catalog() {
    let harness = registry(PushCompatibility::Off);

    for (name, seed) in [("alpha", 10u64), ("beta/svc", 11), ("zeta", 12)] {
        let config = push_blob(&harness.registry, name, seed, 128).await;
        let manifest = v2_manifest(&config, &[]);
        harness
            .registry
            .put_manifest(
                &repo(name),
                &Reference::Tag("latest".to_string()),
                manifest,
                MANIFEST_TYPE,
                true,
            )
            .await
            .unwrap();
    }

    let page = harness.registry.list_repositories(None, 10).await.unwrap();
    assert_eq!(page.repositories, vec!["alpha", "beta/svc", "zeta"]);
    assert!(page.cursor.is_none());

    // Paging one repository at a time walks the same set.
    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = harness
            .registry
            .list_repositories(cursor.as_deref(), 1)
            .await
            .unwrap();
        seen.extend(page.repositories);
        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(seen, vec!["alpha", "beta/svc", "zeta"]);
}
