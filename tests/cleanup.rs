//! Integration tests for sandbox removal.
//!
//! These tests verify:
//! - Read-only trees are removed (or moved aside) and the path is freed
//! - Symlinks out of a sandbox are never followed
//! - Owner eviction spares other owners and the shared template
//! - Scratch-only sandboxes left by runs are listed and evicted
//! - Quarantined directories are swept on the next startup

use std::fs;
use std::time::Duration;

use sandbox_env_manager::environment::{RemovalOutcome, RemovalPolicy, remove_dir_robust};
use sandbox_env_manager::{EnvironmentConfig, ExecutionConfig, SandboxId, SandboxManager};
use tempfile::TempDir;

fn quick_policy() -> RemovalPolicy {
    RemovalPolicy {
        attempts: 2,
        delay: Duration::from_millis(5),
    }
}

fn test_manager(base: &std::path::Path) -> SandboxManager {
    SandboxManager::new(
        EnvironmentConfig::default()
            .with_base_dir(base)
            .with_python("/definitely/not/python3")
            .with_cleanup_retries(2, Duration::from_millis(5)),
        ExecutionConfig::default(),
    )
}

#[cfg(unix)]
#[tokio::test]
async fn test_read_only_tree_frees_its_path() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().expect("failed to create temp dir");
    let root = temp.path().join("sandbox");
    let locked = root.join("venv").join("lib");
    fs::create_dir_all(&locked).expect("create tree");
    let file = locked.join("module.pyc");
    fs::write(&file, b"bytecode").expect("write file");
    fs::set_permissions(&file, fs::Permissions::from_mode(0o444)).expect("chmod file");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).expect("chmod dir");

    let outcome = remove_dir_robust(&root, quick_policy()).await;

    assert!(outcome.path_freed(), "outcome: {outcome:?}");
    assert!(!root.exists());
    if let RemovalOutcome::Quarantined(dest) = outcome {
        assert!(dest.exists());
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_removal_does_not_follow_symlinks() {
    let temp = TempDir::new().expect("failed to create temp dir");
    let outside = temp.path().join("outside");
    fs::create_dir_all(&outside).expect("create outside");
    fs::write(outside.join("precious.txt"), "keep").expect("write outside file");

    let root = temp.path().join("sandbox");
    fs::create_dir_all(&root).expect("create sandbox");
    std::os::unix::fs::symlink(&outside, root.join("link")).expect("link out");

    assert_eq!(
        remove_dir_robust(&root, quick_policy()).await,
        RemovalOutcome::Removed
    );
    assert!(outside.join("precious.txt").exists());
}

#[tokio::test]
async fn test_eviction_spares_other_owners_and_template() {
    let temp = TempDir::new().expect("failed to create temp dir");
    let manager = test_manager(temp.path());
    let envs = manager.environments();

    let keep = manager.resolve_id("alice", "current");
    let stale = [
        manager.resolve_id("alice", "old-1"),
        manager.resolve_id("alice", "old-2"),
    ];
    let other = manager.resolve_id("bob", "anything");
    let template = SandboxId::shared_template();
    for id in stale.iter().chain([&keep, &other, &template]) {
        envs.paths(id).create_root().expect("create root");
    }

    let evicted = envs.evict_owner("alice", &keep).await;

    assert_eq!(evicted, 2);
    let remaining = manager.list_sandboxes().expect("list");
    assert!(remaining.contains(&keep));
    assert!(remaining.contains(&other));
    assert!(remaining.contains(&template));
    assert!(stale.iter().all(|id| !remaining.contains(id)));
}

#[tokio::test]
async fn test_scratch_only_sandbox_is_listed_and_evicted() {
    let temp = TempDir::new().expect("failed to create temp dir");
    let manager = test_manager(temp.path());
    let scratch = manager.resolve_id("erin", "draft");

    // No interpreter anywhere: the run fails in-band but leaves its workdir.
    let result = manager.run(&scratch, "print('hi')").await;
    assert!(result.stdout.is_empty());
    assert!(!result.stderr.is_empty());

    let paths = manager.environments().paths(&scratch);
    assert!(paths.exists());
    assert!(!paths.is_complete());
    assert!(manager.list_sandboxes().expect("list").contains(&scratch));

    let keep = manager.resolve_id("erin", "current");
    assert_eq!(manager.environments().evict_owner("erin", &keep).await, 1);
    assert!(!paths.exists());
}

#[tokio::test]
async fn test_quarantine_is_swept() {
    let temp = TempDir::new().expect("failed to create temp dir");
    let manager = test_manager(temp.path());
    let id = manager.resolve_id("carol", "topic");
    let quarantined = temp.path().join(format!("{id}_old_1700000000"));
    fs::create_dir_all(quarantined.join("venv/bin")).expect("create quarantine");
    create_sandbox_root(&manager, &id);

    assert_eq!(manager.sweep_quarantine().await, 1);
    assert!(!quarantined.exists());
    assert!(manager.environments().paths(&id).exists(), "live sandboxes are untouched");
}

#[tokio::test]
async fn test_cleanup_twice_is_harmless() {
    let temp = TempDir::new().expect("failed to create temp dir");
    let manager = test_manager(temp.path());
    let id = manager.resolve_id("dave", "topic");
    create_sandbox_root(&manager, &id);

    assert_eq!(manager.cleanup(&id).await, RemovalOutcome::Removed);
    assert_eq!(manager.cleanup(&id).await, RemovalOutcome::Absent);
}

fn create_sandbox_root(manager: &SandboxManager, id: &SandboxId) {
    manager
        .environments()
        .paths(id)
        .create_root()
        .expect("create root");
}
