use crate::manager::SandboxState;
use crate::reaper::IdleReaper;
use crate::test_utils::{mock_manager, test_settings, MockProvider};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_reaper_removes_expired_sandboxes() {
    let home = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new());
    let mut settings = test_settings(home.path());
    settings.idle_timeout = Duration::from_millis(50);
    let manager = Arc::new(mock_manager(provider.clone(), settings, 3));

    manager.create("a").await.unwrap();
    manager.create("b").await.unwrap();

    let reaper = IdleReaper::start(manager.clone(), Duration::from_millis(25));
    assert!(reaper.is_running());

    let mut remaining = usize::MAX;
    for _ in 0..100 {
        remaining = manager.list_sandboxes().await.len();
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    reaper.stop().await;

    assert_eq!(remaining, 0);
    assert_eq!(provider.live(), 0);
    assert_eq!(manager.governor().active(), 0);
}

#[tokio::test]
async fn test_reaper_skips_fresh_and_busy_sandboxes() {
    let home = TempDir::new().unwrap();
    let provider = Arc::new(MockProvider::new());
    let mut settings = test_settings(home.path());
    settings.idle_timeout = Duration::from_millis(100);
    let manager = Arc::new(mock_manager(provider, settings, 3));

    manager.create("fresh").await.unwrap();
    let busy = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.execute("busy", "sleep 300", None).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;

    // "fresh" has expired by now, the running cell has not finished
    assert_eq!(manager.reap_idle().await, 1);
    assert!(manager.get("fresh").await.is_none());
    assert_eq!(
        manager.get("busy").await.map(|s| s.state),
        Some(SandboxState::Busy)
    );

    busy.await.unwrap().unwrap();
    assert_eq!(
        manager.get("busy").await.map(|s| s.state),
        Some(SandboxState::Idle)
    );
}
