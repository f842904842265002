//! End-to-end tour: launch a browser, visit a page, persist it, restore it.
//!
//! Needs a local Chromium or Chrome binary. Run with:
//! `cargo run -p manager --example session_tour`

use std::sync::Arc;
use std::time::Duration;

use driver::{CdpDriver, Driver};
use manager::{OpKind, OpRegistry, OpRequest, PageManager, Settings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let storage = std::env::temp_dir().join("webtools-session-tour");
    let settings = Settings::load(None);
    let driver: Arc<dyn Driver> = Arc::new(CdpDriver::new());

    let manager = PageManager::open(settings, driver, &storage).await?;
    let registry = OpRegistry::new(Arc::clone(&manager));

    let session = registry
        .dispatch(
            OpKind::CreateSession,
            OpRequest {
                name: Some("tour".into()),
                ..OpRequest::default()
            },
        )
        .await;
    println!("create_session: {}", session.message);
    let session_id = session
        .data
        .and_then(|d| d["session_id"].as_str().map(str::to_string));

    let page = registry
        .dispatch(
            OpKind::GetPage,
            OpRequest {
                url: Some("https://example.com".into()),
                session_id: session_id.clone(),
                ..OpRequest::default()
            },
        )
        .await;
    println!("get_page: {}", page.message);
    let page_id = page
        .data
        .and_then(|d| d["page_id"].as_str().map(str::to_string))
        .ok_or("no page id")?;

    let shot = registry
        .dispatch(
            OpKind::Screenshot,
            OpRequest {
                page_id: Some(page_id.clone()),
                ..OpRequest::default()
            },
        )
        .await;
    println!("screenshot: {} {:?}", shot.message, shot.data);

    // Let the tab record some console telemetry before closing it.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let logs = registry
        .dispatch(
            OpKind::ConsoleLogs,
            OpRequest {
                page_id: Some(page_id.clone()),
                ..OpRequest::default()
            },
        )
        .await;
    println!("console_logs: {} {:?}", logs.message, logs.data);

    manager.close().await;

    // A fresh manager over the same storage restores the page by id.
    let settings = Settings::load(None);
    let driver: Arc<dyn Driver> = Arc::new(CdpDriver::new());
    let reopened = PageManager::open(settings, driver, &storage).await?;
    let (restored, handle) = reopened.get_page(Some(&page_id), None, None).await?;
    println!("restored page {restored} at {}", handle.url().await);
    reopened.close().await;

    Ok(())
}
