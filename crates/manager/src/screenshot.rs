//! Screenshot and highlight helpers
//!
//! Files land under `<storage>/screenshots` with timestamped names. Element
//! capture degrades to a viewport shot when the selector matches nothing or
//! the engine refuses the clipped capture, so callers always get an image
//! for a live page.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use driver::PageHandle;

use crate::error::Result;
use crate::manager::PageManager;
use crate::store::epoch_secs;

const SHOT_SUBDIR: &str = "screenshots";

pub struct ScreenshotHelper {
    dir: PathBuf,
}

impl ScreenshotHelper {
    pub fn new(storage_dir: &Path) -> Self {
        let dir = storage_dir.join(SHOT_SUBDIR);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!("failed to create screenshot dir {}: {e}", dir.display());
        }
        Self { dir }
    }

    /// Capture a page by id. With a selector, tries a clipped element shot
    /// first; otherwise (or on fallback) captures the viewport, or the full
    /// scroll height when `full_page` is set.
    pub async fn capture(
        &self,
        manager: &Arc<PageManager>,
        page_id: &str,
        selector: Option<&str>,
        full_page: bool,
    ) -> Result<PathBuf> {
        let (id, page) = manager.existing_page(page_id).await?;
        let stamp = epoch_secs();

        if let Some(selector) = selector {
            let path = self.dir.join(format!("element_{id}_{stamp}.png"));
            match page.screenshot_element(selector, &path).await {
                Ok(true) => return Ok(path),
                Ok(false) => {
                    tracing::warn!("selector {selector} matched nothing on page {id}");
                }
                Err(e) => {
                    tracing::warn!("element capture failed on page {id}: {e}");
                }
            }
        }

        let path = self.dir.join(format!("page_{id}_{stamp}.png"));
        match page.screenshot(&path, full_page).await {
            Ok(()) => Ok(path),
            Err(e) if full_page => {
                tracing::warn!("full-page capture failed on page {id}: {e}, retrying viewport");
                page.screenshot(&path, false).await?;
                Ok(path)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Flash an outline and a floating label on every element matching the
    /// selector. The injected script reverts itself after `duration_ms`; a
    /// navigation before that simply discards the styling with the document.
    pub async fn highlight(
        &self,
        page: &Arc<dyn PageHandle>,
        selector: &str,
        duration_ms: u64,
    ) -> Result<u64> {
        let script = highlight_script(selector, duration_ms);
        let value = page.evaluate(&script).await?;
        Ok(value.as_u64().unwrap_or(0))
    }
}

/// Returns the number of elements highlighted.
fn highlight_script(selector: &str, duration_ms: u64) -> String {
    let selector_json = serde_json::Value::String(selector.to_string()).to_string();
    format!(
        r#"(() => {{
            const nodes = document.querySelectorAll({selector_json});
            nodes.forEach((node, i) => {{
                const saved = node.style.cssText;
                node.style.outline = '3px solid #ff4081';
                node.style.outlineOffset = '2px';
                const label = document.createElement('div');
                label.textContent = {selector_json} + ' [' + (i + 1) + ']';
                label.style.cssText =
                    'position:absolute;background:#ff4081;color:#fff;' +
                    'font:12px monospace;padding:2px 6px;z-index:2147483647;';
                const rect = node.getBoundingClientRect();
                label.style.left = (rect.left + window.scrollX) + 'px';
                label.style.top = (rect.top + window.scrollY - 20) + 'px';
                document.body.appendChild(label);
                setTimeout(() => {{
                    node.style.cssText = saved;
                    label.remove();
                }}, {duration_ms});
            }});
            return nodes.length;
        }})()"#
    )
}
