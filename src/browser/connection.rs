use chromiumoxide::Browser;
use futures::StreamExt;
use tracing::{debug, error};

use crate::error::LaunchError;

/// 连接到浏览器调试地址并确认其可用，返回浏览器版本
///
/// 只做探测，不创建页面；连接在返回前断开。
pub async fn probe_endpoint(endpoint: &str) -> Result<String, LaunchError> {
    debug!("正在探测浏览器调试地址: {}", endpoint);

    let probe_failed = |message: String| LaunchError::ProbeFailed {
        endpoint: endpoint.to_string(),
        message,
    };

    let (browser, mut handler) = Browser::connect(endpoint).await.map_err(|e| {
        error!("连接浏览器失败: {}", e);
        probe_failed(e.to_string())
    })?;

    // 在后台处理浏览器事件
    let handler_task = tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    let version = browser.version().await;
    handler_task.abort();

    let version = version.map_err(|e| probe_failed(e.to_string()))?;
    debug!("✓ 调试地址可用: {} ({})", endpoint, version.product);
    Ok(version.product)
}
