//! 后台清理任务：周期性移除闲置的配额 subject，避免按调用方累积的状态无限增长。

use crate::quota::QuotaTracker;
use std::sync::Arc;
use std::time::Duration;

/// 启动后台清理任务。
///
/// - 间隔：由调用方指定（默认配置为 10 分钟）
/// - 只清理最长窗口已滚动、且当前无人持有的 subject
pub fn spawn_prune_task(tracker: Arc<QuotaTracker>, interval: Duration) {
    let interval = interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let removed = tracker.prune_idle().await;
            if removed > 0 {
                let remaining = tracker.subject_count().await;
                tracing::info!("配额清理完成：移除 {removed} 个闲置 subject，剩余 {remaining}");
            }
        }
    });
}
