//! 可取消调用
//!
//! 将一次异步操作与取消令牌竞速：令牌已取消则根本不启动操作；
//! 竞速中取消总是确定性获胜（即便操作同时就绪）；操作先完成则结果照常返回。
//! 令牌应当在调用点按任务 id 重新获取（见 registry），不要缓存旧令牌。

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::core::error::CoordError;

/// 在取消令牌保护下执行一次异步操作
///
/// - 令牌已取消：立即返回 `Err(Cancelled)`，操作不会被轮询
/// - 执行中令牌取消：返回 `Err(Cancelled)`，操作被丢弃
/// - 操作先完成：返回操作结果
pub async fn run_cancellable<T, F>(token: &CancellationToken, operation: F) -> Result<T, CoordError>
where
    F: Future<Output = Result<T, CoordError>>,
{
    if token.is_cancelled() {
        return Err(CoordError::Cancelled);
    }

    // biased：每次轮询先看取消分支，两边同时就绪时取消获胜
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CoordError::Cancelled),
        result = operation => result,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_plain_call_passes_through() {
        let token = CancellationToken::new();
        let result = run_cancellable(&token, async { Ok::<_, CoordError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_pre_cancelled_never_starts() {
        let token = CancellationToken::new();
        token.cancel();

        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let result = run_cancellable(&token, async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, CoordError>("unreachable".to_string())
        })
        .await;

        assert!(matches!(result, Err(CoordError::Cancelled)));
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_mid_flight_cancel_wins() {
        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t.cancel();
        });

        let result = run_cancellable(&token, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, CoordError>("would succeed".to_string())
        })
        .await;

        assert!(matches!(result, Err(CoordError::Cancelled)));
    }

    #[tokio::test]
    async fn test_completed_result_stands() {
        let token = CancellationToken::new();
        let result = run_cancellable(&token, async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, CoordError>("done".to_string())
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        // 事后取消不影响已返回的结果
        token.cancel();
    }

    #[tokio::test]
    async fn test_cancel_beats_slow_failure() {
        let token = CancellationToken::new();
        token.cancel();

        let result = run_cancellable(&token, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err::<String, _>(CoordError::ExecutionFailed("slow failure".to_string()))
        })
        .await;

        // 错误类型是 Cancelled，而不是底层的慢失败
        assert!(matches!(result, Err(CoordError::Cancelled)));
    }

    #[tokio::test]
    async fn test_simultaneous_ready_cancel_wins() {
        let token = CancellationToken::new();
        token.cancel();
        // 操作立即就绪，取消也已就绪：biased 保证取消获胜
        let result = run_cancellable(&token, async { Ok::<_, CoordError>(1) }).await;
        assert!(matches!(result, Err(CoordError::Cancelled)));
    }
}
