use progtree::{TaskBuilder, TaskError, TokioExecutor};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_async_on_tokio_executor() {
    let root = TaskBuilder::new(TokioExecutor::current())
        .name("async-wait")
        .build(|task| {
            for _ in 0..4 {
                task.spawn_parallel(|sub| {
                    sub.set_total(5)?;
                    for _ in 0..5 {
                        sub.sleep(Duration::from_millis(2))?;
                        sub.increment()?;
                    }
                    Ok(())
                })?;
            }
            Ok(())
        });

    root.start().unwrap();
    let completed = tokio::time::timeout(Duration::from_secs(10), root.wait_async())
        .await
        .expect("Task tree should finish");
    assert!(completed);
    assert_eq!(root.percentage(), 100.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_async_after_completion_returns_immediately() {
    let root = TaskBuilder::new(TokioExecutor::current()).build(|_task| Ok(()));
    root.start().unwrap();
    assert!(root.wait_async().await);
    assert!(root.wait_async().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_from_async_context() {
    let root = TaskBuilder::new(TokioExecutor::current()).build(|task| {
        task.sleep(Duration::from_secs(60))?;
        Ok(())
    });
    root.start().unwrap();

    let canceller = root.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let completed = tokio::time::timeout(Duration::from_secs(10), root.wait_async())
        .await
        .expect("Cancellation should stop the tree");
    assert!(!completed);
    assert!(matches!(root.failure_cause(), Some(TaskError::Cancelled)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_result_async() {
    let task = TaskBuilder::new(TokioExecutor::current()).build_with_result(|handle| {
        handle.set_status("Computing");
        Ok(vec![1, 2, 3])
    });
    task.start().unwrap();
    assert_eq!(task.result_async().await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_many_async_observers_all_wake() {
    let root = TaskBuilder::new(TokioExecutor::current()).build(|task| {
        task.sleep(Duration::from_millis(30))?;
        Ok(())
    });
    root.start().unwrap();

    let observers: Vec<_> = (0..8)
        .map(|_| {
            let root = root.clone();
            tokio::spawn(async move { root.wait_async().await })
        })
        .collect();

    for observer in observers {
        let completed = tokio::time::timeout(Duration::from_secs(10), observer)
            .await
            .expect("Observer should wake")
            .unwrap();
        assert!(completed);
    }
}
