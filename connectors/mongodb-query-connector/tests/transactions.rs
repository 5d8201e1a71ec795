//! Ambient session propagation through driver calls.

use bson::doc;
use mongodb_query_connector::{context, Driver, OperationOptions, RecordingDriver, SessionHandle};

#[tokio::test]
async fn driver_calls_observe_the_ambient_session_until_commit() {
    context::attach(async {
        let driver = RecordingDriver::new();

        let mut tx = driver.begin_transaction().await.unwrap();
        driver
            .insert("users", doc! { "name": "ada" }, OperationOptions::default())
            .await
            .unwrap();

        tx.commit().await.unwrap();
        driver
            .insert("users", doc! { "name": "grace" }, OperationOptions::default())
            .await
            .unwrap();

        let calls = driver.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].session_attached, "in-transaction call lost the session");
        assert!(!calls[1].session_attached, "post-commit call kept a session");
    })
    .await;
}

#[tokio::test]
async fn an_explicit_session_overrides_the_ambient_one() {
    context::attach(async {
        let driver = RecordingDriver::new();
        let _tx = driver.begin_transaction().await.unwrap();

        let explicit = SessionHandle::detached();
        driver
            .insert(
                "users",
                doc! { "name": "ada" },
                OperationOptions::with_session(explicit),
            )
            .await
            .unwrap();

        assert!(driver.calls()[0].session_attached);
    })
    .await;
}

#[tokio::test]
async fn concurrent_transactions_stay_isolated() {
    let run = |name: &'static str| async move {
        context::attach(async move {
            let driver = RecordingDriver::new();
            let mut tx = driver.begin_transaction().await.unwrap();

            tokio::task::yield_now().await;
            driver
                .insert("events", doc! { "task": name }, OperationOptions::default())
                .await
                .unwrap();
            tx.commit().await.unwrap();

            assert!(driver.calls()[0].session_attached);
            assert!(context::session().is_none());
        })
        .await;
    };

    let (a, b) = tokio::join!(tokio::spawn(run("a")), tokio::spawn(run("b")));
    a.unwrap();
    b.unwrap();
}
