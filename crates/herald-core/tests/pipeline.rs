mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{ScriptedTransport, app_with, start_time};
use herald_core::config::HeraldConfig;
use herald_core::domain::{MessageStatus, NewMessage};
use herald_core::ports::{Clock, FixedClock};

#[tokio::test(start_paused = true)]
async fn due_message_is_claimed_then_sent() {
    let clock = Arc::new(FixedClock::new(start_time()));
    let transport = Arc::new(ScriptedTransport::accepting());
    let app = app_with(transport.clone(), clock.clone(), HeraldConfig::default()).await;

    let message = app
        .submission()
        .schedule(
            NewMessage::new("bob@example.com", "welcome", "<p>hi</p>")
                .from_sender("alice")
                .at(start_time() - ChronoDuration::seconds(1)),
        )
        .await
        .unwrap();

    // one pass claims it
    let report = app.scheduler().run_once().await.unwrap();
    assert_eq!(report.enqueued, vec![message.id]);
    assert_eq!(
        app.store().get(message.id).await.unwrap().unwrap().status,
        MessageStatus::Processing
    );

    let running = app.start();
    tokio::time::sleep(app.config().scheduler.poll_interval()).await;
    running.shutdown_and_join().await;

    let stored = app.store().get(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
    assert_eq!(stored.sent_at, Some(start_time()));
    assert_eq!(transport.calls().len(), 1);
    assert_eq!(transport.calls()[0].to, "bob@example.com");
}

#[tokio::test(start_paused = true)]
async fn future_message_waits_for_its_time() {
    let clock = Arc::new(FixedClock::new(start_time()));
    let transport = Arc::new(ScriptedTransport::accepting());
    let app = app_with(transport.clone(), clock.clone(), HeraldConfig::default()).await;

    let message = app
        .submission()
        .schedule(
            NewMessage::new("bob@example.com", "later", "body")
                .at(start_time() + ChronoDuration::hours(1)),
        )
        .await
        .unwrap();

    let running = app.start();
    // poll for 59m59s of clock time: never due
    for _ in 0..11 {
        clock.advance(ChronoDuration::minutes(5));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(app.store().find_due(10, clock.now()).await.unwrap().is_empty());
    }
    clock.advance(ChronoDuration::minutes(5) - ChronoDuration::seconds(1));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        app.store().get(message.id).await.unwrap().unwrap().status,
        MessageStatus::Pending
    );
    assert!(transport.calls().is_empty());

    clock.advance(ChronoDuration::seconds(1));
    // now due: picked up within one poll interval
    tokio::time::sleep(Duration::from_secs(6)).await;
    running.shutdown_and_join().await;

    let stored = app.store().get(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn eleventh_message_from_one_sender_is_rate_limited() {
    let clock = Arc::new(FixedClock::new(start_time()));
    let transport = Arc::new(ScriptedTransport::accepting());
    let mut config = HeraldConfig::default();
    // one pass picks up everything
    config.scheduler.batch_size = 20;
    let app = app_with(transport.clone(), clock.clone(), config).await;

    let mut ids = Vec::new();
    for n in 0..11 {
        let message = app
            .submission()
            .schedule(
                NewMessage::new(format!("user{n}@example.com"), format!("note {n}"), "body")
                    .from_sender("alice"),
            )
            .await
            .unwrap();
        ids.push(message.id);
    }

    let running = app.start();
    // covers 1s + 2s of backoff for the limited job
    tokio::time::sleep(Duration::from_secs(30)).await;
    running.shutdown_and_join().await;

    let mut sent = 0;
    let mut failed = Vec::new();
    for id in &ids {
        let stored = app.store().get(*id).await.unwrap().unwrap();
        match stored.status {
            MessageStatus::Sent => sent += 1,
            MessageStatus::Failed => failed.push(stored),
            other => panic!("unexpected status {other}"),
        }
    }

    assert_eq!(sent, 10);
    assert_eq!(failed.len(), 1);
    assert_eq!(
        failed[0].last_error.as_deref(),
        Some("Rate limit exceeded for sender alice")
    );
    // the limited message was never handed to the transport
    assert_eq!(transport.calls().len(), 10);

    let status = app.status().await.unwrap();
    assert_eq!(status.queue.dead, 1);
    assert_eq!(status.queue.succeeded, 10);
}

#[tokio::test(start_paused = true)]
async fn failing_transport_exhausts_attempts_with_growing_delays() {
    let clock = Arc::new(FixedClock::new(start_time()));
    let transport = Arc::new(ScriptedTransport::failing());
    let app = app_with(transport.clone(), clock.clone(), HeraldConfig::default()).await;

    let message = app
        .submission()
        .schedule(NewMessage::new("bob@example.com", "doomed", "body").from_sender("alice"))
        .await
        .unwrap();

    let running = app.start();
    tokio::time::sleep(Duration::from_secs(60)).await;
    running.shutdown_and_join().await;

    let calls = transport.calls();
    assert_eq!(calls.len(), 3, "max_attempts = 3, never redelivered after");

    let gaps: Vec<_> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
    assert!(gaps[0] >= Duration::from_secs(1));
    assert!(gaps[1] >= Duration::from_secs(2));
    assert!(gaps[0] <= gaps[1]);

    let stored = app.store().get(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
    assert_eq!(
        stored.last_error.as_deref(),
        Some("transport unavailable: connection refused")
    );
    assert!(stored.sent_at.is_none());
}
