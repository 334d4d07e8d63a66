use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use leadline_core::{CallStatus, ContactRecord, FixedClock, Operator, OperatorRole, RecordId};
use leadline_ledger::InMemoryLedger;
use leadline_sync::{
    DashboardSession, DisplayQuery, NormalizerRules, RefreshConfig, RefreshPipeline,
    SessionContext, StatusUpdateError,
};

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0)
        .single()
        .expect("ts")
}

fn lead(id: RecordId, phone: &str, hotel: &str, created: DateTime<Utc>) -> ContactRecord {
    ContactRecord {
        id,
        phone: phone.into(),
        hotel_name: hotel.into(),
        message: None,
        classification: None,
        status: CallStatus::NotCalled,
        created_at: created,
        updated_by: None,
        updated_at: None,
    }
}

fn ayse() -> Operator {
    Operator {
        id: "ayse".into(),
        display_name: "Ayşe".into(),
        role: OperatorRole::Agent,
    }
}

fn context(operator: Option<Operator>) -> SessionContext {
    SessionContext::new(operator, Arc::new(FixedClock(at(10, 12))))
}

/// 1,200 filler rows on an older day plus a handful of interesting rows today.
fn seeded_rows() -> Vec<ContactRecord> {
    let mut rows = (1..=1200)
        .map(|id| lead(id, &format!("90{id:06}"), "Filler", at(5, 9)))
        .collect::<Vec<_>>();

    // Duplicate group: the older classified row must win over the newer blank one.
    let mut classified = lead(5001, "555", "Deniz Otel", at(10, 8));
    classified.classification = Some("oda fiyatı".into());
    rows.push(classified);
    rows.push(lead(5002, "555", "Deniz Otel", at(10, 9)));

    let mut stale = lead(5003, "556", "Deniz Otel", at(10, 11));
    stale.message = Some("musteri cuf yazdi".into());
    stale.classification = Some("merhaba".into());
    rows.push(stale);

    for id in 5004..=5006 {
        let mut called = lead(id, &format!("57{id}"), "Deniz Otel", at(10, 7));
        called.status = CallStatus::Called;
        called.updated_by = Some("ayse".into());
        called.updated_at = Some(at(10, 10));
        rows.push(called);
    }
    rows
}

#[tokio::test]
async fn full_cycle_dedups_normalizes_and_aggregates_past_the_row_ceiling() {
    let ledger = Arc::new(InMemoryLedger::new().with_records(seeded_rows()).await);
    let config = RefreshConfig::default();
    let pipeline = RefreshPipeline::new(
        ledger.clone(),
        context(None),
        NormalizerRules::default(),
        &config,
    );

    let bundle = pipeline.run(1).await;
    let report = &bundle.report;
    assert_eq!(report.generation, 1);
    assert_eq!(report.batches, 2);
    assert!(report.snapshot_complete);
    assert_eq!(report.duplicates_deleted, 1);
    assert_eq!(report.fetch_failures, 0);
    assert_eq!(report.snapshot_rows, 1205);
    assert_eq!(ledger.len().await, 1205);
    assert!(ledger.get(5002).await.is_none());
    assert!(ledger.get(5001).await.is_some());

    // Newest uncalled rows come first, so the stale row is on page one.
    assert_eq!(bundle.records.len(), 50);
    assert_eq!(bundle.records[0].id, 5003);
    assert_eq!(bundle.records[0].message.as_deref(), Some("Arama bekliyor"));
    assert_eq!(
        bundle.records[0].classification.as_deref(),
        Some("Genel bilgi aldı")
    );
    let stored = ledger.get(5003).await.expect("row");
    assert_eq!(stored.message.as_deref(), Some("Arama bekliyor"));
    assert_eq!(bundle.total_count, 1205);
    assert_eq!(bundle.total_pages, 25);

    let global = &bundle.stats.global;
    assert_eq!(global.total_count, 1205);
    assert_eq!(global.today_count, 5);
    assert_eq!(global.total_called, 3);
    assert_eq!(global.today_called, 3);
    assert_eq!(global.call_rate_today, 60.0);
    assert_eq!(global.responses.price_askers, 1);
    assert_eq!(global.responses.info_askers, 1);

    let operator = &bundle.stats.operators[0];
    assert_eq!(operator.operator, "ayse");
    assert_eq!(operator.today_calls, 3);
    assert_eq!(operator.hotels.get("Deniz Otel"), Some(&3));

    let second = pipeline.run(2).await;
    assert_eq!(second.report.duplicates_deleted, 0);
    assert_eq!(second.report.normalizer_writes, 0);
}

#[tokio::test]
async fn failed_snapshot_batch_still_produces_a_bundle() {
    let ledger = Arc::new(InMemoryLedger::new().with_records(seeded_rows()).await);
    let pipeline = RefreshPipeline::new(
        ledger.clone(),
        context(None),
        NormalizerRules::default(),
        &RefreshConfig::default(),
    );

    ledger.fail_next_queries(1).await;
    let bundle = pipeline.run(1).await;
    assert_eq!(bundle.report.fetch_failures, 1);
    assert_eq!(bundle.report.snapshot_rows, 0);
    assert_eq!(bundle.report.duplicates_deleted, 0);
    assert_eq!(bundle.stats.global.total_count, 0);
    assert_eq!(bundle.stats.global.call_rate_total, 0.0);
    assert_eq!(bundle.records.len(), 50);
    assert_eq!(ledger.len().await, 1206);
}

#[tokio::test]
async fn display_query_filters_the_page_but_not_the_stats() {
    let ledger = Arc::new(InMemoryLedger::new().with_records(seeded_rows()).await);
    let pipeline = RefreshPipeline::new(
        ledger.clone(),
        context(None),
        NormalizerRules::default(),
        &RefreshConfig::default(),
    );
    pipeline
        .set_display_query(DisplayQuery {
            phone_contains: None,
            status: Some(CallStatus::Called),
            page: 1,
        })
        .await;

    let bundle = pipeline.run(1).await;
    assert_eq!(bundle.total_count, 3);
    assert_eq!(bundle.total_pages, 1);
    assert!(bundle.records.iter().all(|r| r.status == CallStatus::Called));
    assert_eq!(bundle.stats.global.total_count, 1205);
}

async fn wait_for_generation(desk: &DashboardSession, generation: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if desk
                .latest()
                .is_some_and(|bundle| bundle.generation >= generation)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bundle not published in time");
}

fn fast_config() -> RefreshConfig {
    RefreshConfig {
        poll_interval: Duration::from_secs(3600),
        debounce: Duration::from_millis(20),
        ..RefreshConfig::default()
    }
}

#[tokio::test]
async fn status_update_is_stamped_and_shown_before_the_next_cycle() {
    let ledger = Arc::new(
        InMemoryLedger::new()
            .with_records(vec![lead(1, "555", "X", at(10, 9)), lead(2, "556", "X", at(10, 8))])
            .await,
    );
    let desk = DashboardSession::start(
        ledger.clone(),
        context(Some(ayse())),
        NormalizerRules::default(),
        &fast_config(),
    )
    .await;
    wait_for_generation(&desk, 1).await;

    desk.update_status(1, CallStatus::Called).await.expect("status update");

    let shown = desk.latest().expect("bundle");
    let record = shown.records.iter().find(|r| r.id == 1).expect("row on page");
    assert_eq!(record.status, CallStatus::Called);
    assert_eq!(record.updated_by.as_deref(), Some("ayse"));

    let stored = ledger.get(1).await.expect("row");
    assert_eq!(stored.status, CallStatus::Called);
    assert_eq!(stored.updated_by.as_deref(), Some("ayse"));
    assert_eq!(stored.updated_at, Some(at(10, 12)));

    wait_for_generation(&desk, 2).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while desk
            .latest()
            .map_or(true, |b| b.stats.global.today_called != 1)
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stats caught up");

    desk.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while ledger.subscriber_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscription released");
}

#[tokio::test]
async fn status_update_needs_an_operator_and_surfaces_rejections() {
    let ledger = Arc::new(
        InMemoryLedger::new()
            .with_records(vec![lead(1, "555", "X", at(10, 9))])
            .await,
    );

    let anonymous = DashboardSession::start(
        ledger.clone(),
        context(None),
        NormalizerRules::default(),
        &fast_config(),
    )
    .await;
    assert!(matches!(
        anonymous.update_status(1, CallStatus::Called).await,
        Err(StatusUpdateError::NoOperator)
    ));
    anonymous.shutdown().await;

    ledger.reject_writes_for([1]).await;
    let signed_in = DashboardSession::start(
        ledger.clone(),
        context(Some(ayse())),
        NormalizerRules::default(),
        &fast_config(),
    )
    .await;
    assert!(matches!(
        signed_in.update_status(1, CallStatus::Called).await,
        Err(StatusUpdateError::Ledger(_))
    ));
    assert_eq!(
        ledger.get(1).await.expect("row").status,
        CallStatus::NotCalled
    );
    signed_in.shutdown().await;
}

#[tokio::test]
async fn ledger_changes_trigger_a_refresh() {
    let ledger = Arc::new(InMemoryLedger::new());
    let desk = DashboardSession::start(
        ledger.clone(),
        context(None),
        NormalizerRules::default(),
        &fast_config(),
    )
    .await;
    wait_for_generation(&desk, 1).await;
    assert_eq!(desk.latest().map(|b| b.total_count), Some(0));

    ledger.insert(lead(9, "999", "Y", at(10, 11))).await;
    wait_for_generation(&desk, 2).await;
    assert_eq!(desk.latest().map(|b| b.total_count), Some(1));
    desk.shutdown().await;
}
