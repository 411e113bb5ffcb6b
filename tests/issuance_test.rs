use std::sync::Arc;

use chrono::{TimeZone, Utc};
use coachline::coaching::{
    AccountStatus, ChargeStatus, CheckoutRequest, CoachingAuditEvent, CoachingError, CoachingService,
    InMemoryLedgerStore, IssueOutcome, MemoryAuditLogger, MockPaymentProcessor, PaymentEvent,
    RoutingMode, RoutingStatus, Tier, TransferStatus,
};
use coachline::ManualClock;

type Service = CoachingService<InMemoryLedgerStore, MockPaymentProcessor>;

struct Harness {
    service: Arc<Service>,
    store: InMemoryLedgerStore,
    processor: MockPaymentProcessor,
    audit: MemoryAuditLogger,
}

async fn harness() -> Harness {
    let store = InMemoryLedgerStore::new();
    let processor = MockPaymentProcessor::new();
    let audit = MemoryAuditLogger::new();
    processor.add_account(AccountStatus {
        account_ref: "acct_coach".to_string(),
        charges_enabled: true,
        payouts_enabled: true,
        details_submitted: true,
    });

    let service = CoachingService::builder(store.clone(), processor.clone())
        .clock(Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 4, 10, 9, 0, 0).unwrap(),
        )))
        .audit(Arc::new(audit.clone()))
        .build();
    service
        .link_coach_account("coach_1", "acct_coach")
        .await
        .unwrap();

    Harness {
        service: Arc::new(service),
        store,
        processor,
        audit,
    }
}

fn payment(reference: &str, player_id: &str) -> PaymentEvent {
    PaymentEvent {
        payment_reference: reference.to_string(),
        charge_id: Some(format!("ch_{}", reference)),
        provider_id: "coach_1".to_string(),
        player_id: player_id.to_string(),
        player_name: Some("Alex".to_string()),
        sport: "golf".to_string(),
        tier: Some(Tier::Two),
        gross_amount: 6075,
        currency: "usd".to_string(),
        clip_allowance_hint: None,
        validity_days_hint: None,
        routing_mode: RoutingMode::SeparateTransfer,
        destination_account: None,
        customer_ref: Some("cus_alex".to_string()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_issue_one_entitlement() {
    let h = harness().await;
    let event = payment("pi_race", "player_1");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = h.service.clone();
        let event = event.clone();
        handles.push(tokio::spawn(async move {
            service.create_entitlement_from_payment(&event).await
        }));
    }

    let mut new_count = 0;
    let mut ids = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.is_new() {
            new_count += 1;
        }
        ids.push(outcome.entitlement().id.clone());
    }

    assert_eq!(new_count, 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.store.entitlements().await.len(), 1);
    assert_eq!(h.store.transfers().await.len(), 1);
    assert_eq!(h.processor.transfers().len(), 1);
    assert_eq!(h.store.conversations().await.len(), 1);
}

#[tokio::test]
async fn separate_transfer_routes_net_amount() {
    let h = harness().await;

    let outcome = h
        .service
        .create_entitlement_from_payment(&payment("pi_sep", "player_1"))
        .await
        .unwrap();

    let IssueOutcome::Issued(report) = outcome else {
        panic!("expected a new entitlement");
    };
    assert_eq!(report.entitlement.clip_allowance, 7);
    assert_eq!(
        report.entitlement.expires_at,
        Utc.with_ymd_and_hms(2026, 4, 15, 9, 0, 0).unwrap()
    );

    let RoutingStatus::Routed(transfer) = report.routing else {
        panic!("expected routed funds");
    };
    assert_eq!(transfer.platform_fee, 911);
    assert_eq!(transfer.net_amount, 5164);
    assert_eq!(transfer.status, TransferStatus::Paid);

    let sent = h.processor.transfers();
    assert_eq!(sent[0].amount, 5164);
    assert_eq!(sent[0].destination_account, "acct_coach");
}

#[tokio::test]
async fn transfer_failure_keeps_entitlement() {
    let h = harness().await;
    h.processor.fail_transfers(true);

    let outcome = h
        .service
        .create_entitlement_from_payment(&payment("pi_fail", "player_1"))
        .await
        .unwrap();

    let IssueOutcome::Issued(report) = outcome else {
        panic!("expected a new entitlement");
    };
    assert!(matches!(report.routing, RoutingStatus::Failed(_)));
    assert_eq!(h.store.entitlements().await.len(), 1);

    let transfers = h.store.transfers().await;
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].status, TransferStatus::Failed);
    assert!(transfers[0].failure_reason.is_some());

    let events = h.audit.events().await;
    assert!(events
        .iter()
        .any(|e| matches!(e, CoachingAuditEvent::RoutingFailed { .. })));
}

#[tokio::test]
async fn persist_failure_is_reported_and_nothing_routed() {
    let h = harness().await;
    h.store.fail_entitlement_writes(true);

    let err = h
        .service
        .create_entitlement_from_payment(&payment("pi_lost", "player_1"))
        .await
        .unwrap_err();

    assert!(matches!(err, CoachingError::EntitlementPersistFailure { .. }));
    assert!(err.needs_reconciliation());
    assert!(h.store.transfers().await.is_empty());
    assert!(h.processor.transfers().is_empty());
    assert!(h
        .audit
        .events()
        .await
        .iter()
        .any(|e| matches!(e, CoachingAuditEvent::EntitlementPersistFailed { .. })));
}

#[tokio::test]
async fn repurchase_relinks_existing_conversation() {
    let h = harness().await;

    let first = h
        .service
        .create_entitlement_from_payment(&payment("pi_first", "player_1"))
        .await
        .unwrap();
    let second = h
        .service
        .create_entitlement_from_payment(&payment("pi_second", "player_1"))
        .await
        .unwrap();

    assert_ne!(first.entitlement().id, second.entitlement().id);

    let conversations = h.store.conversations().await;
    assert_eq!(conversations.len(), 1);
    assert_eq!(
        conversations[0].linked_entitlement_id,
        second.entitlement().id
    );
}

#[tokio::test]
async fn placeholder_players_get_no_conversation() {
    let h = harness().await;

    let outcome = h
        .service
        .create_entitlement_from_payment(&payment("pi_guest", "Guest"))
        .await
        .unwrap();

    let IssueOutcome::Issued(report) = outcome else {
        panic!("expected a new entitlement");
    };
    assert!(report.conversation.is_none());
    assert!(report.conversation_error.is_none());
    assert!(h.store.conversations().await.is_empty());
}

#[tokio::test]
async fn checkout_then_confirm_issues_destination_entitlement() {
    let h = harness().await;

    let session = h
        .service
        .create_checkout(CheckoutRequest {
            player_id: "player_2".to_string(),
            player_name: None,
            provider_id: "coach_1".to_string(),
            sport: "tennis".to_string(),
            tier: Tier::Three,
            routing_mode: RoutingMode::Destination,
            customer_ref: Some("cus_2".to_string()),
            idempotency_key: Some("checkout-player_2-1".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(session.amount, 8775);

    h.processor
        .set_charge_status(&session.charge_id, ChargeStatus::Succeeded);
    let outcome = h.service.confirm_payment(&session.charge_id).await.unwrap();

    let entitlement = outcome.entitlement();
    assert_eq!(entitlement.sport, "tennis");
    assert_eq!(entitlement.clip_allowance, 15);
    assert_eq!(entitlement.payment_reference, session.charge_id);

    let transfers = h.store.transfers().await;
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].routing_mode, RoutingMode::Destination);
    assert_eq!(transfers[0].provider_account_ref, "acct_coach");
    assert!(h.processor.transfers().is_empty());
}
