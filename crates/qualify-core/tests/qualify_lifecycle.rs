//! End-to-end qualify lifecycle against the in-memory registry

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{ProbeMode, harness, settle, wait_until};
use pretty_assertions::assert_eq;
use rvoip_qualify_core::{
    Aor, Contact, Endpoint, QualifyConfig, QualifyError, ReachabilityState, TransactionOutcome,
};

const ALICE_URI: &str = "sip:alice@192.0.2.10:5060";
const PBX_URI: &str = "sip:pbx@192.0.2.80";

fn registered(id: &str, aor: &str, uri: &str) -> Contact {
    Contact::new(id, aor, uri)
        .with_endpoint(aor)
        .with_expiration(Utc::now() + chrono::Duration::hours(1))
}

fn status_is(h: &common::Harness, id: &str, state: ReachabilityState) -> bool {
    h.registry
        .contact_status(id)
        .is_some_and(|status| status.status == state)
}

#[tokio::test(start_paused = true)]
async fn test_alice_available_then_unavailable() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("alice"));
    h.registry.add_endpoint(Endpoint::new("alice", "default", "alice"));
    h.engine.start().await.unwrap();

    h.registry
        .add_contact(registered("alice;@1", "alice", ALICE_URI).with_qualify(30, 3.0));
    wait_until("alice available", || status_is(&h, "alice;@1", ReachabilityState::Available)).await;

    let available = h.registry.contact_status("alice;@1").unwrap();
    assert_eq!(available.last_status, ReachabilityState::Created);
    assert_eq!(available.aor, "alice");
    assert_eq!(available.uri, ALICE_URI);
    assert!(available.rtt > 0);
    assert!(available.rtt_start.is_none());
    assert!(h.engine.scheduler().is_scheduled("alice;@1"));

    // The next probe goes unanswered
    h.stack.set_mode(ALICE_URI, ProbeMode::Timeout);
    tokio::time::sleep(Duration::from_secs(34)).await;
    wait_until("alice unavailable", || status_is(&h, "alice;@1", ReachabilityState::Unavailable)).await;

    let unavailable = h.registry.contact_status("alice;@1").unwrap();
    assert_eq!(unavailable.last_status, ReachabilityState::Available);
    assert_eq!(unavailable.rtt, 0);
    assert!(unavailable.rtt_start.is_none());
    assert!(h.engine.scheduler().is_scheduled("alice;@1"));

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_any_response_code_means_available() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(404)).await;
    h.registry.add_aor(Aor::new("alice"));
    h.registry.add_endpoint(Endpoint::new("alice", "default", "alice"));
    h.engine.start().await.unwrap();

    h.registry
        .add_contact(registered("alice;@1", "alice", ALICE_URI).with_qualify(30, 3.0));
    wait_until("alice available", || status_is(&h, "alice;@1", ReachabilityState::Available)).await;

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_marks_unavailable() {
    let h = harness(QualifyConfig::default(), ProbeMode::FailSend).await;
    h.registry.add_aor(Aor::new("alice"));
    h.registry.add_endpoint(Endpoint::new("alice", "default", "alice"));
    h.engine.start().await.unwrap();

    h.registry
        .add_contact(registered("alice;@1", "alice", ALICE_URI).with_qualify(30, 3.0));
    wait_until("alice unavailable", || status_is(&h, "alice;@1", ReachabilityState::Unavailable)).await;

    // Still scheduled, the next probe may succeed
    assert!(h.engine.scheduler().is_scheduled("alice;@1"));
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_while_scheduled() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("alice"));
    h.registry.add_endpoint(Endpoint::new("alice", "default", "alice"));
    h.engine.start().await.unwrap();

    h.registry
        .add_contact(registered("alice;@1", "alice", ALICE_URI).with_qualify(30, 3.0));
    wait_until("alice available", || status_is(&h, "alice;@1", ReachabilityState::Available)).await;

    h.registry.remove_contact("alice;@1");
    wait_until("alice purged", || {
        h.registry.contact_status("alice;@1").is_none() && !h.engine.scheduler().is_scheduled("alice;@1")
    })
    .await;

    let sent = h.stack.sent_to(ALICE_URI).len();
    tokio::time::sleep(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(h.stack.sent_to(ALICE_URI).len(), sent);
    assert!(h.registry.contact_status("alice;@1").is_none());

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_aor_deletion_cancels_contacts_without_status_writes() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("sales").with_qualify(60, 3.0));
    h.registry.add_endpoint(Endpoint::new("1000", "default", "sales"));
    h.registry.add_contact(Contact::new("sales;@a", "sales", "sip:a@192.0.2.21"));
    h.registry.add_contact(Contact::new("sales;@b", "sales", "sip:b@192.0.2.22"));

    h.engine.start().await.unwrap();
    assert_eq!(h.engine.scheduler().scheduled_count(), 2);
    let writes = h.registry.status_write_count();

    h.registry.remove_aor("sales");
    wait_until("sales unscheduled", || h.engine.scheduler().scheduled_count() == 0).await;
    assert_eq!(h.registry.status_write_count(), writes);

    tokio::time::sleep(Duration::from_secs(180)).await;
    settle().await;
    assert!(h.stack.sent().is_empty());
    assert_eq!(h.registry.status_write_count(), writes);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_timer_stops_when_aor_disappears() {
    // Not started: nothing follows registry events, so the AOR removal
    // below is only noticed by the timer itself
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("alice"));
    h.registry.add_endpoint(Endpoint::new("alice", "default", "alice"));
    let contact = h
        .registry
        .add_contact(registered("alice;@1", "alice", ALICE_URI).with_qualify(30, 3.0));

    let scheduler = h.engine.scheduler().clone();
    scheduler.schedule(contact, Duration::from_secs(10)).unwrap();

    tokio::time::sleep(Duration::from_secs(11)).await;
    wait_until("first probe", || h.stack.sent_to(ALICE_URI).len() == 1).await;

    h.registry.remove_aor("alice");
    tokio::time::sleep(Duration::from_secs(30)).await;
    wait_until("entry removed", || !scheduler.is_scheduled("alice;@1")).await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(h.stack.sent_to(ALICE_URI).len(), 1);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_frequency_converges_to_unknown() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("lobby"));
    h.registry.add_endpoint(Endpoint::new("lobby", "default", "lobby"));
    h.engine.start().await.unwrap();

    h.registry.add_contact(registered("lobby;@1", "lobby", "sip:lobby@192.0.2.40"));
    wait_until("lobby unknown", || status_is(&h, "lobby;@1", ReachabilityState::Unknown)).await;

    let status = h.registry.contact_status("lobby;@1").unwrap();
    assert_eq!(status.last_status, ReachabilityState::Created);
    assert_eq!(status.rtt, 0);
    assert!(!h.engine.scheduler().is_scheduled("lobby;@1"));
    assert!(h.stack.sent().is_empty());

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_registration_refresh() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("alice"));
    h.registry.add_endpoint(Endpoint::new("alice", "default", "alice"));
    h.engine.start().await.unwrap();

    let contact = registered("alice;@1", "alice", ALICE_URI).with_qualify(30, 3.0);
    h.registry.add_contact(contact.clone());
    wait_until("alice available", || status_is(&h, "alice;@1", ReachabilityState::Available)).await;
    let before = h.registry.contact_status("alice;@1").unwrap();

    h.registry.update_contact(contact);
    wait_until("refresh", || {
        h.registry
            .contact_status("alice;@1")
            .is_some_and(|status| status.refresh)
    })
    .await;

    let after = h.registry.contact_status("alice;@1").unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.last_status, before.last_status);
    assert_eq!(after.rtt, before.rtt);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_refresh_before_first_result_is_suppressed() {
    let h = harness(QualifyConfig::default(), ProbeMode::Hold).await;
    h.registry.add_aor(Aor::new("alice"));
    h.registry.add_endpoint(Endpoint::new("alice", "default", "alice"));
    h.engine.start().await.unwrap();

    let contact = registered("alice;@1", "alice", ALICE_URI).with_qualify(30, 3.0);
    h.registry.add_contact(contact.clone());
    wait_until("probe sent", || h.stack.sent_to(ALICE_URI).len() == 1).await;
    let writes = h.registry.status_write_count();

    h.registry.update_contact(contact);
    settle().await;
    assert_eq!(h.registry.status_write_count(), writes);
    assert!(status_is(&h, "alice;@1", ReachabilityState::Created));

    assert_eq!(h.stack.release_held(TransactionOutcome::Response { status_code: 200 }), 1);
    wait_until("alice available", || status_is(&h, "alice;@1", ReachabilityState::Available)).await;

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_contact_without_endpoint_is_purged() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("ghost"));
    // "ghostly" only matches the pattern query, not the exact AOR
    h.registry.add_endpoint(Endpoint::new("other", "default", "ghostly"));
    h.engine.start().await.unwrap();

    h.registry.add_contact(
        Contact::new("ghost;@1", "ghost", "sip:ghost@192.0.2.66")
            .with_qualify(30, 3.0)
            .with_expiration(Utc::now() + chrono::Duration::hours(1)),
    );
    settle().await;

    wait_until("ghost purged", || !h.engine.scheduler().is_scheduled("ghost;@1")).await;
    assert!(h.registry.contact_status("ghost;@1").is_none());
    assert!(h.stack.sent().is_empty());

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_endpoint_resolved_by_aor_membership() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("abc"));
    h.registry.add_endpoint(Endpoint::new("decoy", "default", "aaabccc"));
    h.registry.add_endpoint(Endpoint::new("1000", "default", "sales, abc"));
    h.engine.start().await.unwrap();

    h.registry.add_contact(
        Contact::new("abc;@1", "abc", "sip:abc@192.0.2.70")
            .with_qualify(30, 3.0)
            .with_expiration(Utc::now() + chrono::Duration::hours(1)),
    );
    wait_until("abc available", || status_is(&h, "abc;@1", ReachabilityState::Available)).await;
    assert_eq!(h.stack.sent()[0].endpoint, "1000");

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_aor_update_applies_policy_and_reschedules() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("sales").with_qualify(60, 3.0));
    h.registry.add_endpoint(Endpoint::new("1000", "default", "sales"));
    h.registry.add_contact(Contact::new("sales;@a", "sales", "sip:a@192.0.2.21"));
    h.engine.start().await.unwrap();

    let scheduled = h.engine.scheduler().scheduled_contact("sales;@a").unwrap();
    assert_eq!(scheduled.qualify_frequency, 60);

    h.registry.update_aor(Aor::new("sales").with_qualify(15, 1.5));
    wait_until("policy applied", || {
        h.engine
            .scheduler()
            .scheduled_contact("sales;@a")
            .is_some_and(|contact| contact.qualify_frequency == 15)
    })
    .await;
    let scheduled = h.engine.scheduler().scheduled_contact("sales;@a").unwrap();
    assert_eq!(scheduled.qualify_timeout_duration(), Duration::from_millis(1500));

    // Qualification switched off on the AOR
    h.registry.update_aor(Aor::new("sales"));
    wait_until("sales unknown", || status_is(&h, "sales;@a", ReachabilityState::Unknown)).await;
    assert!(!h.engine.scheduler().is_scheduled("sales;@a"));

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reload_rebuilds_schedules() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("sales").with_qualify(60, 3.0));
    h.registry.add_endpoint(Endpoint::new("1000", "default", "sales"));
    h.registry.add_contact(Contact::new("sales;@a", "sales", "sip:a@192.0.2.21"));
    h.registry.add_contact(
        Contact::new("solo;@1", "solo", "sip:solo@192.0.2.30").with_qualify(20, 2.0),
    );
    h.engine.start().await.unwrap();
    assert_eq!(h.engine.scheduler().scheduled_count(), 2);

    h.engine.scheduler().unschedule_all();
    assert_eq!(h.engine.scheduler().scheduled_count(), 0);

    h.engine.reload().await.unwrap();
    assert!(h.engine.scheduler().is_scheduled("sales;@a"));
    assert!(h.engine.scheduler().is_scheduled("solo;@1"));
    assert_eq!(
        h.engine.scheduler().scheduled_contact("solo;@1").unwrap().qualify_frequency,
        20
    );

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_permanent_contact_added_after_boot_is_qualified() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("pbx").with_qualify(45, 2.0));
    h.registry.add_endpoint(Endpoint::new("pbx", "default", "pbx"));
    h.engine.start().await.unwrap();
    h.system.mark_fully_booted();

    // Configured contacts carry no qualify settings of their own
    h.registry
        .add_contact(Contact::new("pbx@@1", "pbx", PBX_URI));
    wait_until("pbx scheduled with AOR policy", || {
        h.engine
            .scheduler()
            .scheduled_contact("pbx@@1")
            .is_some_and(|contact| contact.qualify_frequency == 45)
    })
    .await;
    wait_until("pbx available", || status_is(&h, "pbx@@1", ReachabilityState::Available)).await;

    // Creation event and new status record lead to a single immediate qualify
    settle().await;
    assert_eq!(h.stack.sent_to(PBX_URI).len(), 1);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_new_status_of_unscheduled_permanent_contact_schedules_it() {
    // Not started: the creation event goes unnoticed, the new status record does not
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("pbx").with_qualify(45, 2.0));
    h.registry.add_endpoint(Endpoint::new("pbx", "default", "pbx"));
    h.system.mark_fully_booted();
    h.registry.add_contact(Contact::new("pbx@@1", "pbx", PBX_URI));
    assert!(!h.engine.scheduler().is_scheduled("pbx@@1"));

    let outcomes = h.engine.management().qualify_endpoint("pbx").await.unwrap();
    assert_eq!(outcomes.len(), 1);
    wait_until("pbx scheduled with AOR policy", || {
        h.engine
            .scheduler()
            .scheduled_contact("pbx@@1")
            .is_some_and(|contact| contact.qualify_frequency == 45)
    })
    .await;

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_deleted_permanent_contact_stays_unscheduled() {
    let h = harness(QualifyConfig::default(), ProbeMode::Hold).await;
    h.registry.add_aor(Aor::new("pbx").with_qualify(30, 2.0));
    h.registry.add_endpoint(Endpoint::new("pbx", "default", "pbx"));
    h.engine.start().await.unwrap();
    h.system.mark_fully_booted();

    h.registry.add_contact(Contact::new("pbx@@1", "pbx", PBX_URI));
    wait_until("pbx qualify sent", || h.stack.sent_to(PBX_URI).len() == 1).await;

    h.registry.remove_contact("pbx@@1");
    wait_until("pbx unscheduled", || !h.engine.scheduler().is_scheduled("pbx@@1")).await;

    // The answer arrives after the contact is gone
    assert_eq!(h.stack.release_held(TransactionOutcome::Response { status_code: 200 }), 1);
    settle().await;

    tokio::time::sleep(Duration::from_secs(95)).await;
    settle().await;
    assert!(!h.engine.scheduler().is_scheduled("pbx@@1"));
    assert_eq!(h.stack.sent_to(PBX_URI).len(), 1);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_registered_contact_inherits_aor_policy() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("sales").with_qualify(60, 3.0));
    h.registry.add_endpoint(Endpoint::new("sales", "default", "sales"));
    h.engine.start().await.unwrap();

    // The registration carries no qualify frequency of its own
    h.registry.add_contact(registered("sales;@a", "sales", "sip:a@192.0.2.21"));
    wait_until("sales scheduled with AOR policy", || {
        h.engine
            .scheduler()
            .scheduled_contact("sales;@a")
            .is_some_and(|contact| contact.qualify_frequency == 60)
    })
    .await;
    wait_until("sales available", || status_is(&h, "sales;@a", ReachabilityState::Available)).await;

    tokio::time::sleep(Duration::from_secs(130)).await;
    settle().await;
    assert_eq!(h.stack.sent_to("sip:a@192.0.2.21").len(), 3);
    assert_eq!(h.stack.sent_to("sip:a@192.0.2.21")[0].timeout, Duration::from_secs(3));

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_refresh_of_inheriting_contact_waits_for_first_result() {
    let h = harness(QualifyConfig::default(), ProbeMode::Hold).await;
    h.registry.add_aor(Aor::new("sales").with_qualify(60, 3.0));
    h.registry.add_endpoint(Endpoint::new("sales", "default", "sales"));
    h.engine.start().await.unwrap();

    let contact = registered("sales;@a", "sales", "sip:a@192.0.2.21");
    h.registry.add_contact(contact.clone());
    wait_until("sales qualify sent", || h.stack.sent_to("sip:a@192.0.2.21").len() == 1).await;

    h.registry.update_contact(contact);
    settle().await;
    assert!(status_is(&h, "sales;@a", ReachabilityState::Created));
    assert!(h.engine.scheduler().is_scheduled("sales;@a"));

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_update_options_rebuilds_only_that_aor() {
    // Not started: schedules change only through the calls below
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("sales").with_qualify(60, 3.0));
    h.registry.add_aor(Aor::new("support").with_qualify(60, 3.0));
    h.registry.add_endpoint(Endpoint::new("1000", "default", "sales,support"));
    h.registry.add_contact(Contact::new("sales;@a", "sales", "sip:a@192.0.2.21"));
    h.registry.add_contact(Contact::new("support;@b", "support", "sip:b@192.0.2.22"));

    let reconciler = h.engine.reconciler().clone();
    reconciler.qualify_and_schedule_all().await.unwrap();
    assert_eq!(h.engine.scheduler().scheduled_count(), 2);
    let support_before = h.engine.scheduler().scheduled_contact("support;@b").unwrap();

    let sales = h.registry.update_aor(Aor::new("sales").with_qualify(15, 1.5));
    reconciler.update_options(&sales).await;

    let sales_contact = h.engine.scheduler().scheduled_contact("sales;@a").unwrap();
    assert_eq!(sales_contact.qualify_frequency, 15);
    assert_eq!(sales_contact.qualify_timeout_duration(), Duration::from_millis(1500));

    let support_after = h.engine.scheduler().scheduled_contact("support;@b").unwrap();
    assert!(std::sync::Arc::ptr_eq(&support_before, &support_after));
    assert_eq!(h.engine.scheduler().scheduled_count(), 2);

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_marks_unqualified_endpoints_online() {
    let registry = std::sync::Arc::new(rvoip_qualify_core::MemoryRegistry::new());
    registry.add_aor(Aor::new("trunk").with_permanent_contact("sip:trunk@192.0.2.90"));
    registry.add_endpoint(Endpoint::new("trunk-ep", "default", "trunk"));
    registry.add_endpoint(Endpoint::new("lookalike", "default", "trunkline"));
    registry.add_endpoint(Endpoint::new("bob", "default", "bob"));
    registry.add_endpoint(Endpoint::new("carol", "default", "carol"));
    registry.add_contact(registered("bob;@1", "bob", "sip:bob@192.0.2.91"));
    registry.add_contact(
        Contact::new("carol;@1", "carol", "sip:carol@192.0.2.92")
            .with_endpoint("carol")
            .with_expiration(Utc::now() - chrono::Duration::hours(1)),
    );

    let h = common::harness_with(registry, QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.engine.start().await.unwrap();

    assert!(h.registry.is_endpoint_online("trunk-ep"));
    assert!(!h.registry.is_endpoint_online("lookalike"));
    assert!(h.registry.is_endpoint_online("bob"));
    assert!(!h.registry.is_endpoint_online("carol"));

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_qualify_endpoint_command() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("sales"));
    h.registry.add_aor(Aor::new("support"));
    h.registry.add_endpoint(Endpoint::new("1000", "default", "sales,missing, support"));
    h.registry.add_endpoint(Endpoint::new("bare", "default", ""));
    h.registry.add_contact(Contact::new("sales;@a", "sales", "sip:a@192.0.2.21"));
    h.registry.add_contact(Contact::new("support;@b", "support", "sip:b@192.0.2.22"));
    h.engine.start().await.unwrap();

    let outcomes = h.engine.management().qualify_endpoint("1000").await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|outcome| outcome.sent));
    assert!(h.stack.sent().iter().all(|probe| probe.endpoint == "1000"));

    wait_until("both available", || {
        status_is(&h, "sales;@a", ReachabilityState::Available) && status_is(&h, "support;@b", ReachabilityState::Available)
    })
    .await;

    let reports = h
        .engine
        .management()
        .format_endpoint_contacts(&Endpoint::new("1000", "default", "sales,missing, support"))
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|report| report.roundtrip_usec.is_some()));
    assert!(reports[0].to_event_lines().contains("Status: Reachable\r\n"));

    assert!(matches!(
        h.engine.management().qualify_endpoint("nobody").await,
        Err(QualifyError::UnknownEndpoint(_))
    ));
    assert!(matches!(
        h.engine.management().queue_endpoint_qualify("bare").await,
        Err(QualifyError::NoAorsConfigured(_))
    ));

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_queue_endpoint_qualify() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("sales"));
    h.registry.add_endpoint(Endpoint::new("1000", "default", "sales"));
    h.registry.add_contact(Contact::new("sales;@a", "sales", "sip:a@192.0.2.21"));
    h.registry.add_contact(Contact::new("sales;@b", "sales", "sip:b@192.0.2.22"));
    h.engine.start().await.unwrap();

    assert_eq!(h.engine.management().queue_endpoint_qualify("1000").await.unwrap(), 2);
    wait_until("both probed", || h.stack.sent().len() == 2).await;

    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.registry.add_aor(Aor::new("sales").with_qualify(60, 3.0));
    h.registry.add_contact(Contact::new("sales;@a", "sales", "sip:a@192.0.2.21"));
    h.engine.start().await.unwrap();
    assert!(h.engine.is_running());

    h.engine.stop().await;
    h.engine.stop().await;

    assert!(!h.engine.is_running());
    assert_eq!(h.engine.scheduler().scheduled_count(), 0);
    assert!(h.engine.tasks().is_shut_down());
    assert!(h.engine.start().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_stop_without_start() {
    let h = harness(QualifyConfig::default(), ProbeMode::Respond(200)).await;
    h.engine.stop().await;
    assert!(!h.engine.is_running());
}
