use std::sync::Arc;
use std::time::Duration as StdDuration;

use audit_store::{AuditRepository, PageRequest};
use chrono::{Duration, Months, TimeZone, Utc};
use ledger_store::PaymentSessionRepository;
use payment_gateway::{GatewayStatus, ScriptedPaymentGateway};
use platform_core::{AppConfig, AppEnv};
use rental_domain::{
    AccountStatus, AuditAction, Clock, Identity, ManualClock, Money, PaymentSessionStatus,
    TransactionStatus, TransactionType, UserId,
};
use settlement::{
    ExtendRequest, PurchaseMethod, PurchaseOutcome, SettlementOrchestrator,
    spawn_session_recovery_loop,
};
use tokio::sync::oneshot;

use crate::wiring::{InMemoryStores, build_orchestrator};

struct Platform {
    orchestrator: Arc<SettlementOrchestrator>,
    stores: InMemoryStores,
    gateway: ScriptedPaymentGateway,
    clock: ManualClock,
    admin: Identity,
}

fn platform() -> Platform {
    let mut config = AppConfig::default_for_env(AppEnv::Test);
    config.poller.checkout_interval_secs = 1;
    let stores = InMemoryStores::new();
    let gateway = ScriptedPaymentGateway::new();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap());
    let orchestrator = build_orchestrator(
        &config,
        stores.settlement_stores(),
        Arc::new(gateway.clone()),
        Arc::new(clock.clone()),
    )
    .expect("orchestrator");
    Platform {
        orchestrator,
        stores,
        gateway,
        clock,
        admin: Identity::admin(UserId::new()),
    }
}

async fn advertiser_with(p: &Platform, major: u64) -> Identity {
    let identity = Identity::advertiser(UserId::new());
    p.stores
        .ledger
        .seed_balance(identity.user_id, Money::from_major(major))
        .await
        .expect("seed");
    identity
}

async fn balance_of(p: &Platform, identity: &Identity) -> Money {
    p.orchestrator
        .balance(identity, identity.user_id)
        .await
        .expect("balance")
}

#[tokio::test]
async fn scenario_a_balance_purchase() {
    let p = platform();
    let user = advertiser_with(&p, 200).await;

    let outcome = p
        .orchestrator
        .initiate_purchase(&user, PurchaseMethod::Balance)
        .await
        .expect("purchase");
    let PurchaseOutcome::Activated { account, .. } = outcome else {
        panic!("balance purchase should activate");
    };

    assert_eq!(balance_of(&p, &user).await, Money::parse_decimal("50.00").expect("money"));
    let rentals: Vec<_> = p
        .orchestrator
        .list_transactions(&user, user.user_id)
        .await
        .expect("transactions")
        .into_iter()
        .filter(|tx| tx.tx_type == TransactionType::Rental)
        .collect();
    assert_eq!(rentals.len(), 1);
    assert_eq!(rentals[0].status, TransactionStatus::Completed);

    let accounts = p
        .orchestrator
        .list_accounts(&user, user.user_id)
        .await
        .expect("accounts");
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].id, account.id);
    assert_eq!(accounts[0].status, AccountStatus::Active);
    assert_eq!(accounts[0].expire_at, Some(p.clock.now() + Duration::days(30)));
}

#[tokio::test]
async fn scenario_b_unconfirmed_crypto_payment_expires() {
    let p = platform();
    let user = advertiser_with(&p, 80).await;

    let session = p
        .orchestrator
        .initiate_purchase(
            &user,
            PurchaseMethod::Crypto {
                pay_currency: "btc".to_string(),
            },
        )
        .await
        .expect("purchase")
        .session()
        .clone();
    let reference = session.external_reference().expect("reference").to_string();
    p.gateway.push_status(&reference, GatewayStatus::Waiting);

    let poller = p.orchestrator.poller();
    assert_eq!(
        poller.poll_once(session.id).await.expect("poll"),
        PaymentSessionStatus::Waiting
    );
    p.clock.advance(Duration::minutes(25));
    let calls_before = p.gateway.status_calls();
    assert_eq!(
        poller
            .run_until_terminal(session.id, StdDuration::from_millis(5))
            .await
            .expect("terminal"),
        PaymentSessionStatus::Expired
    );
    assert_eq!(p.gateway.status_calls(), calls_before);

    assert_eq!(balance_of(&p, &user).await, Money::from_major(80));
    assert!(p.stores.accounts.snapshot().expect("accounts").is_empty());
    let stored = p
        .stores
        .sessions
        .get_session(session.id)
        .await
        .expect("read")
        .expect("session");
    assert!(stored.settled_at.is_some());
}

#[tokio::test]
async fn scenario_c_admin_extends_by_three_months() {
    let p = platform();
    let user = advertiser_with(&p, 150).await;
    let PurchaseOutcome::Activated { account, .. } = p
        .orchestrator
        .initiate_purchase(&user, PurchaseMethod::Balance)
        .await
        .expect("purchase")
    else {
        panic!("balance purchase should activate");
    };
    let old_expiry = account.expire_at.expect("expiry");
    let target = old_expiry + Months::new(3);

    let extended = p
        .orchestrator
        .extend_account(&p.admin, account.id, ExtendRequest::Until(target), None)
        .await
        .expect("extend");
    assert_eq!(extended.expire_at, Some(target));
    assert_eq!(extended.status, AccountStatus::Active);

    let extended_entries = p
        .stores
        .audit
        .list_for_account(account.id, PageRequest::default())
        .await
        .expect("audit")
        .into_iter()
        .filter(|entry| entry.action == AuditAction::Extended)
        .count();
    assert_eq!(extended_entries, 1);
}

#[tokio::test]
async fn scenario_d_refund_credits_without_touching_accounts() {
    let p = platform();
    let user = advertiser_with(&p, 160).await;
    let PurchaseOutcome::Activated { account, .. } = p
        .orchestrator
        .initiate_purchase(&user, PurchaseMethod::Balance)
        .await
        .expect("purchase")
    else {
        panic!("balance purchase should activate");
    };
    let before = balance_of(&p, &user).await;

    p.orchestrator
        .refund_user(&p.admin, user.user_id, Money::from_major(25), "service issue")
        .await
        .expect("refund");

    assert_eq!(
        balance_of(&p, &user).await,
        before.checked_add(Money::from_major(25)).expect("sum")
    );
    let refunds = p
        .stores
        .audit
        .list_for_user(user.user_id, PageRequest::default())
        .await
        .expect("audit")
        .into_iter()
        .filter(|entry| entry.action == AuditAction::Refunded)
        .count();
    assert_eq!(refunds, 1);
    let unchanged = p
        .orchestrator
        .get_account(&user, account.id)
        .await
        .expect("account");
    assert_eq!(unchanged.status, account.status);
    assert_eq!(unchanged.expire_at, account.expire_at);
    assert_eq!(unchanged.version, account.version);
}

#[tokio::test]
async fn scenario_e_concurrent_pollers_activate_once() {
    let p = platform();
    let user = advertiser_with(&p, 0).await;
    let session = p
        .orchestrator
        .initiate_purchase(
            &user,
            PurchaseMethod::Crypto {
                pay_currency: "eth".to_string(),
            },
        )
        .await
        .expect("purchase")
        .session()
        .clone();
    let reference = session.external_reference().expect("reference").to_string();
    p.gateway.push_status(&reference, GatewayStatus::Confirming);
    p.gateway.push_status(&reference, GatewayStatus::Confirmed);

    let first = p.orchestrator.start_polling(session.id);
    let second = p.orchestrator.start_polling(session.id);
    for handle in [first, second] {
        let status = tokio::time::timeout(StdDuration::from_secs(30), handle)
            .await
            .expect("poller finished")
            .expect("join")
            .expect("poll");
        assert_eq!(status, PaymentSessionStatus::Confirmed);
    }

    assert_eq!(p.stores.accounts.snapshot().expect("accounts").len(), 1);
    let rental_rows = p
        .stores
        .ledger
        .entries_snapshot()
        .await
        .expect("entries")
        .into_iter()
        .filter(|tx| tx.user_id == user.user_id && tx.tx_type == TransactionType::Rental)
        .count();
    assert_eq!(rental_rows, 1);
    // crypto rentals are paid off-platform
    assert_eq!(balance_of(&p, &user).await, Money::ZERO);
}

#[tokio::test]
async fn recovery_loop_settles_sessions_after_restart() {
    let p = platform();
    let user = advertiser_with(&p, 0).await;
    let session = p
        .orchestrator
        .initiate_deposit(&user, Money::from_major(60), "usdt")
        .await
        .expect("deposit");
    let reference = session.external_reference().expect("reference").to_string();
    p.gateway.push_status(&reference, GatewayStatus::Finished);

    // the process that opened the session never polled it
    let restarted = build_orchestrator(
        &AppConfig::default_for_env(AppEnv::Test),
        p.stores.settlement_stores(),
        Arc::new(p.gateway.clone()),
        Arc::new(p.clock.clone()),
    )
    .expect("orchestrator");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = spawn_session_recovery_loop(
        restarted.poller(),
        StdDuration::from_millis(10),
        50,
        shutdown_rx,
    );
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    let _ = shutdown_tx.send(());
    let _ = handle.await;

    assert_eq!(balance_of(&p, &user).await, Money::from_major(60));
}

#[tokio::test]
async fn auto_renewal_and_expiry_through_the_sweep() {
    let p = platform();
    let renewing = advertiser_with(&p, 300).await;
    let lapsing = advertiser_with(&p, 150).await;

    let mut renewing_account = None;
    for user in [&renewing, &lapsing] {
        if let PurchaseOutcome::Activated { account, .. } = p
            .orchestrator
            .initiate_purchase(user, PurchaseMethod::Balance)
            .await
            .expect("purchase")
        {
            if user.user_id == renewing.user_id {
                renewing_account = Some(account);
            }
        }
    }
    let renewing_account = renewing_account.expect("renewing account");
    p.orchestrator
        .set_auto_renew(&renewing, renewing_account.id, true)
        .await
        .expect("auto renew on");
    let lapsing_account = p
        .orchestrator
        .list_accounts(&lapsing, lapsing.user_id)
        .await
        .expect("accounts")
        .remove(0);
    p.orchestrator
        .set_auto_renew(&lapsing, lapsing_account.id, false)
        .await
        .expect("auto renew off");

    p.clock.advance(Duration::days(31));
    let report = p
        .orchestrator
        .lifecycle()
        .expiry_sweep(p.clock.now())
        .await
        .expect("sweep");

    assert_eq!(report.renewed, vec![renewing_account.id]);
    assert_eq!(report.expired, vec![lapsing_account.id]);
    assert_eq!(balance_of(&p, &renewing).await, Money::ZERO);
    let renewed = p
        .orchestrator
        .get_account(&renewing, renewing_account.id)
        .await
        .expect("account");
    assert_eq!(renewed.status, AccountStatus::Active);
    assert!(renewed.expire_at > Some(p.clock.now()));

    let admin_view = p
        .orchestrator
        .get_account(&p.admin, lapsing_account.id)
        .await
        .expect("account");
    assert_eq!(admin_view.status, AccountStatus::Expired);
}
