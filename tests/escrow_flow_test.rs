mod common;

use common::*;
use marketplace_escrow::application::webhook::WebhookOutcome;
use marketplace_escrow::domain::escrow::{EscrowStatus, FeePayer};
use marketplace_escrow::domain::gateway::PaymentAction;
use marketplace_escrow::domain::ports::EscrowStore;
use marketplace_escrow::error::PaymentError;
use rust_decimal_macros::dec;
use serde_json::json;

#[tokio::test]
async fn test_checkout_to_completion_credits_seller() {
    let h = Harness::new(vec![stripe_config()]).await;
    h.stripe_intent("pi_1");

    let checkout = h
        .escrow
        .checkout(checkout_request(Some("stripe"), FeePayer::Seller))
        .await
        .unwrap();
    assert_eq!(checkout.status, EscrowStatus::PaymentProcessing);
    assert_eq!(checkout.breakdown.platform_fee_amount, dec!(10));
    assert_eq!(checkout.breakdown.gateway_fee_amount, dec!(3.78));
    assert_eq!(checkout.breakdown.total_amount, dec!(120));
    assert!(checkout.breakdown.is_conserved());
    assert_eq!(
        checkout.payment.action,
        PaymentAction::ClientSecret("pi_1_secret_abc".to_string())
    );

    let sent = h.transport.requests_to("/v1/payment_intents");
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].header_value("Idempotency-Key"),
        Some(checkout.transaction_id.to_string().as_str())
    );

    let id = checkout.transaction_id;
    let body = stripe_payment_succeeded(id, "pi_1", 12000);
    let response = h.webhooks.handle("stripe", &body, &stripe_headers(&body)).await;
    assert_eq!(response.status, 200);
    assert!(matches!(
        response.outcome,
        Some(WebhookOutcome::Applied { ref status, .. }) if status == "funds_held"
    ));

    let txn = h.escrow.get(id).await.unwrap();
    assert_eq!(txn.status(), EscrowStatus::FundsHeld);
    assert!(txn.fulfillment.product_marked_sold);
    assert!(txn.fulfillment.order_id.is_some());
    assert_eq!(h.catalog.sold_by(PRODUCT).await, Some(id));
    assert_eq!(h.orders.inner.order_count().await, 1);
    // Nothing is released while funds are held.
    assert_eq!(h.seller_balance().await, dec!(0));

    h.escrow
        .mark_shipped(id, SELLER, "UPS", "1Z999AA10123456784")
        .await
        .unwrap();
    let txn = h.escrow.confirm_delivery(id, BUYER).await.unwrap();
    assert_eq!(txn.status(), EscrowStatus::Completed);
    assert!(txn.fulfillment.seller_credited);
    assert_eq!(h.seller_balance().await, dec!(96.22));

    let history: Vec<_> = txn.status_history().iter().map(|c| c.status).collect();
    assert_eq!(
        history,
        vec![
            EscrowStatus::PendingPayment,
            EscrowStatus::PaymentProcessing,
            EscrowStatus::FundsHeld,
            EscrowStatus::Shipped,
            EscrowStatus::Completed,
        ]
    );

    let view = h.escrow.status(id).await.unwrap();
    assert_eq!(view.status, EscrowStatus::Completed);
    assert_eq!(view.history.len(), 5);
}

#[tokio::test]
async fn test_buyer_pays_gateway_fee() {
    let h = Harness::new(vec![stripe_config()]).await;
    h.stripe_intent("pi_2");

    let checkout = h
        .escrow
        .checkout(checkout_request(Some("stripe"), FeePayer::Buyer))
        .await
        .unwrap();
    assert_eq!(checkout.breakdown.total_amount, dec!(123.78));
    assert_eq!(checkout.payment.charged.amount, dec!(123.78));

    let id = checkout.transaction_id;
    let body = stripe_payment_succeeded(id, "pi_2", 12378);
    assert_eq!(
        h.webhooks.handle("stripe", &body, &stripe_headers(&body)).await.status,
        200
    );
    h.escrow.mark_shipped(id, SELLER, "DHL", "JD0002").await.unwrap();
    h.escrow.confirm_delivery(id, BUYER).await.unwrap();
    assert_eq!(h.seller_balance().await, dec!(100));
}

#[tokio::test]
async fn test_gateway_outage_marks_payment_failed() {
    let h = Harness::new(vec![stripe_config()]).await;
    h.transport.respond(
        "/v1/payment_intents",
        503,
        json!({"error": {"message": "upstream unavailable"}}),
    );

    let err = h
        .escrow
        .checkout(checkout_request(Some("stripe"), FeePayer::Seller))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::GatewayUnavailable { .. }));

    let all = h.escrow_store.all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status(), EscrowStatus::PaymentFailed);

    let stats = h.registry.stats("stripe").await.unwrap();
    assert_eq!(stats.failed_transactions, 1);
    assert_eq!(stats.successful_transactions, 0);
}

#[tokio::test]
async fn test_seller_cannot_buy_own_product() {
    let h = Harness::new(vec![stripe_config()]).await;
    let mut req = checkout_request(Some("stripe"), FeePayer::Seller);
    req.buyer_id = SELLER.to_string();
    assert!(matches!(
        h.escrow.checkout(req).await,
        Err(PaymentError::ValidationError(_))
    ));
    assert!(h.transport.requests().is_empty());
}

#[tokio::test]
async fn test_only_parties_drive_transitions() {
    let h = Harness::new(vec![stripe_config()]).await;
    h.stripe_intent("pi_3");
    let id = h
        .escrow
        .checkout(checkout_request(Some("stripe"), FeePayer::Seller))
        .await
        .unwrap()
        .transaction_id;

    // Shipping before the funds are held is an invalid transition.
    assert!(matches!(
        h.escrow.mark_shipped(id, SELLER, "UPS", "1Z").await,
        Err(PaymentError::InvalidTransition { .. })
    ));

    let body = stripe_payment_succeeded(id, "pi_3", 12000);
    h.webhooks.handle("stripe", &body, &stripe_headers(&body)).await;

    assert!(h.escrow.mark_shipped(id, BUYER, "UPS", "1Z").await.is_err());
    assert!(h.escrow.mark_shipped(id, SELLER, "UPS", " ").await.is_err());
    h.escrow.mark_shipped(id, SELLER, "UPS", "1Z").await.unwrap();
    assert!(h.escrow.confirm_delivery(id, SELLER).await.is_err());
    assert_eq!(h.escrow.get(id).await.unwrap().status(), EscrowStatus::Shipped);
}

#[tokio::test]
async fn test_refund_of_held_funds() {
    let h = Harness::new(vec![stripe_config()]).await;
    h.stripe_intent("pi_4");
    h.transport
        .respond("/v1/refunds", 200, json!({"id": "re_1", "status": "succeeded"}));
    let id = h
        .escrow
        .checkout(checkout_request(Some("stripe"), FeePayer::Seller))
        .await
        .unwrap()
        .transaction_id;
    let body = stripe_payment_succeeded(id, "pi_4", 12000);
    h.webhooks.handle("stripe", &body, &stripe_headers(&body)).await;

    let txn = h.escrow.refund(id, "item lost").await.unwrap();
    assert_eq!(txn.status(), EscrowStatus::Refunded);
    assert_eq!(h.seller_balance().await, dec!(0));

    let refunds = h.transport.requests_to("/v1/refunds");
    assert_eq!(refunds.len(), 1);
    assert_eq!(
        refunds[0].header_value("Idempotency-Key"),
        Some(format!("refund_{id}").as_str())
    );

    // A refunded transaction cannot be refunded again.
    assert!(matches!(
        h.escrow.refund(id, "again").await,
        Err(PaymentError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_dispute_released_to_seller() {
    use marketplace_escrow::application::escrow::DisputeResolution;

    let h = Harness::new(vec![stripe_config()]).await;
    h.stripe_intent("pi_5");
    let id = h
        .escrow
        .checkout(checkout_request(Some("stripe"), FeePayer::Seller))
        .await
        .unwrap()
        .transaction_id;
    let body = stripe_payment_succeeded(id, "pi_5", 12000);
    h.webhooks.handle("stripe", &body, &stripe_headers(&body)).await;
    h.escrow.mark_shipped(id, SELLER, "UPS", "1Z").await.unwrap();

    assert!(h.escrow.raise_dispute(id, "stranger", "spam").await.is_err());
    let txn = h.escrow.raise_dispute(id, BUYER, "not as described").await.unwrap();
    assert_eq!(txn.status(), EscrowStatus::Disputed);

    let txn = h
        .escrow
        .resolve_dispute(id, DisputeResolution::Release, "photos match listing")
        .await
        .unwrap();
    assert_eq!(txn.status(), EscrowStatus::Completed);
    assert_eq!(h.seller_balance().await, dec!(96.22));
}

#[tokio::test]
async fn test_unpaid_dispute_cannot_be_released() {
    use marketplace_escrow::application::escrow::DisputeResolution;

    let h = Harness::new(vec![stripe_config()]).await;
    h.stripe_intent("pi_u1");
    let id = h
        .escrow
        .checkout(checkout_request(Some("stripe"), FeePayer::Seller))
        .await
        .unwrap()
        .transaction_id;
    h.escrow.raise_dispute(id, SELLER, "buyer went quiet").await.unwrap();

    assert!(matches!(
        h.escrow
            .resolve_dispute(id, DisputeResolution::Release, "seller asked")
            .await,
        Err(PaymentError::ValidationError(_))
    ));
    assert_eq!(h.escrow.get(id).await.unwrap().status(), EscrowStatus::Disputed);
    assert_eq!(h.seller_balance().await, dec!(0));

    // Nothing was charged, so the refund path closes it without the provider.
    let txn = h
        .escrow
        .resolve_dispute(id, DisputeResolution::Refund, "never paid")
        .await
        .unwrap();
    assert_eq!(txn.status(), EscrowStatus::Cancelled);
    assert!(h.transport.requests_to("/v1/refunds").is_empty());
    assert_eq!(h.seller_balance().await, dec!(0));
}

#[tokio::test]
async fn test_payment_landing_during_dispute_allows_release() {
    use marketplace_escrow::application::escrow::DisputeResolution;

    let h = Harness::new(vec![stripe_config()]).await;
    h.stripe_intent("pi_u2");
    let id = h
        .escrow
        .checkout(checkout_request(Some("stripe"), FeePayer::Seller))
        .await
        .unwrap()
        .transaction_id;
    h.escrow.raise_dispute(id, BUYER, "slow seller").await.unwrap();

    let body = stripe_payment_succeeded(id, "pi_u2", 12000);
    let response = h.webhooks.handle("stripe", &body, &stripe_headers(&body)).await;
    assert_eq!(response.status, 200);
    assert!(matches!(
        response.outcome,
        Some(WebhookOutcome::Applied { ref status, .. }) if status == "disputed"
    ));
    let txn = h.escrow.get(id).await.unwrap();
    assert_eq!(txn.status(), EscrowStatus::Disputed);
    assert!(txn.funds_received());

    // A redelivery changes nothing.
    let again = h.webhooks.handle("stripe", &body, &stripe_headers(&body)).await;
    assert!(matches!(again.outcome, Some(WebhookOutcome::Duplicate { .. })));

    let txn = h
        .escrow
        .resolve_dispute(id, DisputeResolution::Release, "resolved in chat")
        .await
        .unwrap();
    assert_eq!(txn.status(), EscrowStatus::Completed);
    assert!(txn.fulfillment.seller_credited);
    assert!(txn.fulfillment.order_id.is_some());
    assert_eq!(h.catalog.sold_by(PRODUCT).await, Some(id));
    assert_eq!(h.seller_balance().await, dec!(96.22));
}

#[tokio::test]
async fn test_cancel_only_before_payment_starts() {
    let h = Harness::new(vec![stripe_config()]).await;
    h.stripe_intent("pi_6");
    let id = h
        .escrow
        .checkout(checkout_request(Some("stripe"), FeePayer::Seller))
        .await
        .unwrap()
        .transaction_id;
    assert!(matches!(
        h.escrow.cancel(id, BUYER).await,
        Err(PaymentError::ValidationError(_))
    ));
    assert_eq!(
        h.escrow.get(id).await.unwrap().status(),
        EscrowStatus::PaymentProcessing
    );
}

#[tokio::test]
async fn test_auto_confirmation_after_timeout() {
    let h = Harness::new(vec![stripe_config()]).await;
    h.stripe_intent("pi_7");
    let id = h
        .escrow
        .checkout(checkout_request(Some("stripe"), FeePayer::Seller))
        .await
        .unwrap()
        .transaction_id;
    let body = stripe_payment_succeeded(id, "pi_7", 12000);
    h.webhooks.handle("stripe", &body, &stripe_headers(&body)).await;
    h.escrow.mark_shipped(id, SELLER, "UPS", "1Z").await.unwrap();

    let txn = h.escrow.auto_confirm_delivery(id).await.unwrap();
    assert_eq!(txn.status(), EscrowStatus::Completed);
    assert_eq!(h.seller_balance().await, dec!(96.22));

    // Completing twice does not credit twice.
    assert!(h.escrow.auto_confirm_delivery(id).await.is_err());
    assert_eq!(h.seller_balance().await, dec!(96.22));
}
