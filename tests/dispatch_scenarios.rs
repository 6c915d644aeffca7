// End-to-end dispatch and publish scenarios over a scripted transport

use std::sync::Arc;

use serde_json::{json, Map, Value};

use platform_dispatch::config::{AppConfig, PollingSettings};
use platform_dispatch::core::{ConnectionStatus, InMemoryConnectionStore, MediaKind};
use platform_dispatch::http::{ApiResponse, ScriptedTransport};
use platform_dispatch::media::MediaLibrary;
use platform_dispatch::{
    BatchDispatcher, BatchRequest, BatcherRegistry, ConnectionResolver, MediaAsset,
    PlatformConnection, PlatformType, PublishOptions, PublisherFactory,
};

fn connection(
    id: &str,
    platform: PlatformType,
    token: Option<&str>,
    account: Option<&str>,
    credentials: Value,
) -> PlatformConnection {
    let credentials = match credentials {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    PlatformConnection {
        id: id.into(),
        org_id: "org-1".into(),
        platform,
        access_token: token.map(str::to_string),
        account_id: account.map(str::to_string),
        credentials,
        status: ConnectionStatus::Active,
    }
}

fn resolver() -> ConnectionResolver {
    let store = InMemoryConnectionStore::with_connections([
        connection("google", PlatformType::Google, Some("tok"), Some("123-456-7890"), json!({})),
        connection("meta-no-token", PlatformType::Meta, None, Some("act_1"), json!({})),
        connection(
            "meta",
            PlatformType::Meta,
            Some("user-tok"),
            Some("act_1"),
            json!({"page_id": "p1", "page_access_token": "page-tok", "instagram_account_id": "ig1"}),
        ),
        connection("tiktok", PlatformType::TikTok, Some("tok"), Some("adv"), json!({})),
    ]);
    ConnectionResolver::new(Arc::new(store))
}

fn dispatcher(transport: Arc<ScriptedTransport>) -> BatchDispatcher {
    let mut config = AppConfig::default();
    config.throttle.enabled = false;
    config.google_ads.developer_token = Some("dev".into());
    BatchDispatcher::new(
        resolver(),
        Arc::new(BatcherRegistry::defaults(transport, &config)),
    )
}

fn factory(transport: Arc<ScriptedTransport>) -> PublisherFactory {
    let media = MediaLibrary::new(std::env::temp_dir(), None, transport.clone());
    PublisherFactory::new(resolver(), transport, media).with_polling(PollingSettings {
        interval_ms: Some(0),
        max_attempts: Some(2),
    })
}

#[tokio::test]
async fn google_mixed_batch_uses_one_call_per_group() {
    let transport = Arc::new(ScriptedTransport::new(|req| {
        if req.url.ends_with("googleAds:searchStream") {
            return Ok(ApiResponse::json_body(
                200,
                &json!([{"results": [
                    {"campaign": {"id": "1", "status": "ENABLED"}},
                    {"campaign": {"id": "2", "status": "PAUSED"}}
                ]}]),
            ));
        }
        assert!(req.url.ends_with("/adGroupAds:mutate"));
        Ok(ApiResponse::json_body(
            200,
            &json!({"results": [
                {"resourceName": "customers/1234567890/adGroupAds/1~1"},
                {"resourceName": "customers/1234567890/adGroupAds/1~2"}
            ]}),
        ))
    }));
    let requests = vec![
        BatchRequest::new("c1", "get_campaigns", json!({})),
        BatchRequest::new("u1", "update_ads", json!({"operation": {"update": {"status": "PAUSED"}}})),
        BatchRequest::new("c2", "get_campaigns", json!({"filters": {"campaign.status": "PAUSED"}})),
        BatchRequest::new("u2", "update_ads", json!({"operation": {"update": {"status": "ENABLED"}}})),
        BatchRequest::new("c3", "get_campaigns", json!({})),
    ];

    let results = dispatcher(transport.clone()).dispatch("google", &requests).await;

    assert_eq!(results.len(), 5);
    assert_eq!(
        results.ids().collect::<Vec<_>>(),
        requests.iter().map(|r| r.id.as_str()).collect::<Vec<_>>()
    );
    assert!(results.iter().all(|(_, r)| r.is_success()));
    assert_eq!(transport.calls_to("searchStream").len(), 1);
    assert_eq!(transport.calls_to(":mutate").len(), 1);
    assert_eq!(
        results.get("c2").unwrap().payload().unwrap()["get_campaigns"]
            .as_array()
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn missing_token_fails_closed_without_remote_calls() {
    let transport = Arc::new(ScriptedTransport::unreachable());
    let requests = vec![
        BatchRequest::new("a", "get_campaigns", json!({})),
        BatchRequest::new("b", "update_ads", json!({"entity_id": "1", "updates": {"status": "PAUSED"}})),
    ];

    let results = dispatcher(transport.clone())
        .dispatch("meta-no-token", &requests)
        .await;

    assert_eq!(results.ids().collect::<Vec<_>>(), vec!["a", "b"]);
    assert!(results.iter().all(|(_, r)| !r.is_success()));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn every_submitted_id_gets_exactly_one_entry() {
    let transport = Arc::new(ScriptedTransport::new(|_| {
        Ok(ApiResponse::json_body(500, &json!({"error": {"message": "backend down"}})))
    }));
    let requests = vec![
        BatchRequest::new("x", "get_campaigns", json!({})),
        BatchRequest::new("y", "get_insights", json!({})),
        BatchRequest::new("z", "not_a_real_type", json!({})),
    ];

    let results = dispatcher(transport).dispatch("meta", &requests).await;

    assert_eq!(results.ids().collect::<Vec<_>>(), vec!["x", "y", "z"]);
    assert_eq!(
        results.get("x").unwrap().error().unwrap().error,
        "backend down"
    );
}

#[tokio::test]
async fn tiktok_without_media_makes_no_calls() {
    let transport = Arc::new(ScriptedTransport::unreachable());
    let result = factory(transport.clone())
        .publish("tiktok", "org-1", "caption", &[], &PublishOptions::default())
        .await;

    assert!(!result.success);
    assert!(result.message.unwrap().contains("requires a video"));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn facebook_single_photo_publish() {
    let transport = Arc::new(ScriptedTransport::new(|req| {
        if req.url.ends_with("/p1/photos") {
            assert_eq!(req.header_value("Authorization"), Some("Bearer page-tok"));
            assert_eq!(req.form_value("url"), Some("https://cdn.test/a.jpg"));
            return Ok(ApiResponse::json_body(200, &json!({"id": "ph1", "post_id": "p1_9"})));
        }
        Ok(ApiResponse::json_body(
            200,
            &json!({"permalink_url": "https://facebook.com/p1/posts/9"}),
        ))
    }));
    let media = [MediaAsset::image_url("https://cdn.test/a.jpg")];
    let result = factory(transport.clone())
        .publish("facebook", "org-1", "New menu", &media, &PublishOptions::default())
        .await;

    assert!(result.success, "{:?}", result.message);
    assert_eq!(result.post_id.as_deref(), Some("p1_9"));
    assert_eq!(
        result.permalink.as_deref(),
        Some("https://facebook.com/p1/posts/9")
    );
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn instagram_container_timeout_never_publishes() {
    let transport = Arc::new(ScriptedTransport::new(|req| {
        if req.url.ends_with("/ig1/media") {
            return Ok(ApiResponse::json_body(200, &json!({"id": "c1"})));
        }
        Ok(ApiResponse::json_body(200, &json!({"status_code": "IN_PROGRESS"})))
    }));
    let media = [MediaAsset::image_url("https://cdn.test/a.jpg")];
    let result = factory(transport.clone())
        .publish("instagram", "org-1", "caption", &media, &PublishOptions::default())
        .await;

    assert!(!result.success);
    assert!(transport.calls_to("media_publish").is_empty());
    // configured override: two status checks
    assert_eq!(transport.calls_to("/c1").len(), 2);
}

#[tokio::test]
async fn stored_media_without_public_url_is_a_configuration_failure() {
    let transport = Arc::new(ScriptedTransport::unreachable());
    let media = [MediaAsset::stored(MediaKind::Image, "org-1/a.jpg")];
    let result = factory(transport.clone())
        .publish("instagram", "org-1", "caption", &media, &PublishOptions::default())
        .await;

    assert!(!result.success);
    assert!(result.message.unwrap().contains("public base URL"));
    assert_eq!(transport.call_count(), 0);
}
