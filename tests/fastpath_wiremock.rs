use std::collections::BTreeMap;

use anyhow::Result;
use rollcall::fastpath::{FastPathClient, FastResult};
use rollcall::models::{CheckinStatus, SessionAuth, SiteState};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn site_for(server_uri: &str) -> SiteState {
    SiteState {
        domain: server_uri.trim_end_matches('/').to_string(),
        name: "Test Site".to_string(),
        client_id: Some("cid".to_string()),
        checkin_path: "/api/user/checkin".to_string(),
        alive: None,
        needs_waf: false,
        has_waf: None,
        version: None,
        checkin_enabled: Some(true),
        min_trust_level: None,
        skip: false,
        skip_reason: None,
        removed: false,
        accounts: BTreeMap::new(),
    }
}

async fn mount_valid_whoami(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/user/self"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"success":true,"data":{"id":7,"username":"alice"}}"#,
            "application/json",
        ))
        .mount(server)
        .await;
}

#[tokio::test]
async fn valid_session_with_already_message_classifies_already_checked() -> Result<()> {
    let server = MockServer::start().await;
    mount_valid_whoami(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/user/checkin"))
        .and(header("cookie", "session=cached-token"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"success":false,"message":"already checked in today"}"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    let client = FastPathClient::new("session")?;
    let result = client
        .validate_and_checkin(&site_for(&server.uri()), &SessionAuth::new("cached-token"), None)
        .await;

    match result {
        FastResult::Outcome { status, message } => {
            assert_eq!(status, CheckinStatus::AlreadyChecked);
            assert_eq!(message, "already checked in today");
        }
        other => panic!("expected outcome, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn explicit_success_flag_wins() -> Result<()> {
    let server = MockServer::start().await;
    mount_valid_whoami(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/user/checkin"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"success":true,"message":"got 25 quota","data":{"quota":25}}"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    let client = FastPathClient::new("session")?;
    let result = client
        .validate_and_checkin(&site_for(&server.uri()), &SessionAuth::new("tok"), None)
        .await;

    match result {
        FastResult::Outcome { status, message } => {
            assert_eq!(status, CheckinStatus::Success);
            assert_eq!(message, "got 25 quota");
        }
        other => panic!("expected outcome, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn html_where_json_expected_is_expired() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/user/self"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "<html><body>please log in</body></html>",
            "text/html; charset=utf-8",
        ))
        .mount(&server)
        .await;

    let client = FastPathClient::new("session")?;
    let result = client
        .validate_and_checkin(&site_for(&server.uri()), &SessionAuth::new("tok"), None)
        .await;

    assert!(matches!(result, FastResult::Expired { .. }), "{result:?}");
    Ok(())
}

#[tokio::test]
async fn unauthorized_is_expired() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/user/self"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = FastPathClient::new("session")?;
    let result = client
        .validate_and_checkin(&site_for(&server.uri()), &SessionAuth::new("tok"), None)
        .await;

    assert!(matches!(result, FastResult::Expired { .. }), "{result:?}");
    Ok(())
}

#[tokio::test]
async fn redirect_to_login_is_expired_not_followed() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/user/self"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/login"))
        .mount(&server)
        .await;

    let client = FastPathClient::new("session")?;
    let result = client
        .validate_and_checkin(&site_for(&server.uri()), &SessionAuth::new("tok"), None)
        .await;

    assert!(matches!(result, FastResult::Expired { .. }), "{result:?}");
    Ok(())
}

#[tokio::test]
async fn rejected_envelope_is_expired() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/user/self"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"success":false,"message":"not logged in"}"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    let client = FastPathClient::new("session")?;
    let result = client
        .validate_and_checkin(&site_for(&server.uri()), &SessionAuth::new("tok"), None)
        .await;

    match result {
        FastResult::Expired { reason } => assert!(reason.contains("not logged in")),
        other => panic!("expected expired, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn connection_refused_is_unreachable() -> Result<()> {
    // Bind a server, remember its address, then shut it down so the port
    // refuses connections.
    let uri = {
        let server = MockServer::start().await;
        server.uri()
    };

    let client = FastPathClient::new("session")?;
    let result = client
        .validate_and_checkin(&site_for(&uri), &SessionAuth::new("tok"), None)
        .await;

    assert!(matches!(result, FastResult::Unreachable { .. }), "{result:?}");
    Ok(())
}

#[tokio::test]
async fn post_404_retries_with_get() -> Result<()> {
    let server = MockServer::start().await;
    mount_valid_whoami(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/user/checkin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/user/checkin"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"success":true,"message":"checked in via GET"}"#,
            "application/json",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = FastPathClient::new("session")?;
    let result = client
        .validate_and_checkin(&site_for(&server.uri()), &SessionAuth::new("tok"), None)
        .await;

    match result {
        FastResult::Outcome { status, message } => {
            assert_eq!(status, CheckinStatus::Success);
            assert_eq!(message, "checked in via GET");
        }
        other => panic!("expected outcome, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn unknown_failure_message_kept_verbatim() -> Result<()> {
    let server = MockServer::start().await;
    mount_valid_whoami(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/user/checkin"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"success":false,"message":"trust level too low"}"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    let client = FastPathClient::new("session")?;
    let result = client
        .validate_and_checkin(&site_for(&server.uri()), &SessionAuth::new("tok"), None)
        .await;

    match result {
        FastResult::Outcome { status, message } => {
            assert_eq!(status, CheckinStatus::Failed);
            assert_eq!(message, "trust level too low");
        }
        other => panic!("expected outcome, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn bearer_token_preferred_over_user_id_header() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/user/self"))
        .and(header("authorization", "Bearer tok-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"success":true,"data":{}}"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/user/checkin"))
        .and(header("authorization", "Bearer tok-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"success":true,"message":"ok"}"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    let auth = SessionAuth::new("cookie-value")
        .with_user_id("7")
        .with_access_token("tok-abc");

    let client = FastPathClient::new("session")?;
    let result = client
        .validate_and_checkin(&site_for(&server.uri()), &auth, None)
        .await;

    assert!(
        matches!(
            result,
            FastResult::Outcome {
                status: CheckinStatus::Success,
                ..
            }
        ),
        "{result:?}"
    );
    Ok(())
}

#[tokio::test]
async fn probe_reads_status_endpoint() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/status"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"success":true,"data":{
                "linuxdo_client_id":"cid-42",
                "system_name":"Example Hub",
                "version":"v1.9.0",
                "checkin_enabled":true,
                "min_trust_level":2
            }}"#,
            "application/json",
        ))
        .mount(&server)
        .await;

    let client = FastPathClient::new("session")?;
    let probe = client.probe(&server.uri()).await.expect("probe result");

    assert_eq!(probe.client_id.as_deref(), Some("cid-42"));
    assert_eq!(probe.system_name.as_deref(), Some("Example Hub"));
    assert_eq!(probe.checkin_enabled, Some(true));
    assert_eq!(probe.min_trust_level, Some(2));
    Ok(())
}

#[tokio::test]
async fn probe_failure_is_silent() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/status"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = FastPathClient::new("session")?;
    assert!(client.probe(&server.uri()).await.is_none());
    Ok(())
}
