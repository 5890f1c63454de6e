use actix_web::{App, http::StatusCode, test, web};
use device_link::{
    api::PortalApi,
    diagnostics::Diagnostics,
    restart::{RestartHandle, RestartReason, RestartReceiver},
    services::storage::{CREDENTIALS_PATH, ConfigStore},
};
use serde_json::json;
use std::{
    fs,
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};
use tempfile::TempDir;

struct Portal {
    dir: TempDir,
    api: PortalApi,
    restart_rx: RestartReceiver,
}

fn create_portal() -> Portal {
    let dir = TempDir::new().expect("failed to create temp directory");
    let (diagnostics, _) = Diagnostics::channel();
    let (restart, restart_rx) = RestartHandle::channel();

    let api = PortalApi::new(
        ConfigStore::new(dir.path(), diagnostics),
        restart,
        IpAddr::V4(Ipv4Addr::new(192, 168, 4, 1)),
        "lamp.local",
        Duration::from_millis(10),
    );

    Portal {
        dir,
        api,
        restart_rx,
    }
}

async fn call(api: PortalApi, req: test::TestRequest) -> (StatusCode, String) {
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(api))
            .configure(PortalApi::routes),
    )
    .await;

    let resp = test::call_service(&app, req.to_request()).await;
    let status = resp.status();
    let body = test::read_body(resp).await;

    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn index_serves_setup_form() {
    let portal = create_portal();
    let (status, body) = call(portal.api, test::TestRequest::get().uri("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#"action="/save""#));
    assert!(body.contains(r#"name="ssid""#));
    assert!(body.contains(r#"name="pass""#));
}

#[tokio::test]
async fn form_probe_paths_serve_setup_form() {
    for path in ["/generate_204", "/hotspot-detect.html", "/kindle-wifi/wifistub.html"] {
        let portal = create_portal();
        let (status, body) = call(portal.api, test::TestRequest::get().uri(path)).await;

        assert_eq!(status, StatusCode::OK, "{path}");
        assert!(body.contains(r#"action="/save""#), "{path}");
    }
}

#[tokio::test]
async fn success_probe_paths_serve_literal_bodies() {
    for (path, expected) in [
        ("/connecttest.txt", "Microsoft NCSI"),
        ("/ncsi.txt", "Microsoft NCSI"),
        ("/success.txt", "success"),
    ] {
        let portal = create_portal();
        let (status, body) = call(portal.api, test::TestRequest::get().uri(path)).await;

        assert_eq!(status, StatusCode::OK, "{path}");
        assert_eq!(body, expected);
    }
}

#[tokio::test]
async fn save_persists_credentials_and_schedules_restart() {
    let mut portal = create_portal();

    let (status, body) = call(
        portal.api.clone(),
        test::TestRequest::post()
            .uri("/save")
            .set_form(vec![("ssid", "home"), ("pass", "secret1")]),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<p>Saved! Restarting...</p>");

    let content = fs::read_to_string(portal.api.store.resolve(CREDENTIALS_PATH))
        .expect("credentials should be persisted");
    let value: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(value, json!({"ssid": "home", "pass": "secret1"}));

    let reason = tokio::time::timeout(Duration::from_secs(5), portal.restart_rx.recv())
        .await
        .expect("restart should be requested");
    assert_eq!(reason, Some(RestartReason::CredentialsSaved));
}

#[tokio::test]
async fn save_with_empty_ssid_is_rejected() {
    let mut portal = create_portal();

    let (status, body) = call(
        portal.api.clone(),
        test::TestRequest::post()
            .uri("/save")
            .set_form(vec![("ssid", ""), ("pass", "secret1")]),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "<p>Error: SSID cannot be empty!</p>");
    assert!(!portal.dir.path().join("wifi_config.json").exists());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(portal.restart_rx.try_recv().is_err());
}

#[tokio::test]
async fn save_failure_does_not_restart() {
    let mut portal = create_portal();
    fs::remove_dir_all(portal.dir.path()).unwrap();

    let (status, _) = call(
        portal.api.clone(),
        test::TestRequest::post()
            .uri("/save")
            .set_form(vec![("ssid", "home"), ("pass", "secret1")]),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(portal.restart_rx.try_recv().is_err());
}

#[tokio::test]
async fn bare_host_probe_is_redirected_to_form() {
    let portal = create_portal();
    let (status, body) = call(
        portal.api,
        test::TestRequest::get()
            .uri("/some/probe")
            .insert_header(("host", "connectivitycheck")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#"action="/save""#));
}

#[tokio::test]
async fn unmatched_path_on_own_address_is_not_found() {
    let portal = create_portal();
    let (status, body) = call(
        portal.api,
        test::TestRequest::get()
            .uri("/missing")
            .insert_header(("host", "192.168.4.1")),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "File Not Found");
}
