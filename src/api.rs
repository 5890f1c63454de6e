use crate::{
    network_stack::NetworkCredentials,
    restart::{RestartHandle, RestartReason},
    services::{firmware::FirmwareService, storage::ConfigStore},
};
use actix_multipart::form::{MultipartForm, MultipartFormConfig, tempfile::TempFile};
use actix_server::ServerHandle;
use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Responder,
    http::header::{self, ContentType},
    web::{self, Data},
};
use anyhow::{Context, Result};
use log::{debug, error, info};
use serde::Deserialize;
use serde_valid::Validate;
use std::{io, net::IpAddr, path::PathBuf, time::Duration};
use tokio::task::JoinHandle;

const SETUP_PAGE: &str = include_str!("setup.html");
const SAVED_PAGE: &str = "<p>Saved! Restarting...</p>";
const EMPTY_SSID_PAGE: &str = "<p>Error: SSID cannot be empty!</p>";
const NOT_FOUND: &str = "File Not Found";

/// Probe paths answered with the setup page
pub const FORM_PROBE_PATHS: [&str; 4] = [
    "/generate_204",
    "/hotspot-detect.html",
    "/library/test/success.html",
    "/kindle-wifi/wifistub.html",
];

/// Probe paths answered with the literal body the client expects
pub const SUCCESS_PROBE_PATHS: [(&str, &str); 3] = [
    ("/connecttest.txt", "Microsoft NCSI"),
    ("/ncsi.txt", "Microsoft NCSI"),
    ("/success.txt", "success"),
];

const UPLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;
const MEMORY_LIMIT_BYTES: usize = 1024 * 1024;

pub type ServerTask = JoinHandle<Result<(), io::Error>>;

/// Conversion of a successful service result into a response
pub trait ServiceResultResponse {
    fn into_response(self) -> HttpResponse;
}

impl ServiceResultResponse for () {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().finish()
    }
}

impl ServiceResultResponse for String {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().body(self)
    }
}

/// Static portal page served with caching disabled
pub struct PortalPage(pub &'static str);

impl ServiceResultResponse for PortalPage {
    fn into_response(self) -> HttpResponse {
        portal_response(HttpResponse::Ok(), ContentType::html(), self.0)
    }
}

/// 200 with the converted data, 500 with the error text otherwise
pub fn handle_service_result<T>(result: Result<T>, operation: &str) -> HttpResponse
where
    T: ServiceResultResponse,
{
    match result {
        Ok(data) => data.into_response(),
        Err(e) => {
            error!("{operation} failed: {e:#}");
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

fn portal_response(
    mut builder: actix_web::HttpResponseBuilder,
    content_type: ContentType,
    body: &'static str,
) -> HttpResponse {
    builder
        .content_type(content_type)
        .insert_header((header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"))
        .insert_header((header::PRAGMA, "no-cache"))
        .insert_header((header::EXPIRES, "-1"))
        .body(body)
}

#[derive(Debug, Deserialize)]
pub struct CredentialsForm {
    #[serde(default)]
    ssid: String,
    #[serde(default)]
    pass: String,
}

/// Captive portal served while the device hosts its own hub
#[derive(Clone)]
pub struct PortalApi {
    pub store: ConfigStore,
    pub restart: RestartHandle,
    pub hub_address: IpAddr,
    pub advertised_name: String,
    pub restart_grace: Duration,
}

impl PortalApi {
    pub fn new(
        store: ConfigStore,
        restart: RestartHandle,
        hub_address: IpAddr,
        advertised_name: impl Into<String>,
        restart_grace: Duration,
    ) -> Self {
        Self {
            store,
            restart,
            hub_address,
            advertised_name: advertised_name.into(),
            restart_grace,
        }
    }

    pub fn routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/", web::get().to(Self::index))
            .route("/save", web::post().to(Self::save));

        for path in FORM_PROBE_PATHS {
            cfg.route(path, web::get().to(Self::index));
        }

        for (path, body) in SUCCESS_PROBE_PATHS {
            cfg.route(
                path,
                web::get().to(move || async move {
                    portal_response(HttpResponse::Ok(), ContentType::plaintext(), body)
                }),
            );
        }

        cfg.default_service(web::to(Self::not_found));
    }

    pub async fn index() -> impl Responder {
        debug!("index() called");
        PortalPage(SETUP_PAGE).into_response()
    }

    pub async fn save(form: web::Form<CredentialsForm>, api: Data<Self>) -> impl Responder {
        let form = form.into_inner();
        debug!("save() called with ssid {:?}", form.ssid);

        let credentials = NetworkCredentials::new(form.ssid, form.pass);

        if let Err(e) = credentials.validate() {
            debug!("rejected credentials: {e}");
            return portal_response(
                HttpResponse::BadRequest(),
                ContentType::html(),
                EMPTY_SSID_PAGE,
            );
        }

        let result = api
            .store
            .save_credentials(&credentials)
            .map(|_| PortalPage(SAVED_PAGE));

        if result.is_ok() {
            info!("saved credentials for {}", credentials.ssid);
            api.restart
                .request_after(RestartReason::CredentialsSaved, api.restart_grace);
        }

        handle_service_result(result, "save")
    }

    pub async fn not_found(req: HttpRequest, api: Data<Self>) -> impl Responder {
        let host = req.connection_info().host().to_owned();
        debug!("not_found() called for {host}{}", req.path());

        if api.is_captive_portal_request(&host) {
            return PortalPage(SETUP_PAGE).into_response();
        }

        HttpResponse::NotFound()
            .content_type(ContentType::plaintext())
            .body(NOT_FOUND)
    }

    /// Whether `host` is a bare probe host name that should see the setup page
    pub fn is_captive_portal_request(&self, host: &str) -> bool {
        let host = host.split(':').next().unwrap_or_default();

        !host.is_empty()
            && host != self.hub_address.to_string()
            && host != self.advertised_name
            && !host.contains('.')
    }
}

#[derive(MultipartForm)]
pub struct UploadForm {
    file: TempFile,
}

/// Update delivery kept alive while the device is joined
#[derive(Clone)]
pub struct UpdateApi {
    pub update_file: PathBuf,
    pub restart: RestartHandle,
    pub restart_grace: Duration,
}

impl UpdateApi {
    pub fn new(
        update_file: impl Into<PathBuf>,
        restart: RestartHandle,
        restart_grace: Duration,
    ) -> Self {
        Self {
            update_file: update_file.into(),
            restart,
            restart_grace,
        }
    }

    pub fn routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/update", web::post().to(Self::upload));
    }

    pub async fn upload(
        MultipartForm(form): MultipartForm<UploadForm>,
        api: Data<Self>,
    ) -> impl Responder {
        debug!("upload() called");

        let result = FirmwareService::stage_update(form.file, &api.update_file);

        let reason = if result.is_ok() {
            RestartReason::UpdateInstalled
        } else {
            RestartReason::UpdateFault
        };
        api.restart.request_after(reason, api.restart_grace);

        handle_service_result(result.map(|size| format!("staged {size} bytes")), "upload")
    }
}

pub fn run_portal_server(api: PortalApi, port: u16) -> Result<(ServerHandle, ServerTask)> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(api.clone()))
            .configure(PortalApi::routes)
    })
    .workers(1)
    .bind(("0.0.0.0", port))
    .context("failed to bind portal server")?
    .disable_signals()
    .run();

    Ok((server.handle(), tokio::spawn(server)))
}

pub fn run_update_server(api: UpdateApi, port: u16) -> Result<(ServerHandle, ServerTask)> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(
                MultipartFormConfig::default()
                    .total_limit(UPLOAD_LIMIT_BYTES)
                    .memory_limit(MEMORY_LIMIT_BYTES),
            )
            .app_data(Data::new(api.clone()))
            .configure(UpdateApi::routes)
    })
    .workers(1)
    .bind(("0.0.0.0", port))
    .context("failed to bind update server")?
    .disable_signals()
    .run();

    Ok((server.handle(), tokio::spawn(server)))
}
