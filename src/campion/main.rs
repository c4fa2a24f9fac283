use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, Responder, web};
use clap::Parser;
use dashmap::DashMap;
use larkspur::duration_since_unix_epoch;
use larkspur::live_feeds::{UpstreamConfig, aggregate_live_vehicles};
use larkspur::models::{LiveVehiclesRequest, SourceState};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "CAMPION_BIND_ADDRESS", default_value = "127.0.0.1")]
    address: String,

    #[arg(long, env = "CAMPION_PORT", default_value_t = 8700)]
    port: u16,

    /// NJ Transit GTFS-realtime vehicle positions URL (protobuf).
    #[arg(long, env = "NJT_VEHICLE_POSITIONS_URL")]
    njt_vehicle_positions_url: String,

    /// Princeton TripShot live status URL (JSON).
    #[arg(long, env = "PRINCETON_STATUS_URL")]
    princeton_status_url: String,

    /// Upstream request timeout in seconds.
    #[arg(long, env = "CAMPION_UPSTREAM_TIMEOUT_SECS", default_value_t = 10)]
    upstream_timeout_secs: u64,
}

struct AppState {
    client: reqwest::Client,
    config: UpstreamConfig,
    /// Last seen state per agency, so upstream trouble logs once per
    /// transition instead of once per poll.
    source_states: DashMap<String, SourceState>,
}

async fn index() -> impl Responder {
    HttpResponse::Ok()
        .insert_header(("Content-Type", "text/plain"))
        .body("campion live vehicle aggregator")
}

#[actix_web::post("/api/live-vehicles")]
async fn live_vehicles(
    state: web::Data<Arc<AppState>>,
    body: web::Json<LiveVehiclesRequest>,
) -> impl Responder {
    let now = duration_since_unix_epoch().as_secs();
    let response =
        aggregate_live_vehicles(&state.client, &state.config, &body.route_keys, now).await;

    for status in &response.sources {
        let previous = state
            .source_states
            .insert(status.agency.clone(), status.state);
        if previous == Some(status.state) {
            continue;
        }
        match status.state {
            SourceState::Ok | SourceState::Skipped => {
                log::info!("upstream {} is now {:?}", status.agency, status.state);
            }
            SourceState::Error | SourceState::Unavailable => {
                log::warn!(
                    "upstream {} is now {:?}: {}",
                    status.agency,
                    status.state,
                    status.detail.as_deref().unwrap_or("no detail")
                );
            }
        }
    }

    HttpResponse::Ok().json(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.upstream_timeout_secs))
        .build()?;

    let state = Arc::new(AppState {
        client,
        config: UpstreamConfig {
            njt_vehicle_positions_url: args.njt_vehicle_positions_url,
            princeton_status_url: args.princeton_status_url,
        },
        source_states: DashMap::new(),
    });

    log::info!(
        "campion listening on {}:{}, polling njt + princeton upstreams on demand",
        args.address,
        args.port
    );

    HttpServer::new(move || {
        let cors = Cors::permissive();
        App::new()
            .wrap(cors)
            .app_data(web::Data::new(Arc::clone(&state)))
            .app_data(web::JsonConfig::default().limit(64 * 1024))
            .route("/", web::get().to(index))
            .service(live_vehicles)
    })
    .bind((args.address, args.port))?
    .run()
    .await?;

    Ok(())
}
