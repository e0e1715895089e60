pub mod broker;
pub mod config;
pub mod db;
pub mod dedupe;
pub mod error;
pub mod events;
pub mod fanout;
pub mod ingest;
pub mod models;
pub mod permission;
pub mod routes;
pub mod seq;
pub mod store;
pub mod webhook;

use broker::{BrokerTransport, HttpBroker};
use config::CoreConfig;
use db::Db;
use events::EventBus;
use fanout::UnreadLedger;
use ingest::Pipeline;
use rocket_cors::CorsOptions;
use std::env;
use std::sync::Arc;
use webhook::OnlineTracker;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let db_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "data/chat.db".to_string());
    rocket_with_db(&db_path)
}

pub fn rocket_with_db(db_path: &str) -> rocket::Rocket<rocket::Build> {
    build_rocket(db_path, CoreConfig::from_env(), None)
}

pub fn rocket_with_config(db_path: &str, config: CoreConfig) -> rocket::Rocket<rocket::Build> {
    build_rocket(db_path, config, None)
}

/// Plug a custom broker transport — tests use an in-memory one.
pub fn rocket_with_broker(
    db_path: &str,
    config: CoreConfig,
    broker: Arc<dyn BrokerTransport>,
) -> rocket::Rocket<rocket::Build> {
    build_rocket(db_path, config, Some(broker))
}

fn build_rocket(
    db_path: &str,
    config: CoreConfig,
    broker_override: Option<Arc<dyn BrokerTransport>>,
) -> rocket::Rocket<rocket::Build> {
    // Ensure data directory exists
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let db = Arc::new(Db::new(db_path));
    let events = EventBus::new();
    let ledger = Arc::new(UnreadLedger::default());
    let online = OnlineTracker::default();

    let broker: Arc<dyn BrokerTransport> =
        broker_override.unwrap_or_else(|| Arc::new(HttpBroker::new(&config)));

    // Subscribe the fan-out worker BEFORE handing the EventBus to the pipeline
    let fanout_receiver = events.sender.subscribe();

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&db),
        broker,
        events,
        config.clone(),
    ));
    let fanout_db_path = db_path.to_string();
    let fanout_ledger = Arc::clone(&ledger);
    let fanout_config = config.clone();

    let flush_db_path = db_path.to_string();
    let flush_ledger = Arc::clone(&ledger);
    let flush_interval = config.unread_flush_secs;

    let repair_db_path = db_path.to_string();
    let repair_config = config.clone();
    let repair_interval = config.repair_interval_secs;

    let maintenance_pipeline = Arc::clone(&pipeline);
    let maintenance_interval = config.maintenance_interval_secs;

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    rocket::build()
        .manage(db)
        .manage(pipeline)
        .manage(online)
        .manage(config)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![routes::not_found, routes::unprocessable],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::system_stats,
                routes::send_message,
                routes::batch_send,
                routes::recall_message,
                routes::forward_message,
                routes::retry_message,
                routes::mark_read,
                routes::get_message,
                routes::list_user_messages,
                routes::list_group_messages,
                routes::list_failed_messages,
                routes::history,
                routes::search_messages,
                routes::user_stats,
                routes::list_conversations,
                routes::update_conversation_settings,
                routes::create_group,
                routes::list_group_members,
                routes::list_friendships,
                routes::get_group,
                routes::add_group_member,
                routes::remove_group_member,
                routes::mute_group_member,
                routes::add_friend,
                routes::block_user,
                routes::unblock_user,
                routes::user_token,
                routes::broker_webhook,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Conversation Fan-out",
            move |_rocket| {
                Box::pin(async move {
                    fanout::spawn_fanout_worker(
                        fanout_receiver,
                        fanout_db_path,
                        fanout_ledger,
                        fanout_config,
                    );
                    println!("📨 Conversation fan-out worker started");
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Unread Reconciliation",
            move |_rocket| {
                Box::pin(async move {
                    fanout::spawn_unread_flush_task(flush_db_path, flush_ledger, flush_interval);
                    println!("🔄 Unread reconciliation task started");
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Conversation Repair",
            move |_rocket| {
                Box::pin(async move {
                    fanout::spawn_repair_task(repair_db_path, repair_config, repair_interval);
                    println!("🧹 Conversation repair task started");
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Engine Maintenance",
            move |_rocket| {
                Box::pin(async move {
                    ingest::spawn_maintenance(maintenance_pipeline, maintenance_interval);
                    println!("🧽 Dedupe/sequence maintenance task started");
                })
            },
        ))
}
