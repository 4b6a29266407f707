use clap::Parser;
use roomcast::auth::{Claims, StaticTokenVerifier};
use roomcast::cli::Args;
use roomcast::cluster::{ClusterBridge, ClusterPublisher, Fabric, MqttConfig, MqttFabric};
use roomcast::config::DeliveryConfig;
use roomcast::repo::memory::{LoggingPushSink, MemoryStore};
use roomcast::repo::UserRepo;
use roomcast::ws::Hub;
use roomcast::{create_router, AppState};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// One entry in the dev-mode token file.
#[derive(Debug, Deserialize)]
struct TokenEntry {
    token: String,
    subject: String,
    email: String,
    preferred_name: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let instance_id = args.instance_id.unwrap_or_else(Uuid::new_v4);
    tracing::info!(instance_id = %instance_id, "starting delivery plane");

    // Dev-mode identity: a static token table loaded from disk.
    let mut verifier = StaticTokenVerifier::new();
    let mut entries: Vec<TokenEntry> = Vec::new();
    if let Some(path) = &args.tokens {
        let raw = std::fs::read_to_string(path).expect("failed to read token file");
        entries = serde_json::from_str(&raw).expect("invalid token file");
        for entry in &entries {
            verifier.insert(
                entry.token.clone(),
                Claims {
                    subject: entry.subject.clone(),
                    email: entry.email.clone(),
                    preferred_name: entry.preferred_name.clone(),
                },
            );
        }
        tracing::info!(count = entries.len(), "loaded dev tokens");
    } else {
        tracing::warn!("no token file specified - every upgrade will be rejected");
        tracing::warn!("use --tokens <file> to accept connections");
    }

    let store = Arc::new(MemoryStore::new());

    if args.demo {
        store.add_room(1, "lobby").await;
        for entry in &entries {
            let user = store
                .get_or_create_from_claims(&Claims {
                    subject: entry.subject.clone(),
                    email: entry.email.clone(),
                    preferred_name: entry.preferred_name.clone(),
                })
                .await
                .expect("failed to seed demo user");
            store.add_member(1, user.id).await;
        }
        tracing::info!("seeded demo room 1 (lobby)");
    }

    // With a broker the hub publishes everything it broadcasts and the
    // bridge re-injects what other instances publish.
    let hub = match &args.broker {
        Some(url) => {
            let fabric = MqttFabric::connect(MqttConfig {
                broker_url: url.clone(),
                client_id: instance_id.to_string(),
                ..Default::default()
            })
            .await
            .expect("failed to connect to the cluster broker");
            let fabric: Arc<dyn Fabric> = Arc::new(fabric);
            let hub = Arc::new(Hub::with_publisher(ClusterPublisher::new(
                fabric.clone(),
                instance_id,
            )));
            ClusterBridge::spawn(hub.clone(), fabric, instance_id);
            hub
        }
        None => {
            tracing::warn!("no broker specified - running as a single instance");
            Arc::new(Hub::new())
        }
    };

    let state = AppState {
        hub,
        verifier: Arc::new(verifier),
        users: store.clone(),
        members: store.clone(),
        messages: store,
        push: Arc::new(LoggingPushSink),
        config: DeliveryConfig::default(),
    };

    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .expect("invalid address");

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
