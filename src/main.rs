mod auth;
mod backend;
mod channel;
mod config;
mod error;
mod messages;
mod presence;
mod relay;
mod room;
mod server;
mod session;

use std::error::Error as StdError;
use std::sync::Arc;
use log::{error, info};

use auth::TokenAuthenticator;
use backend::{MemoryBackend, Profile};
use channel::{LocalChannel, RedisChannel, RoomChannel};
use config::Config;
use presence::{MemoryPresenceStore, PresenceCoordinator, PresenceStore, RedisPresenceStore};
use relay::MessageRelay;
use server::Server;
use session::SessionContext;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

async fn connect_redis(url: &str) -> Result<(Arc<dyn PresenceStore>, Arc<dyn RoomChannel>), BoxError> {
    let client = redis::Client::open(url)?;
    let store = RedisPresenceStore::connect(&client).await?;
    let channel = RedisChannel::connect(client).await?;
    Ok((Arc::new(store), Arc::new(channel)))
}

async fn seed(config: &Config, backend: &MemoryBackend, auth: &TokenAuthenticator) {
    for (id, name) in &config.dev_rooms {
        backend.add_room(*id, name).await;
        info!("Seeded room {} ({})", id, name);
    }
    for (id, username) in &config.dev_users {
        backend
            .add_profile(Profile {
                id: *id,
                username: username.clone(),
                avatar: None,
            })
            .await;
        let token = auth.issue(*id).await;
        info!("Seeded user {} ({}), token {}", id, username, token);
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let (store, channel): (Arc<dyn PresenceStore>, Arc<dyn RoomChannel>) = match &config.redis_url {
        Some(url) => match connect_redis(url).await {
            Ok(parts) => {
                info!("Presence and fan-out backed by Redis");
                parts
            }
            Err(e) => {
                error!("Failed to connect to Redis: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("CHAT_REDIS_URL not set; presence and fan-out are local to this process");
            (Arc::new(MemoryPresenceStore::new()), Arc::new(LocalChannel::new()))
        }
    };

    let backend = Arc::new(MemoryBackend::new());
    let auth = Arc::new(TokenAuthenticator::new());
    seed(&config, &backend, &auth).await;

    let presence = Arc::new(PresenceCoordinator::new(
        store,
        backend.clone(),
        channel.clone(),
        config.heartbeat_ttl,
    ));
    let relay = Arc::new(MessageRelay::new(backend.clone(), backend.clone(), channel.clone()));
    let ctx = SessionContext {
        presence,
        relay,
        channel,
    };
    let server = Server::new(ctx, backend.clone(), backend, auth);
    let routes = server::routes(server, config.static_dir.clone());

    if config.tls_enabled() {
        info!("Starting secure server (HTTPS/WSS) on {}", config.bind_addr);
        warp::serve(routes)
            .tls()
            .cert_path(&config.tls_cert)
            .key_path(&config.tls_key)
            .run(config.bind_addr)
            .await;
    } else {
        info!("No TLS certificate found, serving HTTP/WS on {}", config.bind_addr);
        warp::serve(routes).run(config.bind_addr).await;
    }
}
