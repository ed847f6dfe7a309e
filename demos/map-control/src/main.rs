use std::path::PathBuf;

use mapcast::prelude::*;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

struct Settings {
    host: String,
    map_port: u16,
    control_port: u16,
    client_dir: PathBuf,
}

impl Settings {
    /// Reads settings through `var`, falling back to the defaults for
    /// anything unset or unparsable.
    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let port = |key: &str, default: u16| {
            var(key).and_then(|raw| raw.parse().ok()).unwrap_or(default)
        };
        Self {
            host: var("MAPCAST_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            map_port: port("MAPCAST_MAP_PORT", 8080),
            control_port: port("MAPCAST_CONTROL_PORT", 8081),
            client_dir: var("MAPCAST_CLIENT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./client")),
        }
    }

    fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn instance(&self, name: &str, port: u16) -> ServerConfig {
        ServerConfig::new(name)
            .host(self.host.clone())
            .port(port)
            .assets_dir(self.client_dir.join("maps"))
    }

    fn index_of(&self, name: &str) -> FileSource {
        FileSource::on_disk(self.client_dir.join(name).join("index.html"))
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Greets every new peer of `instance` with its name.
fn greet_peers(instance: &ServerInstance) {
    let name = instance.name().to_string();
    instance.on_event(move |event: &ServerEvent| {
        if let ServerEvent::Connected(conn) = event {
            if let Err(e) = conn.send_typed("welcome", name.as_str()) {
                tracing::warn!(conn_id = %conn.id(), error = %e, "welcome not sent");
            }
        }
    });
}

/// Forwards every typed message from control peers to all map peers.
fn relay_control_to_map(control: &ServerInstance, map: InstanceHandle) {
    control.on_event(move |event: &ServerEvent| match event {
        ServerEvent::TypedMessageReceived { conn, message } => {
            match map.broadcast_typed(message.kind(), message.data()) {
                Ok(reached) => tracing::debug!(
                    from = %conn.id(),
                    kind = message.kind(),
                    reached,
                    "relayed to map"
                ),
                Err(e) => tracing::warn!(error = %e, "relay failed"),
            }
        }
        ServerEvent::MessageReceived { conn, text } => {
            tracing::info!(from = %conn.id(), %text, "untyped control message");
        }
        _ => {}
    });
}

/// Builds both instances with their files and handlers in place. Neither
/// is listening yet.
fn wire(settings: &Settings) -> (ServerInstance, ServerInstance) {
    let map = ServerInstance::new(settings.instance("map", settings.map_port));
    let control = ServerInstance::new(settings.instance("control", settings.control_port));

    map.register_file("index.html", settings.index_of("map"));
    control.register_file("index.html", settings.index_of("control"));

    greet_peers(&map);
    greet_peers(&control);
    relay_control_to_map(&control, map.handle());
    (map, control)
}

async fn start(settings: &Settings) -> Result<(ServerInstance, ServerInstance), MapcastError> {
    let (mut map, mut control) = wire(settings);
    map.run_startup().await?;
    control.run_startup().await?;
    Ok((map, control))
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    let (mut map, mut control) = start(&settings).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    control.shutdown().await;
    map.shutdown().await;
    Ok(())
}
