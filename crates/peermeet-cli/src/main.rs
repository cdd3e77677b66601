use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use peermeet_core::loopback::{LoopbackDevices, LoopbackNetwork};
use peermeet_core::{MeetEvent, RoomId, RoomSession, SessionConfig, SettingsStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer-to-peer meeting rooms", long_about = None)]
struct Args {
    /// Display name shown to other participants
    #[arg(long, global = true)]
    name: Option<String>,

    /// Directory holding settings.json
    #[arg(long, global = true, env = "PEERMEET_DATA_DIR", default_value = ".peermeet")]
    data_dir: PathBuf,

    /// Upper bound for the room occupancy probe
    #[arg(long, global = true)]
    probe_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a fresh room id
    New,
    /// Check whether a room is occupied
    Probe {
        /// Room id, `/m/<id>` path or full room URL
        room: String,
    },
    /// Run a whole meeting in-process over the loopback transport
    Demo {
        #[arg(long)]
        room: Option<String>,

        #[arg(long, default_value_t = 2)]
        joiners: usize,

        #[arg(long, default_value = "hello from the demo")]
        message: String,
    },
}

fn session_config(args: &Args, store: &SettingsStore) -> SessionConfig {
    let mut config = SessionConfig::from(&store.get());
    if let Some(name) = &args.name {
        config.display_name = name.clone();
    }
    if let Some(ms) = args.probe_timeout_ms {
        config.probe_timeout = Duration::from_millis(ms);
    }
    config
}

fn parse_room(input: Option<&str>) -> anyhow::Result<RoomId> {
    match input {
        Some(raw) => RoomId::parse(raw).with_context(|| format!("bad room {raw:?}")),
        None => Ok(RoomId::generate()),
    }
}

async fn probe(config: SessionConfig, room: RoomId) -> anyhow::Result<()> {
    let net = LoopbackNetwork::new();
    let session = RoomSession::new(config, Arc::new(net.clone()), Arc::new(LoopbackDevices::new()));
    let occupied = session.check_room_occupancy(&room).await;
    println!("{room}: {}", if occupied { "occupied" } else { "vacant" });
    if net.live_peers() != 0 {
        bail!("probe leaked {} peer(s)", net.live_peers());
    }
    Ok(())
}

async fn wait_until(what: &str, mut check: impl AsyncFnMut() -> bool) -> anyhow::Result<()> {
    for _ in 0..500 {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {what}")
}

async fn demo(config: SessionConfig, room: RoomId, joiners: usize, message: String) -> anyhow::Result<()> {
    let net = LoopbackNetwork::new();
    let new_session = |name: String| {
        let config = SessionConfig { display_name: name, ..config.clone() };
        RoomSession::new(config, Arc::new(net.clone()), Arc::new(LoopbackDevices::new()))
    };

    let host = new_session(config.display_name.clone());
    host.add_fn(|event| {
        if let MeetEvent::Notice(notice) = event {
            warn!("host notice: {}", notice.error);
        }
    });
    host.refresh_devices().await?;
    host.enter(&room).await?;
    info!("room {room} is up at {}", room.path());

    let mut guests = Vec::with_capacity(joiners);
    for i in 1..=joiners {
        let guest = new_session(format!("guest-{i}"));
        guest.refresh_devices().await?;
        guest.enter(&room).await?;
        guest.chat().send_message(&format!("{message} ({i})"), None).await?;
        guests.push(guest);
    }

    wait_until("every guest to show up", async || {
        let list = host.participants().await;
        list.len() == joiners && list.iter().all(|p| p.display_name.is_some())
    })
    .await?;
    wait_until("every chat message", async || {
        host.chat().messages().await.len() >= joiners
    })
    .await?;

    println!("participants of {room}:");
    for p in host.participants().await {
        println!(
            "  {} ({}) audio={} video={}",
            p.display_name.as_deref().unwrap_or("?"),
            p.peer_id,
            p.has_audio,
            p.has_video
        );
    }
    println!("chat:");
    for msg in host.chat().messages().await {
        println!("  [{}] {}: {}", msg.timestamp_ms, msg.sender_name, msg.text);
    }

    for guest in &guests {
        guest.teardown().await;
    }
    host.teardown().await;

    if net.live_peers() != 0 {
        bail!("{} loopback peer(s) still live after teardown", net.live_peers());
    }
    info!("demo finished, {} peers created, none left", net.created_peers());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peermeet_core=info,peermeet_cli=info")),
        )
        .init();

    let args = Args::parse();
    let store = SettingsStore::new(&args.data_dir);
    if let Some(name) = &args.name {
        store.set_display_name(Some(name.clone()));
    }
    let config = session_config(&args, &store);

    match args.command {
        Command::New => {
            let room = RoomId::generate();
            println!("{room}");
            println!("{}", room.path());
        }
        Command::Probe { room } => probe(config, parse_room(Some(room.as_str()))?).await?,
        Command::Demo { room, joiners, message } => {
            demo(config, parse_room(room.as_deref())?, joiners, message).await?
        }
    }
    Ok(())
}
