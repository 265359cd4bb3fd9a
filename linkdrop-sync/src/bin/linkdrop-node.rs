//! Standalone replica that syncs over WebSockets.
//!
//! ```text
//! linkdrop-node --id laptop --listen 127.0.0.1:7001 --data ./laptop \
//!     --peer phone=ws://127.0.0.1:7002 --connect phone
//! ```
//!
//! Reads commands from stdin: `add <url> [title]`, `list`, `delete <id>`,
//! `groups`, `group <name> [color]`, `status`, `sync`, `export [path]`,
//! `import <path>`, `quit`.

use clap::Parser;
use linkdrop_core::{
    export_file_name, export_snapshot, import_snapshot, AddOutcome, GroupColor, LinkPatch,
};
use linkdrop_sync::{PeerId, Replica, ReplicaConfig, WsConfig, WsSignaling};
use log::{error, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "linkdrop-node")]
#[command(about = "Standalone linkdrop replica syncing over WebSockets", long_about = None)]
struct Args {
    /// Peer id of this replica
    #[arg(long, default_value = "node")]
    id: String,

    /// Address to accept peers on
    #[arg(long, default_value = "127.0.0.1:7001")]
    listen: SocketAddr,

    /// RocksDB directory; in-memory only when absent
    #[arg(long)]
    data: Option<PathBuf>,

    /// Dialable peer as ID=URL (repeatable)
    #[arg(long = "peer", value_name = "ID=URL", value_parser = parse_peer)]
    peers: Vec<(String, String)>,

    /// Peer id to connect to on startup (repeatable)
    #[arg(long)]
    connect: Vec<String>,
}

fn parse_peer(entry: &str) -> Result<(String, String), String> {
    let (id, url) = entry
        .split_once('=')
        .ok_or_else(|| format!("expected ID=URL, got {entry}"))?;
    if id.is_empty() || url.is_empty() {
        return Err(format!("expected ID=URL, got {entry}"));
    }
    Ok((id.to_string(), url.to_string()))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    let mut ws = WsConfig::new(args.id.as_str(), args.listen);
    for (peer, url) in &args.peers {
        ws = ws.with_peer(peer.as_str(), url.as_str());
    }
    let mut config = ReplicaConfig::new(args.id.as_str());
    if let Some(data) = &args.data {
        config = config.with_data_dir(data);
    }

    let replica = match Replica::open(config, WsSignaling::new(ws)).await {
        Ok(replica) => replica,
        Err(e) => {
            error!("Failed to open replica: {e}");
            std::process::exit(1);
        }
    };
    info!("Starting linkdrop node {}", replica.id());

    for peer in &args.connect {
        if let Err(e) = replica.connect(peer.as_str()).await {
            error!("Could not connect to {peer}: {e}");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&replica, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    replica.shutdown().await;
}

/// Returns false when the node should exit.
async fn run_command(replica: &Replica<WsSignaling>, line: &str) -> bool {
    let store = replica.store();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "" => {}
        "add" => {
            let (url, title) = rest.split_once(' ').unwrap_or((rest, ""));
            let mut metadata = LinkPatch::default();
            if !title.is_empty() {
                metadata = metadata.title(title);
            }
            match store.add_link(url, metadata) {
                Ok(AddOutcome::Added(link)) => println!("added {} {}", link.id, link.canonical_url),
                Ok(AddOutcome::Duplicate(link)) => println!("duplicate of {}", link.id),
                Err(e) => println!("error: {e}"),
            }
        }
        "list" => {
            for link in store.links() {
                println!(
                    "{}  {}  {}",
                    link.id,
                    link.url,
                    link.title.as_deref().unwrap_or("")
                );
            }
        }
        "delete" => match store.delete_link(rest) {
            Ok(Some(_)) => println!("deleted {rest}"),
            Ok(None) => println!("no link {rest}"),
            Err(e) => println!("error: {e}"),
        },
        "groups" => {
            for group in store.groups() {
                println!("{}  {}  {}", group.id, group.name, group.color.name());
            }
        }
        "group" => {
            let (name, color) = rest.split_once(' ').unwrap_or((rest, "blue"));
            let color = GroupColor::ALL
                .into_iter()
                .find(|c| c.name().eq_ignore_ascii_case(color.trim()))
                .unwrap_or(GroupColor::Blue);
            match store.add_group(name, color) {
                Ok(AddOutcome::Added(group)) => println!("added group {}", group.id),
                Ok(AddOutcome::Duplicate(group)) => println!("group exists: {}", group.id),
                Err(e) => println!("error: {e}"),
            }
        }
        "status" => {
            match replica.sync_status().await {
                Ok(status) => println!("{}", serde_json::to_string(&status).unwrap_or_default()),
                Err(e) => println!("error: {e}"),
            }
            println!(
                "{}",
                serde_json::to_string(&replica.connections()).unwrap_or_default()
            );
        }
        "sync" => {
            if let Err(e) = replica.force_sync().await {
                println!("error: {e}");
            }
        }
        "connect" => {
            if let Err(e) = replica.connect(PeerId::new(rest)).await {
                println!("error: {e}");
            }
        }
        "export" => {
            let path = if rest.is_empty() {
                PathBuf::from(export_file_name(chrono::Utc::now().date_naive()))
            } else {
                PathBuf::from(rest)
            };
            let result = export_snapshot(store)
                .to_json()
                .map_err(|e| e.to_string())
                .and_then(|json| std::fs::write(&path, json).map_err(|e| e.to_string()));
            match result {
                Ok(()) => println!("exported to {}", path.display()),
                Err(e) => println!("error: {e}"),
            }
        }
        "import" => match std::fs::read_to_string(rest) {
            Ok(json) => match import_snapshot(store, &json) {
                Ok(summary) => println!(
                    "imported: {} -> {} links ({} new)",
                    summary.total_before, summary.total_after, summary.new_links
                ),
                Err(e) => println!("error: {e}"),
            },
            Err(e) => println!("error: {e}"),
        },
        "quit" | "exit" => return false,
        other => println!("unknown command {other}"),
    }
    true
}
