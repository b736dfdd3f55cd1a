//! ivshmsg-demo: runs a coordinator and a set of clients over one mailbox.
//!
//! The coordinator pings every client, negotiates its component ids over the
//! link protocol, and then the clients pass messages around a ring through
//! the bridge framing.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=ivshmsg=debug ivshmsg-demo --clients 4 --rounds 2
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ivshmsg::link::{self, CtlWrite};
use ivshmsg::{
    Bridge, Endpoint, EndpointConfig, Fabric, Mailbox, MailboxConfig, MsgError, PeerId,
    SID_DEFAULT, SendConfig,
};
use tracing_subscriber::EnvFilter;

const REPLY_WAIT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "ivshmsg-demo")]
#[command(about = "Mailbox messaging between in-process peers")]
struct Args {
    /// Number of client peers
    #[arg(long, default_value_t = 4)]
    clients: u64,

    /// Mailslot size in bytes, header included
    #[arg(long, default_value_t = 512)]
    slot_size: u64,

    /// Rounds of ring traffic between clients
    #[arg(long, default_value_t = 2)]
    rounds: u32,

    /// Back the mailbox with this file instead of the heap
    #[arg(long)]
    file: Option<PathBuf>,

    /// Class name bound to every endpoint after negotiation
    #[arg(long, default_value = "demo_class")]
    class: String,
}

type DemoResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        tracing::error!(error = %e, "demo failed");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> DemoResult<()> {
    let config = MailboxConfig {
        slot_size: args.slot_size,
        n_clients: args.clients,
    };
    let mailbox = match &args.file {
        Some(path) => Mailbox::create_file(path, &config)?,
        None => Mailbox::create(&config)?,
    };
    let layout = *mailbox.layout();
    tracing::info!(?layout, path = ?mailbox.path(), "mailbox ready");

    let fabric = Fabric::new(mailbox);
    let endpoint_config = EndpointConfig {
        send: SendConfig::fast(),
        ..EndpointConfig::default()
    };

    let coordinator_id = layout.coordinator_id as PeerId;
    let coordinator = fabric.attach(coordinator_id, endpoint_config.clone())?;
    let clients = (1..=args.clients as PeerId)
        .map(|id| fabric.attach(id, endpoint_config.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    for client in &clients {
        negotiate(&coordinator, client)?;
    }

    let bound = fabric.bind_class(&args.class);
    let dumps = drain(&coordinator);
    tracing::info!(bound, dumps, "class bound");

    let bridges: Vec<Bridge> = clients.iter().cloned().map(Bridge::new).collect();
    for round in 0..args.rounds {
        for (i, from) in bridges.iter().enumerate() {
            let to = &bridges[(i + 1) % bridges.len()];
            let request = format!(
                "{}:round {} from {}",
                to.endpoint().peer_id(),
                round,
                from.endpoint().peer_id()
            );
            from.write(request.as_bytes())?;

            to.endpoint().await_incoming_timeout(REPLY_WAIT)?;
            let mut buf = vec![0u8; to.endpoint().max_payload() + 32];
            let n = to.read(&mut buf, true)?;
            println!(
                "peer {} <- {}",
                to.endpoint().peer_id(),
                String::from_utf8_lossy(&buf[..n])
            );
        }
    }

    for endpoint in clients.iter().chain(std::iter::once(&coordinator)) {
        tracing::info!(
            peer_id = endpoint.peer_id(),
            metrics = ?endpoint.metrics().snapshot(),
            "final counters"
        );
    }
    Ok(())
}

/// Ping a client, query its attributes, and assign its component ids.
fn negotiate(coordinator: &Endpoint, client: &Endpoint) -> DemoResult<()> {
    let id = client.peer_id();

    let reply = exchange(coordinator, id, link::PING)?;
    println!("peer {id}: {}", String::from_utf8_lossy(&reply));

    let reply = exchange(coordinator, id, link::peer_attribute_request().as_bytes())?;
    let ack = link::parse_link_ack(&reply)
        .ok_or_else(|| format!("bad peer attribute reply from {id}"))?;
    println!("peer {id}: class {} cid0 {} sid0 {}", ack.class_name, ack.cid0, ack.sid0);

    let write = CtlWrite {
        pfmcid: i32::from(coordinator.peer_id()) * 100,
        pfmsid: SID_DEFAULT,
        cid: i32::from(id) * 100,
        sid: SID_DEFAULT,
        tag: i32::from(id),
    };
    let reply = exchange(coordinator, id, link::ctl_write_request(&write).as_bytes())?;
    match link::parse_standalone_ack(&reply) {
        Some(tag) if tag == write.tag => {
            println!("peer {id}: assigned cid {} sid {}", write.cid, write.sid)
        }
        _ => return Err(format!("bad CTL-Write reply from {id}").into()),
    }
    Ok(())
}

/// Send a link request and wait for the reply from `peer`.
fn exchange(coordinator: &Endpoint, peer: PeerId, request: &[u8]) -> DemoResult<Vec<u8>> {
    coordinator.send(peer, request)?;
    let incoming = coordinator.await_incoming_timeout(REPLY_WAIT)?;
    let (sender, reply) = (incoming.sender(), incoming.payload());
    coordinator.release_incoming();
    if sender != peer {
        return Err(format!("expected reply from {peer}, got one from {sender}").into());
    }
    Ok(reply)
}

/// Release everything pending at `endpoint`; returns how many messages.
fn drain(endpoint: &Arc<Endpoint>) -> usize {
    let mut count = 0;
    loop {
        match endpoint.await_incoming_timeout(Duration::from_millis(50)) {
            Ok(_) => {
                endpoint.release_incoming();
                count += 1;
            }
            Err(MsgError::TimedOut) | Err(MsgError::Interrupted) => return count,
            Err(e) => {
                tracing::warn!(error = %e, "drain stopped");
                return count;
            }
        }
    }
}
