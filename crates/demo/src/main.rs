use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use rkyv::{Archive, Deserialize, Serialize, rancor};

use tether::{
    Connection, ConnectionManager, GroupReader, NetworkEndpoint, NetworkSimulator, PackageStatus,
    PacketLossSimulation, ProtocolConfig,
};

const TICK: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "tether-demo")]
#[command(about = "Echo server and sender for the tether reliable-messaging layer")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an echo server
    Serve {
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,

        #[arg(short, long, default_value_t = 27115)]
        port: u16,

        #[arg(long, help = "Enable packet loss simulation for every peer")]
        simulate_packet_loss: bool,

        #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
        loss_percent: f32,

        #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
        min_latency: u32,

        #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
        max_latency: u32,

        #[arg(long, default_value_t = 0, help = "Jitter in ms")]
        jitter: u32,
    },
    /// Send messages to a server and wait for the echoes
    Send {
        #[arg(short, long)]
        addr: SocketAddr,

        #[arg(short, long, default_value = "hello over lossy ground")]
        message: String,

        #[arg(short, long, default_value_t = 3)]
        count: u32,

        #[arg(long, help = "Also send a payload large enough to fragment")]
        blob: bool,

        #[arg(long, default_value_t = 10, help = "Give up after this many seconds")]
        timeout_secs: u64,
    },
}

#[derive(Archive, Deserialize, Serialize, Debug, PartialEq)]
#[rkyv(compare(PartialEq), derive(Debug))]
enum ChatPayload {
    Line { from: String, text: String },
    Blob(Vec<u8>),
}

/// Messages inside a group carry no framing of their own, so the payload
/// is length-prefixed to let the handler consume exactly one per call.
fn encode_payload(payload: &ChatPayload) -> Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<rancor::Error>(payload)?;
    let mut framed = Vec::with_capacity(4 + bytes.len());
    framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    framed.extend_from_slice(&bytes);
    Ok(framed)
}

fn read_payload(reader: &mut GroupReader<'_>) -> Option<ChatPayload> {
    let len = reader.read_u32()? as usize;
    let bytes = reader.read_bytes(len)?;
    // group bytes sit at arbitrary offsets; rkyv wants them aligned
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<ChatPayload, rancor::Error>(&aligned).ok()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Args::parse().command {
        Command::Serve {
            bind,
            port,
            simulate_packet_loss,
            loss_percent,
            min_latency,
            max_latency,
            jitter,
        } => {
            let loss = simulate_packet_loss.then_some(PacketLossSimulation {
                enabled: true,
                loss_percent,
                min_latency_ms: min_latency,
                max_latency_ms: max_latency,
                jitter_ms: jitter,
            });
            serve(&bind, port, loss)
        }
        Command::Send {
            addr,
            message,
            count,
            blob,
            timeout_secs,
        } => send(addr, &message, count, blob, Duration::from_secs(timeout_secs)),
    }
}

fn serve(bind: &str, port: u16, loss: Option<PacketLossSimulation>) -> Result<()> {
    let mut endpoint = NetworkEndpoint::bind((bind, port))?;
    let mut manager = ConnectionManager::new(ProtocolConfig::default());
    let mut simulator = NetworkSimulator::new();

    log::info!("echo server listening on {}", endpoint.local_addr());
    if let Some(loss) = &loss {
        log::info!(
            "simulating {}% loss, {}-{} ms latency",
            loss.loss_percent,
            loss.min_latency_ms,
            loss.max_latency_ms
        );
    }

    loop {
        for (data, addr) in endpoint.receive()? {
            if let Some(loss) = &loss {
                if simulator.get_config(&addr).is_none() {
                    simulator.set_config(addr, loss.clone());
                }
                if simulator.should_drop(&addr) {
                    log::debug!("simulated loss of a datagram from {addr}");
                    continue;
                }
            }
            simulator.enqueue_inbound(data, addr);
        }

        for (data, addr) in simulator.take_inbound() {
            let connection = manager.get_or_create(addr);

            let mut received = Vec::new();
            let mut handler = |_seq: u32, reader: &mut GroupReader<'_>| match read_payload(reader) {
                Some(payload) => {
                    received.push(payload);
                    true
                }
                None => false,
            };
            if connection.process_package(&data, &mut handler) == PackageStatus::InvalidMessage {
                log::warn!("undecodable message content from {addr}");
            }

            for payload in received {
                let reply = match payload {
                    ChatPayload::Line { from, text } => {
                        log::info!("{from}@{addr}: {text}");
                        ChatPayload::Line {
                            from: "server".to_string(),
                            text,
                        }
                    }
                    ChatPayload::Blob(bytes) => {
                        log::info!("{addr}: blob of {} bytes", bytes.len());
                        ChatPayload::Line {
                            from: "server".to_string(),
                            text: format!("blob of {} bytes received", bytes.len()),
                        }
                    }
                };
                connection.queue_critical_message(&encode_payload(&reply)?);
            }
        }

        let mut outgoing = Vec::new();
        for (&addr, connection) in manager.iter_mut() {
            connection.discard_stale_fragments();
            for package in connection.packages() {
                outgoing.push((package, addr));
            }
        }
        for (package, addr) in outgoing {
            if simulator.should_drop(&addr) {
                continue;
            }
            simulator.enqueue_outbound(package, addr);
        }
        for (package, addr) in simulator.take_outbound() {
            endpoint.send_packages_to(&[package], addr)?;
        }

        manager.cleanup_timed_out();
        thread::sleep(TICK);
    }
}

fn send(
    addr: SocketAddr,
    message: &str,
    count: u32,
    blob: bool,
    timeout: Duration,
) -> Result<()> {
    let mut endpoint = NetworkEndpoint::bind("0.0.0.0:0")?;
    endpoint.set_remote(addr);

    let mut connection = Connection::new(&ProtocolConfig::default());
    // everything queued before the first build shares one sequence
    let mut waiting: Vec<(u32, String)> = Vec::new();

    for i in 0..count {
        let payload = ChatPayload::Line {
            from: "demo".to_string(),
            text: format!("{message} #{i}"),
        };
        let seq = connection.queue_critical_message(&encode_payload(&payload)?);
        waiting.push((seq, format!("line #{i}")));
    }
    if blob {
        let payload = ChatPayload::Blob(vec![0xA5; 8 * 1024]);
        let seq = connection.queue_critical_message(&encode_payload(&payload)?);
        waiting.push((seq, "blob".to_string()));
    }

    let mut echoes = 0u32;
    let expected = count + u32::from(blob);
    let started = Instant::now();

    while started.elapsed() < timeout {
        endpoint.send_packages(&connection.packages())?;

        for (data, _) in endpoint.receive()? {
            let mut handler = |_seq: u32, reader: &mut GroupReader<'_>| match read_payload(reader) {
                Some(ChatPayload::Line { from, text }) => {
                    log::info!("{from}: {text}");
                    echoes += 1;
                    true
                }
                Some(_) => true,
                None => false,
            };
            connection.process_package(&data, &mut handler);
        }

        if let Some(rtt) = connection.average_rtt() {
            endpoint.stats_mut().rtt_ms = rtt.as_secs_f32() * 1000.0;
        }

        waiting.retain(|(seq, label)| {
            if connection.acknowledged(*seq) {
                log::info!("{label} acknowledged");
                false
            } else {
                true
            }
        });

        if waiting.is_empty() && echoes >= expected {
            let stats = endpoint.stats();
            log::info!(
                "done: {echoes} echoes, {} packages sent, {} received, rtt {:.1} ms",
                stats.packets_sent,
                stats.packets_received,
                stats.rtt_ms
            );
            return Ok(());
        }

        thread::sleep(TICK);
    }

    anyhow::bail!("timed out with {} sends unacknowledged", waiting.len())
}
