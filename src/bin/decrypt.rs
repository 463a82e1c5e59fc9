use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::UdpSocket;

use mpegts_decrypt::cam::NullCam;
use mpegts_decrypt::config::DecryptConfig;
use mpegts_decrypt::constants::{TS_PACKET_SIZE, TS_SYNC_BYTE};
use mpegts_decrypt::engine::DecryptEngine;
use mpegts_decrypt::network::{create_udp_egress_socket, create_udp_socket};

#[derive(Parser)]
struct Opt {
    /// UDP socket to bind + listen on for scrambled input (IPv4)
    #[clap(long = "in", default_value = "239.1.1.2:1234")]
    input: String,

    /// UDP destination for clear output
    #[clap(long = "out", default_value = "127.0.0.1:5000")]
    output: String,

    /// Log tag and stats snapshot label
    #[clap(long, default_value = "decrypt")]
    name: String,

    /// 16 hex character BISS fixed control word (even||odd halves)
    #[clap(long)]
    biss: Option<String>,

    /// Overrides the observed program number for CAS matching
    #[clap(long)]
    cas_pnr: Option<u16>,

    /// Hex string forwarded opaquely to the chosen CAS plugin
    #[clap(long)]
    cas_data: Option<String>,

    /// Print a JSON snapshot of engine state at this interval (seconds); 0 disables
    #[clap(long, default_value_t = 0)]
    stats_secs: u64,
}

#[derive(serde::Serialize)]
struct StatsSnapshot {
    name: String,
    timestamp: String,
    packets_in: u64,
    packets_out: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    let mut config = DecryptConfig::new(opt.name.clone());
    if let Some(biss) = &opt.biss {
        config = config.with_biss(biss.clone());
    }
    if let Some(pnr) = opt.cas_pnr {
        config = config.with_cas_pnr(pnr);
    }
    if let Some(cas_data) = &opt.cas_data {
        let bytes = decode_hex(cas_data)?;
        config = config.with_cas_data(bytes);
    }
    if opt.biss.is_none() {
        // No CAM wired up yet in this binary; BISS mode needs none, and a
        // plain pass-through without a CAM is still a valid configuration.
        config = config.with_cam(Arc::new(NullCam::new(false, true)));
    }

    let mut engine = DecryptEngine::new(config)?;

    let in_socket = create_udp_socket(&opt.input)?;
    let in_sock = UdpSocket::from_std(in_socket.into())?;
    let (out_socket, out_dest) = create_udp_egress_socket(&opt.output)?;
    let out_sock = UdpSocket::from_std(out_socket.into())?;

    let mut in_buf = [0u8; 65536];
    let mut out_buf: Vec<u8> = Vec::with_capacity(7 * TS_PACKET_SIZE);
    let mut packets_in: u64 = 0;
    let mut packets_out: u64 = 0;
    let mut last_stats = Instant::now();

    loop {
        let n = in_sock.recv(&mut in_buf).await?;
        if n == 0 {
            continue;
        }

        for chunk in in_buf[..n].chunks_exact(TS_PACKET_SIZE) {
            if chunk[0] != TS_SYNC_BYTE {
                continue; // bad sync
            }
            packets_in += 1;
            let pkt: [u8; TS_PACKET_SIZE] = chunk.try_into().unwrap();
            engine.on_ts(&pkt, |out| {
                out_buf.extend_from_slice(out);
                packets_out += 1;
            });
        }

        let mut sent = 0;
        while sent + 7 * TS_PACKET_SIZE <= out_buf.len() {
            out_sock
                .send_to(&out_buf[sent..sent + 7 * TS_PACKET_SIZE], out_dest)
                .await?;
            sent += 7 * TS_PACKET_SIZE;
        }
        out_buf.drain(0..sent);

        if opt.stats_secs > 0 && last_stats.elapsed() >= Duration::from_secs(opt.stats_secs) {
            let snapshot = StatsSnapshot {
                name: opt.name.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                packets_in,
                packets_out,
            };
            println!("{}", serde_json::to_string(&snapshot)?);
            last_stats = Instant::now();
        }
    }
}

fn decode_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        anyhow::bail!("odd-length hex string");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| anyhow::anyhow!(e)))
        .collect()
}
