// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs either end of the codec bypass: a target serving the echo engine, or a host client that
//! opens a session against a running target and prints what it reports.

mod config;

use std::net::TcpStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use argh::FromArgs;
use bypass::CallbackDelivery;
use bypass::Dispatcher;
use bypass::EchoEngine;
use bypass::HostClient;
use bypass::TargetServer;
use log::error;
use log::info;
use mfx_wire::DispatchMode;
use mfx_wire::types::InitParam;
use mfx_wire::Status;
use shim_transport::Channel;
use shim_transport::CommMode;
use shim_transport::Fabric;
use shim_transport::Listener;
use shim_transport::TcpChannelListener;
use shim_transport::TcpFabric;

use crate::config::ShimConfig;

#[derive(FromArgs)]
#[argh(subcommand, name = "target", description = "Serve the echo codec to a host.")]
struct TargetCommand {
    #[argh(option, description = "transport: tcp or xlink")]
    mode: Option<CommMode>,
    #[argh(option, description = "address to listen on in tcp mode")]
    listen: Option<String>,
    #[argh(option, description = "socket directory in xlink mode")]
    xlink_dir: Option<PathBuf>,
    #[argh(option, description = "allocator callback delivery: inplace or dedicated")]
    delivery: Option<CallbackDelivery>,
    #[argh(option, description = "path to a JSON config file")]
    cfg: Option<PathBuf>,
    #[argh(switch, description = "exit after the first host disconnects")]
    once: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "query", description = "Open a session on a target and query it.")]
struct QueryCommand {
    #[argh(option, description = "transport: tcp or xlink")]
    mode: Option<CommMode>,
    #[argh(option, description = "target address in tcp mode")]
    connect: Option<String>,
    #[argh(option, description = "socket directory in xlink mode")]
    xlink_dir: Option<PathBuf>,
    #[argh(option, description = "allocator callback delivery: inplace or dedicated")]
    delivery: Option<CallbackDelivery>,
    #[argh(option, description = "path to a JSON config file")]
    cfg: Option<PathBuf>,
    #[argh(option, default = "0", description = "implementation requested at init")]
    implementation: u32,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Target(TargetCommand),
    Query(QueryCommand),
}

#[derive(FromArgs)]
#[argh(description = "Codec API bypass over a host/target link.")]
struct Options {
    #[argh(option, description = "log filter, overridden by RUST_LOG")]
    log_level: Option<String>,
    #[argh(subcommand)]
    command: Command,
}

struct Overrides<'a> {
    cfg: Option<&'a Path>,
    mode: Option<CommMode>,
    address: Option<&'a String>,
    xlink_dir: Option<&'a PathBuf>,
    delivery: Option<CallbackDelivery>,
    log_level: Option<&'a String>,
}

fn load_config(o: Overrides) -> Result<ShimConfig> {
    let mut cfg = ShimConfig::load_or_default(o.cfg)?;
    if let Some(mode) = o.mode {
        cfg.mode = mode;
    }
    if let Some(address) = o.address {
        cfg.address = address.clone();
    }
    if let Some(dir) = o.xlink_dir {
        cfg.xlink_dir = dir.clone();
    }
    if let Some(delivery) = o.delivery {
        cfg.delivery = delivery;
    }
    if let Some(level) = o.log_level {
        cfg.log_level = level.clone();
    }
    Ok(cfg)
}

// `level` takes env_logger directives such as `info` or `bypass=debug`.
fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn tcp_fabric(stream_addr: std::net::SocketAddr) -> Arc<dyn Fabric> {
    Arc::new(TcpFabric::new(
        &stream_addr.ip().to_string(),
        stream_addr.port(),
    ))
}

fn xlink_fabric(dir: &Path) -> Result<Arc<dyn Fabric>> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            Ok(Arc::new(shim_transport::XlinkFabric::new(dir)))
        } else {
            bail!("xlink mode is not available on this platform ({})", dir.display())
        }
    }
}

fn serve_host(channel: Channel, fabric: Arc<dyn Fabric>, delivery: CallbackDelivery) {
    let mut server = TargetServer::new(
        Dispatcher::new(channel, DispatchMode::Proxy),
        Box::new(EchoEngine::new()),
    )
    .with_fabric(fabric)
    .with_delivery(delivery);
    match server.serve() {
        Ok(()) => info!("host session ended"),
        Err(e) => error!("host connection failed: {}", e),
    }
}

// Hosts are served one at a time since sub-channel ids restart for every host.
fn run_target(cfg: &ShimConfig, once: bool) -> Result<()> {
    match cfg.mode {
        CommMode::Tcp => {
            let mut listener = TcpChannelListener::bind(cfg.address.as_str())
                .context("failed to start target listener")?;
            let addr = listener.local_addr().context("failed to read listen address")?;
            info!("target listening on {} ({} delivery)", addr, cfg.delivery);
            let fabric = tcp_fabric(addr);
            loop {
                let channel = match listener.accept().context("failed to accept host")? {
                    Some(channel) => channel,
                    None => continue,
                };
                serve_host(channel, fabric.clone(), cfg.delivery);
                if once {
                    return Ok(());
                }
            }
        }
        CommMode::Xlink => {
            let fabric = xlink_fabric(&cfg.xlink_dir)?;
            info!(
                "target waiting in {} ({} delivery)",
                cfg.xlink_dir.display(),
                cfg.delivery
            );
            loop {
                let channel = fabric
                    .accept(Some(0))
                    .context("failed to open main channel")?;
                serve_host(channel, fabric.clone(), cfg.delivery);
                if once {
                    return Ok(());
                }
            }
        }
        CommMode::Unite => bail!("unite mode only runs in-process"),
    }
}

fn check(what: &str, status: Status) -> Result<()> {
    if status.is_error() {
        bail!("{} failed: {}", what, status);
    }
    Ok(())
}

fn connect(cfg: &ShimConfig) -> Result<(Channel, Arc<dyn Fabric>)> {
    match cfg.mode {
        CommMode::Tcp => {
            let stream = TcpStream::connect(cfg.address.as_str())
                .with_context(|| format!("failed to connect to {}", cfg.address))?;
            let _ = stream.set_nodelay(true);
            let peer = stream.peer_addr().context("failed to read peer address")?;
            Ok((Channel::from_stream(stream), tcp_fabric(peer)))
        }
        CommMode::Xlink => {
            let fabric = xlink_fabric(&cfg.xlink_dir)?;
            let channel = fabric.connect(0).context("failed to open main channel")?;
            Ok((channel, fabric))
        }
        CommMode::Unite => bail!("unite mode only runs in-process"),
    }
}

fn run_query(cfg: &ShimConfig, implementation: u32) -> Result<()> {
    let (channel, fabric) = connect(cfg)?;
    let mut client = HostClient::new(channel)
        .with_fabric(fabric)
        .with_delivery(cfg.delivery);
    if let Some(ms) = cfg.sync_chunk_ms {
        client = client.with_sync_chunk(ms);
    }

    check("proxy init", client.proxy_init())?;
    match client.query_impls_description(0) {
        Ok(descs) => {
            for d in descs {
                println!(
                    "available {} type {:#x} api {}.{}",
                    d.name(),
                    d.header.impl_type,
                    d.header.api_version.major,
                    d.header.api_version.minor
                );
                println!(
                    "  {} sub-devices, {} decoders, {} encoders, {} filters",
                    d.dev.sub_devices.len(),
                    d.decoders.len(),
                    d.encoders.len(),
                    d.filters.len()
                );
            }
        }
        Err(s) => println!("implementation list unavailable: {}", s),
    }

    let par = InitParam {
        implementation,
        ..Default::default()
    };
    let session = client
        .init_ex(&par)
        .map_err(|s| anyhow!("session init failed: {}", s))?;
    println!("session {:#x}", session.0);

    match client.query_impl(session) {
        Ok(i) => println!("implementation {:#x}", i),
        Err(s) => println!("implementation unavailable: {}", s),
    }
    match client.query_version(session) {
        Ok(v) => println!("version {}.{}", v.major, v.minor),
        Err(s) => println!("version unavailable: {}", s),
    }
    match client.query_platform(session) {
        Ok(p) => println!(
            "platform code_name {} device_id {:#x} media_adapter_type {}",
            p.code_name, p.device_id, p.media_adapter_type
        ),
        Err(s) => println!("platform unavailable: {}", s),
    }

    check("close", client.close(session))?;
    check("proxy term", client.proxy_term())
}

fn main() -> Result<()> {
    let options: Options = argh::from_env();
    match &options.command {
        Command::Target(t) => {
            let cfg = load_config(Overrides {
                cfg: t.cfg.as_deref(),
                mode: t.mode,
                address: t.listen.as_ref(),
                xlink_dir: t.xlink_dir.as_ref(),
                delivery: t.delivery,
                log_level: options.log_level.as_ref(),
            })?;
            init_logging(&cfg.log_level);
            run_target(&cfg, t.once)
        }
        Command::Query(p) => {
            let cfg = load_config(Overrides {
                cfg: p.cfg.as_deref(),
                mode: p.mode,
                address: p.connect.as_ref(),
                xlink_dir: p.xlink_dir.as_ref(),
                delivery: p.delivery,
                log_level: options.log_level.as_ref(),
            })?;
            init_logging(&cfg.log_level);
            run_query(&cfg, p.implementation)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn flags_override_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{ "address": "10.0.0.1:7000", "delivery": "dedicated", "log_level": "warn" }"#,
        )
        .unwrap();
        let listen = "127.0.0.1:7200".to_string();
        let cfg = load_config(Overrides {
            cfg: Some(file.path()),
            mode: None,
            address: Some(&listen),
            xlink_dir: None,
            delivery: None,
            log_level: None,
        })
        .unwrap();
        assert_eq!(cfg.address, listen);
        assert_eq!(cfg.delivery, CallbackDelivery::Dedicated);
        assert_eq!(cfg.log_level, "warn");
    }

    #[test]
    fn parses_subcommands() {
        let options = Options::from_args(
            &["vpl_bypass"],
            &["target", "--mode", "tcp", "--listen", "127.0.0.1:7100", "--once"],
        )
        .unwrap();
        match options.command {
            Command::Target(t) => {
                assert_eq!(t.mode, Some(CommMode::Tcp));
                assert_eq!(t.listen.as_deref(), Some("127.0.0.1:7100"));
                assert!(t.once);
            }
            Command::Query(_) => panic!("expected target"),
        }
        assert!(Options::from_args(&["vpl_bypass"], &["query", "--mode", "pcie"]).is_err());
    }

    #[test]
    fn query_against_tcp_target() {
        let mut listener = TcpChannelListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let target = thread::spawn(move || {
            let channel = listener.accept().unwrap().unwrap();
            serve_host(channel, tcp_fabric(addr), CallbackDelivery::Inplace);
        });
        let cfg = ShimConfig {
            address: addr.to_string(),
            ..Default::default()
        };
        run_query(&cfg, 0).unwrap();
        target.join().unwrap();
    }

    #[test]
    fn unite_mode_is_rejected() {
        let cfg = ShimConfig {
            mode: CommMode::Unite,
            ..Default::default()
        };
        assert!(run_target(&cfg, true).is_err());
        assert!(run_query(&cfg, 0).is_err());
    }
}
