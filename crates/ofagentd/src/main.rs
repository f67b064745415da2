//! ofagentd entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ofagent_types::TunnelType;
use ofagentd::bridge::list_bridges;
use ofagentd::bridge_setup::{
    check_ovs_version, setup_ancillary_bridges, setup_integration_br, setup_physical_bridges,
    setup_tunnel_br, IpLinks, PhysicalBridgeSetup,
};
use ofagentd::config::{AgentConfig, DEFAULT_CONFIG_PATH};
use ofagentd::constants::{AGENT_BINARY, AGENT_TOPIC, AGENT_TYPE};
use ofagentd::heartbeat::Heartbeat;
use ofagentd::notifications::{spawn_dispatcher, spawn_notification_poller, NotificationHandler};
use ofagentd::plugin_rpc::{AgentConfigurations, AgentStateReport};
use ofagentd::polling::{AlwaysPoll, OvsdbMonitorPoller, PollingManager};
use ofagentd::security_group::NoopFirewall;
use ofagentd::{
    Agent, Bridge, FlowProgrammer, HttpPluginClient, OvsBridge, PortReconciler, TunnelReconciler,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// OpenFlow L2 agent
#[derive(Parser, Debug)]
#[command(name = "ofagentd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config_file: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Host name reported to the control plane
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            error!("Agent terminated!");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = AgentConfig::load_or_default(&args.config_file)?;
    if let Some(host) = args.host {
        config.host = host;
    }
    let config = config.validate()?;
    info!("Starting {} on {}", AGENT_BINARY, config.host);

    let root_helper = config.root_helper.clone();
    let factory = {
        let root_helper = root_helper.clone();
        move |name: &str| -> Arc<dyn Bridge> {
            Arc::new(OvsBridge::new(name, root_helper.clone()))
        }
    };

    if config.tunnel_types.contains(&TunnelType::Vxlan) {
        check_ovs_version(&root_helper).await?;
    }

    let int_br = factory(&config.integration_bridge);
    setup_integration_br(
        int_br.as_ref(),
        &config.int_peer_patch_port,
        config.get_datapath_retry_times,
    )
    .await
    .context("integration bridge setup failed")?;

    let mac = int_br
        .local_port_mac()
        .await
        .context("unable to read integration bridge MAC")?;
    let agent_id = format!("ovs{}", mac.to_compact());
    info!("Agent id {}", agent_id);

    let links = IpLinks::new(root_helper.clone());
    let phys_brs = setup_physical_bridges(
        &PhysicalBridgeSetup {
            int_br: &int_br,
            factory: &factory,
            links: &links,
            veth_mtu: config.veth_mtu,
            retry_max: config.get_datapath_retry_times,
            backoff: std::time::Duration::from_secs(1),
        },
        &config.bridge_mappings,
    )
    .await
    .context("physical bridge setup failed")?;

    let mut programmer = FlowProgrammer::new(int_br.clone());
    for (physical_network, bridge) in phys_brs {
        programmer = programmer.with_physical_bridge(physical_network, bridge);
    }
    if config.enable_tunneling() {
        let tun_br = factory(&config.tunnel_bridge);
        setup_tunnel_br(
            int_br.as_ref(),
            tun_br.as_ref(),
            &config.int_peer_patch_port,
            &config.tun_peer_patch_port,
            config.get_datapath_retry_times,
        )
        .await
        .context("tunnel bridge setup failed")?;
        programmer = programmer.with_tunneling(tun_br, config.local_ip.clone(), config.vxlan_udp_port);
    }

    let mut managed = vec![config.integration_bridge.clone()];
    if config.enable_tunneling() {
        managed.push(config.tunnel_bridge.clone());
    }
    managed.extend(programmer.physical_bridge_names());
    let all_bridges = list_bridges(&root_helper).await?;
    let ancillary_brs = setup_ancillary_bridges(all_bridges, &managed, &factory).await?;

    let programmer = Arc::new(Mutex::new(programmer));
    let http = Arc::new(HttpPluginClient::new(config.plugin_url.clone(), config.plugin_timeout)?);
    let firewall = Arc::new(NoopFirewall);

    let tunnels = Arc::new(TunnelReconciler::new(
        programmer.clone(),
        http.clone(),
        config.local_ip.clone(),
        config.tunnel_types.clone(),
    ));
    let ports = PortReconciler::new(
        programmer.clone(),
        http.clone(),
        firewall.clone(),
        agent_id.clone(),
        config.host.clone(),
    );
    let mut agent = Agent::new(ports, tunnels.clone(), config.polling_interval)
        .with_ancillary_bridges(ancillary_brs);

    if let Some(interval) = config.report_interval {
        let template = AgentStateReport {
            binary: AGENT_BINARY.to_string(),
            host: config.host.clone(),
            topic: AGENT_TOPIC.to_string(),
            agent_type: AGENT_TYPE.to_string(),
            configurations: AgentConfigurations {
                bridge_mappings: config.bridge_mappings.clone(),
                tunnel_types: config.tunnel_types.clone(),
                tunneling_ip: config.local_ip.clone(),
                l2_population: false,
                devices: 0,
            },
            start_flag: None,
        };
        Heartbeat::new(http.clone(), template, interval, agent.device_count()).spawn();
    }

    let (tx, rx) = mpsc::channel(64);
    let handler = NotificationHandler::new(
        programmer,
        http.clone(),
        firewall,
        tunnels,
        agent_id.clone(),
        config.host.clone(),
    );
    spawn_dispatcher(Arc::new(handler), rx);
    spawn_notification_poller(
        http,
        agent_id,
        config.host.clone(),
        tx,
        config.notification_poll_interval,
    );

    let mut polling: Box<dyn PollingManager> = if config.minimize_polling {
        Box::new(OvsdbMonitorPoller::start(
            &root_helper,
            config.ovsdb_monitor_respawn_interval,
        ))
    } else {
        Box::new(AlwaysPoll::default())
    };

    info!("Agent initialized successfully, now running...");
    tokio::select! {
        _ = agent.rpc_loop(&mut *polling) => {}
        _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
    }
    Ok(())
}
