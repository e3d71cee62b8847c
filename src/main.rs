use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio_util::sync::CancellationToken;

use telemetry_gateway::admin::AdminServer;
use telemetry_gateway::buffer_pool::BufferPool;
use telemetry_gateway::config::Settings;
use telemetry_gateway::connection::{ConnectionStats, TcpAcceptor, UdpEndpoint};
use telemetry_gateway::pipeline::Pipeline;
use telemetry_gateway::plugin::nmea::NmeaDecoder;
use telemetry_gateway::plugin::{PluginConfigView, PluginRegistry};
use telemetry_gateway::publisher::{KafkaSettings, Publisher};
use telemetry_gateway::resilience::ResiliencePolicy;
use telemetry_gateway::shutdown::{wait_for_shutdown_signal, ShutdownCoordinator};

#[derive(Parser, Debug)]
#[clap(name = "telemetry-gateway", about = "GPS telemetry ingestion gateway")]
struct Cli {
    /// Path to a TOML config file (without extension), searched relative to
    /// the working directory.
    #[clap(long)]
    config: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref()).context("failed to load configuration")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(settings))
}

async fn run(settings: Settings) -> Result<()> {
    let cancel = CancellationToken::new();

    let registry = Arc::new(PluginRegistry::new());
    registry
        .register(Arc::new(NmeaDecoder::new()), &PluginConfigView::default())
        .await;
    info!("registered {} plugin(s)", registry.plugin_count().await);

    let validator = Arc::new(telemetry_gateway::validator::Validator::new());

    let kafka_settings = KafkaSettings {
        bootstrap_servers: settings.kafka.bootstrap_servers.clone(),
        topic_prefix: settings.kafka.topic_prefix.clone(),
        partition_count: settings.kafka.partition_count,
        compression: settings.kafka.compression.clone(),
    };
    let kafka_policy = ResiliencePolicy::new(settings.resilience.kafka_publish.to_policy_config());
    let publisher = Arc::new(Publisher::new(kafka_settings, kafka_policy).context("failed to construct Kafka producer")?);

    let processing_policy = ResiliencePolicy::new(settings.resilience.message_processing.to_policy_config());
    let buffer_pool = BufferPool::new(settings.telemetry_server.buffer_class_size);

    let channel_capacity =
        settings.telemetry_server.max_connections * settings.pipeline.channel_capacity_multiplier;
    let pipeline = Pipeline::new(
        registry.clone(),
        validator,
        publisher.clone(),
        processing_policy,
        buffer_pool.clone(),
        settings.pipeline.worker_count,
        channel_capacity,
    );
    let (pipeline_handle, pipeline_join) = pipeline.spawn(cancel.clone());

    let connection_stats = ConnectionStats::new();

    let tcp_addr: SocketAddr = format!("0.0.0.0:{}", settings.telemetry_server.tcp_port).parse()?;
    let tcp_acceptor = TcpAcceptor::bind(
        tcp_addr,
        pipeline_handle.clone(),
        buffer_pool.clone(),
        connection_stats.clone(),
        settings.telemetry_server.max_connections,
    )
    .await
    .context("failed to bind TCP acceptor")?;

    let udp_addr: SocketAddr = format!("0.0.0.0:{}", settings.telemetry_server.udp_port).parse()?;
    let udp_endpoint = UdpEndpoint::bind(
        udp_addr,
        pipeline_handle.clone(),
        buffer_pool.clone(),
        connection_stats.clone(),
    )
    .await
    .context("failed to bind UDP endpoint")?;

    let admin_addr: SocketAddr = format!("0.0.0.0:{}", settings.telemetry_server.admin_port).parse()?;
    let admin_publisher = publisher.clone();
    let health_check: Box<dyn telemetry_gateway::admin::HealthCheck> = Box::new(PublisherHealth(admin_publisher));
    let admin_server = AdminServer::new(
        admin_addr,
        connection_stats,
        pipeline_handle.clone(),
        vec![health_check],
    );

    let tcp_task = tokio::spawn(tcp_acceptor.run(cancel.clone()));
    let udp_task = tokio::spawn(udp_endpoint.run(cancel.clone()));
    let admin_task = tokio::spawn(admin_server.run(cancel.clone()));

    let signal_task = tokio::spawn(wait_for_shutdown_signal(cancel.clone()));

    cancel.cancelled().await;
    info!("shutdown signal observed, draining");

    let _ = tokio::join!(tcp_task, udp_task, admin_task, signal_task);

    let coordinator = ShutdownCoordinator {
        cancel,
        pipeline_intake: Some(pipeline_handle),
        pipeline_join,
        publisher,
        registry,
    };
    coordinator.run().await;

    info!("telemetry gateway stopped");
    Ok(())
}

struct PublisherHealth(Arc<Publisher>);

impl telemetry_gateway::admin::HealthCheck for PublisherHealth {
    fn healthy(&self) -> bool {
        self.0.is_healthy()
    }

    fn name(&self) -> &str {
        "publisher"
    }
}

