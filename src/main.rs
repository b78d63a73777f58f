use std::sync::Arc;

use clap::Parser;
use dicom_volume_viewer::{
    RemoteActionRouter, SceneHost, VolumeSource,
    actor::RenderActor,
    config::{Config, init_logging},
    enums::Processor,
    fps::FrameRateMonitor,
    render::{RayCastBackend, cpu::CpuRayCaster, gpu::GpuRayCaster},
    transport::{self, FrameHub},
};
use tokio::net::TcpListener;
use tracing::{error, info};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let config = Config::parse();
    let _log_guard = init_logging(&config)?;

    let backend: Box<dyn RayCastBackend> = match config.processor {
        Processor::GPU => Box::new(GpuRayCaster::new().await?),
        Processor::CPU => Box::new(CpuRayCaster),
    };
    info!(backend = backend.name(), "ray caster ready");

    let mut host = SceneHost::new(backend, config.scene_config()?);
    FrameRateMonitor::attach(&mut host);

    let hub = FrameHub::new(16);
    let source = Arc::new(VolumeSource::dicom(config.sort_by));
    let router = RemoteActionRouter::new(source, host, Box::new(hub.clone()));
    let (actor, scene) = RenderActor::spawn(router)?;

    let listener = TcpListener::bind(config.listen_addr()?).await?;
    let server = tokio::spawn(transport::serve(listener, scene, hub));
    let actor = tokio::task::spawn_blocking(move || actor.join());

    tokio::select! {
        served = server => {
            served??;
        }
        stopped = actor => {
            if let Err(err) = stopped? {
                error!(%err, "render actor failed");
                return Err(err.into());
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutting down");
        }
    }

    Ok(())
}
