#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub use clap::Parser;
use eyre::{eyre, WrapErr};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vis_ingest::{
    args,
    capture::VisSource,
    comms::{Comms, LocalTransport, TcpTransport, Transport},
    config::{ObsConfig, Parset},
    merge::MergedSource,
    metadata::UdpMetadataSource,
    monitoring::{monitor_task, start_web_server},
    pipeline::{IngestPipeline, RunSummary},
    tasks::TaskChain,
};

/// Process exit code handed to peers when this rank gives up
const ABORT_CODE: i32 = 1;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Get the CLI options
    let cli = args::Cli::parse();

    let summary = if cli.peers.is_empty() {
        if cli.rank != 0 {
            return Err(eyre!("Rank {} given without --peers", cli.rank));
        }
        let transport = LocalTransport::group(1)
            .pop()
            .ok_or_else(|| eyre!("Empty local group"))?;
        run(&cli, Comms::with_max_message_size(transport, cli.max_message_size))?
    } else {
        let transport = TcpTransport::connect(cli.rank, &cli.peers, cli.timeout)
            .wrap_err("Couldn't join the ingest group")?;
        run(&cli, Comms::with_max_message_size(transport, cli.max_message_size))?
    };

    // Only a completed observation counts as success
    if !summary.completed() {
        return Err(eyre!(
            "Stopped before the observation completed, last scan {}",
            summary.final_scan
        ));
    }
    Ok(())
}

fn run<T: Transport>(cli: &args::Cli, comms: Comms<T>) -> eyre::Result<RunSummary> {
    let result = ingest(cli, &comms);
    if let Err(e) = &result {
        error!(rank = comms.rank(), "Fatal - {e:#}");
        // Peers may be blocked in a collective waiting on us
        if comms.size() > 1 && comms.aborted().is_none() {
            comms.abort(ABORT_CODE);
        }
    }
    result
}

fn ingest<T: Transport>(cli: &args::Cli, comms: &Comms<T>) -> eyre::Result<RunSummary> {
    let rank = comms.rank();

    // The master reads the parameter set and hands it to everyone else
    let parset = if comms.is_master() {
        let path = cli
            .config
            .as_ref()
            .ok_or_else(|| eyre!("Rank 0 needs --config"))?;
        Parset::from_file(path)?
    } else {
        Parset::new()
    };
    let parset = comms.broadcast_parset(&parset, 0)?;
    let config = Arc::new(ObsConfig::from_parset(&parset, rank)?);
    info!(
        rank,
        antennas = config.antennas.len(),
        channels = config.correlator.n_channel,
        offset = config.channel_offset,
        "Configuration loaded"
    );

    // Create the channels
    let (sd_s, _) = broadcast::channel(1);
    let (stat_s, stat_r) = thingbuf::mpsc::blocking::channel(100);

    // Start the metrics server on its own thread
    let metrics_port = cli.metrics_port;
    std::thread::Builder::new()
        .name("metrics".to_owned())
        .spawn(move || {
            let served = actix_web::rt::System::new().block_on(async move {
                start_web_server(metrics_port)?.await?;
                Ok::<_, eyre::Report>(())
            });
            if let Err(e) = served {
                warn!("Metrics server stopped - {e}");
            }
        })?;

    // Ctrl-C stops everything at the next cycle boundary
    let signal_s = sd_s.clone();
    let signal_rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("signal".to_owned())
        .spawn(move || {
            if signal_rt.block_on(tokio::signal::ctrl_c()).is_ok() {
                info!("Interrupted, shutting down");
                let _ = signal_s.send(());
            }
        })?;

    // A peer giving up stops this rank at the next cycle boundary too
    let abort_s = sd_s.clone();
    comms.on_abort(move |code| {
        warn!(code, "Ingest group aborted, shutting down");
        let _ = abort_s.send(());
    });

    let monitor_sd = sd_s.subscribe();
    let monitor_thread = std::thread::Builder::new()
        .name("monitor".to_owned())
        .spawn(move || monitor_task(stat_r, monitor_sd))?;

    // Build the pipeline
    let vis = VisSource::with_stats(&config.vis_source, Some(stat_s))?;
    let metadata = UdpMetadataSource::bind(config.metadata_port)?;
    let source = MergedSource::new(vis, metadata, config.clone())?;
    let chain = TaskChain::from_descs(&config.tasks, &config)?;

    // Everyone is ready before the first cycle
    if comms.is_master() {
        for _ in 1..comms.size() {
            let worker = comms.get_ready_worker_id()?;
            info!(worker, "Worker ready");
        }
    } else {
        comms.signal_ready()?;
    }

    let mut pipeline =
        IngestPipeline::new(source, chain, rank, config.timeout).with_shutdown(sd_s.subscribe());
    let summary = pipeline.run()?;
    let align = pipeline.source().stats().clone();
    info!(?align, "Alignment statistics");
    drop(pipeline);
    if let Some(code) = comms.aborted() {
        return Err(eyre!("Ingest group aborted with code {code}"));
    }

    let totals = gather_totals(comms, &summary)?;
    if comms.is_master() {
        info!(
            cycles = totals[0],
            processed = totals[1],
            stalls = totals[2],
            "Ingest group finished"
        );
    }

    let _ = sd_s.send(());
    match monitor_thread.join() {
        Ok(r) => r?,
        Err(_) => warn!("Monitor thread panicked"),
    }
    Ok(summary)
}

#[allow(clippy::cast_precision_loss)]
fn gather_totals<T: Transport>(comms: &Comms<T>, summary: &RunSummary) -> eyre::Result<[f32; 3]> {
    let mut totals = [
        summary.cycles as f32,
        summary.processed as f32,
        summary.stalls as f32,
    ];
    comms.sum_reduce(&mut totals, 0)?;
    Ok(totals)
}
