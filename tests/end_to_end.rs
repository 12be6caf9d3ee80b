use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use vis_ingest::{
    chunk::VisChunk,
    common::{Sample, SCAN_IDLE, SCAN_OBS_COMPLETE},
    comms::{Comms, LocalTransport},
    config::{ObsConfig, Parset},
    datagram::VisDatagram,
    merge::MergedSource,
    metadata::{self, TelescopeMetadata},
    pipeline::{IngestPipeline, PipelineState, RunSummary},
    ring::DatagramRing,
    tasks::{sink::record_len, ChannelAvgTask, NoopTask, TaskChain},
};

const PARSET: &str = "
antennas = [ak01, ak02]
antenna.ak01.location = [-2556084.669, 5097398.337, -2848424.133]
antenna.ak02.location = [-2556118.102, 5097384.726, -2848417.280]

correlator.nbeam = 1
correlator.nchan = 32
correlator.start_freq = 1.4e9
correlator.chan_width = 1e6
correlator.interval = 5

vis_source.port = 0
metadata_source.port = 0
ingest.timeout = 0.2

tasks.tasklist = [uvw, avg, sink]
tasks.uvw.type = CalcUVWTask
tasks.avg.type = ChannelAvgTask
tasks.avg.params.averaging = 4
tasks.sink.type = FileSinkTask
";

#[test]
fn chain_averages_and_propagates_flags() {
    let mut chain = TaskChain::new();
    // Stands in for the UVW stage, leaves the data alone
    chain.push(Box::new(NoopTask::new("uvw")));
    chain.push(Box::new(ChannelAvgTask::new("avg", 4).unwrap()));

    let mut chunk = VisChunk::new(2, 8, 1, 0);
    for ((row, chan, _), v) in chunk.visibility.indexed_iter_mut() {
        *v = Sample::new((row * 8 + chan) as f32, 0.0);
    }
    chunk.flag.fill(false);
    chunk.flag[[0, 1, 0]] = true;
    chunk.frequency = (0..8u8).map(|c| 1e9 + f64::from(c) * 1e6).collect();

    chain.process(&mut chunk).unwrap();

    assert_eq!(chunk.visibility.dim(), (2, 2, 1));
    assert_eq!(chunk.flag.dim(), (2, 2, 1));
    let means: Vec<f32> = chunk.visibility.iter().map(|v| v.re).collect();
    assert_eq!(means, vec![1.5, 5.5, 9.5, 13.5]);
    let flags: Vec<bool> = chunk.flag.iter().copied().collect();
    assert_eq!(flags, vec![true, false, false, false]);
    assert_eq!(chunk.frequency, vec![1.0015e9, 1.0055e9]);
    assert!(chunk.validate().is_ok());
}

fn cycle(ring: &DatagramRing<VisDatagram>, timestamp: u64) {
    for (antenna1, antenna2) in [(0, 0), (0, 1), (1, 1)] {
        for slice in 0..2 {
            let mut dg = VisDatagram {
                timestamp,
                antenna1,
                antenna2,
                slice,
                ..Default::default()
            };
            dg.vis
                .iter_mut()
                .for_each(|s| *s = Sample::new(antenna2 as f32, 1.0));
            ring.put(dg).unwrap();
        }
    }
}

fn metadata(timestamp: u64, scan_id: i64) -> TelescopeMetadata {
    TelescopeMetadata {
        timestamp,
        scan_id,
        phase_direction: [0.5, -0.7],
        flagged_antennas: vec![],
    }
}

#[test]
fn pipeline_runs_a_short_observation() {
    let dir = tempfile::tempdir().unwrap();
    let sink_path = dir.path().join("vis.bin");
    let mut parset = Parset::parse(PARSET).unwrap();
    parset.insert("tasks.sink.params.filename", sink_path.display().to_string());
    let config = Arc::new(ObsConfig::from_parset(&parset, 0).unwrap());
    let chain = TaskChain::from_descs(&config.tasks, &config).unwrap();
    assert_eq!(chain.names(), vec!["uvw", "avg", "sink"]);

    let ring = Arc::new(DatagramRing::new(64));
    let (tx, md) = metadata::channel(8);
    let source = MergedSource::new(ring.clone(), md, config.clone()).unwrap();

    // 1.7e9 seconds past the Unix epoch
    let t0 = 1_700_000_000_000_000;
    tx.send(metadata(t0, 3)).unwrap();
    cycle(&ring, t0);
    tx.send(metadata(t0 + 5_000_000, 3)).unwrap();
    cycle(&ring, t0 + 5_000_000);
    tx.send(metadata(t0 + 10_000_000, SCAN_OBS_COMPLETE)).unwrap();

    let mut pipeline = IngestPipeline::new(source, chain, 0, config.timeout);
    let summary = pipeline.run().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(
        summary,
        RunSummary {
            cycles: 3,
            processed: 2,
            stalls: 0,
            final_scan: SCAN_OBS_COMPLETE,
        }
    );
    assert!(pipeline.scan().observation_complete());
    assert_eq!(pipeline.source().stats().incomplete_cycles, 0);
    drop(tx);

    // Three rows, 32 channels averaged down to 8, four polarisations
    let written = std::fs::read(&sink_path).unwrap();
    assert_eq!(written.len(), 2 * record_len(3, 8, 4));
}

#[test]
fn pipeline_stalls_without_data() {
    let mut parset = Parset::parse(PARSET).unwrap();
    parset.insert("tasks.tasklist", "[]");
    parset.insert("ingest.timeout", "0.05");
    let config = Arc::new(ObsConfig::from_parset(&parset, 0).unwrap());
    let ring = Arc::new(DatagramRing::new(8));
    let (tx, md) = metadata::channel(8);
    let source = MergedSource::new(ring, md, config.clone()).unwrap();
    let mut pipeline = IngestPipeline::new(source, TaskChain::new(), 0, config.timeout);

    // Complete the observation once the pipeline has stalled a few times
    let feeder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        tx.send(metadata(0, SCAN_OBS_COMPLETE)).unwrap();
        std::thread::sleep(Duration::from_millis(300));
    });
    let summary = pipeline.run().unwrap();
    feeder.join().unwrap();
    assert!(summary.stalls >= 2);
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.final_scan, SCAN_OBS_COMPLETE);
}

#[test]
fn peer_abort_stops_a_running_pipeline() {
    let mut parset = Parset::parse(PARSET).unwrap();
    parset.insert("tasks.tasklist", "[]");
    parset.insert("ingest.timeout", "0.05");
    let config = Arc::new(ObsConfig::from_parset(&parset, 0).unwrap());
    let ring = Arc::new(DatagramRing::new(8));
    // Metadata stays open but silent, so only the abort can end the run
    let (_md_tx, md) = metadata::channel(8);
    let source = MergedSource::new(ring, md, config.clone()).unwrap();

    let mut group = LocalTransport::group(2);
    let worker = Comms::new(group.pop().unwrap());
    let master = Comms::new(group.pop().unwrap());
    let (sd_s, sd_r) = broadcast::channel(1);
    worker.on_abort(move |_| {
        let _ = sd_s.send(());
    });

    let mut pipeline =
        IngestPipeline::new(source, TaskChain::new(), 1, config.timeout).with_shutdown(sd_r);
    let aborter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        master.abort(3);
    });
    let summary = pipeline.run().unwrap();
    aborter.join().unwrap();

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert!(summary.stalls >= 1);
    assert_eq!(summary.final_scan, SCAN_IDLE);
    assert!(!summary.completed());
    assert_eq!(worker.aborted(), Some(3));
}
