use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use env_logger::Env;
use log::{error, info, warn};

use gridiron_stream::checkpoint::FileCheckpointStore;
use gridiron_stream::clock::SystemClock;
use gridiron_stream::config::PipelineConfig;
use gridiron_stream::coordinator::WorkerParts;
use gridiron_stream::error::PipelineError;
use gridiron_stream::log_cursor::{FRAMES_STREAM, FileLog, PLAYS_STREAM};
use gridiron_stream::pipeline;
use gridiron_stream::scoring::RuleScorer;
use gridiron_stream::sink::{Diverted, FanoutSink, FeedSink, FeedUpdate, SideChannel, SinkEmitter, SqliteSink};

struct Args {
    input: PathBuf,
    db: PathBuf,
    side: PathBuf,
    partitions: Option<usize>,
    exit_when_idle: Option<Duration>,
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = parse_args()?;
    let mut config = PipelineConfig::from_env()?;
    if let Some(partitions) = args.partitions {
        config.partitions = partitions.clamp(1, 64);
    }
    info!(
        "Reading {} ({} partitions), storing to {}",
        args.input.display(),
        config.partitions,
        args.db.display()
    );

    let (feed, feed_rx) = FeedSink::channel();
    let (side, side_rx) = SideChannel::channel();
    let side_writer = spawn_side_writer(args.side.clone(), side_rx)?;

    let retry = config.retry.clone();
    let input = args.input.clone();
    let db = args.db.clone();
    let handle = pipeline::spawn(config, |partition, pool| {
        let plays = FileLog::new(&input, PLAYS_STREAM)
            .cursor(partition)
            .map_err(|source| unavailable(PLAYS_STREAM, partition, source))?;
        let frames = FileLog::new(&input, FRAMES_STREAM)
            .cursor(partition)
            .map_err(|source| unavailable(FRAMES_STREAM, partition, source))?;
        let storage = SqliteSink::open(&db).map_err(|err| PipelineError::Config(format!("{err:#}")))?;
        let fanout = FanoutSink::new(vec![Box::new(storage), Box::new(feed.clone())]);
        Ok(WorkerParts {
            plays: Box::new(plays),
            frames: Box::new(frames),
            emitter: SinkEmitter::new(Box::new(fanout), retry.clone()),
            side: side.clone(),
            checkpoints: Box::new(FileCheckpointStore::new(input.join("checkpoints"))),
            scorer: Arc::new(RuleScorer),
            clock: Arc::new(SystemClock),
            pool,
        })
    })?;
    // Workers hold their own senders; the writer exits once they are gone.
    drop(side);
    drop(feed);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut last_activity = Instant::now();
    loop {
        match feed_rx.recv_timeout(Duration::from_millis(250)) {
            Ok(update) => {
                write_feed(&mut out, &update)?;
                last_activity = Instant::now();
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if handle.finished() > 0 {
            warn!("A worker exited early; draining the rest");
            handle.drain();
            break;
        }
        if args
            .exit_when_idle
            .is_some_and(|idle| last_activity.elapsed() >= idle)
        {
            info!("No output for {:?}; draining", args.exit_when_idle.unwrap_or_default());
            handle.drain();
            break;
        }
    }

    let joined = handle.join();
    for update in feed_rx.try_iter() {
        write_feed(&mut out, &update)?;
    }
    out.flush().context("flush feed")?;
    if side_writer.join().is_err() {
        error!("Side channel writer panicked");
    }

    let reports = joined.map_err(|err| anyhow!("pipeline failed: {err}"))?;
    for report in reports {
        info!(
            "Worker 'p{}': records={} emitted={} unchanged={} late={} malformed={} orphaned={} timeouts={} open={}",
            report.partition,
            report.records,
            report.emitted,
            report.unchanged,
            report.late,
            report.malformed,
            report.orphaned,
            report.timeouts,
            report.open_plays
        );
    }
    Ok(())
}

fn unavailable(
    stream: &str,
    partition: usize,
    source: gridiron_stream::error::LogError,
) -> PipelineError {
    PipelineError::StreamUnavailable {
        stream: stream.to_string(),
        partition,
        attempts: 1,
        source,
    }
}

fn write_feed(out: &mut impl Write, update: &FeedUpdate) -> Result<()> {
    let FeedUpdate::Play(play) = update;
    let line = serde_json::to_string(play).context("encode feed update")?;
    writeln!(out, "{line}").context("write feed update")?;
    Ok(())
}

fn spawn_side_writer(path: PathBuf, rx: Receiver<Diverted>) -> Result<thread::JoinHandle<()>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open side channel {}", path.display()))?;
    let handle = thread::Builder::new()
        .name("side-channel".to_string())
        .spawn(move || {
            let mut writer = BufWriter::new(file);
            let mut written = 0u64;
            for record in rx {
                match serde_json::to_string(&record) {
                    Ok(line) => {
                        if let Err(err) = writeln!(writer, "{line}") {
                            error!("Side channel write failed: {err}");
                        }
                        written += 1;
                    }
                    Err(err) => error!("Side channel encode failed: {err}"),
                }
                if written % 100 == 0 {
                    let _ = writer.flush();
                }
            }
            let _ = writer.flush();
            info!("Side channel: {written} records written to {}", path.display());
        })
        .context("spawn side channel writer")?;
    Ok(handle)
}

fn parse_args() -> Result<Args> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let input = arg_value(&args, "--input")
        .map(PathBuf::from)
        .context("missing --input DIR")?;
    if !input.is_dir() {
        return Err(anyhow!("input {} is not a directory", input.display()));
    }
    let db = arg_value(&args, "--db")
        .map(PathBuf::from)
        .unwrap_or_else(|| input.join("enriched_plays.sqlite"));
    let side = arg_value(&args, "--side")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_side_path(&input));
    let partitions = match arg_value(&args, "--partitions") {
        Some(raw) => Some(raw.parse::<usize>().context("parse --partitions")?),
        None => None,
    };
    let exit_when_idle = match arg_value(&args, "--exit-when-idle") {
        Some(raw) => Some(Duration::from_secs(
            raw.parse::<u64>().context("parse --exit-when-idle")?,
        )),
        None => None,
    };
    Ok(Args {
        input,
        db,
        side,
        partitions,
        exit_when_idle,
    })
}

fn default_side_path(input: &Path) -> PathBuf {
    input.join("side_channel.jsonl")
}

fn arg_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}
