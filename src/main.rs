use std::io::Write as _;
use std::thread;

use anyhow::Context as _;
use clap::Parser;
use crossbeam_channel::bounded;
use leakscan::chunk::Chunk;
use leakscan::cli::{Cli, Command};
use leakscan::source::{CancelToken, Source};

/// Backpressure bound between sources and the stdout writer.
const CHUNK_CHANNEL_CAPACITY: usize = 64;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cancel = CancelToken::new();

    let resume = cli.resume.unwrap_or_default();
    let mut source: Box<dyn Source> = match cli.command {
        Command::Git(args) => Box::new(args.into_source().with_resume_info(&resume)),
        Command::Github(args) => Box::new(args.into_source()?),
        Command::Gcs(args) => Box::new(args.into_source().with_resume_info(&resume)),
    };
    source
        .init(&cli.name, cli.source_id, cli.job_id, cli.verify, cli.concurrency)
        .context("initializing source")?;

    let (tx, rx) = bounded::<Chunk>(CHUNK_CHANNEL_CAPACITY);
    let writer = thread::spawn(move || -> anyhow::Result<u64> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let mut written = 0u64;
        for chunk in rx.iter() {
            serde_json::to_writer(&mut out, &chunk)?;
            out.write_all(b"\n")?;
            written += 1;
        }
        out.flush()?;
        Ok(written)
    });

    let result = source.chunks(&tx, &[], &cancel);
    drop(tx);

    let written = writer
        .join()
        .map_err(|_| anyhow::anyhow!("chunk writer panicked"))?
        .context("writing chunks")?;

    let progress = source.progress();
    log::info!(
        "{}% complete ({} of {} sections): {} chunks emitted",
        progress.percent_complete,
        progress.sections_completed,
        progress.sections_remaining,
        written,
    );
    if !progress.encoded_resume_info.is_empty() {
        log::info!("resume with --resume {:?}", progress.encoded_resume_info);
    }

    result
}
