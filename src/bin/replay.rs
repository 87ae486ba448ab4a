use std::path::PathBuf;

use anyhow::{Context, Result};
use env_logger::Env;
use log::info;

use gridiron_stream::config::PipelineConfig;
use gridiron_stream::synthetic::{self, SyntheticConfig};

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let out = arg_value(&args, "--out")
        .map(PathBuf::from)
        .context("missing --out DIR")?;
    let defaults = SyntheticConfig::default();
    let config = SyntheticConfig {
        games: parse_or(&args, "--games", defaults.games)?.max(1),
        plays_per_game: parse_or(&args, "--plays", defaults.plays_per_game)?.max(1),
        seed: parse_or(&args, "--seed", defaults.seed)?,
        ..defaults
    };
    let partitions = parse_or(&args, "--partitions", PipelineConfig::default().partitions)?.clamp(1, 64);

    let games = synthetic::generate(&config);
    let feed = synthetic::render(&games, &config)?;
    feed.write_jsonl(&out, partitions)?;

    info!(
        "Wrote {} games ({} play records, {} frame rows) to {} across {} partitions",
        games.len(),
        feed.plays.len(),
        feed.frames.len(),
        out.display(),
        partitions
    );
    for game in &games {
        println!("{} plays={}", game.game_id, game.plays.len());
    }
    Ok(())
}

fn parse_or<T>(args: &[String], name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match arg_value(args, name) {
        Some(raw) => raw.parse::<T>().with_context(|| format!("parse {name}={raw}")),
        None => Ok(default),
    }
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
