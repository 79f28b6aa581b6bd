//! Command handlers. Each returns the one-line summary printed on success.

use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chanvault_engine::{TransferConfig, TransferEngine, TransferEvent};
use chanvault_local_channel::LocalChannel;
use chanvault_settings::{SettingsStore, UserSettings};
use chanvault_transfer::{
    Direction, KeyStore, SpeedCalculator, clamp_chunk_size, render_progress_bar,
    source_file_name,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channels::{new_channel_dir, resolve_channel_dir};
use crate::config::Config;
use crate::{Command, SettingsCommand};

const BAR_WIDTH: usize = 30;

/// Cancels the running transfer when the user presses Ctrl-C.
struct CancelOnCtrlC(JoinHandle<()>);

impl CancelOnCtrlC {
    fn spawn(token: CancellationToken) -> Self {
        Self(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling transfer");
                token.cancel();
            }
        }))
    }

    fn disarm(self) {
        self.0.abort();
    }
}

pub async fn run(command: Command, config: &Config) -> anyhow::Result<String> {
    match command {
        Command::SplitFile {
            path,
            compress,
            chunk_size,
            encrypt,
            key,
        } => split_file(config, &path, compress, chunk_size, encrypt, key).await,
        Command::CombineFile { channel, output } => combine_file(config, &channel, &output).await,
        Command::Settings(SettingsCommand::Show) => settings_show(config),
        Command::Settings(SettingsCommand::Set {
            encrypt,
            compress,
            chunk_size,
        }) => settings_set(config, encrypt, compress, chunk_size),
        Command::Keygen => keygen(config),
    }
}

fn transfer_config(config: &Config, settings: &UserSettings) -> TransferConfig {
    TransferConfig {
        concurrency: config.concurrency,
        manifest_search_window: config.manifest_search_window,
        ..TransferConfig::from_settings(settings)
    }
}

async fn split_file(
    config: &Config,
    path: &Path,
    compress: Option<bool>,
    chunk_size: Option<usize>,
    encrypt: bool,
    key: Option<String>,
) -> anyhow::Result<String> {
    if !path.is_file() {
        bail!("{} is not a file", path.display());
    }
    let file_name = source_file_name(path)?;

    let settings = SettingsStore::new(config.settings_path.clone()).load(&config.user_id)?;
    let mut transfer = transfer_config(config, &settings);
    if let Some(compress) = compress {
        transfer.compress = compress;
    }
    if let Some(size) = chunk_size {
        transfer = transfer.with_chunk_size(size);
    }

    let channel_dir = new_channel_dir(&config.channel_root, &file_name);
    let channel = LocalChannel::open(&channel_dir)
        .await
        .with_context(|| format!("opening channel {}", channel_dir.display()))?;
    let mut engine = TransferEngine::new(Arc::new(channel), transfer.clone())?;

    let key_id = if encrypt || settings.encrypt || key.is_some() {
        let keys = KeyStore::open(config.key_store.clone())?;
        let key_id = match key {
            Some(id) => id,
            None => keys.generate()?,
        };
        engine = engine.with_cipher(keys.cipher(&key_id)?);
        Some(key_id)
    } else {
        None
    };

    let progress = spawn_progress(engine.take_events(), transfer.chunk_size as u64);
    let guard = CancelOnCtrlC::spawn(engine.cancel_token());
    let result = engine.send(path).await;
    guard.disarm();
    let elapsed = took(&engine);
    drop(engine);
    finish_progress(progress).await;

    let manifest = result?;
    let mut summary = format!(
        "sent {} ({} chunks) to {}, positions {}..={}{elapsed}",
        manifest.file_name,
        manifest.total_chunks.unwrap_or_default(),
        channel_dir.display(),
        manifest.first_position,
        manifest.last_position,
    );
    if let Some(key_id) = key_id {
        summary.push_str(&format!(", encrypted with key {key_id}"));
    }
    Ok(summary)
}

async fn combine_file(config: &Config, channel: &str, output: &Path) -> anyhow::Result<String> {
    let channel_dir = resolve_channel_dir(&config.channel_root, channel);
    if !channel_dir.is_dir() {
        bail!("no channel at {}", channel_dir.display());
    }

    let settings = SettingsStore::new(config.settings_path.clone()).load(&config.user_id)?;
    let transfer = transfer_config(config, &settings);
    let channel = LocalChannel::open(&channel_dir).await?;
    let keys = KeyStore::open(config.key_store.clone())?;
    let mut engine =
        TransferEngine::new(Arc::new(channel), transfer.clone())?.with_key_store(Arc::new(keys));

    let progress = spawn_progress(engine.take_events(), transfer.chunk_size as u64);
    let guard = CancelOnCtrlC::spawn(engine.cancel_token());
    let result = engine.combine_from_channel(output).await;
    guard.disarm();
    let elapsed = took(&engine);
    drop(engine);
    finish_progress(progress).await;

    let (_, report) = result?;
    Ok(format!(
        "wrote {} ({} bytes, {} chunks{}){elapsed}",
        report.path.display(),
        report.bytes_written,
        report.total_chunks,
        if report.duplicates > 0 {
            format!(", {} duplicates ignored", report.duplicates)
        } else {
            String::new()
        }
    ))
}

/// ` in 1.2s` for the engine's last job, or nothing if it never started.
fn took(engine: &TransferEngine) -> String {
    engine
        .current_job()
        .and_then(|job| job.elapsed())
        .map(|d| format!(" in {:.1}s", d.as_secs_f64()))
        .unwrap_or_default()
}

fn describe(user: &str, s: &UserSettings) -> String {
    format!(
        "user {user}: encrypt={} compress={} chunk_size={}",
        s.encrypt,
        s.compress,
        format_bytes(s.chunk_size as u64)
    )
}

fn settings_show(config: &Config) -> anyhow::Result<String> {
    let settings = SettingsStore::new(config.settings_path.clone()).load(&config.user_id)?;
    Ok(describe(&config.user_id, &settings))
}

fn settings_set(
    config: &Config,
    encrypt: Option<bool>,
    compress: Option<bool>,
    chunk_size: Option<usize>,
) -> anyhow::Result<String> {
    if encrypt.is_none() && compress.is_none() && chunk_size.is_none() {
        bail!("nothing to set: pass --encrypt, --compress or --chunk-size");
    }
    let store = SettingsStore::new(config.settings_path.clone());
    let updated = store.update(&config.user_id, |s| {
        if let Some(encrypt) = encrypt {
            s.encrypt = encrypt;
        }
        if let Some(compress) = compress {
            s.compress = compress;
        }
        if let Some(size) = chunk_size {
            s.chunk_size = clamp_chunk_size(size);
        }
    })?;
    Ok(describe(&config.user_id, &updated))
}

fn keygen(config: &Config) -> anyhow::Result<String> {
    let keys = KeyStore::open(config.key_store.clone())?;
    let key_id = keys.generate()?;
    Ok(format!(
        "generated key {key_id} in {} ({} stored)",
        keys.path().display(),
        keys.key_ids().len()
    ))
}

/// Parses a byte count such as `4194304`, `512KiB`, `4MiB` or `4mb`.
///
/// Units are binary regardless of spelling.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: usize = digits
        .parse()
        .map_err(|_| format!("invalid size `{s}`"))?;
    let factor: usize = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size unit `{other}`")),
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| format!("size `{s}` is too large"))
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(d) => {
            let secs = d.as_secs();
            format!("{:02}:{:02}", secs / 60, secs % 60)
        }
        None => "--:--".into(),
    }
}

/// Renders job events to stderr while a transfer runs.
///
/// Progress lines are only drawn on a terminal; the receiver is still drained
/// otherwise so the engine never sees a full channel.
fn spawn_progress(
    events: Option<mpsc::Receiver<TransferEvent>>,
    chunk_bytes: u64,
) -> Option<JoinHandle<()>> {
    let mut events = events?;
    let draw = std::io::stderr().is_terminal();
    Some(tokio::spawn(async move {
        let mut speed = SpeedCalculator::default();
        let mut last = 0u32;
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Started {
                    direction,
                    file_name,
                    total,
                    ..
                } => {
                    let verb = match direction {
                        Direction::Upload => "uploading",
                        Direction::Download => "downloading",
                    };
                    tracing::info!(file = %file_name, chunks = total, "{verb}");
                    speed.add_sample(0);
                }
                TransferEvent::Progress {
                    completed, total, ..
                } => {
                    speed.add_sample(u64::from(completed.saturating_sub(last)) * chunk_bytes);
                    last = completed;
                    if draw {
                        let remaining = u64::from(total.saturating_sub(completed)) * chunk_bytes;
                        let mut err = std::io::stderr().lock();
                        let _ = write!(
                            err,
                            "\r{} {completed}/{total} {}/s eta {}",
                            render_progress_bar(completed.into(), total.into(), BAR_WIDTH),
                            format_bytes(speed.bytes_per_second() as u64),
                            format_eta(speed.eta(remaining)),
                        );
                        let _ = err.flush();
                    }
                }
                TransferEvent::ChunkFailed { index, error, .. } => {
                    tracing::warn!(?index, %error, "chunk failed");
                }
                TransferEvent::Completed { .. } | TransferEvent::Failed { .. } => {
                    if draw {
                        eprintln!();
                    }
                }
            }
        }
    }))
}

async fn finish_progress(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle
        && let Err(e) = handle.await
    {
        tracing::debug!(error = %e, "progress task ended abnormally");
    }
}
