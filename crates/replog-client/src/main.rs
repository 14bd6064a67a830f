#![warn(missing_docs)]

//! Compaction tool: feeds the local log into a state machine, writes a
//! snapshot, and prunes obsolete segments.
//!
//! The compaction index is given explicitly with `--index`, or derived as
//! `min(commit_index, prune_index)` from a peer named with `--peer`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use replog_client::cancel::CancelToken;
use replog_client::rpc::{ClientConfig, ClusterClient};
use replog_log::compact::{run_compaction, CompactError, CompactionOptions};
use replog_log::state::{StateMachine, VecState};
use replog_log::types::LogIndex;
use replog_net::message::PeerInfo;
use replog_net::transport::PeerDirectory;
use replog_net::url::PeerUrl;

struct Args {
    data_root: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    state_machine: Option<String>,
    index: Option<u64>,
    peer: Option<String>,
    compression_level: u32,
    serve_compressed: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        data_root: None,
        snapshot_path: None,
        log_dir: None,
        state_machine: None,
        index: None,
        peer: None,
        compression_level: 0,
        serve_compressed: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        let mut value = |name: &str| {
            it.next().ok_or_else(|| format!("{name} needs a value"))
        };
        match flag.as_str() {
            "--root" => args.data_root = Some(PathBuf::from(value("--root")?)),
            "--target" => args.snapshot_path = Some(PathBuf::from(value("--target")?)),
            "--log-dir" => args.log_dir = Some(PathBuf::from(value("--log-dir")?)),
            "--state-machine" => args.state_machine = Some(value("--state-machine")?),
            "--index" => {
                args.index = Some(
                    value("--index")?
                        .parse::<u64>()
                        .map_err(|e| format!("--index: {e}"))?,
                )
            }
            "--peer" => args.peer = Some(value("--peer")?),
            "--compress" => {
                args.compression_level = value("--compress")?
                    .parse::<u32>()
                    .map_err(|e| format!("--compress: {e}"))?
            }
            "--serve-compressed" => args.serve_compressed = true,
            other => return Err(format!("unknown flag {other}")),
        }
    }
    Ok(args)
}

fn make_state_machine(name: &str) -> Result<Box<dyn StateMachine>, CompactError> {
    match name {
        "vec" | "builtin:vec" => Ok(Box::new(VecState::new())),
        other => Err(CompactError::MissingStateMachine {
            name: other.to_string(),
        }),
    }
}

/// Asks `peer` for its log info and derives the compaction index as
/// `min(commit_index, prune_index)`.
async fn derive_index_from_peer(peer: &str) -> Result<LogIndex, CompactError> {
    let url = PeerUrl::parse(peer).map_err(|e| CompactError::Fatal(e.to_string()))?;
    let peers = vec![PeerInfo { id: 0, url }];
    let mut client = ClusterClient::new(peers, PeerDirectory::new(), ClientConfig::default())
        .map_err(|e| CompactError::Fatal(e.to_string()))?;
    let cancel = CancelToken::new();
    let deadline = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        deadline.cancel();
    });
    let info = client
        .request_log_info(true, &cancel)
        .await
        .map_err(|_| CompactError::MissingIndex)?;
    Ok(info.commit_index.min(info.prune_index))
}

async fn run() -> Result<(), CompactError> {
    let args = parse_args().map_err(CompactError::Fatal)?;

    let data_root = args.data_root.ok_or(CompactError::MissingDataRoot {
        path: "(not given)".to_string(),
    })?;
    let machine_name = args
        .state_machine
        .ok_or(CompactError::MissingStateMachine {
            name: "(not given)".to_string(),
        })?;
    let mut sm = make_state_machine(&machine_name)?;

    let target_index = match (args.index, args.peer.as_deref()) {
        (Some(i), _) => LogIndex::new(i),
        (None, Some(peer)) => derive_index_from_peer(peer).await?,
        (None, None) => return Err(CompactError::MissingIndex),
    };

    let opts = CompactionOptions {
        data_root,
        snapshot_path: args.snapshot_path,
        log_dir: args.log_dir,
        target_index: Some(target_index),
        compression_level: args.compression_level,
        serve_compressed: args.serve_compressed,
    };
    let report = run_compaction(&opts, sm.as_mut())?;
    tracing::info!(
        snapshot = %report.snapshot_path.display(),
        last_included = report.meta.last_included_index.as_u64(),
        bytes = report.meta.data_size,
        compressed = report.compressed,
        "compaction finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, code = e.exit_code(), "compaction failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
