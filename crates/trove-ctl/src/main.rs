//! trove-ctl: command-line client for a trove peer's control endpoint.
//!
//! ```text
//! trove-ctl <access_point> BACKUP <file> <replication>
//! trove-ctl <access_point> RESTORE <file>
//! trove-ctl <access_point> DELETE <file>
//! trove-ctl <access_point> RECLAIM <max_bytes>
//! trove-ctl <access_point> STATE
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct BackupRequest<'a> {
    path: &'a Path,
    replication: u8,
}

#[derive(Serialize)]
struct PathRequest<'a> {
    path: &'a Path,
}

#[derive(Serialize)]
struct ReclaimRequest {
    max_bytes: u64,
}

#[derive(Deserialize)]
struct FileResponse {
    file_id: String,
}

#[derive(Deserialize)]
struct ReclaimResponse {
    evicted: usize,
}

#[derive(Deserialize)]
struct StateResponse {
    state: String,
}

// ── HTTP helpers ──────────────────────────────────────────────────────────────

fn base_url(addr: SocketAddr) -> String {
    format!("http://{addr}/api")
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    bail!("peer refused request ({status}): {body}")
}

async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to peer at {url}, is it running?"))?;
    check(resp)
        .await?
        .json::<T>()
        .await
        .context("failed to parse response")
}

async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(url: &str, body: &B) -> Result<T> {
    let resp = reqwest::Client::new()
        .post(url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("failed to connect to peer at {url}, is it running?"))?;
    check(resp)
        .await?
        .json::<T>()
        .await
        .context("failed to parse response")
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Backup { path: PathBuf, replication: u8 },
    Restore { path: PathBuf },
    Delete { path: PathBuf },
    Reclaim { max_bytes: u64 },
    State,
}

fn parse_command(args: &[&str]) -> Result<Command> {
    let command = match args {
        [op, file, rd] if op.eq_ignore_ascii_case("backup") => Command::Backup {
            path: PathBuf::from(file),
            replication: rd
                .parse()
                .with_context(|| format!("replication degree must be a number, got {rd:?}"))?,
        },
        [op, file] if op.eq_ignore_ascii_case("restore") => Command::Restore {
            path: PathBuf::from(file),
        },
        [op, file] if op.eq_ignore_ascii_case("delete") => Command::Delete {
            path: PathBuf::from(file),
        },
        [op, bytes] if op.eq_ignore_ascii_case("reclaim") => Command::Reclaim {
            max_bytes: bytes
                .parse()
                .with_context(|| format!("reclaim size must be a byte count, got {bytes:?}"))?,
        },
        [op] if op.eq_ignore_ascii_case("state") => Command::State,
        other => bail!("unknown command: {}", other.join(" ")),
    };
    Ok(command)
}

/// Paths are resolved here; the peer may run in another directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("invalid path {}", path.display()))
}

async fn run(addr: SocketAddr, command: Command) -> Result<()> {
    let base = base_url(addr);
    match command {
        Command::Backup { path, replication } => {
            let path = absolute(&path)?;
            let resp: FileResponse = post_json(
                &format!("{base}/backup"),
                &BackupRequest {
                    path: &path,
                    replication,
                },
            )
            .await?;
            println!("Backup of {} started (file {})", path.display(), resp.file_id);
        }
        Command::Restore { path } => {
            let path = absolute(&path)?;
            let resp: FileResponse =
                post_json(&format!("{base}/restore"), &PathRequest { path: &path }).await?;
            println!("Restore of {} started (file {})", path.display(), resp.file_id);
        }
        Command::Delete { path } => {
            let path = absolute(&path)?;
            let resp: FileResponse =
                post_json(&format!("{base}/delete"), &PathRequest { path: &path }).await?;
            println!("Delete of {} sent (file {})", path.display(), resp.file_id);
        }
        Command::Reclaim { max_bytes } => {
            let resp: ReclaimResponse =
                post_json(&format!("{base}/reclaim"), &ReclaimRequest { max_bytes }).await?;
            println!("Storage capped at {max_bytes} bytes, {} chunks evicted", resp.evicted);
        }
        Command::State => {
            let resp: StateResponse = get_json(&format!("{base}/state")).await?;
            print!("{}", resp.state);
        }
    }
    Ok(())
}

fn print_usage() {
    println!("trove-ctl: control a trove backup peer");
    println!();
    println!("Usage:");
    println!("  trove-ctl <access_point> BACKUP <file> <replication>");
    println!("  trove-ctl <access_point> RESTORE <file>");
    println!("  trove-ctl <access_point> DELETE <file>");
    println!("  trove-ctl <access_point> RECLAIM <max_bytes>");
    println!("  trove-ctl <access_point> STATE");
    println!();
    println!("An access point is a port on 127.0.0.1 or a full ip:port.");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        [] | ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        [access_point, rest @ ..] => {
            let addr = trove_core::config::parse_access_point(access_point)?;
            let command = match parse_command(rest) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("{e:#}");
                    eprintln!();
                    print_usage();
                    std::process::exit(1);
                }
            };
            run(addr, command).await
        }
    }
}
