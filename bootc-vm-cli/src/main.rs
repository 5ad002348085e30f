mod config;
mod pipeline_file;

use std::path::PathBuf;

use anyhow::{Context, Result};
use bootc_vm::{VMRegistry, VMState};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "bootvmctl", version, about = "Boot, probe, and tear down bootc test VMs")]
struct Cli {
    /// Path to a config.toml; defaults to `~/.config/bootc-vm/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot a VM from a pipeline file, run its boot checks, then tear it down.
    Run {
        /// Minimal pipeline TOML file (name, base_dir, boot_checks, boot_timeout_secs, gui).
        pipeline_file: PathBuf,
        /// Container image tag to resolve a disk image for.
        image_tag: String,
    },
    /// List every VM the registry knows about.
    List,
    /// Stop a running VM and release its resources.
    Stop { name: String },
    /// Print a VM's persisted status.
    Status { name: String },
    /// Dump, or follow, a VM's serial and proxy logs.
    Logs {
        name: String,
        #[arg(short, long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.or_else(config::Config::default_path);
    if let Some(path) = config_path {
        let config = config::Config::load(&path).await?;
        config.apply_to_environment();
    }

    match cli.command {
        Command::Run { pipeline_file, image_tag } => run(&pipeline_file, &image_tag).await,
        Command::List => list().await,
        Command::Stop { name } => stop(&name).await,
        Command::Status { name } => status(&name).await,
        Command::Logs { name, follow } => logs(&name, follow).await,
    }
}

async fn run(pipeline_file: &std::path::Path, image_tag: &str) -> Result<()> {
    let pipeline = pipeline_file::load(pipeline_file).await?;

    let preflight = bootc_vm::check_prerequisites(&pipeline, image_tag).await;
    if !preflight.is_ready() {
        for reason in &preflight.missing {
            eprintln!("preflight failed: {reason}");
        }
        anyhow::bail!("preflight checks failed for `{image_tag}`");
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let info = bootc_vm::execute(&pipeline, image_tag, cancel)
        .await
        .context("vm run failed")?;

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn list() -> Result<()> {
    let infos = VMRegistry::at_default_location().list().await?;
    if infos.is_empty() {
        println!("no VMs registered");
        return Ok(());
    }
    for info in infos {
        let running = VMRegistry::is_vm_running(&info);
        println!(
            "{:<20} {:<10} pid={:<8} ssh={}:{}",
            info.name,
            if running { "running" } else { "stopped" },
            info.process_id,
            info.ssh_host,
            info.ssh_port,
        );
    }
    Ok(())
}

async fn stop(name: &str) -> Result<()> {
    let registry = VMRegistry::at_default_location();
    let info = registry.load(name).await.context("loading VM info")?;

    for pid in [info.process_id, info.proxy_process_id] {
        if pid == 0 {
            continue;
        }
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
    }
    let _ = bootc_vm::port_registry::PortRegistry::at_default_location()
        .release_port(info.ssh_port)
        .await;
    registry.delete(name).await?;
    println!("stopped {name}");
    Ok(())
}

async fn status(name: &str) -> Result<()> {
    let registry = VMRegistry::at_default_location();
    let mut info = registry.load(name).await.context("loading VM info")?;
    if !VMRegistry::is_vm_running(&info) {
        info.state = VMState::Stopped;
    }
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn logs(name: &str, follow: bool) -> Result<()> {
    let registry = VMRegistry::at_default_location();
    let info = registry.load(name).await.context("loading VM info")?;

    print_log_file("serial", &info.serial_log_path).await;
    let safe_name = bootc_vm::VMOptions::sanitize_name(&info.name);
    let proxy_log = bootc_vm::paths::proxy_log_path(&safe_name);
    print_log_file("proxy", &proxy_log).await;

    if follow {
        follow_log_file(&info.serial_log_path).await?;
    }
    Ok(())
}

async fn print_log_file(label: &str, path: &std::path::Path) {
    println!("==> {label}: {} <==", path.display());
    match tokio::fs::read_to_string(path).await {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("({label} log unavailable: {e})"),
    }
}

async fn follow_log_file(path: &std::path::Path) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {} to follow", path.display()))?;
    file.seek(std::io::SeekFrom::End(0)).await?;

    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            continue;
        }
        print!("{}", String::from_utf8_lossy(&buf[..n]));
    }
}
