use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};

use simbridge::config::MEGA;
use simbridge::loader::read_c_string;
use simbridge::logger::StderrLogger;
use simbridge::pipeline::script::ScriptedPipeline;
use simbridge::syscall::numbers;
use simbridge::{Bridge, BridgeConfig, BridgeSnapshot, TrapOutcome};

/// Serve a RISC-V pipeline model's memory bus and proxy its system calls
#[derive(Parser, Debug)]
#[command(name = "simbridge", version)]
struct Args {
    /// Guest ELF image (may be gzip or zstd compressed)
    image: PathBuf,

    /// Arguments passed to the guest after its own name
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,

    /// Physical memory in MiB
    #[arg(long, default_value_t = 1024)]
    ram_mb: u64,

    /// Identity-map guest addresses instead of walking a page table
    #[arg(long)]
    no_vm: bool,

    /// Do not bind guest pages into the host address space (paging needs it, so only with --no-vm)
    #[arg(long)]
    no_host_mapping: bool,

    /// Seed for physical page placement
    #[arg(long)]
    seed: Option<u64>,

    /// Render the text console and read the keyboard
    #[arg(long, env = "SHOWCONSOLE")]
    console: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "SIMBRIDGE_LOG", default_value = "warn")]
    log_level: LevelFilter,

    /// Stop after this many cycles
    #[arg(long, default_value_t = 2_000_000)]
    max_cycles: u64,

    /// JSON bus script to drive instead of a pipeline model
    #[arg(long)]
    script: Option<PathBuf>,

    /// Start from a saved snapshot instead of a fresh load
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Write a snapshot here when the run ends
    #[arg(long)]
    dump_state: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> BridgeConfig {
        BridgeConfig {
            ram_size: self.ram_mb * MEGA,
            virtual_memory: !self.no_vm,
            host_mapping: !self.no_vm && !self.no_host_mapping,
            page_seed: self.seed,
            console: self.console,
            ..BridgeConfig::default()
        }
    }
}

/// Echo argv through the proxied write path
fn echo_arguments(bridge: &mut Bridge, argc: usize) -> Result<()> {
    let sp = bridge.reset_vector().stack_pointer;
    for i in 0..argc as u64 {
        let raw = bridge.space_mut().read_virtual(sp + 8 * (i + 1), 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&raw);
        let ptr = u64::from_le_bytes(word);
        let arg = read_c_string(bridge.space_mut(), ptr, 4096)?;
        let outcome = bridge.ecall(numbers::WRITE, [2, ptr, arg.len() as u64, 0, 0, 0, 0])?;
        eprintln!();
        if let TrapOutcome::Completed { value, errno } = outcome {
            if value < 0 {
                bail!("echoing argv[{}] failed (errno {:?})", i, errno);
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    StderrLogger::new(args.log_level).init().context("installing logger")?;

    let mut bridge = Bridge::new(args.config()).context("creating bridge")?;

    let mut guest_argv = vec![args.image.display().to_string()];
    guest_argv.extend(args.guest_args.iter().cloned());

    if let Some(path) = &args.restore {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let snapshot = BridgeSnapshot::from_bytes(&bytes)?;
        bridge.restore_snapshot(&snapshot)?;
        info!("restored {} ({} bytes of pages)", path.display(), snapshot.page_bytes());
    } else {
        let image = fs::read(&args.image).with_context(|| format!("reading {}", args.image.display()))?;
        let loaded = bridge.load_image(&image).context("loading image")?;
        info!("{} segments, image ends at {:#x}", loaded.segments.len(), loaded.image_end);
        bridge.setup_stack(&guest_argv).context("building initial stack")?;
        if log::log_enabled!(log::Level::Info) {
            echo_arguments(&mut bridge, guest_argv.len())?;
        }
    }

    let reset = bridge.reset_vector();
    info!(
        "reset: entry {:#x} sp {:#x} root {:#x}",
        reset.entry, reset.stack_pointer, reset.page_table_root
    );

    if let Some(path) = &args.script {
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut pipeline = ScriptedPipeline::from_json(&text)?;
        let summary = simbridge::run(&mut bridge, &mut pipeline, args.max_cycles)?;
        if let Some(halt) = &summary.halt {
            info!("{}", halt);
        }
        println!("{}", serde_json::to_string_pretty(pipeline.report())?);
    }

    if let Some(path) = &args.dump_state {
        let bytes = bridge.create_snapshot()?.to_bytes()?;
        fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
        info!("snapshot written to {} ({} bytes)", path.display(), bytes.len());
    }

    if let Some(simbridge::HaltReason::Exit(code)) = bridge.halted() {
        std::process::exit(exit_status(*code));
    }
    Ok(())
}

/// Guest exit code as a process status; out-of-range codes saturate
fn exit_status(code: i64) -> i32 {
    i32::try_from(code).unwrap_or(if code < 0 { i32::MIN } else { i32::MAX })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(5), 5);
        assert_eq!(exit_status(-1), -1);
        assert_eq!(exit_status(1 << 40), i32::MAX);
        assert_eq!(exit_status(i64::MIN), i32::MIN);
    }
}
