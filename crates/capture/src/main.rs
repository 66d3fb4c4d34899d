//! fx3-capture
//!
//! Opens an FX3 streamer, runs the bulk pipeline into a ring buffer, drains
//! the buffer on a consumer thread and reports throughput until the
//! configured duration elapses or Ctrl+C is pressed.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use common::{RingBuffer, StreamStats, setup_logging};
use config::CaptureConfig;
use driver::sim::{SimulatedLifecycle, block_sequence};
use driver::usb::UsbLifecycle;
use driver::{BulkEndpoint, ControlChannel, DeviceLifecycle, Fx3Device, StreamExit};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};

/// Completion pacing of the simulated device
const SIMULATED_BLOCK_TIME: Duration = Duration::from_millis(2);

#[derive(Parser, Debug)]
#[command(name = "fx3-capture")]
#[command(author, version, about = "Stream samples from an FX3 acquisition device")]
#[command(long_about = "
Streams fixed-size sample blocks from a USB3 FX3-based acquisition device
into memory and reports throughput. Captured data is discarded.

EXAMPLES:
    # Stream from the first device until Ctrl+C
    fx3-capture

    # Stream for 30 seconds from the second device
    fx3-capture --device 1 --duration 30

    # Exercise the pipeline without hardware
    fx3-capture --simulate --duration 5

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/fx3-capture/capture.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Index of the device among connected FX3s
    #[arg(short, long, value_name = "INDEX")]
    device: Option<usize>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Use the in-memory device instead of USB hardware
    #[arg(long)]
    simulate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = CaptureConfig::default();
        let path = CaptureConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        CaptureConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        CaptureConfig::load_or_default()
    };

    if let Some(index) = args.device {
        config.capture.device_index = index;
    }
    if let Some(secs) = args.duration {
        config.capture.duration_secs = Some(secs);
    }
    if let Some(level) = args.log_level {
        config.capture.log_level = level;
    }
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.capture.log_level).context("Failed to setup logging")?;

    info!("fx3-capture v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.capture.log_level);

    if args.simulate {
        info!("Using simulated device");
        let lifecycle = SimulatedLifecycle::new(config.device.firmware)
            .with_completion_delay(SIMULATED_BLOCK_TIME);
        run_capture(lifecycle, &config, true).await
    } else {
        let lifecycle = UsbLifecycle::new(config.usb_ids());
        run_capture(lifecycle, &config, false).await
    }
}

/// Open the device, stream until told to stop, then report
async fn run_capture<L>(mut lifecycle: L, config: &CaptureConfig, verify: bool) -> Result<()>
where
    L: DeviceLifecycle,
{
    let firmware = config.load_firmware()?;
    let index = config.capture.device_index;

    let mut device: Fx3Device<L::Control, L::Bulk> =
        Fx3Device::open(&mut lifecycle, index, &firmware, config.device_options())
            .with_context(|| format!("Failed to open device {}", index))?;
    let info = device.hardware_info();
    info!(
        "Device {} ready: model {:#04x}, firmware {}",
        index, info.model, info.firmware
    );

    let buffer = Arc::new(
        RingBuffer::new(config.stream.ring_capacity).context("Failed to create ring buffer")?,
    );
    let consumed = Arc::new(AtomicU64::new(0));
    let consumer = spawn_consumer(Arc::clone(&buffer), Arc::clone(&consumed), verify)?;

    device
        .start_streaming(Arc::clone(&buffer), config.stream.transfer_size)
        .context("Failed to start streaming")?;
    device
        .control()
        .start_stream()
        .context("Failed to send start command")?;

    wait_for_stop(&device, &buffer, &consumed, config).await;

    if let Err(e) = device.control().stop_stream() {
        warn!("Failed to send stop command: {}", e);
    }
    let exit = device.stop_streaming().context("Failed to stop streaming")?;
    let gaps = consumer
        .join()
        .map_err(|_| anyhow::anyhow!("Consumer thread panicked"))?;

    let stats = device.metrics().snapshot();
    info!(
        "Capture finished ({}): {} blocks, {} bytes, {} short reads, {} failures, {} consumed",
        describe_exit(&exit),
        stats.blocks,
        stats.bytes,
        stats.short_reads,
        stats.failures,
        consumed.load(Ordering::Relaxed)
    );
    info!(
        "Ring buffer: {} full waits, {} empty waits",
        buffer.full_count(),
        buffer.empty_count()
    );
    if verify {
        info!("Sequence gaps: {}", gaps);
    }

    match exit {
        StreamExit::Stopped => Ok(()),
        other => Err(anyhow::anyhow!("Streaming ended early: {}", describe_exit(&other))),
    }
}

/// Block until Ctrl+C, the configured duration, or the stream dying
async fn wait_for_stop<C, B>(
    device: &Fx3Device<C, B>,
    buffer: &RingBuffer<u8>,
    consumed: &AtomicU64,
    config: &CaptureConfig,
) where
    C: ControlChannel,
    B: BulkEndpoint,
{
    let deadline = async {
        match config.duration() {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(config.report_interval());
    // The first tick completes immediately
    ticker.tick().await;

    match config.duration() {
        Some(d) => info!("Capturing for {:?}. Press Ctrl+C to stop early.", d),
        None => info!("Capturing. Press Ctrl+C to stop."),
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping capture");
                break;
            }
            _ = &mut deadline => {
                info!("Capture duration elapsed");
                break;
            }
            _ = ticker.tick() => {
                report(&device.metrics().snapshot(), buffer, consumed);
                if !device.is_streaming() {
                    warn!("Streaming stopped on its own");
                    break;
                }
            }
        }
    }
}

fn report(stats: &StreamStats, buffer: &RingBuffer<u8>, consumed: &AtomicU64) {
    info!(
        "{} | blocks {} | consumed {} | fill {}/{} | short {} | full waits {}",
        stats.format_throughput(),
        stats.blocks,
        consumed.load(Ordering::Relaxed),
        buffer.fill_count(),
        buffer.capacity() - 1,
        stats.short_reads,
        buffer.full_count()
    );
}

fn describe_exit(exit: &StreamExit) -> String {
    match exit {
        StreamExit::Stopped => "stopped".to_string(),
        StreamExit::TimedOut => "transfer timed out".to_string(),
        StreamExit::Rejected(e) => format!("submission rejected: {}", e),
        StreamExit::Failed(e) => format!("transfer failed: {}", e),
    }
}

/// Drain the ring buffer until it is shut down
///
/// With `verify` set, block sequence stamps are checked and the number of
/// discontinuities is returned.
fn spawn_consumer(
    buffer: Arc<RingBuffer<u8>>,
    consumed: Arc<AtomicU64>,
    verify: bool,
) -> Result<JoinHandle<u64>> {
    thread::Builder::new()
        .name("fx3-consumer".to_string())
        .spawn(move || {
            let mut expected = 0u32;
            let mut gaps = 0u64;

            loop {
                let block = buffer.acquire_read_slot();
                if buffer.is_shutdown() {
                    break;
                }

                if verify {
                    let sequence = block_sequence(&block.lock());
                    if sequence != Some(expected) {
                        debug!("Expected block {}, got {:?}", expected, sequence);
                        gaps += 1;
                    }
                    expected = sequence.unwrap_or(expected).wrapping_add(1);
                }

                buffer.commit_read();
                consumed.fetch_add(1, Ordering::Relaxed);
            }

            gaps
        })
        .context("Failed to spawn consumer thread")
}
