use std::process::exit;
use std::time::Duration;

use _core::logging;
use _core::{ConnectionSettings, DeviceEvent, DeviceHandle, DeviceKind, NetOptions, ParameterMap};
use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "biosignal-demo",
    about = "Connect to an OT Bioelettronica device and print decoded frames"
)]
struct Args {
    /// Device: muovi, muovi_plus, sessantaquattro, sessantaquattro_plus or quattrocento
    device: DeviceKind,
    /// Address to listen on (Muovi, Sessantaquattro) or to dial (Quattrocento)
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// TCP port (defaults to the device's factory port)
    #[arg(long)]
    port: Option<u16>,
    /// Configuration parameter, e.g. `-p working_mode=emg`. Repeatable.
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
    /// Number of frames to print before stopping
    #[arg(long, default_value_t = 10)]
    frames: usize,
    /// Seconds to wait for the device to connect and for each frame
    #[arg(long, default_value_t = 30)]
    wait: u64,
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn wait_for(device: &mut DeviceHandle, wait: Duration, wanted: fn(&DeviceEvent) -> bool) -> Result<()> {
    loop {
        match device.next_event_timeout(wait) {
            Some(event) if wanted(&event) => return Ok(()),
            Some(DeviceEvent::ConnectionToggled(false)) => bail!("device disconnected"),
            Some(_) => {}
            None => bail!("timed out after {} s", wait.as_secs()),
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init_rust_logging();

    let wait = Duration::from_secs(args.wait);
    let port = args.port.unwrap_or_else(|| args.device.default_port());
    let settings = ConnectionSettings::parse(&args.host, &port.to_string())?;
    let params: ParameterMap = args.params.into_iter().collect();

    let mut options = NetOptions::default();
    options.session.connect_timeout = wait;
    let mut device = DeviceHandle::spawn_with(args.device, options, logging::WarningLog::new())?;

    // 1. Connection
    println!("--- {} at {}:{} ---", args.device, args.host, port);
    device.toggle_connection(settings)?;
    wait_for(&mut device, wait, |e| {
        matches!(e, DeviceEvent::ConnectionToggled(true))
    })
    .context("waiting for the device to connect")?;
    println!("Connected.");

    // 2. Configuration
    device.configure_device(params)?;
    wait_for(&mut device, wait, |e| {
        matches!(e, DeviceEvent::ConfigurationToggled(true))
    })
    .context("waiting for the device to apply the configuration")?;
    let info = device.device_information()?;
    println!(
        "Configured: {} Hz, {} channels ({} biosignal, {} auxiliary), {} samples/frame",
        info.sampling_frequency.unwrap_or_default(),
        info.number_of_channels.unwrap_or_default(),
        info.number_of_biosignal_channels.unwrap_or_default(),
        info.number_of_auxiliary_channels.unwrap_or_default(),
        info.samples_per_frame.unwrap_or_default()
    );

    // 3. Acquisition
    device.toggle_streaming()?;
    let mut printed = 0;
    while printed < args.frames {
        match device.next_event_timeout(wait) {
            Some(DeviceEvent::BiosignalDataAvailable(matrix)) => {
                let Some(first) = matrix.row(0).filter(|row| !row.is_empty()) else {
                    bail!("frame without biosignal samples: shape {:?}", matrix.shape());
                };
                let rms = (first.iter().map(|v| v * v).sum::<f32>() / first.len() as f32).sqrt();
                println!(
                    "[Frame {}] shape {:?} | ch0 RMS {:.4} mV",
                    printed,
                    matrix.shape(),
                    rms
                );
                printed += 1;
            }
            Some(DeviceEvent::ConnectionToggled(false)) => bail!("device disconnected"),
            Some(_) => {}
            None => bail!("no data within {} s", args.wait),
        }
    }

    // 4. Cleanup
    println!("Stopping...");
    device.toggle_streaming()?;
    device.toggle_connection(settings)?;
    println!("Done.");
    Ok(())
}
