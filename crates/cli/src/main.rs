use std::sync::Arc;

use app_core::ids::DeviceId;
use app_core::DeviceDescriptor;
use device::{EventStream, HidBridge, HidEvent};
use tokio::sync::mpsc;
use tracing::warn;
use transport_usb::{HotplugWatch, RusbBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match cmd {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "list" => cmd_list(),
        "find" => cmd_find(&args),
        "request" => cmd_request(&args).await,
        "monitor" => cmd_monitor(&args).await,
        "send" => cmd_send(&args).await,
        "watch" => cmd_watch().await,
        "config" => cmd_config(&args),
        other => anyhow::bail!("unknown command: {other} (run `hidlink help`)"),
    }
}

fn print_help() {
    eprintln!(
        r#"hidlink

USAGE:
  hidlink list
  hidlink find <vendor_id>
  hidlink request [vendor_id]
  hidlink monitor <device>
  hidlink send <device> <report_id> <hex_payload>
  hidlink watch
  hidlink config [path|init]

Vendor ids are hex (`0801` or `0x0801`). Devices are named like
/dev/bus/usb/001/004, as printed by `list`.
"#
    );
}

/// Bridge wired to the real USB stack, with the OS event loop running.
struct Session {
    bridge: HidBridge,
    events: EventStream,
    hotplug: Option<HotplugWatch>,
}

fn start(with_hotplug: bool) -> anyhow::Result<Session> {
    let settings = settings::load()?;
    let (os_tx, os_rx) = mpsc::unbounded_channel();
    let backend = Arc::new(RusbBackend::new(os_tx));

    let hotplug = if with_hotplug {
        match backend.start_hotplug() {
            Ok(watch) => Some(watch),
            Err(err) => {
                warn!(%err, "hotplug notifications unavailable");
                None
            }
        }
    } else {
        None
    };

    let (bridge, events) = HidBridge::new(backend, settings);
    tokio::spawn(bridge.clone().run(os_rx));
    Ok(Session {
        bridge,
        events,
        hotplug,
    })
}

fn cmd_list() -> anyhow::Result<()> {
    let s = start(false)?;
    let devices = s.bridge.list_hid_devices()?;
    if devices.is_empty() {
        println!("(no HID devices)");
    }
    for d in devices {
        println!("{}", describe(&d));
    }
    Ok(())
}

fn cmd_find(args: &[String]) -> anyhow::Result<()> {
    let vendor_id = parse_vendor_id(args, 2)?;
    let s = start(false)?;
    match s.bridge.find_by_vendor(vendor_id)? {
        Some(d) => println!("{}", describe(&d)),
        None => anyhow::bail!("no HID device with vendor id {vendor_id:04x}"),
    }
    Ok(())
}

async fn cmd_request(args: &[String]) -> anyhow::Result<()> {
    let vendor_id = match args.get(2) {
        Some(_) => Some(parse_vendor_id(args, 2)?),
        None => None,
    };
    let s = start(false)?;
    let d = s.bridge.request_device(vendor_id).await?;
    println!("granted: {}", describe(&d));
    Ok(())
}

async fn cmd_monitor(args: &[String]) -> anyhow::Result<()> {
    let id = parse_device_id(args, 2)?;
    let mut s = start(true)?;
    s.bridge.list_hid_devices()?;
    let d = s.bridge.open(&id).await?;
    println!("opened: {}", describe(&d));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = s.events.recv() => match ev {
                Some(HidEvent::DeviceClosed(d)) if d.id == id => {
                    println!("closed: {}", d.id);
                    break;
                }
                Some(ev @ HidEvent::PumpDisconnected { .. }) => {
                    print_event(&ev);
                    break;
                }
                Some(ev) => print_event(&ev),
                None => break,
            },
        }
    }

    s.bridge.close().await;
    Ok(())
}

async fn cmd_send(args: &[String]) -> anyhow::Result<()> {
    let id = parse_device_id(args, 2)?;
    let report_id = parse_u8(args, 3)?;
    let payload = parse_hex(args.get(4).map(|s| s.as_str()).unwrap_or(""))?;

    let s = start(false)?;
    s.bridge.list_hid_devices()?;
    s.bridge.open(&id).await?;
    let result = s.bridge.send_output_report(report_id, &payload).await;
    s.bridge.close().await;

    let sent = result?;
    println!("sent {sent} bytes (report id {report_id})");
    Ok(())
}

async fn cmd_watch() -> anyhow::Result<()> {
    let mut s = start(true)?;
    if s.hotplug.is_none() {
        anyhow::bail!("hotplug notifications are not supported on this platform");
    }
    for d in s.bridge.list_hid_devices()? {
        println!("present: {}", describe(&d));
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = s.events.recv() => match ev {
                Some(ev) => print_event(&ev),
                None => break,
            },
        }
    }
    Ok(())
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let sub = args.get(2).map(|s| s.as_str()).unwrap_or("show");
    match sub {
        "show" => {
            let settings = settings::load()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        "path" => println!("{}", settings::paths::settings_path()?.display()),
        "init" => {
            let settings = settings::load()?;
            settings::save(&settings)?;
            println!("wrote {}", settings::paths::settings_path()?.display());
        }
        other => anyhow::bail!("unknown config subcommand: {other}"),
    }
    Ok(())
}

fn describe(d: &DeviceDescriptor) -> String {
    format!(
        "{}  {:04x}:{:04x}  {}",
        d.id,
        d.vendor_id,
        d.product_id,
        d.display_name()
    )
}

fn print_event(ev: &HidEvent) {
    match ev {
        HidEvent::InputReport { device, data } => {
            println!("{device}  in  {}", hex::encode_upper(data))
        }
        HidEvent::DeviceOpened(d) => println!("opened: {}", describe(d)),
        HidEvent::DeviceClosed(d) => println!("closed: {}", d.id),
        HidEvent::DeviceConnected(d) => println!("attached: {}", describe(d)),
        HidEvent::DeviceDisconnected(d) => println!("detached: {}", d.id),
        HidEvent::PumpFailed {
            device,
            consecutive_errors,
        } => println!("{device}  input stopped after {consecutive_errors} errors"),
        HidEvent::PumpDisconnected { device } => println!("{device}  input stopped, device lost"),
    }
}

fn parse_device_id(args: &[String], idx: usize) -> anyhow::Result<DeviceId> {
    let raw = args
        .get(idx)
        .ok_or_else(|| anyhow::anyhow!("missing device"))?;
    Ok(DeviceId::new(raw.clone()))
}

fn parse_vendor_id(args: &[String], idx: usize) -> anyhow::Result<u16> {
    let raw = args
        .get(idx)
        .ok_or_else(|| anyhow::anyhow!("missing vendor_id"))?;
    let digits = raw.trim_start_matches("0x").trim_start_matches("0X");
    Ok(u16::from_str_radix(digits, 16)?)
}

fn parse_u8(args: &[String], idx: usize) -> anyhow::Result<u8> {
    let raw = args
        .get(idx)
        .ok_or_else(|| anyhow::anyhow!("missing arg {idx}"))?;
    Ok(raw.parse::<u8>()?)
}

/// Accepts `01ff`, `01 ff` or `01:ff`.
fn parse_hex(raw: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&digits).map_err(|err| anyhow::anyhow!("invalid hex payload {raw:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_payload_accepts_separators() {
        assert_eq!(parse_hex("01ff").unwrap(), vec![0x01, 0xff]);
        assert_eq!(parse_hex("01 ff:0a").unwrap(), vec![0x01, 0xff, 0x0a]);
        assert!(parse_hex("").unwrap().is_empty());
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex("é1").is_err());
        assert_eq!(parse_hex("0A0b").unwrap(), vec![0x0a, 0x0b]);
    }

    #[test]
    fn vendor_id_is_hex_with_optional_prefix() {
        let args = |v: &str| vec!["hidlink".to_string(), "find".to_string(), v.to_string()];
        assert_eq!(parse_vendor_id(&args("0801"), 2).unwrap(), 0x0801);
        assert_eq!(parse_vendor_id(&args("0x046D"), 2).unwrap(), 0x046d);
        assert!(parse_vendor_id(&args("xyz"), 2).is_err());
    }
}
