//! tdmctl - poke a running display manager over its wire socket
//!
//! # Usage
//!
//! ```text
//! # Measure vblank tick spacing on the primary output
//! tdmctl vblank --fps 30 --count 5
//!
//! # Stream connection/DPMS changes
//! tdmctl watch --output primary
//!
//! # Toggle buffer dumping in the server
//! tdmctl debug -dump layer,pp@/tmp/dumps
//! ```
//!
//! Exit codes: 0 on success, 1 on any failure.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tdm_client::Client;

struct VblankOptions {
    output: String,
    fps: Option<u32>,
    offset_ms: Option<i32>,
    fake: bool,
    interval: u32,
    count: u32,
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("vblank") => cmd_vblank(&args[1..]),
        Some("watch") => cmd_watch(&args[1..]),
        Some("debug") => cmd_debug(&args[1..]),
        Some("help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            Err(anyhow::anyhow!("unknown command '{other}'"))
        }
    };

    if let Err(e) = result {
        eprintln!("tdmctl: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        "usage: tdmctl <command> [options]\n\n\
         commands:\n\
         \x20 vblank [--output NAME] [--fps N] [--offset MS] [--fake] [--interval N] [--count N]\n\
         \x20        request ticks and print their spacing\n\
         \x20 watch  [--output NAME]\n\
         \x20        stream connection/DPMS change events\n\
         \x20 debug  <options...>\n\
         \x20        forward a debug command line and print the reply"
    );
}

fn parse_vblank_options(args: &[String]) -> Result<VblankOptions> {
    let mut options = VblankOptions {
        output: "primary".into(),
        fps: None,
        offset_ms: None,
        fake: false,
        interval: 1,
        count: 10,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .with_context(|| format!("{name} needs a value"))
        };
        match arg.as_str() {
            "--output" => options.output = value("--output")?.clone(),
            "--fps" => options.fps = Some(value("--fps")?.parse().context("bad --fps")?),
            "--offset" => {
                options.offset_ms = Some(value("--offset")?.parse().context("bad --offset")?)
            }
            "--fake" => options.fake = true,
            "--interval" => {
                options.interval = value("--interval")?.parse().context("bad --interval")?
            }
            "--count" => options.count = value("--count")?.parse().context("bad --count")?,
            other => bail!("unknown option '{other}'"),
        }
    }
    Ok(options)
}

fn cmd_vblank(args: &[String]) -> Result<()> {
    let options = parse_vblank_options(args)?;

    let client = Client::connect().context("connecting to the display manager")?;
    let output = client
        .get_output(&options.output)
        .with_context(|| format!("binding output '{}'", options.output))?;

    let (width, height) = output.resolution()?;
    let refresh = output.refresh_rate()?;
    println!(
        "output '{}': {}x{}@{} {} dpms {}",
        options.output,
        width,
        height,
        refresh,
        output.conn_status()?,
        output.dpms()?,
    );

    let vblank = output.create_vblank()?;
    if let Some(fps) = options.fps {
        vblank.set_fps(fps)?;
    }
    if let Some(offset_ms) = options.offset_ms {
        vblank.set_offset(offset_ms)?;
    }
    if options.fake {
        vblank.set_enable_fake(true)?;
    }

    let received = Arc::new(AtomicU32::new(0));
    let mut last_us: Option<u64> = None;

    for i in 0..options.count {
        let received_cb = received.clone();
        vblank.wait(options.interval, move |result| match result {
            Ok(sample) => {
                received_cb.fetch_add(1, Ordering::SeqCst);
                println!(
                    "tick {} seq {} at {}.{:06}",
                    i, sample.sequence, sample.tv_sec, sample.tv_usec
                );
            }
            Err(e) => eprintln!("wait failed: {e}"),
        })?;

        // Drive the socket until this tick lands, so spacing is visible.
        let want = i + 1;
        while received.load(Ordering::SeqCst) < want {
            client.handle_events().context("dispatching events")?;
        }

        let now = tdm::types::monotonic_us();
        if let Some(prev) = last_us {
            println!("  spacing {} us", now - prev);
        }
        last_us = Some(now);
    }

    Ok(())
}

fn cmd_watch(args: &[String]) -> Result<()> {
    let mut name = "primary".to_string();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--output" => {
                name = iter
                    .next()
                    .context("--output needs a value")?
                    .clone()
            }
            other => bail!("unknown option '{other}'"),
        }
    }

    let client = Client::connect().context("connecting to the display manager")?;
    let output = client
        .get_output(&name)
        .with_context(|| format!("binding output '{name}'"))?;

    println!(
        "watching '{name}': {} dpms {}",
        output.conn_status()?,
        output.dpms()?
    );
    output.add_change_handler(move |change| match change {
        tdm_client::OutputChange::Dpms(value) => println!("dpms -> {value}"),
        tdm_client::OutputChange::Connection(status) => println!("connection -> {status}"),
    })?;

    loop {
        client.handle_events().context("dispatching events")?;
    }
}

fn cmd_debug(args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("debug needs a command line, e.g. 'tdmctl debug -dump layer'");
    }
    let client = Client::connect().context("connecting to the display manager")?;
    let reply = client.debug(&args.join(" "))?;
    print!("{reply}");
    Ok(())
}
