// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! strata-echo - print inter-process publications as they pass.
//!
//! Connects a portal to the platform's daemon and registers one regex
//! subscription; every matching publication is printed with its scheme,
//! type, group and a short preview of the payload.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::cell::Cell;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata::{
    InterProcessConfig, InterProcessPortal, InterThreadTransporter, MarshallingScheme, PortalState,
    Pollable, RegexFilter, Subscribes, TransportRuntime,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PREVIEW_BYTES: usize = 64;

/// Echo strata publications
#[derive(Parser, Debug)]
#[command(name = "strata-echo")]
#[command(version)]
#[command(about = "Echo strata publications (inter-process traffic only)")]
struct Args {
    /// Manager port of the platform daemon
    #[arg(short = 'm', long, default_value = "11144")]
    manager_port: u16,

    /// Platform name
    #[arg(short, long, default_value = "default")]
    platform: String,

    /// Type name pattern (full match)
    #[arg(short, long = "type", default_value = ".*")]
    type_pattern: String,

    /// Group pattern (full match)
    #[arg(short, long = "group", default_value = ".*")]
    group_pattern: String,

    /// Schemes to show, by name or number (repeatable; default all)
    #[arg(short, long = "scheme")]
    schemes: Vec<String>,

    /// Maximum number of publications to print (0 = unlimited)
    #[arg(short = 'n', long, default_value = "0")]
    count: u64,

    /// Log filter
    #[arg(short, long, default_value = "warn")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn parse_schemes(names: &[String]) -> Result<Vec<i32>> {
    if names.is_empty() {
        return Ok(vec![MarshallingScheme::ALL_SCHEMES]);
    }
    names
        .iter()
        .map(|name| {
            MarshallingScheme::parse(name).with_context(|| format!("unknown scheme {name:?}"))
        })
        .collect()
}

/// Text schemes print as text, everything else as hex.
fn preview(scheme: i32, data: &[u8]) -> String {
    let head = &data[..data.len().min(PREVIEW_BYTES)];
    let ellipsis = if data.len() > PREVIEW_BYTES { "..." } else { "" };
    if scheme == MarshallingScheme::CSTR || scheme == MarshallingScheme::JSON {
        if let Ok(text) = std::str::from_utf8(head) {
            return format!("{:?}{ellipsis}", text);
        }
    }
    let hex: Vec<String> = head.iter().map(|b| format!("{b:02x}")).collect();
    format!("{}{ellipsis}", hex.join(" "))
}

fn run(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level)
        .with_context(|| format!("invalid log level {:?}", args.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = InterProcessConfig::default()
        .with_platform(args.platform.clone())
        .with_manager_port(args.manager_port);

    let filter = RegexFilter::new(
        parse_schemes(&args.schemes)?,
        &args.type_pattern,
        &args.group_pattern,
    )
    .context("invalid pattern")?;

    let runtime = TransportRuntime::new(config.platform.clone());
    let mut portal = InterProcessPortal::new(InterThreadTransporter::new(runtime), &config)
        .with_context(|| format!("cannot reach manager at {}", config.manager_addr()))?;
    info!("Connected to platform '{}'", config.platform);

    let printed = Rc::new(Cell::new(0u64));
    let p = Rc::clone(&printed);
    let limit = args.count;
    portal.subscribe_regex(filter, move |data, scheme, type_name, group| {
        if limit > 0 && p.get() >= limit {
            return;
        }
        p.set(p.get() + 1);
        let mut out = io::stdout().lock();
        let _ = writeln!(
            out,
            "[{}] {} on '{}' ({} bytes): {}",
            MarshallingScheme::display(scheme),
            type_name,
            group,
            data.len(),
            preview(scheme, data)
        );
        let _ = out.flush();
    })?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;

    while running.load(Ordering::SeqCst) {
        portal.poll(Some(Duration::from_millis(100)));
        if limit > 0 && printed.get() >= limit {
            break;
        }
        if portal.state() == PortalState::Disconnected {
            bail!("lost connection to the daemon");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_text_and_binary() {
        assert_eq!(preview(MarshallingScheme::CSTR, b"hi"), "\"hi\"");
        assert_eq!(preview(MarshallingScheme::PROTOBUF, &[0x08, 0x2a]), "08 2a");

        let long = vec![b'a'; PREVIEW_BYTES + 10];
        assert!(preview(MarshallingScheme::CSTR, &long).ends_with("..."));
    }

    #[test]
    fn test_parse_schemes() {
        assert_eq!(
            parse_schemes(&[]).expect("default"),
            vec![MarshallingScheme::ALL_SCHEMES]
        );
        let named = parse_schemes(&["json".to_string(), "1".to_string()]).expect("parse");
        assert_eq!(named, vec![MarshallingScheme::JSON, MarshallingScheme::PROTOBUF]);
        assert!(parse_schemes(&["bogus".to_string()]).is_err());
    }
}
