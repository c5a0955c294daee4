//! VU1 Probe CLI
//!
//! Setup helper: finds a VU1 server and checks that an API key works.
//!
//! Usage:
//!   vu1-probe discover [host] [port]
//!   vu1-probe test [host] [port] [key]
//!   vu1-probe dials [host] [port] [key]   (status and easing per dial)
//!
//! Missing arguments fall back to VU1_HOST / VU1_API_KEY, then localhost:5340.

use serde_json::json;
use std::env;
use std::process;
use vu1_dial_bridge::adapters::vu1::{
    discover_server, DialApi, Vu1Client, Vu1ClientOptions, DEFAULT_PORT,
};

struct Target {
    host: String,
    port: u16,
    key: String,
}

impl Target {
    fn from_args(args: &[String]) -> Self {
        let host = args
            .first()
            .cloned()
            .or_else(|| env::var("VU1_HOST").ok())
            .unwrap_or_else(|| "localhost".to_string());
        let port = match args.get(1) {
            Some(port) => port.parse().unwrap_or_else(|_| {
                eprintln!("Error: Invalid port: {}", port);
                process::exit(1);
            }),
            None => DEFAULT_PORT,
        };
        let key = args
            .get(2)
            .cloned()
            .or_else(|| env::var("VU1_API_KEY").ok())
            .unwrap_or_default();
        Self { host, port, key }
    }

    fn client(&self) -> Vu1Client {
        Vu1Client::new(Vu1ClientOptions::new(&self.host, self.port, &self.key)).unwrap_or_else(
            |e| {
                eprintln!("Error: {}", e);
                process::exit(1);
            },
        )
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let target = Target::from_args(&args[2..]);

    match args[1].as_str() {
        "discover" => discover(&target).await,
        "test" => test(&target).await,
        "dials" => dials(&target).await,
        "help" | "--help" | "-h" => {
            print_usage();
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
            process::exit(1);
        }
    }
}

async fn discover(target: &Target) {
    match discover_server(&target.host, target.port).await {
        Some((host, port)) => {
            println!("{}", json!({ "found": true, "host": host, "port": port }));
        }
        None => {
            println!("{}", json!({ "found": false }));
            process::exit(2);
        }
    }
}

async fn test(target: &Target) {
    let check = target.client().test_connection().await;
    print_json(&check);
    if !check.connected {
        process::exit(2);
    }
    if !check.authenticated {
        process::exit(3);
    }
}

async fn dials(target: &Target) {
    let client = target.client();
    let list = match client.get_dial_list().await {
        Ok(list) => list,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };

    let mut dials = Vec::with_capacity(list.len());
    for info in list {
        let status = match client.get_dial_status(&info.uid).await {
            Ok(status) => json!(status),
            Err(e) => json!({ "error": e.to_string() }),
        };
        let easing = match client.get_easing_options(&info.uid).await {
            Ok(easing) => easing,
            Err(e) => json!({ "error": e.to_string() }),
        };
        dials.push(json!({ "dial": info, "status": status, "easing": easing }));
    }
    print_json(&dials);
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("VU1 Probe - Find a VU1 server and check credentials");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  vu1-probe discover [host] [port]");
    eprintln!("  vu1-probe test [host] [port] [key]");
    eprintln!("  vu1-probe dials [host] [port] [key]");
    eprintln!();
    eprintln!("Exit codes: 0 ok, 1 usage, 2 unreachable, 3 key rejected");
}
