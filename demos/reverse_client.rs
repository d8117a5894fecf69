//! Submit a background `reverse` job with a future epoch and poll its
//! status until the server forgets it.
//!
//! ```text
//! cargo run --example reverse_client -- [host] [port] [epoch-offset-secs] [text]
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use gearman_client::{failed, should_continue, Client, Priority, SubmitMode, DEFAULT_PORT};

fn main() {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "localhost".to_string());
    let port: u16 = args
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let offset: u64 = args.next().and_then(|o| o.parse().ok()).unwrap_or(10);
    let text = args.next().unwrap_or_else(|| "Hello!".to_string());

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_secs();

    let mut client = Client::new();
    client.add_server(host, port);

    let handle = match client.do_background(
        "reverse",
        text.into_bytes(),
        Priority::Normal,
        SubmitMode::Epoch(now + offset),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{e}: {}", client.session().last_error());
            std::process::exit(1);
        }
    };
    println!("Background Job Handle={handle}");

    loop {
        let ret = client.job_status(&handle);
        if should_continue(&ret) {
            continue;
        }
        if failed(&ret) {
            eprintln!(
                "{}: {}",
                ret.unwrap_err(),
                client.session().last_error()
            );
            std::process::exit(1);
        }
        let status = ret.unwrap();

        println!(
            "Known={}, Running={}, Percent Complete={}/{}",
            status.known, status.running, status.numerator, status.denominator
        );

        if !status.known {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(500));
    }
}
