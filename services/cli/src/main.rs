//! Reference subscriber/publisher CLI. Does not spawn external handler
//! processes for received events; matching subscriptions are printed to
//! stdout.

use clap::{Arg, ArgAction, Command};
use rt_client::{Conn, Received};
use std::io::Write;
use std::process::ExitCode;
use tracing::{error, info};

fn parse_timestamp(value: &str) -> Result<i64, String> {
    if let Ok(n) = value.parse::<i64>() {
        return Ok(n);
    }
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp())
        .map_err(|e| format!("not a unix timestamp or RFC3339 datetime: {e}"))
}

fn cli() -> Command {
    Command::new("events-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Reference subscriber/publisher for the event broker")
        .arg(Arg::new("server").long("server").value_name("addr").required(true))
        .arg(Arg::new("app").long("app").value_name("name").default_value(""))
        .arg(Arg::new("event").long("event").value_name("pattern").action(ArgAction::Append))
        .arg(Arg::new("fire").long("fire").value_name("name:data"))
        .arg(Arg::new("to").long("to").value_name("target"))
        .arg(Arg::new("since").long("since").value_parser(parse_timestamp))
        .arg(Arg::new("until").long("until").value_parser(parse_timestamp))
        .arg(Arg::new("info").short('i').action(ArgAction::SetTrue))
        .arg(Arg::new("interactive").short('I').action(ArgAction::SetTrue))
        .arg(Arg::new("verbose").short('V').action(ArgAction::SetTrue))
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();

    let verbose = matches.get_flag("verbose");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(if verbose { "debug" } else { "info" }))
        .init();

    let server = matches.get_one::<String>("server").expect("required").clone();
    let app = matches.get_one::<String>("app").cloned().unwrap_or_default();

    let mut conn = match Conn::dial(&app, &server).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, server, "dial failed");
            return ExitCode::FAILURE;
        }
    };

    let flags = if matches.get_one::<String>("fire").is_some() || matches.get_flag("interactive") {
        rt_protocol::WRITABLE | rt_protocol::READABLE
    } else {
        rt_protocol::READABLE
    };
    if let Err(e) = conn.auth(flags).await {
        error!(error = %e, "auth failed");
        return ExitCode::FAILURE;
    }

    if matches.get_flag("info") {
        return run_info(&mut conn).await;
    }

    let patterns: Vec<String> = matches.get_many::<String>("event").map(|v| v.cloned().collect()).unwrap_or_default();
    for pattern in &patterns {
        if let Err(e) = conn.subscribe(pattern).await {
            error!(error = %e, pattern, "subscribe failed");
            return ExitCode::FAILURE;
        }
    }

    let since = matches.get_one::<i64>("since").copied();
    let until = matches.get_one::<i64>("until").copied();
    if since.is_some() || until.is_some() {
        if let Err(e) = conn.recover(since.unwrap_or(0), until.unwrap_or(0)).await {
            error!(error = %e, "recover failed");
            return ExitCode::FAILURE;
        }
    }

    if let Some(spec) = matches.get_one::<String>("fire") {
        let Some((name, data)) = spec.split_once(':') else {
            error!(spec, "fire spec must be name:data");
            return ExitCode::FAILURE;
        };
        let result = match matches.get_one::<String>("to") {
            Some(target) => conn.fire_to(target, name, data.as_bytes()).await,
            None => conn.fire(name, data.as_bytes()).await,
        };
        if let Err(e) = result {
            error!(error = %e, "fire failed");
            return ExitCode::FAILURE;
        }
    }

    if matches.get_flag("interactive") {
        return run_repl(&mut conn).await;
    }

    if patterns.is_empty() {
        return ExitCode::SUCCESS;
    }

    info!(?patterns, "listening, press Ctrl+C to exit");
    loop {
        match conn.receive().await {
            Ok(Received::Event { name, data }) => {
                println!("{name}: {}", String::from_utf8_lossy(&data));
            }
            Ok(Received::Reply(text)) => info!(text, "reply"),
            Ok(Received::Pong(payload)) => println!("pong: {}", String::from_utf8_lossy(&payload)),
            Err(e) => {
                error!(error = %e, "connection lost");
                return ExitCode::FAILURE;
            }
        }
    }
}

async fn run_info(conn: &mut Conn) -> ExitCode {
    if let Err(e) = conn.info().await {
        error!(error = %e, "info request failed");
        return ExitCode::FAILURE;
    }
    match conn.receive().await {
        Ok(Received::Event { name, data }) if name == "info" => {
            match serde_json::from_slice::<serde_json::Value>(&data) {
                Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or_default()),
                Err(_) => println!("{}", String::from_utf8_lossy(&data)),
            }
            ExitCode::SUCCESS
        }
        Ok(other) => {
            error!(?other, "unexpected response to info");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "info request failed");
            ExitCode::FAILURE
        }
    }
}

/// `FIRE name data`, `FIRETO target name data`, `INFO` — one command per line.
async fn run_repl(conn: &mut Conn) -> ExitCode {
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        line.clear();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            return ExitCode::SUCCESS;
        }
        let mut parts = line.trim().splitn(2, ' ');
        let Some(cmd) = parts.next() else { continue };
        let rest = parts.next().unwrap_or("");

        let result = match cmd.to_ascii_uppercase().as_str() {
            "FIRE" => {
                let Some((name, data)) = rest.split_once(' ') else {
                    println!("usage: FIRE name data");
                    continue;
                };
                conn.fire(name, data.as_bytes()).await
            }
            "FIRETO" => {
                let mut it = rest.splitn(3, ' ');
                let (Some(target), Some(name), Some(data)) = (it.next(), it.next(), it.next()) else {
                    println!("usage: FIRETO target name data");
                    continue;
                };
                conn.fire_to(target, name, data.as_bytes()).await
            }
            "INFO" => conn.info().await,
            "" => continue,
            other => {
                println!("unknown command: {other}");
                continue;
            }
        };

        if let Err(e) = result {
            error!(error = %e, "command failed");
            return ExitCode::FAILURE;
        }
    }
}
