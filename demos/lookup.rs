//! Look up a professional credential from the command line
//!
//! Run with:
//!   cargo run --example lookup -- --curp ABCD800101HDFLRN09
//!   cargo run --example lookup -- --nombre "Ana" --paterno "Lopez"
//!   cargo run --example lookup -- --inspect
//!
//! Timeouts and the portal URL come from the environment (see `LookupConfig::from_env`).

use cedula_lookup::{BrowserConfig, BrowserPool, CedulaLookup, Error, LookupConfig, Query, Result};

fn parse_args() -> Result<(Query, bool)> {
    let mut query = Query::default();
    let mut inspect = false;
    let mut args = std::env::args().skip(1);

    while let Some(flag) = args.next() {
        if flag == "--inspect" {
            inspect = true;
            continue;
        }
        let value = args
            .next()
            .ok_or_else(|| Error::InvalidQuery(format!("{} needs a value", flag)))?;
        match flag.as_str() {
            "--nombre" => query.nombre = Some(value),
            "--paterno" => query.paterno = Some(value),
            "--materno" => query.materno = Some(value),
            "--curp" => query.curp = Some(value),
            other => return Err(Error::InvalidQuery(format!("unknown flag {}", other))),
        }
    }

    Ok((query, inspect))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (query, inspect) = parse_args()?;
    let config = LookupConfig::from_env()?;

    let pool = BrowserPool::new(BrowserConfig::default());
    let lookup = CedulaLookup::new(pool.clone(), config);

    let outcome = if inspect {
        lookup
            .inspect_fields()
            .await
            .and_then(|frames| Ok(serde_json::to_string_pretty(&frames)?))
    } else {
        lookup
            .search(&query)
            .await
            .and_then(|response| Ok(serde_json::to_string_pretty(&response)?))
    };

    pool.shutdown().await?;

    match outcome {
        Ok(json) => {
            println!("{}", json);
            Ok(())
        }
        Err(e) => {
            eprintln!(
                "Lookup failed [{}{}]: {}",
                e.kind(),
                if e.is_retryable() { ", retryable" } else { "" },
                e
            );
            std::process::exit(1);
        }
    }
}
