use std::{io::BufRead, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use client_core::{
    flows, FlowDependencies, FlowError, FlowEvent, FormFields, LedgerHttpClient,
    OperationState, PollingConfirmation, StaticIdentity, SubmitProgress, TransactionFlow,
    ValidationError,
};
use shared::domain::Address;
use tokio::sync::broadcast;
use tracing::info;

const SETTLE_AFTER_TERMINAL: Duration = Duration::from_millis(500);
const PRINTER_GRACE: Duration = Duration::from_secs(5);

/// Runs one admin-dashboard write flow against the ledger and reports how it ended.
#[derive(Parser, Debug)]
struct Args {
    /// Flow to run, e.g. `set_platform_fee`.
    #[arg(long, required_unless_present = "list")]
    flow: Option<String>,
    /// Address of the connected signer.
    #[arg(long, required_unless_present = "list")]
    signer: Option<String>,
    /// Form input as `name=value`; repeatable.
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, String)>,
    /// Answer to the confirmation step. Read from stdin when omitted.
    #[arg(long)]
    confirm: Option<String>,
    #[arg(long, default_value = "dashboard.toml")]
    config: PathBuf,
    /// Overrides `ledger_url` from the settings file.
    #[arg(long)]
    ledger_url: Option<String>,
    /// Print the available flows and exit.
    #[arg(long)]
    list: bool,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    if args.list {
        for flow in flows::catalog() {
            let fields: Vec<&str> = flow.validator.fields().iter().map(|f| f.name).collect();
            println!("{:<26} {:<26} {}", flow.name, flow.title, fields.join(", "));
        }
        return Ok(ExitCode::SUCCESS);
    }

    let (Some(flow_name), Some(signer)) = (args.flow.as_deref(), args.signer.as_deref()) else {
        return Err(anyhow!("--flow and --signer are required"));
    };
    let spec = flows::find(flow_name).ok_or_else(|| anyhow!("unknown flow '{flow_name}'"))?;
    let signer = Address::parse(signer).context("invalid --signer")?;

    let mut settings = client_core::load_settings(&args.config);
    if let Some(url) = args.ledger_url {
        settings.ledger_url = url;
    }
    info!(ledger_url = %settings.ledger_url, flow = spec.name, "starting");

    let identity = StaticIdentity::new(Some(signer));
    let ledger = Arc::new(LedgerHttpClient::new(&settings.ledger_url, identity.clone())?);
    let deps = FlowDependencies {
        submission: ledger.clone(),
        confirmation: Arc::new(PollingConfirmation::new(
            ledger.clone(),
            settings.poll_interval,
        )),
        reader: ledger.clone(),
        identity,
    };
    let flow = TransactionFlow::new(spec, deps, &settings);
    let mut printer = spawn_event_printer(&flow);

    let fields: FormFields = args.fields.into_iter().collect();
    flow.update_fields(fields).await;

    let progress = match flow.submit().await {
        Ok(SubmitProgress::AwaitingConfirmation(challenge)) => {
            let answer = match args.confirm {
                Some(answer) => answer,
                None => read_confirmation(challenge.prompt()).await?,
            };
            flow.confirm(&answer).await
        }
        other => other,
    };
    if let Err(err) = progress {
        report(&err);
        printer.abort();
        return Ok(ExitCode::FAILURE);
    }

    let mut state = flow.watch_state();
    let terminal = *state
        .wait_for(|state| state.is_terminal())
        .await
        .context("flow stopped before reaching a terminal state")?;

    let snapshot = flow.snapshot().await;
    if tokio::time::timeout(PRINTER_GRACE, &mut printer).await.is_err() {
        printer.abort();
    }
    match terminal {
        OperationState::Confirmed => {
            for key in flow.affected_queries() {
                match ledger.query(key).await {
                    Ok(value) => println!("{key} = {value}"),
                    Err(err) => eprintln!("{key}: {err:#}"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            if let Some(reason) = snapshot.failure {
                eprintln!("failed: {reason}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn spawn_event_printer(flow: &TransactionFlow) -> tokio::task::JoinHandle<()> {
    let events = flow.subscribe();
    tokio::spawn(print_events(events, SETTLE_AFTER_TERMINAL, |line| println!("{line}")))
}

/// Prints events until the flow ends, then keeps printing until it has been quiet for `settle`
/// so the final status and any refresh warning are not lost.
async fn print_events(
    mut events: broadcast::Receiver<FlowEvent>,
    settle: Duration,
    mut emit: impl FnMut(String),
) {
    let mut finished = false;
    loop {
        let next = if finished {
            match tokio::time::timeout(settle, events.recv()).await {
                Ok(next) => next,
                Err(_) => return,
            }
        } else {
            events.recv().await
        };
        match next {
            Ok(FlowEvent::Transition { from, to, .. }) => {
                emit(format!("[{from} -> {to}]"));
                finished |= to.is_terminal();
            }
            Ok(FlowEvent::Status(message)) => {
                emit(format!("{:?}: {}", message.severity, message.text))
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                emit(format!("({skipped} events skipped)"))
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn read_confirmation(prompt: String) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        eprintln!("{prompt}:");
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await?
}

fn report(err: &FlowError) {
    match err {
        FlowError::Validation(ValidationError { result }) => {
            for (field, message) in result.errors() {
                eprintln!("{field}: {message}");
            }
        }
        other => eprintln!("{other}"),
    }
}
