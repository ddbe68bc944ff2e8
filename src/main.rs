use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use base64::Engine;
use tracing::{info, warn};

use iconflow::logging::{self, preview_base64, sniff_image_kind};
use iconflow::{
    ClientConfig, FileSessionStore, GenerationMode, GenerationPayload, HttpBackend,
    RecoveryOutcome, RecoveryTrigger, SessionController, SessionPhase, SessionUpdate,
};

const USAGE: &str = "usage: iconflow [<mode> <description> [--variations] [--count N] [--image PATH] [--label TEXT]]";

struct Args {
    mode: GenerationMode,
    payload: GenerationPayload,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> anyhow::Result<Option<Args>> {
    let Some(mode) = raw.next() else {
        return Ok(None);
    };
    let mode: GenerationMode = mode.parse().map_err(anyhow::Error::msg)?;
    let mut payload = GenerationPayload::default();
    let mut image: Option<PathBuf> = None;

    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--variations" => payload.generate_variations = true,
            "--count" => {
                let n = raw.next().context("--count needs a value")?;
                payload.icon_count = Some(n.parse().context("--count must be a number")?);
            }
            "--image" => image = Some(raw.next().context("--image needs a path")?.into()),
            "--label" => payload.label_text = Some(raw.next().context("--label needs text")?),
            flag if flag.starts_with("--") => bail!("unknown flag {flag}\n{USAGE}"),
            text => {
                if !payload.general_description.is_empty() {
                    payload.general_description.push(' ');
                }
                payload.general_description.push_str(text);
            }
        }
    }

    if let Some(path) = image {
        let bytes = std::fs::read(&path)
            .with_context(|| format!("reading reference image {}", path.display()))?;
        payload.reference_image = Some(base64::engine::general_purpose::STANDARD.encode(bytes));
    }
    Ok(Some(Args { mode, payload }))
}

fn print_results(controller: &SessionController) {
    let state = controller.state();
    match state.phase() {
        SessionPhase::Results => {
            let Some(response) = state.response() else {
                return;
            };
            println!("request {} finished with {} icon(s)", response.request_id, response.icons.len());
            for (service, results) in &response.service_results {
                for result in results {
                    println!(
                        "  {service} gen{}: {} icon(s) {:?} {}",
                        result.generation_index,
                        result.icons.len(),
                        result.status,
                        result.message
                    );
                }
            }
            for icon in &response.icons {
                info!(
                    source = ?icon.service_source,
                    kind = sniff_image_kind(&icon.base64_data),
                    data = %preview_base64(&icon.base64_data),
                    "icon"
                );
            }
        }
        SessionPhase::Error => {
            println!("error: {}", state.error().unwrap_or_default());
        }
        SessionPhase::Initial | SessionPhase::Streaming => {}
    }
}

async fn pump(controller: &mut SessionController) -> SessionPhase {
    loop {
        let update = tokio::select! {
            update = controller.next_update() => update,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, abandoning session");
                controller.teardown();
                return controller.state().phase();
            }
        };
        match update {
            Some(SessionUpdate::ServiceUpdated(key)) => {
                let count = controller.state().ledger().icon_count(&key);
                println!("[{:>3.0}%] {key}: {count} icon(s)", controller.progress_value());
            }
            Some(SessionUpdate::Reattached) => println!("reconnected, still generating..."),
            Some(_) => {}
            None => return controller.state().phase(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::from_env();
    logging::init(&config.log);

    let args = parse_args(std::env::args().skip(1))?;

    let backend = Arc::new(HttpBackend::new(&config)?);
    let store = Arc::new(FileSessionStore::new(&config.session_dir));
    info!(api_base = %config.api_base, store = %store.path().display(), "starting");
    let mut controller = SessionController::new(backend, store, config)?;

    match controller.recover(RecoveryTrigger::Mount).await? {
        RecoveryOutcome::Completed { .. } => print_results(&controller),
        RecoveryOutcome::InProgress { descriptor } => {
            println!("resuming generation {}", descriptor.request_id);
            pump(&mut controller).await;
            print_results(&controller);
        }
        _ => {}
    }

    let Some(Args { mode, payload }) = args else {
        return Ok(());
    };
    if let Err(e) = controller.refresh_balance().await {
        warn!(error = %e, "could not fetch balance");
    }

    if let Err(e) = controller.submit(mode, payload).await {
        println!("error: {}", e.user_message());
        std::process::exit(1);
    }
    let phase = pump(&mut controller).await;
    print_results(&controller);
    if phase != SessionPhase::Results {
        std::process::exit(1);
    }
    Ok(())
}
