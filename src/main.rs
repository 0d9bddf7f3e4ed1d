//! wkbridge CLI
//!
//! Converts an HTML file or a URL to PDF.
//!
//! ```text
//! wkbridge <input> [output]
//! ```
//!
//! Without `output` the document is written to stdout.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wkbridge::{GlobalSettings, IsolationManager};

/// Page location handed to wkhtmltox for a CLI argument.
///
/// Local files go in by absolute path so relative stylesheets and images
/// resolve against their directory.
fn page_for(input: &str) -> anyhow::Result<String> {
    let is_uri = ["http://", "https://", "file://"]
        .iter()
        .any(|scheme| input.starts_with(scheme));
    if is_uri {
        return Ok(input.to_string());
    }

    let path = std::fs::canonicalize(input).with_context(|| format!("Failed to read {}", input))?;
    Ok(path.to_string_lossy().into_owned())
}

fn main() -> anyhow::Result<()> {
    // Load configuration before the global manager reads it
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "wkbridge=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(input) = args.next() else {
        bail!("usage: wkbridge <input> [output]");
    };
    let output = args.next();
    let page = page_for(&input)?;

    let manager = IsolationManager::global();
    manager.ensure_ready()?;
    tracing::info!(version = %manager.version()?, "Using wkhtmltox");

    let converter = manager.create(GlobalSettings::default().document_title(input.clone()))?;
    converter.on_phase_changed(|_, phase, description| {
        tracing::info!(phase, "{}", description);
    });
    converter.on_warning(|_, message| tracing::warn!("{}", message));
    converter.on_error(|_, message| tracing::error!("{}", message));

    let result = converter.convert_uri(&page);
    let code = converter.http_error_code().unwrap_or_default();
    converter.dispose()?;

    let Some(document) = result? else {
        bail!("Conversion of {} failed (HTTP status {})", input, code);
    };

    match output {
        Some(path) => {
            std::fs::write(Path::new(&path), &document).with_context(|| format!("Failed to write {}", path))?;
            tracing::info!(path = %path, bytes = document.len(), "Wrote document");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&document)?;
            stdout.flush()?;
        }
    }

    manager.teardown();
    Ok(())
}
