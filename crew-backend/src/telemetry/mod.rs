//! Tracing boundary
//!
//! The crew emits [`TraceEvent`]s through a [`TraceBroadcaster`]. Every event is
//! logged; when Langfuse credentials are configured a background exporter also
//! ships them to the collector.

pub mod broadcaster;
pub mod events;
pub mod langfuse;

pub use broadcaster::TraceBroadcaster;
pub use events::{EventType, TraceEvent};
pub use langfuse::LangfuseExporter;

use crate::config::Config;

/// Build the broadcaster and attach the collector exporter if configured.
///
/// Exporter setup failures are logged and leave tracing log-only.
pub fn init(config: &Config) -> TraceBroadcaster {
    let broadcaster = TraceBroadcaster::new();

    let Some(langfuse) = &config.langfuse else {
        log::info!("[TRACE] No Langfuse credentials, traces go to the log only");
        return broadcaster;
    };

    match LangfuseExporter::new(langfuse) {
        Ok(exporter) => {
            let (_, rx) = broadcaster.subscribe();
            exporter.spawn(rx);
            log::info!("[TRACE] Exporting traces to {}", langfuse.host);
            broadcaster.emit(TraceEvent::startup(
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                &config.openai.model,
            ));
        }
        Err(e) => {
            log::warn!("[TRACE] Langfuse exporter disabled: {}", e);
        }
    }

    broadcaster
}
